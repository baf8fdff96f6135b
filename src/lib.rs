//! src/lib.rs
//!
//! Cluster membership over the SWIM protocol: every node maintains an
//! eventually consistent view of the member set, each member carrying a
//! status and a metadata mapping disseminated alongside it. This file
//! declares the module hierarchy and exports the primary public interface.

// Declare the module hierarchy.
pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod members;
pub mod packet;
pub mod shuffle;
pub mod status;
pub mod transport;

// Re-export key types for the public API.
pub use app::App;
pub use config::Config;
pub use engine::Engine;
pub use error::Error;
pub use members::{GossipState, MemberInfo, Members, Metadata};
pub use packet::{Packet, Source};
pub use status::Status;
