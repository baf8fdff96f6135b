//! src/status.rs
//!
//! Cluster member status flags. The three real statuses are the only values
//! ever stored on a member or sent on the wire; the aggregate values exist
//! for queries against the status indexes.

use bitflags::bitflags;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

bitflags! {
    /// The perceived availability of a cluster member.
    ///
    /// `ONLINE`, `SUSPECT` and `OFFLINE` are real statuses that a member can
    /// hold. `AVAILABLE`, `UNAVAILABLE` and `ALL` are aggregates for use in
    /// queries like [`Members::find`](crate::members::Members::find) and must
    /// never be assigned to a member or transmitted.
    pub struct Status: u8 {
        /// The member is responding as expected.
        const ONLINE = 0b001;
        /// The member has failed to respond, but is not yet declared fully
        /// offline.
        const SUSPECT = 0b010;
        /// The member has stopped responding for long enough to avoid false
        /// positives.
        const OFFLINE = 0b100;
        /// Statuses considered responding.
        const AVAILABLE = Self::ONLINE.bits | Self::SUSPECT.bits;
        /// Statuses not considered responding.
        const UNAVAILABLE = Self::OFFLINE.bits | Self::SUSPECT.bits;
        /// Every status.
        const ALL = Self::AVAILABLE.bits | Self::UNAVAILABLE.bits;
    }
}

impl Status {
    /// Whether this is one of the three real statuses, as opposed to an
    /// aggregate query value.
    pub fn is_real(self) -> bool {
        matches!(self, Status::ONLINE | Status::SUSPECT | Status::OFFLINE)
    }

    /// Filters impossible status transitions, returning the status to store
    /// instead of `to`:
    ///
    /// * `OFFLINE` to `SUSPECT` remains `OFFLINE`.
    /// * `ONLINE` to `OFFLINE` first goes to `SUSPECT`.
    ///
    /// # Panics
    ///
    /// Panics if `to` is an aggregate status, which can never be assigned.
    pub fn transition(self, to: Status) -> Status {
        assert!(to.is_real(), "cannot transition into aggregate status {to}");
        if to == Status::SUSPECT && self == Status::OFFLINE {
            self
        } else if to == Status::OFFLINE && self == Status::ONLINE {
            Status::SUSPECT
        } else {
            to
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Status::ONLINE => "online",
            Status::SUSPECT => "suspect",
            Status::OFFLINE => "offline",
            Status::AVAILABLE => "available",
            Status::UNAVAILABLE => "unavailable",
            Status::ALL => "all",
            _ => return write!(f, "status({:#05b})", self.bits()),
        };
        f.write_str(name)
    }
}

// The wire encoding is the raw flag byte. Only real statuses are valid on
// the wire; aggregates and unknown bit patterns fail to decode.

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        match Status::from_bits(bits) {
            Some(status) if status.is_real() => Ok(status),
            _ => Err(de::Error::custom(format!(
                "invalid status byte {bits:#04x}"
            ))),
        }
    }
}
