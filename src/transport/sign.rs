//! src/transport/sign.rs
//!
//! Shared-secret packet signatures. Every frame carries a random salt and an
//! HMAC-SHA256 digest over the salt, the crate version and the payload, so
//! only members holding the same secret (and speaking the same protocol
//! revision) accept each other's packets.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

/// Generates and verifies cluster packet signatures.
#[derive(Debug)]
pub struct Signatures {
    secret: Vec<u8>,
}

impl Signatures {
    /// Builds a signer from the shared secret. Without a configured secret a
    /// random one is generated, which only peers in the same process can
    /// ever verify.
    pub fn new(secret: Option<&str>) -> Self {
        let secret = match secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!(
                    "no shared secret configured; generated a random one, \
                     remote peers will not verify our packets"
                );
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        Self { secret }
    }

    /// Signs `data` under a fresh random salt, returning the salt and
    /// digest pair.
    pub fn sign(&self, data: &[u8]) -> ([u8; SALT_LEN], [u8; DIGEST_LEN]) {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = self.digest(&salt, data);
        (salt, digest)
    }

    /// Checks a received salt/digest pair against `data`.
    pub fn verify(&self, salt: &[u8], digest: &[u8], data: &[u8]) -> bool {
        let mut mac = self.mac(salt, data);
        mac.verify_slice(digest).is_ok()
    }

    fn digest(&self, salt: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
        self.mac(salt, data).finalize().into_bytes().into()
    }

    fn mac(&self, salt: &[u8], data: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(salt);
        mac.update(env!("CARGO_PKG_VERSION").as_bytes());
        mac.update(data);
        mac
    }
}
