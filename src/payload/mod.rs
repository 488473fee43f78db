use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;

/// The canned response every connection receives.
///
/// Generated once when the listener is built and never mutated afterwards;
/// clones share the same bytes.
#[derive(Debug, Clone)]
pub struct Payload {
    bytes: Arc<[u8]>,
}

impl Payload {
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::rng().fill_bytes(&mut bytes);
        Self::from(bytes)
    }

    pub fn seeded(len: usize, seed: u64) -> Self {
        let mut bytes = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
        Self::from(bytes)
    }

    pub fn generate(len: usize, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(len, seed),
            None => Self::random(len),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}
