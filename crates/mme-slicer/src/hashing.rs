//! FNV-1a fingerprints for emitted programs.
//!
//! The hash only depends on the bytes fed to it, so a fingerprint is stable across processes
//! and platforms (unlike `DefaultHasher`).

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    state: u64,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self {
            state: FNV1A_OFFSET,
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.state = fnv1a_bytes(self.state, bytes);
    }

    pub fn finish(self) -> u64 {
        self.state
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(FNV1A_OFFSET, bytes)
}
