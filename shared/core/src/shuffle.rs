use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shuffle {
    #[default]
    DontShuffle,
    Seeded([u8; 32]),
}

impl Shuffle {
    /// Expand a small integer seed into a full 32-byte seed.
    pub fn seeded(seed: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..32].copy_from_slice(&seed.to_be_bytes());
        Shuffle::Seeded(bytes)
    }
}
