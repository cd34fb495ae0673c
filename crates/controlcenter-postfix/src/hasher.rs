//! 32 bit FNV-1a, used to reference raw log lines from deliveries.

const OFFSET_BASIS: u32 = 0x811c_9dc5;
const PRIME: u32 = 0x0100_0193;

/// Checksum of a raw line, zero-extended so it fits a signed database
/// column.
pub type Sum = i64;

#[derive(Debug, Clone, Copy)]
pub struct Hasher {
    state: u32,
}

impl Default for Hasher {
    fn default() -> Self {
        Self { state: OFFSET_BASIS }
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(
        &mut self,
        bytes: &[u8],
    ) {
        for byte in bytes {
            self.state ^= u32::from(*byte);
            self.state = self.state.wrapping_mul(PRIME);
        }
    }

    pub fn finish(&self) -> Sum {
        Sum::from(self.state)
    }
}

pub fn checksum(line: &str) -> Sum {
    let mut hasher = Hasher::new();
    hasher.write(line.as_bytes());
    hasher.finish()
}
