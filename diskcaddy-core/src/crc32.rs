//! Reflected CRC-32 (IEEE 802.3), as used by ZIP and the upload headers.

/// Incremental hasher; `finalize` over concatenated updates equals
/// [`checksum`] over the whole buffer.
#[derive(Debug, Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Formats a checksum the way the device expects it in `X-CRC32`.
pub fn header_value(crc: u32) -> String {
    format!("0x{crc:08x}")
}
