// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload-wire - CRC32 engine
//!
//! Standard Ethernet CRC32: reflected polynomial `0xEDB88320`, initial state
//! `0xFFFFFFFF`, final XOR `0xFFFFFFFF`.  Used for frame integrity, flash
//! image verification (`GET_CRC32`) and the discovery backoff hash.
//!
//! [`Crc32`] is the streaming form; [`crc32`] the one-shot convenience.
//! Feeding the same bytes in any chunking produces the same result.

const POLYNOMIAL: u32 = 0xEDB8_8320;
const INITIAL: u32 = 0xFFFF_FFFF;
const FINAL_XOR: u32 = 0xFFFF_FFFF;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table();

/// Streaming CRC32 state.
///
/// ```
/// use busload_wire::crc32::Crc32;
///
/// let mut crc = Crc32::new();
/// crc.update(b"1234");
/// crc.update(b"56789");
/// assert_eq!(crc.finish(), 0xCBF43926);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32(u32);

impl Crc32 {
    /// Creates a fresh state.
    pub const fn new() -> Self {
        Self(INITIAL)
    }

    /// Folds bytes into the state.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.0 ^ byte as u32) & 0xFF) as usize;
            self.0 = (self.0 >> 8) ^ TABLE[index];
        }
    }

    /// Returns the CRC of everything folded so far.
    ///
    /// Does not consume or reset the state: callers may read an
    /// intermediate CRC and continue streaming.
    pub const fn finish(&self) -> u32 {
        self.0 ^ FINAL_XOR
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_vectors() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b""), 0x0000_0000);
        assert_eq!(crc32(b"A"), 0xD3D99E8B);
        assert_eq!(crc32(b"Hello World"), 0x4A17B156);
        assert_eq!(crc32(&[0x00, 0x00, 0x00, 0x00]), 0x2144DF1C);
        assert_eq!(crc32(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFF_FFFF);
        assert_eq!(crc32(&[0x00, 0x0F, 0xF0, 0xFF, 0x55, 0xAA]), 0xFAA3F7DF);
    }

    #[test]
    fn sixty_four_byte_page_pattern() {
        let mut page = [0u8; 64];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(crc32(&page), 0x100ECE8C);
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let expected = crc32(data);

        let mut crc = Crc32::new();
        for chunk in data.chunks(3) {
            crc.update(chunk);
        }
        assert_eq!(crc.finish(), expected);

        let mut crc = Crc32::new();
        for byte in data {
            crc.update(&[*byte]);
        }
        assert_eq!(crc.finish(), expected);
    }

    #[test]
    fn leading_zeros_change_the_result() {
        assert_ne!(crc32(&[0x00, 0x12]), crc32(&[0x12]));
    }

    #[test]
    fn finish_is_not_destructive() {
        let mut crc = Crc32::new();
        crc.update(b"1234");
        let _ = crc.finish();
        crc.update(b"56789");
        assert_eq!(crc.finish(), 0xCBF43926);
    }
}
