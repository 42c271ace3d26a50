/// Reflected CRC-32 (polynomial 0xEDB88320), the checksum catalog entries
/// declare for their expected base ROM.
const POLY: u32 = 0xEDB8_8320;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = make_table();

/// Incremental CRC-32 state. Feeding the input in any number of pieces
/// yields the same value as [`crc32`] over the whole buffer.
#[derive(Debug, Clone)]
pub struct Crc32 {
    crc: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { crc: 0xFFFF_FFFF }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;
        for &byte in data {
            crc = TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.crc = crc;
    }

    pub fn finalize(&self) -> u32 {
        self.crc ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

/// Format a checksum the way catalog entries store it: 8 uppercase hex digits.
pub fn format_crc32(value: u32) -> String {
    format!("{:08X}", value)
}

/// CRC-32 of a byte slice, formatted with [`format_crc32`].
pub fn crc32_hex(data: &[u8]) -> String {
    format_crc32(crc32(data))
}

/// Parse an 8-digit hex checksum in either case.
pub fn parse_crc32(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}
