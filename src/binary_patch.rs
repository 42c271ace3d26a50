use crate::patch_format::FormatError;

/// Bounds-checked cursor over raw patch bytes.
pub struct PatchReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PatchReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(FormatError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> Result<u16, FormatError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24_be(&mut self) -> Result<u32, FormatError> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, FormatError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Variable-length number shared by UPS and BPS: 7 bits per byte, high bit
    /// marks the last byte, with an implicit +1 carry per continuation.
    pub fn read_vlq(&mut self) -> Result<u64, FormatError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift: u64 = 1;
        loop {
            let byte = self.read_u8()?;
            value = ((byte & 0x7F) as u64)
                .checked_mul(shift)
                .and_then(|v| value.checked_add(v))
                .ok_or(FormatError::Overflow(start))?;
            if byte & 0x80 != 0 {
                return Ok(value);
            }
            shift = shift
                .checked_shl(7)
                .filter(|&s| s < (1 << 56))
                .ok_or(FormatError::Overflow(start))?;
            value = value.checked_add(shift).ok_or(FormatError::Overflow(start))?;
        }
    }

    /// [`read_vlq`](Self::read_vlq) narrowed to `usize`.
    pub fn read_vlq_usize(&mut self) -> Result<usize, FormatError> {
        let start = self.pos;
        let value = self.read_vlq()?;
        usize::try_from(value).map_err(|_| FormatError::Overflow(start))
    }
}

/// Split a patch into its body and trailing little-endian CRC-32 footer words.
/// Returns `(body, footer)` where `body` excludes the final `words * 4` bytes.
pub fn split_footer(data: &[u8], words: usize) -> Result<(&[u8], Vec<u32>), FormatError> {
    let footer_len = words * 4;
    if data.len() < footer_len {
        return Err(FormatError::Truncated(data.len()));
    }
    let (body, footer) = data.split_at(data.len() - footer_len);
    let mut reader = PatchReader::new(footer);
    let values = (0..words)
        .map(|_| reader.read_u32_le())
        .collect::<Result<_, _>>()?;
    Ok((body, values))
}

#[cfg(test)]
pub(crate) fn encode_vlq(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let x = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(0x80 | x);
            break;
        }
        out.push(x);
        value -= 1;
    }
}
