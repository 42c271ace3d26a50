use crate::binary_patch::{split_footer, PatchReader};
use crate::catalog::PatchType;
use crate::crc32::crc32;
use crate::patch_format::{output_buffer, FormatError, ParsedPatch};

pub const MAGIC: &[u8; 4] = b"UPS1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsHunk {
    /// Bytes skipped since the end of the previous hunk.
    pub skip: usize,
    /// XOR mask, without the terminating zero.
    pub xor: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsPatch {
    pub input_size: usize,
    pub output_size: usize,
    pub hunks: Vec<UpsHunk>,
    pub input_crc32: u32,
    pub output_crc32: u32,
}

impl UpsPatch {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if !data.starts_with(MAGIC) {
            return Err(FormatError::Magic("UPS"));
        }
        let (body, footer) = split_footer(data, 3)?;
        let (input_crc32, output_crc32, patch_crc32) = (footer[0], footer[1], footer[2]);

        let actual = crc32(&data[..data.len() - 4]);
        if actual != patch_crc32 {
            return Err(FormatError::ChecksumMismatch {
                what: "Patch",
                expected: patch_crc32,
                actual,
            });
        }

        let body = body
            .get(MAGIC.len()..)
            .ok_or(FormatError::Truncated(body.len()))?;
        let mut reader = PatchReader::new(body);
        let input_size = reader.read_vlq_usize()?;
        let output_size = reader.read_vlq_usize()?;

        let mut hunks = Vec::new();
        while reader.remaining() > 0 {
            let skip = reader.read_vlq_usize()?;
            let mut xor = Vec::new();
            loop {
                let byte = reader.read_u8()?;
                if byte == 0 {
                    break;
                }
                xor.push(byte);
            }
            hunks.push(UpsHunk { skip, xor });
        }

        Ok(Self {
            input_size,
            output_size,
            hunks,
            input_crc32,
            output_crc32,
        })
    }
}

impl ParsedPatch for UpsPatch {
    fn format(&self) -> PatchType {
        PatchType::Ups
    }

    /// UPS is symmetric: a ROM matching the output checksum is patched back
    /// to the input.
    fn apply(&self, rom: &[u8]) -> Result<Vec<u8>, FormatError> {
        let rom_crc = crc32(rom);
        let (target_size, expected_crc) = if rom_crc == self.input_crc32 {
            (self.output_size, self.output_crc32)
        } else if rom_crc == self.output_crc32 {
            (self.input_size, self.input_crc32)
        } else {
            return Err(FormatError::ChecksumMismatch {
                what: "Source ROM",
                expected: self.input_crc32,
                actual: rom_crc,
            });
        };

        let mut result = output_buffer(target_size)?;
        result.extend_from_slice(&rom[..rom.len().min(target_size)]);
        result.resize(target_size, 0);

        let mut pos: usize = 0;
        for hunk in &self.hunks {
            pos = pos.checked_add(hunk.skip).ok_or(FormatError::Overflow(pos))?;
            for &mask in &hunk.xor {
                if pos < result.len() {
                    result[pos] ^= mask;
                }
                pos = pos.checked_add(1).ok_or(FormatError::Overflow(pos))?;
            }
            // The terminator stands for one unchanged byte.
            pos = pos.checked_add(1).ok_or(FormatError::Overflow(pos))?;
        }

        let actual = crc32(&result);
        if actual != expected_crc {
            return Err(FormatError::ChecksumMismatch {
                what: "Target ROM",
                expected: expected_crc,
                actual,
            });
        }
        Ok(result)
    }
}

/// Build a UPS patch from two buffers. Test fixture only.
#[cfg(test)]
pub(crate) fn build_patch(source: &[u8], target: &[u8]) -> Vec<u8> {
    use crate::binary_patch::encode_vlq;

    let mut out = MAGIC.to_vec();
    encode_vlq(source.len() as u64, &mut out);
    encode_vlq(target.len() as u64, &mut out);

    let len = source.len().max(target.len());
    let byte_at = |buf: &[u8], i: usize| buf.get(i).copied().unwrap_or(0);
    let mut last = 0;
    let mut i = 0;
    while i < len {
        if byte_at(source, i) == byte_at(target, i) {
            i += 1;
            continue;
        }
        encode_vlq((i - last) as u64, &mut out);
        while i < len && byte_at(source, i) != byte_at(target, i) {
            out.push(byte_at(source, i) ^ byte_at(target, i));
            i += 1;
        }
        out.push(0);
        i += 1;
        last = i;
    }

    out.extend_from_slice(&crc32(source).to_le_bytes());
    out.extend_from_slice(&crc32(target).to_le_bytes());
    let patch_crc = crc32(&out);
    out.extend_from_slice(&patch_crc.to_le_bytes());
    out
}
