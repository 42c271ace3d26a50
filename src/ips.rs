use crate::binary_patch::PatchReader;
use crate::catalog::PatchType;
use crate::patch_format::{FormatError, ParsedPatch};

pub const MAGIC: &[u8; 5] = b"PATCH";
const EOF_MARKER: u32 = 0x454F46;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpsRecord {
    Write { offset: u32, data: Vec<u8> },
    Fill { offset: u32, length: u16, value: u8 },
}

impl IpsRecord {
    fn end(&self) -> usize {
        match self {
            IpsRecord::Write { offset, data } => *offset as usize + data.len(),
            IpsRecord::Fill { offset, length, .. } => *offset as usize + *length as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsPatch {
    pub records: Vec<IpsRecord>,
    /// Lunar IPS extension: final output length.
    pub truncate: Option<u32>,
}

impl IpsPatch {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if !data.starts_with(MAGIC) {
            return Err(FormatError::Magic("IPS"));
        }
        let mut reader = PatchReader::new(&data[MAGIC.len()..]);
        let mut records = Vec::new();

        loop {
            let offset = reader.read_u24_be()?;
            if offset == EOF_MARKER {
                break;
            }
            let size = reader.read_u16_be()?;
            if size == 0 {
                let length = reader.read_u16_be()?;
                let value = reader.read_u8()?;
                records.push(IpsRecord::Fill {
                    offset,
                    length,
                    value,
                });
            } else {
                let data = reader.read_bytes(size as usize)?.to_vec();
                records.push(IpsRecord::Write { offset, data });
            }
        }

        let truncate = if reader.remaining() >= 3 {
            Some(reader.read_u24_be()?)
        } else {
            None
        };

        Ok(Self { records, truncate })
    }
}

impl ParsedPatch for IpsPatch {
    fn format(&self) -> PatchType {
        PatchType::Ips
    }

    /// IPS carries no checksums: records overwrite bytes in place and grow the
    /// ROM with zeros when they reach past its end.
    fn apply(&self, rom: &[u8]) -> Result<Vec<u8>, FormatError> {
        let needed = self.records.iter().map(IpsRecord::end).max().unwrap_or(0);
        let mut result = Vec::with_capacity(rom.len().max(needed));
        result.extend_from_slice(rom);
        if result.len() < needed {
            result.resize(needed, 0);
        }

        for record in &self.records {
            match record {
                IpsRecord::Write { offset, data } => {
                    let start = *offset as usize;
                    result[start..start + data.len()].copy_from_slice(data);
                }
                IpsRecord::Fill {
                    offset,
                    length,
                    value,
                } => {
                    let start = *offset as usize;
                    result[start..start + *length as usize].fill(*value);
                }
            }
        }

        if let Some(size) = self.truncate {
            result.truncate(size as usize);
        }

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) fn build_patch(records: &[IpsRecord], truncate: Option<u32>) -> Vec<u8> {
    let mut out = MAGIC.to_vec();
    for record in records {
        match record {
            IpsRecord::Write { offset, data } => {
                out.extend_from_slice(&offset.to_be_bytes()[1..]);
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
            IpsRecord::Fill {
                offset,
                length,
                value,
            } => {
                out.extend_from_slice(&offset.to_be_bytes()[1..]);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&length.to_be_bytes());
                out.push(*value);
            }
        }
    }
    out.extend_from_slice(b"EOF");
    if let Some(size) = truncate {
        out.extend_from_slice(&size.to_be_bytes()[1..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_fill() {
        let patch = build_patch(
            &[
                IpsRecord::Write {
                    offset: 1,
                    data: b"XY".to_vec(),
                },
                IpsRecord::Fill {
                    offset: 5,
                    length: 3,
                    value: 0xEE,
                },
            ],
            None,
        );
        let parsed = IpsPatch::parse(&patch).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.truncate, None);

        let rom = [0u8; 10];
        let out = parsed.apply(&rom).unwrap();
        assert_eq!(out, [0, b'X', b'Y', 0, 0, 0xEE, 0xEE, 0xEE, 0, 0]);
    }

    #[test]
    fn test_grows_rom() {
        let patch = build_patch(
            &[IpsRecord::Write {
                offset: 6,
                data: vec![0xAB, 0xCD],
            }],
            None,
        );
        let out = IpsPatch::parse(&patch).unwrap().apply(&[1, 2, 3]).unwrap();
        assert_eq!(out, [1, 2, 3, 0, 0, 0, 0xAB, 0xCD]);
    }

    #[test]
    fn test_truncate_extension() {
        let patch = build_patch(&[], Some(2));
        let parsed = IpsPatch::parse(&patch).unwrap();
        assert_eq!(parsed.truncate, Some(2));
        assert_eq!(parsed.apply(&[1, 2, 3, 4]).unwrap(), [1, 2]);
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        assert_eq!(IpsPatch::parse(b"PATCX"), Err(FormatError::Magic("IPS")));
        // Missing EOF marker.
        let mut patch = build_patch(
            &[IpsRecord::Write {
                offset: 0,
                data: vec![1, 2, 3],
            }],
            None,
        );
        patch.truncate(patch.len() - 4);
        assert!(matches!(IpsPatch::parse(&patch), Err(FormatError::Truncated(_))));
    }
}
