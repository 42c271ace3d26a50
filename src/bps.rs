use crate::binary_patch::{split_footer, PatchReader};
use crate::catalog::PatchType;
use crate::crc32::crc32;
use crate::patch_format::{output_buffer, FormatError, ParsedPatch};

pub const MAGIC: &[u8; 4] = b"BPS1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BpsAction {
    /// Copy from the source at the current output offset.
    SourceRead { length: usize },
    /// Literal bytes carried by the patch.
    TargetRead { data: Vec<u8> },
    /// Copy from the source at a relative cursor.
    SourceCopy { delta: i64, length: usize },
    /// Copy from already-written output at a relative cursor; may overlap.
    TargetCopy { delta: i64, length: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpsPatch {
    pub source_size: usize,
    pub target_size: usize,
    pub metadata: String,
    pub actions: Vec<BpsAction>,
    pub source_crc32: u32,
    pub target_crc32: u32,
}

fn read_signed(reader: &mut PatchReader<'_>) -> Result<i64, FormatError> {
    let start = reader.position();
    let raw = reader.read_vlq()?;
    let magnitude = i64::try_from(raw >> 1).map_err(|_| FormatError::Overflow(start))?;
    Ok(if raw & 1 != 0 { -magnitude } else { magnitude })
}

impl BpsPatch {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if !data.starts_with(MAGIC) {
            return Err(FormatError::Magic("BPS"));
        }
        let (body, footer) = split_footer(data, 3)?;
        let (source_crc32, target_crc32, patch_crc32) = (footer[0], footer[1], footer[2]);

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
        let source_size = reader.read_vlq_usize()?;
        let target_size = reader.read_vlq_usize()?;
        let metadata_size = reader.read_vlq_usize()?;
        let metadata = String::from_utf8_lossy(reader.read_bytes(metadata_size)?).into_owned();

        let mut actions = Vec::new();
        while reader.remaining() > 0 {
            let start = reader.position();
            let word = reader.read_vlq()?;
            let length = usize::try_from((word >> 2) + 1).map_err(|_| FormatError::Overflow(start))?;
            let action = match word & 3 {
                0 => BpsAction::SourceRead { length },
                1 => BpsAction::TargetRead {
                    data: reader.read_bytes(length)?.to_vec(),
                },
                2 => BpsAction::SourceCopy {
                    delta: read_signed(&mut reader)?,
                    length,
                },
                _ => BpsAction::TargetCopy {
                    delta: read_signed(&mut reader)?,
                    length,
                },
            };
            actions.push(action);
        }

        Ok(Self {
            source_size,
            target_size,
            metadata,
            actions,
            source_crc32,
            target_crc32,
        })
    }
}

fn move_cursor(cursor: usize, delta: i64, what: &'static str) -> Result<usize, FormatError> {
    let moved = (cursor as i64).checked_add(delta).filter(|&c| c >= 0);
    moved.map(|c| c as usize).ok_or(FormatError::OutOfBounds {
        what,
        offset: cursor,
    })
}

impl ParsedPatch for BpsPatch {
    fn format(&self) -> PatchType {
        PatchType::Bps
    }

    fn apply(&self, rom: &[u8]) -> Result<Vec<u8>, FormatError> {
        let rom_crc = crc32(rom);
        if rom_crc != self.source_crc32 {
            return Err(FormatError::ChecksumMismatch {
                what: "Source ROM",
                expected: self.source_crc32,
                actual: rom_crc,
            });
        }

        let mut result = output_buffer(self.target_size)?;
        let mut source_cursor: usize = 0;
        let mut target_cursor: usize = 0;

        for action in &self.actions {
            match action {
                BpsAction::SourceRead { length } => {
                    let start = result.len();
                    let chunk = start
                        .checked_add(*length)
                        .and_then(|end| rom.get(start..end))
                        .ok_or(FormatError::OutOfBounds {
                            what: "Source read",
                            offset: start,
                        })?;
                    result.extend_from_slice(chunk);
                }
                BpsAction::TargetRead { data } => {
                    result.extend_from_slice(data);
                }
                BpsAction::SourceCopy { delta, length } => {
                    source_cursor = move_cursor(source_cursor, *delta, "Source copy")?;
                    let chunk = source_cursor
                        .checked_add(*length)
                        .and_then(|end| rom.get(source_cursor..end))
                        .ok_or(FormatError::OutOfBounds {
                            what: "Source copy",
                            offset: source_cursor,
                        })?;
                    result.extend_from_slice(chunk);
                    source_cursor += length;
                }
                BpsAction::TargetCopy { delta, length } => {
                    target_cursor = move_cursor(target_cursor, *delta, "Target copy")?;
                    if target_cursor >= result.len() || *length > self.target_size - result.len() {
                        return Err(FormatError::OutOfBounds {
                            what: "Target copy",
                            offset: target_cursor,
                        });
                    }
                    // Byte at a time: the run may read bytes it has just written.
                    for _ in 0..*length {
                        let byte = result[target_cursor];
                        result.push(byte);
                        target_cursor += 1;
                    }
                }
            }
            if result.len() > self.target_size {
                return Err(FormatError::OutOfBounds {
                    what: "Target write",
                    offset: self.target_size,
                });
            }
        }

        if result.len() != self.target_size {
            return Err(FormatError::SizeMismatch {
                expected: self.target_size,
                actual: result.len(),
            });
        }

        let actual = crc32(&result);
        if actual != self.target_crc32 {
            return Err(FormatError::ChecksumMismatch {
                what: "Target ROM",
                expected: self.target_crc32,
                actual,
            });
        }
        Ok(result)
    }
}

/// Serialize actions into a BPS file. Test fixture only.
#[cfg(test)]
pub(crate) fn build_patch(source: &[u8], target: &[u8], actions: &[BpsAction]) -> Vec<u8> {
    use crate::binary_patch::encode_vlq;

    fn signed(delta: i64, out: &mut Vec<u8>) {
        let raw = (delta.unsigned_abs() << 1) | u64::from(delta < 0);
        encode_vlq(raw, out);
    }

    let mut out = MAGIC.to_vec();
    encode_vlq(source.len() as u64, &mut out);
    encode_vlq(target.len() as u64, &mut out);
    encode_vlq(0, &mut out);
    for action in actions {
        match action {
            BpsAction::SourceRead { length } => encode_vlq((*length as u64 - 1) << 2, &mut out),
            BpsAction::TargetRead { data } => {
                encode_vlq(((data.len() as u64 - 1) << 2) | 1, &mut out);
                out.extend_from_slice(data);
            }
            BpsAction::SourceCopy { delta, length } => {
                encode_vlq(((*length as u64 - 1) << 2) | 2, &mut out);
                signed(*delta, &mut out);
            }
            BpsAction::TargetCopy { delta, length } => {
                encode_vlq(((*length as u64 - 1) << 2) | 3, &mut out);
                signed(*delta, &mut out);
            }
        }
    }
    out.extend_from_slice(&crc32(source).to_le_bytes());
    out.extend_from_slice(&crc32(target).to_le_bytes());
    let patch_crc = crc32(&out);
    out.extend_from_slice(&patch_crc.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::MAX_OUTPUT_SIZE;

    const SOURCE: &[u8] = b"ABCDEFGH";

    #[test]
    fn test_all_actions() {
        // "ABCD" from source, "xy" literal, "GH" copied from source, then
        // "xyGHxy" replayed from output, overlapping the bytes being written.
        let target = b"ABCDxyGHxyGHxy";
        let actions = vec![
            BpsAction::SourceRead { length: 4 },
            BpsAction::TargetRead {
                data: b"xy".to_vec(),
            },
            BpsAction::SourceCopy {
                delta: 6,
                length: 2,
            },
            BpsAction::TargetCopy {
                delta: 4,
                length: 6,
            },
        ];
        let bytes = build_patch(SOURCE, target, &actions);
        let patch = BpsPatch::parse(&bytes).unwrap();
        assert_eq!(patch.actions, actions);
        assert_eq!(patch.target_size, target.len());
        assert_eq!(patch.apply(SOURCE).unwrap(), target);
    }

    #[test]
    fn test_negative_source_delta() {
        let target = b"GHAB";
        let actions = vec![
            BpsAction::SourceCopy {
                delta: 6,
                length: 2,
            },
            BpsAction::SourceCopy {
                delta: -8,
                length: 2,
            },
        ];
        let patch = BpsPatch::parse(&build_patch(SOURCE, target, &actions)).unwrap();
        assert_eq!(patch.apply(SOURCE).unwrap(), target);
    }

    #[test]
    fn test_wrong_source_rejected() {
        let patch = BpsPatch::parse(&build_patch(
            SOURCE,
            b"ABCD",
            &[BpsAction::SourceRead { length: 4 }],
        ))
        .unwrap();
        let err = patch.apply(b"ZZZZZZZZ").unwrap_err();
        assert_eq!(err.to_string().split(':').next(), Some("Source ROM checksum mismatch"));
    }

    #[test]
    fn test_out_of_bounds_copy() {
        // Declared target checksum is irrelevant: the copy fails first.
        let patch = BpsPatch::parse(&build_patch(
            SOURCE,
            b"????",
            &[BpsAction::SourceCopy {
                delta: 7,
                length: 4,
            }],
        ))
        .unwrap();
        assert!(matches!(
            patch.apply(SOURCE),
            Err(FormatError::OutOfBounds {
                what: "Source copy",
                ..
            })
        ));
    }

    #[test]
    fn test_size_mismatch() {
        let patch = BpsPatch::parse(&build_patch(
            SOURCE,
            b"ABCDEFGH",
            &[BpsAction::SourceRead { length: 4 }],
        ))
        .unwrap();
        assert_eq!(
            patch.apply(SOURCE),
            Err(FormatError::SizeMismatch {
                expected: 8,
                actual: 4
            })
        );
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(BpsPatch::parse(b"UPS1xxxxxxxxxxxx"), Err(FormatError::Magic("BPS")));
    }

    #[test]
    fn test_footer_only_patch_is_truncated() {
        let mut bytes = b"BPS1\0\0\0\0".to_vec();
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(bytes.len(), 12);
        assert_eq!(BpsPatch::parse(&bytes), Err(FormatError::Truncated(0)));
    }

    #[test]
    fn test_oversized_target_rejected() {
        use crate::binary_patch::encode_vlq;

        let mut bytes = MAGIC.to_vec();
        encode_vlq(SOURCE.len() as u64, &mut bytes);
        encode_vlq(1 << 50, &mut bytes);
        encode_vlq(0, &mut bytes);
        bytes.extend_from_slice(&crc32(SOURCE).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let patch = BpsPatch::parse(&bytes).unwrap();
        assert_eq!(patch.target_size, 1 << 50);
        assert_eq!(
            patch.apply(SOURCE),
            Err(FormatError::TooLarge {
                declared: 1 << 50,
                limit: MAX_OUTPUT_SIZE
            })
        );
    }
}
