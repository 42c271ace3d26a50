use std::sync::Arc;
use thiserror::Error;

use crate::catalog::PatchType;

/// An in-memory file handed to the patch backend: either a ROM or a patch.
#[derive(Debug, Clone)]
pub struct BinFile {
    pub file_name: String,
    pub bytes: Arc<[u8]>,
}

impl BinFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Output of a successful patch application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedRom {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Failures raised while decoding or applying a patch format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Missing {0} magic header")]
    Magic(&'static str),

    #[error("Unexpected end of patch data at offset {0:#X}")]
    Truncated(usize),

    #[error("Variable-length number at offset {0:#X} is too large")]
    Overflow(usize),

    #[error("{what} checksum mismatch: expected {expected:08X}, got {actual:08X}")]
    ChecksumMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("{what} access out of bounds at offset {offset:#X}")]
    OutOfBounds { what: &'static str, offset: usize },

    #[error("Output size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Patch declares a {declared}-byte output, over the {limit}-byte limit")]
    TooLarge { declared: usize, limit: usize },
}

/// Largest output a patch may declare.
pub const MAX_OUTPUT_SIZE: usize = 512 * 1024 * 1024;

/// Empty buffer with room for a patch's declared output size.
pub fn output_buffer(declared: usize) -> Result<Vec<u8>, FormatError> {
    let too_large = FormatError::TooLarge {
        declared,
        limit: MAX_OUTPUT_SIZE,
    };
    if declared > MAX_OUTPUT_SIZE {
        return Err(too_large);
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(declared).map_err(|_| too_large)?;
    Ok(buf)
}

/// A patch that a backend successfully parsed and can apply to a ROM.
pub trait ParsedPatch: Send + Sync {
    fn format(&self) -> PatchType;

    fn apply(&self, rom: &[u8]) -> Result<Vec<u8>, FormatError>;
}

/// The parser/applier the patch engine delegates to.
pub trait PatchBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the bytes are not a patch this backend understands.
    fn parse_patch_file(&self, patch: &BinFile) -> Option<Box<dyn ParsedPatch>>;

    fn apply_patch(
        &self,
        rom: &BinFile,
        patch: &dyn ParsedPatch,
    ) -> Result<PatchedRom, FormatError>;

    /// Backend-provided CRC-32, if it has its own implementation.
    fn crc32(&self, _data: &[u8]) -> Option<u32> {
        None
    }
}

/// Produces the backend once, when the engine initializes.
pub trait BackendLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn PatchBackend>, crate::engine::EngineError>;
}
