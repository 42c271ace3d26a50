use std::sync::Arc;
use tracing::{debug, warn};

use crate::bps::{self, BpsPatch};
use crate::catalog::PatchType;
use crate::engine::EngineError;
use crate::ips::{self, IpsPatch};
use crate::patch_format::{
    BackendLoader, BinFile, FormatError, ParsedPatch, PatchBackend, PatchedRom,
};
use crate::ups::{self, UpsPatch};
use crate::util;

/// Formats the native backend can parse. xdelta is not among them.
pub const SUPPORTED_FORMATS: [PatchType; 3] = [PatchType::Ips, PatchType::Ups, PatchType::Bps];

/// Native IPS/UPS/BPS parser and applier.
pub struct BuiltinBackend {
    enabled: Vec<PatchType>,
}

impl BuiltinBackend {
    pub fn new(enabled: Vec<PatchType>) -> Self {
        Self { enabled }
    }

    fn parse(data: &[u8]) -> Option<Result<Box<dyn ParsedPatch>, FormatError>> {
        fn boxed<P: ParsedPatch + 'static>(
            parsed: Result<P, FormatError>,
        ) -> Result<Box<dyn ParsedPatch>, FormatError> {
            parsed.map(|p| Box::new(p) as Box<dyn ParsedPatch>)
        }

        if data.starts_with(ips::MAGIC) {
            Some(boxed(IpsPatch::parse(data)))
        } else if data.starts_with(ups::MAGIC) {
            Some(boxed(UpsPatch::parse(data)))
        } else if data.starts_with(bps::MAGIC) {
            Some(boxed(BpsPatch::parse(data)))
        } else {
            None
        }
    }
}

impl PatchBackend for BuiltinBackend {
    fn name(&self) -> &str {
        "builtin"
    }

    fn parse_patch_file(&self, patch: &BinFile) -> Option<Box<dyn ParsedPatch>> {
        match Self::parse(&patch.bytes) {
            None => {
                debug!("Unrecognized patch header in {}", patch.file_name);
                None
            }
            Some(Err(e)) => {
                warn!("Rejected patch {}: {}", patch.file_name, e);
                None
            }
            Some(Ok(parsed)) if !self.enabled.contains(&parsed.format()) => {
                warn!(
                    "Patch {} is {} which is not enabled",
                    patch.file_name,
                    parsed.format()
                );
                None
            }
            Some(Ok(parsed)) => Some(parsed),
        }
    }

    fn apply_patch(
        &self,
        rom: &BinFile,
        patch: &dyn ParsedPatch,
    ) -> Result<PatchedRom, FormatError> {
        let bytes = patch.apply(&rom.bytes)?;
        Ok(PatchedRom {
            file_name: util::patched_file_name(&rom.file_name),
            bytes,
        })
    }
}

/// Loads [`BuiltinBackend`], failing when a required format has no parser.
pub struct BuiltinLoader {
    required: Vec<PatchType>,
}

impl BuiltinLoader {
    pub fn new(required: Vec<PatchType>) -> Self {
        Self { required }
    }
}

impl Default for BuiltinLoader {
    fn default() -> Self {
        Self::new(SUPPORTED_FORMATS.to_vec())
    }
}

impl BackendLoader for BuiltinLoader {
    fn load(&self) -> Result<Arc<dyn PatchBackend>, EngineError> {
        if self.required.is_empty() {
            return Err(EngineError::EngineLoad("no patch formats enabled".into()));
        }
        if let Some(missing) = self
            .required
            .iter()
            .find(|f| !SUPPORTED_FORMATS.contains(f))
        {
            return Err(EngineError::EngineLoad(format!(
                "no parser available for required format '{}'",
                missing
            )));
        }
        Ok(Arc::new(BuiltinBackend::new(self.required.clone())))
    }
}
