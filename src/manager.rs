use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::PatchCatalogEntry;
use crate::engine::{EngineError, PatchEngine};
use crate::patch_format::{BinFile, PatchedRom};
use crate::source::{FetchError, PatchSource};
use crate::util;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("No patch selected")]
    NoSelection,

    #[error("No ROM file selected")]
    MissingRom,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to load patch: {0}")]
    Network(#[from] FetchError),

    #[error("Failed to save patched ROM: {0}")]
    Download(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Info,
    Success,
    Error,
}

/// A line of user-facing feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub text: String,
}

impl StatusMessage {
    fn new(kind: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub calculated_crc32: String,
    pub expected: String,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// No patch selected, or the patch declares no checksum.
    Indeterminate,
    Checked(ValidationResult),
    /// The selection changed (or a newer validation started) before this one finished.
    Superseded,
}

/// Receives the patched ROM once application succeeds.
pub trait DownloadSink: Send + Sync {
    fn offer(&self, rom: &PatchedRom) -> std::io::Result<PathBuf>;
}

/// Writes patched ROMs into a directory, atomically.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DownloadSink for DirectorySink {
    fn offer(&self, rom: &PatchedRom) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        // Only the final component: patched names must not escape the output dir.
        let name = Path::new(&rom.file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "patched.rom".into());
        let target = self.dir.join(name);

        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(&rom.bytes)?;
        file.flush()?;
        file.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }
}

#[derive(Default)]
struct ManagerState {
    hack: Option<PatchCatalogEntry>,
    /// Bumped on every selection change.
    selection: u64,
    /// Bumped on every selection change and every validation start.
    validation: u64,
    validation_message: Option<StatusMessage>,
    status: Option<StatusMessage>,
}

/// Coordinates selection, ROM validation and patch application.
pub struct PatchManager {
    engine: Arc<PatchEngine>,
    source: Arc<dyn PatchSource>,
    sink: Arc<dyn DownloadSink>,
    state: Mutex<ManagerState>,
}

impl PatchManager {
    pub fn new(
        engine: Arc<PatchEngine>,
        source: Arc<dyn PatchSource>,
        sink: Arc<dyn DownloadSink>,
    ) -> Self {
        Self {
            engine,
            source,
            sink,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn engine(&self) -> &Arc<PatchEngine> {
        &self.engine
    }

    pub fn selected_hack(&self) -> Option<PatchCatalogEntry> {
        self.lock().hack.clone()
    }

    pub fn validation_message(&self) -> Option<StatusMessage> {
        self.lock().validation_message.clone()
    }

    pub fn status(&self) -> Option<StatusMessage> {
        self.lock().status.clone()
    }

    /// Whether the apply action is available. Checksum mismatches never disable it.
    pub fn can_apply(&self) -> bool {
        self.engine.is_ready() && self.lock().hack.is_some()
    }

    /// Replace the selection. Any validation or status from the previous
    /// selection is cleared and in-flight validations become stale.
    pub fn set_selected_hack(&self, hack: Option<PatchCatalogEntry>) {
        let mut state = self.lock();
        debug!(
            "Selected {}",
            hack.as_ref().map(|h| h.id.as_str()).unwrap_or("<none>")
        );
        state.hack = hack;
        state.selection += 1;
        state.validation += 1;
        state.validation_message = None;
        state.status = None;
    }

    /// Compare the ROM's CRC-32 with the selected patch's declared checksum.
    /// A mismatch is reported but does not block patching.
    pub async fn validate_rom(&self, rom: &BinFile) -> Result<Validation, EngineError> {
        let (ticket, expected) = {
            let mut state = self.lock();
            state.validation += 1;
            let expected = state.hack.as_ref().and_then(|h| h.crc32.clone());
            match expected {
                Some(expected) => (state.validation, expected),
                None => {
                    state.validation_message = None;
                    return Ok(Validation::Indeterminate);
                }
            }
        };

        let calculated = self.engine.calculate_crc32(rom).await;

        let mut state = self.lock();
        if state.validation != ticket {
            debug!("Discarding stale validation of {}", rom.file_name);
            return Ok(Validation::Superseded);
        }

        let calculated = match calculated {
            Ok(crc) => crc,
            Err(e) => {
                warn!("ROM validation failed: {}", e);
                state.validation_message = Some(StatusMessage::new(
                    StatusKind::Error,
                    format!("Cannot validate ROM: {}", e),
                ));
                return Err(e);
            }
        };

        let matches = calculated.eq_ignore_ascii_case(&expected);
        let message = if matches {
            StatusMessage::new(StatusKind::Success, "ROM validated")
        } else {
            StatusMessage::new(
                StatusKind::Error,
                format!("CRC32 mismatch: expected {}, got {}", expected, calculated),
            )
        };
        info!("{}: {}", rom.file_name, message);
        state.validation_message = Some(message);

        Ok(Validation::Checked(ValidationResult {
            calculated_crc32: calculated,
            expected,
            matches,
        }))
    }

    /// Fetch the selected patch, apply it to `rom` and hand the result to the
    /// download sink. Either the sink receives a ROM or an error status is
    /// set, never both. The selection is left as it was.
    pub async fn apply_patch(&self, rom: Option<&BinFile>) -> Result<PathBuf, PatchError> {
        let selection = self.lock().selection;
        let result = self.run_apply(rom, selection).await;

        let mut state = self.lock();
        let message = match &result {
            Ok(path) => {
                info!("Patched ROM written to {}", path.display());
                StatusMessage::new(StatusKind::Success, "Patch applied successfully!")
            }
            Err(e) => {
                warn!("Patching failed: {}", e);
                StatusMessage::new(StatusKind::Error, format!("Error: {}", e))
            }
        };
        if state.selection == selection {
            state.status = Some(message);
        }
        result
    }

    async fn run_apply(&self, rom: Option<&BinFile>, selection: u64) -> Result<PathBuf, PatchError> {
        let entry = self.selected_hack().ok_or(PatchError::NoSelection)?;
        if !self.engine.is_ready() {
            return Err(EngineError::EngineNotReady.into());
        }
        let rom = rom.ok_or(PatchError::MissingRom)?;

        {
            let mut state = self.lock();
            if state.selection == selection {
                state.status = Some(StatusMessage::new(StatusKind::Info, "Patching..."));
            }
        }

        info!("Fetching patch {}", self.source.describe(&entry.file));
        let bytes = self.source.fetch(&entry.file).await?;
        let patch = BinFile::new(util::file_name(Path::new(&entry.file)), bytes);

        let patched = self.engine.apply_patch(rom, &patch).await?;

        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.offer(&patched))
            .await
            .map_err(|e| PatchError::Download(std::io::Error::other(e)))?
            .map_err(PatchError::Download)
    }
}
