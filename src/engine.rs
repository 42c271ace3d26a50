use anyhow::Context;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::crc32::{crc32_hex, format_crc32};
use crate::patch_format::{BackendLoader, BinFile, PatchBackend, PatchedRom};
use crate::util;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Patch engine failed to load: {0}")]
    EngineLoad(String),

    #[error("Patch engine not ready")]
    EngineNotReady,

    #[error("Invalid patch file format")]
    InvalidPatchFormat,

    #[error("{0}")]
    PatchApplication(String),
}

/// Readiness of the patch backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
}

enum Readiness {
    Uninitialized,
    Loading,
    Ready(Arc<dyn PatchBackend>),
    Failed(String),
}

/// Facade over a [`PatchBackend`] that is loaded once and may fail to load.
///
/// Operations never wait for loading: unless the engine is `Ready` they
/// return [`EngineError::EngineNotReady`] straight away.
pub struct PatchEngine {
    loader: Arc<dyn BackendLoader>,
    readiness: RwLock<Readiness>,
    init_lock: tokio::sync::Mutex<()>,
}

impl PatchEngine {
    pub fn new(loader: Arc<dyn BackendLoader>) -> Self {
        Self {
            loader,
            readiness: RwLock::new(Readiness::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> EngineState {
        match &*self.readiness.read().unwrap_or_else(|e| e.into_inner()) {
            Readiness::Uninitialized => EngineState::Uninitialized,
            Readiness::Loading => EngineState::Loading,
            Readiness::Ready(_) => EngineState::Ready,
            Readiness::Failed(reason) => EngineState::Failed(reason.clone()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    fn set_readiness(&self, next: Readiness) {
        *self.readiness.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn backend(&self) -> Result<Arc<dyn PatchBackend>, EngineError> {
        match &*self.readiness.read().unwrap_or_else(|e| e.into_inner()) {
            Readiness::Ready(backend) => Ok(Arc::clone(backend)),
            _ => Err(EngineError::EngineNotReady),
        }
    }

    /// Load the backend. Idempotent once `Ready`; concurrent callers share a
    /// single load. After a failure, calling `init` again retries.
    pub async fn init(&self) -> Result<(), EngineError> {
        let _guard = self.init_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        self.set_readiness(Readiness::Loading);
        info!("Loading patch backend");

        let loader = Arc::clone(&self.loader);
        let loaded = match tokio::task::spawn_blocking(move || loader.load()).await {
            Ok(result) => result,
            Err(e) => Err(EngineError::EngineLoad(format!("loader task failed: {}", e))),
        };

        match loaded {
            Ok(backend) => {
                info!("Patch engine ready (backend: {})", backend.name());
                self.set_readiness(Readiness::Ready(backend));
                Ok(())
            }
            Err(e) => {
                error!("Patch engine initialization failed: {}", e);
                self.set_readiness(Readiness::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// CRC-32 of a ROM as 8 uppercase hex digits. Uses the backend's own
    /// checksum when it provides one.
    pub async fn calculate_crc32(&self, rom: &BinFile) -> Result<String, EngineError> {
        let backend = self.backend()?;
        let bytes = Arc::clone(&rom.bytes);
        tokio::task::spawn_blocking(move || match backend.crc32(&bytes) {
            Some(value) => format_crc32(value),
            None => crc32_hex(&bytes),
        })
        .await
        .map_err(|e| EngineError::PatchApplication(format!("checksum task failed: {}", e)))
    }

    /// Parse `patch` with the backend and apply it to `rom`.
    pub async fn apply_patch(
        &self,
        rom: &BinFile,
        patch: &BinFile,
    ) -> Result<PatchedRom, EngineError> {
        let backend = self.backend()?;
        let rom = rom.clone();
        let patch = patch.clone();

        tokio::task::spawn_blocking(move || {
            let parsed = backend
                .parse_patch_file(&patch)
                .ok_or(EngineError::InvalidPatchFormat)?;
            debug!(
                "Applying {} patch {} to {}",
                parsed.format(),
                patch.file_name,
                rom.file_name
            );
            backend
                .apply_patch(&rom, parsed.as_ref())
                .map_err(|e| EngineError::PatchApplication(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::PatchApplication(format!("patch backend aborted: {}", e)))?
    }
}

/// Read a file from disk into a [`BinFile`].
pub async fn read_bin_file(path: &Path) -> anyhow::Result<BinFile> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<BinFile> {
        let map = util::mmap_file(&path)?;
        Ok(BinFile::new(util::file_name(&path), &map[..]))
    })
    .await
    .context("File read task failed")?
}
