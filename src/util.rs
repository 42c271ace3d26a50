use anyhow::{Context, Result};
use memmap2::Mmap;
use std::path::Path;

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; ROM files are not modified while mapped.
    unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// File name component of a path, falling back to the whole path.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

/// `Pokemon Crystal.gbc` -> `Pokemon Crystal (patched).gbc`
pub fn patched_file_name(rom_name: &str) -> String {
    let path = Path::new(rom_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(rom_name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{} (patched).{}", stem, ext),
        None => format!("{} (patched)", stem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patched_file_name() {
        assert_eq!(
            patched_file_name("Pokemon Crystal.gbc"),
            "Pokemon Crystal (patched).gbc"
        );
        assert_eq!(patched_file_name("rom"), "rom (patched)");
    }

    #[test]
    fn test_mmap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.gb");
        std::fs::write(&path, b"\x00\x01\x02").unwrap();
        let map = mmap_file(&path).unwrap();
        assert_eq!(&map[..], b"\x00\x01\x02");
        assert_eq!(file_name(&path), "rom.gb");
    }
}
