use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::PathBuf;

use crate::catalog::Catalog;
use crate::crc32::{crc32, format_crc32};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub path: PathBuf,
    pub crc32: String,
    /// Ids of catalog entries that expect this ROM as their base.
    pub matches: Vec<String>,
}

/// Checksum ROM files in parallel on the blocking pool. Output order follows `paths`.
pub async fn checksum_files(paths: Vec<PathBuf>) -> Result<Vec<(PathBuf, u32)>> {
    tokio::task::spawn_blocking(move || {
        paths
            .into_par_iter()
            .map(|path| -> Result<(PathBuf, u32)> {
                let map = util::mmap_file(&path)?;
                let crc = crc32(&map);
                Ok((path, crc))
            })
            .collect()
    })
    .await
    .context("Checksum task failed")?
}

/// Match each ROM against the catalog's declared base ROM checksums.
pub async fn identify_roms(catalog: &Catalog, paths: Vec<PathBuf>) -> Result<Vec<Identification>> {
    Ok(checksum_files(paths)
        .await?
        .into_iter()
        .map(|(path, crc)| Identification {
            matches: catalog
                .find_by_crc32(crc)
                .into_iter()
                .map(|e| e.id.clone())
                .collect(),
            crc32: format_crc32(crc),
            path,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identify() {
        let dir = tempfile::tempdir().unwrap();
        let red = dir.path().join("red.gb");
        let blue = dir.path().join("blue.gb");
        std::fs::write(&red, b"123456789").unwrap();
        std::fs::write(&blue, b"blue").unwrap();

        let catalog = Catalog::from_json(
            br#"[
                {"id": "red-plus", "title": "Red+", "file": "a.ips", "type": "ips", "crc32": "CBF43926"},
                {"id": "red-max", "title": "Red Max", "file": "b.bps", "type": "bps", "crc32": "cbf43926"},
                {"id": "gold", "title": "Gold", "file": "c.bps", "type": "bps", "crc32": "00000000"}
            ]"#,
        )
        .unwrap();

        let results = identify_roms(&catalog, vec![red.clone(), blue.clone()])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, red);
        assert_eq!(results[0].crc32, "CBF43926");
        assert_eq!(results[0].matches, vec!["red-plus", "red-max"]);
        assert_eq!(results[1].path, blue);
        assert!(results[1].matches.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(checksum_files(vec![dir.path().join("nope.gb")]).await.is_err());
    }

    #[tokio::test]
    async fn test_checksum_files_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..8).map(|i| dir.path().join(format!("{}.gb", i))).collect();
        for path in &paths {
            std::fs::write(path, b"123456789").unwrap();
        }
        let sums = checksum_files(paths.clone()).await.unwrap();
        let returned: Vec<_> = sums.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(returned, paths);
        assert!(sums.iter().all(|(_, crc)| *crc == 0xCBF4_3926));
    }
}
