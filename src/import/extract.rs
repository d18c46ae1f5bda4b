use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path};
use tempfile::TempDir;

use crate::error::GridwareError;

/// Unpack a gzip tarball into a fresh temporary directory, removed when the
/// returned handle drops.
pub fn extract_tar_gz(archive_path: &Path) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("gridware-import.")
        .tempdir()
        .context("creating extraction directory")?;
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    extract_tar(decoder, dir.path()).map_err(|e| {
        GridwareError::Archive(format!("Unable to extract tarball: {e:#}"))
    })?;
    Ok(dir)
}

fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(GridwareError::Archive(format!(
                "Invalid path in archive: {}",
                relative.display()
            ))
            .into());
        }
        let target = dest_dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("unpacking {}", relative.display()))?;
    }
    Ok(())
}

/// Pack the contents of `dir` into a gzip tarball at `archive_path`, with
/// entries relative to `dir`.
pub fn pack_tar_gz(dir: &Path, archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path)
        .with_context(|| format!("creating archive {}", archive_path.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("packing {}", dir.display()))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("writing archive {}", archive_path.display()))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_round_trip() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("el7/pkg")).unwrap();
        fs::write(src.path().join("metadata.yml"), "type: apps\n").unwrap();
        fs::write(src.path().join("el7/pkg/file"), "payload").unwrap();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("a.tar.gz");
        testing::pack_dir(src.path(), &archive);

        let extracted = extract_tar_gz(&archive).unwrap();
        assert_eq!(
            fs::read_to_string(extracted.path().join("el7/pkg/file")).unwrap(),
            "payload"
        );
        let kept = extracted.path().to_path_buf();
        drop(extracted);
        assert!(!kept.exists());
    }

    #[test]
    fn test_garbage_is_an_archive_error() {
        let out = TempDir::new().unwrap();
        let archive = out.path().join("bad.tar.gz");
        fs::write(&archive, "not a tarball").unwrap();
        let err = extract_tar_gz(&archive).unwrap_err();
        assert!(matches!(
            GridwareError::classify(&err),
            Some(GridwareError::Archive(_))
        ));
    }
}
