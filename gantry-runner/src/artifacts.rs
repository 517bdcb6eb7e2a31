//! Artifact and cache packaging
//!
//! Builds archives for upload and unpacks downloaded ones. Zip archives hold
//! a sorted file list with workspace-relative paths; gzip and raw streams are
//! valid for exactly one file. The zstd format is a zip container with
//! zstd-compressed entries, so multi-file artifacts stay addressable.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::write::FileOptions;

use gantry_core::domain::artifact::ArchiveFormat;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O: {0}")]
    Io(#[from] io::Error),

    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{format:?} archives support exactly one file, got {count}")]
    SingleFileOnly { format: ArchiveFormat, count: usize },

    #[error("no files matched the artifact paths")]
    NoFiles,

    #[error("artifact path escapes the workspace: {0}")]
    PathEscapes(String),
}

/// Resolve the declared paths into a sorted list of workspace-relative files.
pub fn collect_files(base_dir: &Path, paths: &[String]) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut files = Vec::new();

    for path in paths {
        if Path::new(path).is_absolute() || path.split('/').any(|c| c == "..") {
            return Err(ArchiveError::PathEscapes(path.clone()));
        }

        let full = base_dir.join(path);
        if full.is_dir() {
            walk(&full, base_dir, &mut files)?;
        } else if full.is_file() {
            files.push(PathBuf::from(path));
        }
        // missing paths are skipped; the caller reports an empty archive
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn walk(dir: &Path, base_dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, base_dir, files)?;
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(base_dir) {
                files.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

/// Package `paths` (relative to `base_dir`) into `dest` using `format`.
pub fn create_archive(
    base_dir: &Path,
    paths: &[String],
    format: ArchiveFormat,
    dest: &Path,
) -> Result<(), ArchiveError> {
    let files = collect_files(base_dir, paths)?;
    if files.is_empty() {
        return Err(ArchiveError::NoFiles);
    }

    if format.single_file_only() && files.len() != 1 {
        return Err(ArchiveError::SingleFileOnly {
            format,
            count: files.len(),
        });
    }

    match format {
        ArchiveFormat::Zip => write_zip(base_dir, &files, dest, zip::CompressionMethod::Deflated),
        ArchiveFormat::Zstd => write_zip(base_dir, &files, dest, zip::CompressionMethod::Zstd),
        ArchiveFormat::Gzip => {
            let mut input = File::open(base_dir.join(&files[0]))?;
            let output = File::create(dest)?;
            let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
            Ok(())
        }
        ArchiveFormat::Raw => {
            let mut input = File::open(base_dir.join(&files[0]))?;
            let mut output = File::create(dest)?;
            io::copy(&mut input, &mut output)?;
            Ok(())
        }
    }
}

fn write_zip(
    base_dir: &Path,
    files: &[PathBuf],
    dest: &Path,
    method: zip::CompressionMethod,
) -> Result<(), ArchiveError> {
    let output = File::create(dest)?;
    let mut writer = zip::ZipWriter::new(output);
    let options = FileOptions::default().compression_method(method);

    for rel in files {
        writer.start_file(rel.to_string_lossy(), options)?;
        let mut input = File::open(base_dir.join(rel))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
    }

    writer.finish()?;
    Ok(())
}

/// Unpack a zip archive into `dest`, refusing entries that escape it.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel = match entry.enclosed_name() {
            Some(name) => name.to_path_buf(),
            None => return Err(ArchiveError::PathEscapes(entry.name().to_string())),
        };

        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&target)?;
        io::copy(&mut entry, &mut output)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("target/sub")).unwrap();
        std::fs::write(dir.path().join("target/b.txt"), b"bee").unwrap();
        std::fs::write(dir.path().join("target/a.txt"), b"ayy").unwrap();
        std::fs::write(dir.path().join("target/sub/c.txt"), b"sea").unwrap();
        std::fs::write(dir.path().join("report.xml"), b"<report/>").unwrap();
        dir
    }

    #[test]
    fn test_collect_files_sorted_and_relative() {
        let ws = workspace();
        let files =
            collect_files(ws.path(), &["target".to_string(), "report.xml".to_string()]).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("report.xml"),
                PathBuf::from("target/a.txt"),
                PathBuf::from("target/b.txt"),
                PathBuf::from("target/sub/c.txt"),
            ]
        );
    }

    #[test]
    fn test_collect_rejects_escaping_paths() {
        let ws = workspace();
        assert!(matches!(
            collect_files(ws.path(), &["../outside".to_string()]),
            Err(ArchiveError::PathEscapes(_))
        ));
        assert!(matches!(
            collect_files(ws.path(), &["/etc/passwd".to_string()]),
            Err(ArchiveError::PathEscapes(_))
        ));
    }

    #[test]
    fn test_zip_round_trip() {
        let ws = workspace();
        let archive = ws.path().join("artifacts.zip");
        create_archive(
            ws.path(),
            &["target".to_string()],
            ArchiveFormat::Zip,
            &archive,
        )
        .unwrap();

        let out = tempfile::tempdir().unwrap();
        extract_zip(&archive, out.path()).unwrap();

        assert_eq!(
            std::fs::read(out.path().join("target/a.txt")).unwrap(),
            b"ayy"
        );
        assert_eq!(
            std::fs::read(out.path().join("target/sub/c.txt")).unwrap(),
            b"sea"
        );
    }

    #[test]
    fn test_gzip_requires_single_file() {
        let ws = workspace();
        let err = create_archive(
            ws.path(),
            &["target".to_string()],
            ArchiveFormat::Gzip,
            &ws.path().join("out.gz"),
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::SingleFileOnly { count: 3, .. }));

        create_archive(
            ws.path(),
            &["report.xml".to_string()],
            ArchiveFormat::Gzip,
            &ws.path().join("out.gz"),
        )
        .unwrap();
    }

    #[test]
    fn test_raw_copies_single_file() {
        let ws = workspace();
        let dest = ws.path().join("out.raw");
        create_archive(
            ws.path(),
            &["report.xml".to_string()],
            ArchiveFormat::Raw,
            &dest,
        )
        .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"<report/>");
    }

    #[test]
    fn test_empty_archive_is_an_error() {
        let ws = workspace();
        let err = create_archive(
            ws.path(),
            &["does-not-exist".to_string()],
            ArchiveFormat::Zip,
            &ws.path().join("out.zip"),
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::NoFiles));
    }
}
