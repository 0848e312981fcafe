use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::StorageError;

/// Suffix used for in-flight writes; files carrying it are never live state.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Move a file from `src` to `dst`. Uses `rename` first (fast, atomic on same
/// filesystem). Falls back to copy + delete when rename fails, which covers
/// cross-device moves into archive or error folders on another volume.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Rename without any copy fallback. Queue state transitions must never be
/// observable half-done, so a failed rename is reported instead of emulated.
pub fn atomic_rename(src: &Path, dst: &Path) -> Result<(), StorageError> {
    std::fs::rename(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })
}

/// Writes `content` to a sibling temp file, flushes it and renames it over
/// `path`. Readers see either the old or the new content, never a mix.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(format!(".{}{}", uuid::Uuid::new_v4().simple(), TEMP_SUFFIX));
    let tmp_path = path.with_file_name(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()
    };

    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        });
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        });
    }

    Ok(())
}

pub fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Resolves filename conflicts by finding an available name.
///
/// Returns `directory/filename` when free, otherwise `name_2.ext`,
/// `name_3.ext`, ... up to 1000 attempts.
pub fn resolve_conflict(directory: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    let path = directory.join(filename);

    // symlink_metadata also catches broken symlinks occupying the name
    if std::fs::symlink_metadata(&path).is_err() {
        return Ok(path);
    }

    let (base, ext) = match filename.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => (&filename[..dot_pos], Some(&filename[dot_pos..])),
        _ => (filename, None),
    };

    for counter in 2..=1000 {
        let new_filename = match ext {
            Some(ext) => format!("{}_{}{}", base, counter, ext),
            None => format!("{}_{}", base, counter),
        };

        let new_path = directory.join(&new_filename);
        if std::fs::symlink_metadata(&new_path).is_err() {
            return Ok(new_path);
        }
    }

    Err(StorageError::FileExists(path))
}

/// Moves `source` into `directory`, keeping its file name when possible.
pub fn move_into(source: &Path, directory: &Path) -> Result<PathBuf, StorageError> {
    ensure_directory(directory)?;

    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let target = resolve_conflict(directory, filename)?;

    move_file(source, &target)?;
    Ok(target)
}

/// Compresses `source` into `<directory>/<file name>.zip` and removes the
/// original once the archive is complete.
pub fn zip_into(source: &Path, directory: &Path) -> Result<PathBuf, StorageError> {
    ensure_directory(directory)?;

    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let target = resolve_conflict(directory, &format!("{}.zip", filename))?;

    let archive_err = |reason: String| StorageError::Archive {
        path: target.clone(),
        reason,
    };

    let build = || -> Result<(), StorageError> {
        let input = File::open(source).map_err(|e| archive_err(e.to_string()))?;
        let output = File::create(&target).map_err(|e| StorageError::WriteFile {
            path: target.clone(),
            source: e,
        })?;

        let mut zip = ZipWriter::new(BufWriter::new(output));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(filename, options)
            .map_err(|e| archive_err(e.to_string()))?;
        std::io::copy(&mut BufReader::new(input), &mut zip)
            .map_err(|e| archive_err(e.to_string()))?;
        zip.finish().map_err(|e| archive_err(e.to_string()))?;
        Ok(())
    };

    if let Err(e) = build() {
        let _ = std::fs::remove_file(&target);
        return Err(e);
    }

    std::fs::remove_file(source).map_err(|e| StorageError::DeleteFile {
        path: source.to_path_buf(),
        source: e,
    })?;

    Ok(target)
}

pub fn delete_file(path: &Path) -> Result<(), StorageError> {
    std::fs::remove_file(path).map_err(|e| StorageError::DeleteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("item.pending.wsjf");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_move_into_creates_directory_and_keeps_name() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("test.xml");
        std::fs::write(&source, b"<test/>").unwrap();

        let archive = temp_dir.path().join("archive").join("nested");
        let moved = move_into(&source, &archive).unwrap();

        assert!(!source.exists());
        assert_eq!(moved, archive.join("test.xml"));
        assert_eq!(std::fs::read(&moved).unwrap(), b"<test/>");
    }

    #[test]
    fn test_move_into_resolves_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("archive");
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::write(archive.join("test.xml"), b"old").unwrap();

        let source = temp_dir.path().join("test.xml");
        std::fs::write(&source, b"new").unwrap();

        let moved = move_into(&source, &archive).unwrap();
        assert!(moved.ends_with("test_2.xml"));
        assert_eq!(std::fs::read(archive.join("test.xml")).unwrap(), b"old");
    }

    #[test]
    fn test_resolve_conflict_without_extension() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("README"), b"x").unwrap();

        let path = resolve_conflict(temp_dir.path(), "README").unwrap();
        assert!(path.ends_with("README_2"));
    }

    #[test]
    fn test_zip_into_removes_source() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("log.csv");
        std::fs::write(&source, b"a,b,c\n1,2,3\n").unwrap();

        let archive_dir = temp_dir.path().join("zipped");
        let zipped = zip_into(&source, &archive_dir).unwrap();

        assert!(!source.exists());
        assert!(zipped.ends_with("log.csv.zip"));

        let mut archive = zip::ZipArchive::new(File::open(&zipped).unwrap()).unwrap();
        let mut entry = archive.by_name("log.csv").unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "a,b,c\n1,2,3\n");
    }
}
