//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating a source card into (relative path, name, size) records
//! - Atomic copies: temp file in the destination directory, fsync, rename
//! - Atomic writes of small metadata files (journal, manifests)
//! - Creating directories recursively

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;
use uuid::Uuid;

use crate::checksums::{DualHasher, FileChecksum, CHUNK_SIZE};
use crate::error::EngineError;

/// Suffix of in-flight temp files. Never a final file name.
pub const TEMP_SUFFIX: &str = ".offload-tmp";

/// A file discovered on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Sub-folder below the source root, `None` for files at the root
    pub relative_path: Option<String>,
    pub file_name: String,
    pub file_size: u64,
}

/// True for names the engine itself creates while writing.
pub fn is_engine_temp_file(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}

/// OS clutter that never belongs to the footage.
fn is_os_junk(name: &str) -> bool {
    name == ".DS_Store" || name == "Thumbs.db" || name == "desktop.ini" || name.starts_with("._")
}

/// Enumerate all regular files below `root`, sorted by relative path.
///
/// # Errors
/// Returns EngineError if the root cannot be read. Unreadable sub-folders are
/// an error too: silently skipping footage is worse than refusing to start.
pub fn enumerate_source(root: &Path) -> Result<Vec<SourceFile>, EngineError> {
    fn recurse(dir: &Path, rel: &Path, out: &mut Vec<SourceFile>) -> Result<(), EngineError> {
        let enum_err = |e| EngineError::Read {
            path: dir.to_path_buf(),
            source: e,
        };

        let mut entries = fs::read_dir(dir)
            .map_err(enum_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(enum_err)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_os_junk(&name) || is_engine_temp_file(&name) {
                continue;
            }
            let metadata = entry.metadata().map_err(enum_err)?;
            if metadata.is_dir() {
                recurse(&entry.path(), &rel.join(&name), out)?;
            } else if metadata.is_file() {
                let relative_path = if rel.as_os_str().is_empty() {
                    None
                } else {
                    Some(rel.to_string_lossy().replace('\\', "/"))
                };
                out.push(SourceFile {
                    relative_path,
                    file_name: name,
                    file_size: metadata.len(),
                });
            }
        }
        Ok(())
    }

    match fs::metadata(root) {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::InvalidJob {
                reason: format!("source is not a directory: {}", root.display()),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: root.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(EngineError::Read {
                path: root.to_path_buf(),
                source: e,
            })
        }
    }

    let mut files = Vec::new();
    recurse(root, Path::new(""), &mut files)?;
    Ok(files)
}

/// Resolve `path` to an absolute path with symlinks and `..` removed.
///
/// The longest existing prefix is canonicalized; components below it do not
/// exist yet, so they are normalized lexically. Nothing is created.
///
/// # Errors
/// Returns EngineError if an existing prefix cannot be resolved (for example
/// a component is a regular file).
pub fn resolve_path(path: &Path) -> Result<PathBuf, EngineError> {
    let components: Vec<Component<'_>> = path.components().collect();

    for split in (0..=components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        let base = if prefix.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            prefix
        };
        match fs::canonicalize(&base) {
            Ok(mut resolved) => {
                for component in &components[split..] {
                    match component {
                        Component::ParentDir => {
                            resolved.pop();
                        }
                        Component::CurDir => {}
                        other => resolved.push(other.as_os_str()),
                    }
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(EngineError::Read { path: base, source: e }),
        }
    }

    Err(EngineError::SourceNotFound {
        path: path.to_path_buf(),
    })
}

/// Temp path next to `dst`, on the same filesystem so the final rename is atomic.
fn temp_path_for(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    dst.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX))
}

/// Copy `src` to `dst` atomically, hashing the bytes as they are written.
///
/// The destination path is either absent, the previous file, or the complete
/// new copy. Bytes are streamed into a temp file in the destination directory,
/// flushed and synced, stamped with the source modification time, renamed into
/// place, and the directory entry is synced.
///
/// `progress` receives `(bytes_written, total)` after every chunk.
///
/// # Errors
/// Any failure removes the temp file before the error is returned.
pub fn atomic_copy(
    src: &Path,
    dst: &Path,
    progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<FileChecksum, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let read_err = |e| EngineError::Read {
        path: src.to_path_buf(),
        source: e,
    };
    let mut src_file = File::open(src).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EngineError::SourceNotFound {
                path: src.to_path_buf(),
            }
        } else {
            read_err(e)
        }
    })?;
    let src_metadata = src_file.metadata().map_err(read_err)?;
    let total = src_metadata.len();
    let src_mtime = src_metadata.modified().ok();

    copy_stream_atomically(&mut src_file, src, total, src_mtime, dst, progress)
}

/// The body of `atomic_copy`: stream `reader` into a temp file next to `dst`
/// and rename it into place.
fn copy_stream_atomically(
    reader: &mut dyn Read,
    src: &Path,
    total: u64,
    src_mtime: Option<SystemTime>,
    dst: &Path,
    mut progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<FileChecksum, EngineError> {
    let tmp = temp_path_for(dst);
    let read_err = |e| EngineError::Read {
        path: src.to_path_buf(),
        source: e,
    };
    let write_err = |e| EngineError::Write {
        path: tmp.clone(),
        source: e,
    };

    let result = (|| -> Result<FileChecksum, EngineError> {
        let mut tmp_file = File::create(&tmp).map_err(write_err)?;
        let mut hasher = DualHasher::new();
        let mut buffer = vec![0u8; CHUNK_SIZE.min(total.max(1) as usize)];
        let mut written = 0u64;

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_err(e)),
            };
            tmp_file.write_all(&buffer[..n]).map_err(write_err)?;
            hasher.update(&buffer[..n]);
            written += n as u64;
            if let Some(cb) = progress.as_mut() {
                cb(written, total);
            }
        }

        tmp_file.flush().map_err(write_err)?;
        tmp_file.sync_all().map_err(write_err)?;
        drop(tmp_file);

        if let Some(mtime) = src_mtime {
            let _ = filetime::set_file_mtime(&tmp, filetime::FileTime::from_system_time(mtime));
        }

        fs::rename(&tmp, dst).map_err(|e| EngineError::Write {
            path: dst.to_path_buf(),
            source: e,
        })?;
        Ok(hasher.finalize())
    })();

    match result {
        Ok(checksum) => {
            sync_parent_dir(dst);
            debug!(src = %src.display(), dst = %dst.display(), bytes = total, "atomic copy complete");
            Ok(checksum)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Write `bytes` to `path` with the same temp-fsync-rename discipline.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    ensure_parent_dir_exists(path)?;
    let tmp = temp_path_for(path);
    let write_err = |e| EngineError::Write {
        path: tmp.clone(),
        source: e,
    };

    let result = (|| -> Result<(), EngineError> {
        let mut file = File::create(&tmp).map_err(write_err)?;
        file.write_all(bytes).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&tmp, path).map_err(|e| EngineError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    } else {
        sync_parent_dir(path);
    }
    result
}

/// Force the directory entry of `path` to stable storage.
///
/// Only meaningful on unix; elsewhere directories cannot be opened for sync.
/// Errors are ignored: the data itself is already synced.
pub fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!(dir = %parent.display(), error = %e, "directory sync failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails or the parent is a file.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}
