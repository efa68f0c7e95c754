//! Page-cache bypass for verification reads.
//!
//! A verification read has to come from the physical medium, not from pages
//! the copy left in memory. A `CacheDropper` opens the file and applies the
//! platform's bypass to that handle; the hash is then read from the same
//! handle. The bypass is best effort: a platform without the primitive, or a
//! failed call, means the read may be served from cache. It never fails a job.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::checksums::{compute_checksum_from, FileChecksum};
use crate::error::EngineError;

/// Opens files for reads that should bypass the page cache.
pub trait CacheDropper: Send {
    /// Open `path` for reading with cached pages evicted or caching disabled
    /// on the returned handle. Only the open itself may fail.
    fn open_uncached(&self, path: &Path) -> io::Result<File>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// `posix_fadvise(POSIX_FADV_DONTNEED)` over the whole file.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct FadviseDropper;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
impl CacheDropper for FadviseDropper {
    fn open_uncached(&self, path: &Path) -> io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = File::open(path)?;
        // Dirty pages cannot be evicted; push them out first.
        let _ = file.sync_data();
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
        if rc != 0 {
            tracing::debug!(path = %path.display(), rc, "posix_fadvise failed");
        }
        Ok(file)
    }

    fn name(&self) -> &'static str {
        "fadvise"
    }
}

/// `fcntl(F_NOCACHE)` on macOS.
///
/// The flag belongs to the descriptor, so it is set on the handle that is
/// returned and read from.
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCacheDropper;

#[cfg(target_os = "macos")]
impl CacheDropper for NoCacheDropper {
    fn open_uncached(&self, path: &Path) -> io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = File::open(path)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if rc == -1 {
            tracing::debug!(path = %path.display(), "fcntl(F_NOCACHE) failed");
        }
        Ok(file)
    }

    fn name(&self) -> &'static str {
        "f_nocache"
    }
}

/// For platforms without a cache-eviction primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDropper;

impl CacheDropper for NoopDropper {
    fn open_uncached(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// The dropper for the platform this engine was compiled for.
pub fn platform_dropper() -> Box<dyn CacheDropper> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        Box::new(FadviseDropper)
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(NoCacheDropper)
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "macos"
    )))]
    {
        Box::new(NoopDropper)
    }
}

/// Hash `path` from storage, reading through the dropper's uncached handle.
pub fn verified_reread(
    dropper: &dyn CacheDropper,
    path: &Path,
    progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<FileChecksum, EngineError> {
    let file = dropper.open_uncached(path).map_err(|e| EngineError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    compute_checksum_from(file, path, progress)
}
