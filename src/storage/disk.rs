//! Free disk space checks

use std::path::Path;

const BYTES_PER_MB: u64 = 1_048_576;

/// Free space available to unprivileged writers on the filesystem holding `path` (bytes).
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn available_bytes(path: &Path) -> std::io::Result<u64> {
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is NUL-terminated and stat points to writable memory of the right size
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: statvfs returned 0, so the struct is initialised
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "free space check not supported on this platform",
    ))
}

/// Available space in whole MiB, or `None` when it cannot be determined.
pub fn available_mb(path: &Path) -> Option<u64> {
    match available_bytes(path) {
        Ok(bytes) => Some(bytes / BYTES_PER_MB),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Could not check disk space");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_tempdir_has_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_bytes(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_missing_path_is_unknown() {
        assert!(available_mb(Path::new("/definitely/not/a/real/path")).is_none());
    }
}
