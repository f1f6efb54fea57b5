use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::err::server_error::ServerError;
use crate::err::SResult;

static PIPE_SEQ: AtomicU64 = AtomicU64::new(1);

/// A named FIFO bridging a streaming wire operation (COPY TO, LOAD DATA)
/// and the engine's file-based bulk statements. The file is removed when
/// the guard drops, on every exit path.
#[derive(Debug)]
pub struct PipeFile {
    path: PathBuf,
}

impl PipeFile {
    pub fn create(dir: &Path, label: &str) -> SResult<Self> {
        let seq = PIPE_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            ".pipe_{}_{}_{}",
            label,
            std::process::id(),
            seq
        ));

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ServerError::String("pipe path contains NUL".to_string()))?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }

        Ok(PipeFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

impl Drop for PipeFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove pipe {:?}: {}", self.path, err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::PipeFile;

    #[test]
    fn test_create_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let pipe = PipeFile::create(dir.path(), "copy").unwrap();
            assert!(pipe.path().exists());
            pipe.path().to_path_buf()
        };
        // removed on drop
        assert!(!path.exists());
    }
}
