//! Subprocess log files
//!
//! Each subprocess gets one log file holding a raw copy of its stdout and
//! stderr. Stderr is handed to the child as the file itself. Stdout goes
//! through a pump when the control process needs to watch it (readiness
//! lines, completion reports); the pump copies bytes verbatim before looking
//! at them.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::warn;

/// Create the log directory if needed
pub fn ensure_log_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// A truncated log file for one subprocess
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            ensure_log_dir(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A duplicate descriptor suitable for `Stdio::from`.
    ///
    /// Duplicates share one file offset, so the child's direct writes and the
    /// pump's writes interleave instead of overwriting each other.
    pub fn handle(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    pub fn async_handle(&self) -> io::Result<tokio::fs::File> {
        Ok(tokio::fs::File::from_std(self.handle()?))
    }
}

/// Copy `reader` into `log` line by line, calling `on_line` with each line's
/// text after it has been written. Finishes at end of stream.
pub fn spawn_output_pump<R, F>(reader: R, mut log: tokio::fs::File, mut on_line: F) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(&str) + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut log_ok = true;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if log_ok {
                        if let Err(e) = log.write_all(&buf).await {
                            warn!("Log write failed, continuing without log copy: {}", e);
                            log_ok = false;
                        }
                    }
                    let text = String::from_utf8_lossy(&buf);
                    on_line(text.trim_end_matches(['\r', '\n']));
                }
                Err(e) => {
                    warn!("Reading subprocess output failed: {}", e);
                    break;
                }
            }
        }

        if log_ok {
            let _ = log.flush().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_pump_copies_raw_and_reports_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::create(dir.path().join("sub").join("p.log")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let input: &[u8] = b"first\r\nsecond\nno newline";
        let pump = spawn_output_pump(input, log.async_handle().unwrap(), move |line| {
            sink.lock().unwrap().push(line.to_string());
        });
        pump.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), ["first", "second", "no newline"]);
        let written = std::fs::read(log.path()).unwrap();
        assert_eq!(written, input);
    }

    #[tokio::test]
    async fn test_shared_offset_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::create(dir.path().join("shared.log")).unwrap();

        let mut direct = log.handle().unwrap();
        direct.write_all(b"stderr line\n").unwrap();

        let pump = spawn_output_pump(&b"stdout line\n"[..], log.async_handle().unwrap(), |_| {});
        pump.await.unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, "stderr line\nstdout line\n");
    }
}
