use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Handle to the active log destination. When a log file is configured the
/// handle can reopen it in place, which is how log rotation is supported:
/// rotate the file away, then signal the process with SIGUSR1.
#[derive(Clone, Default)]
pub struct LogHandle {
    file: Option<Arc<ReopenableFile>>,
}

struct ReopenableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogHandle {
    fn stderr() -> Self {
        Self { file: None }
    }

    fn file(path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            file: Some(Arc::new(ReopenableFile {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            })),
        })
    }

    /// Reopen the log file at its configured path.
    pub fn reopen(&self) -> io::Result<()> {
        let Some(inner) = &self.file else {
            return Ok(());
        };
        let fresh = open_log_file(&inner.path)?;
        *inner.file.lock().expect("log file lock poisoned") = fresh;
        Ok(())
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogWriter {
    handle: LogHandle,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.handle.file {
            Some(inner) => inner
                .file
                .lock()
                .expect("log file lock poisoned")
                .write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.handle.file {
            Some(inner) => inner
                .file
                .lock()
                .expect("log file lock poisoned")
                .flush(),
            None => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            handle: self.clone(),
        }
    }
}

/// Install the global tracing subscriber honoring the configured level and
/// optional log file. Returns the handle used for SIGUSR1 reopening.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> io::Result<LogHandle> {
    let handle = match log_file {
        Some(path) => LogHandle::file(path)?,
        None => LogHandle::stderr(),
    };

    let filter = EnvFilter::try_new(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(handle.clone())
        .finish();
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(handle)
}
