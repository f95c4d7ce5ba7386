use crate::config::{env_value, Config};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

type SharedFile = Arc<Mutex<std::fs::File>>;

/// Keeps the mirrored log file open for the life of the command.
pub struct LogGuard {
    path: Option<PathBuf>,
    file: Option<SharedFile>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Installs the global subscriber for one `sbx` invocation. Each command
/// mirrors into its own file so a long `progress` session and a one-shot
/// `chat` never interleave. Returns `None` when a subscriber is already set.
pub fn init_logging(config: &Config, command: &str) -> Option<LogGuard> {
    let level = default_level(config.debug, env_value("SBX_LOG_LEVEL"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = match open_log_file(&config.log_dir, command) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard {
                path: None,
                file: None,
            }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || StderrTee::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    if let Some(path) = guard.path() {
        tracing::debug!(event = "log_file_opened", command, path = %path.display());
    }
    Some(guard)
}

fn default_level(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level.unwrap_or_else(|| "info".to_string())
}

// stdout belongs to command output.
struct StderrTee {
    stderr: io::Stderr,
    file: Option<SharedFile>,
}

impl StderrTee {
    fn new(file: Option<SharedFile>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for StderrTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(mut file) = self.file.as_ref().and_then(|file| file.lock().ok()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(mut file) = self.file.as_ref().and_then(|file| file.lock().ok()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, command: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard {
            path: None,
            file: None,
        });
    }
    let dir = PathBuf::from(log_dir.trim());
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(log_file_name(command, std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        path: Some(path),
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn log_file_name(command: &str, pid: u32) -> String {
    format!("sbx-{command}-{pid}.log")
}
