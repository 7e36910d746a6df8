use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use bitflags::bitflags;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::getpid;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

/// Install the tracing subscriber for daemon diagnostics. The operator-facing
/// proxy log is the mask-gated [`Logger`] below, not tracing.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

bitflags! {
    /// Category mask controlling which proxy log lines are emitted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogMask: u16 {
        const ERROR = 1;
        const STATUS = 2;
        const PROCESS = 4;
        const CONNECT = 8;
        const HEADERS = 16;
        const FILTER = 32;
        const DATA = 64;
        const ENGINE = 128;
    }
}

impl LogMask {
    /// Parse a `|`-joined list of case-insensitive category names.
    pub fn parse(value: &str) -> Result<Self> {
        let mut mask = LogMask::empty();
        for token in value.split('|') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            mask |= match token.to_ascii_uppercase().as_str() {
                "NONE" => LogMask::empty(),
                "ALL" => LogMask::all(),
                "ERROR" => LogMask::ERROR,
                "STATUS" => LogMask::STATUS,
                "PROCESS" => LogMask::PROCESS,
                "CONNECT" => LogMask::CONNECT,
                "HEADERS" => LogMask::HEADERS,
                "FILTER" => LogMask::FILTER,
                "DATA" => LogMask::DATA,
                "ENGINE" => LogMask::ENGINE,
                other => return Err(anyhow!("unknown log mask category '{other}'")),
            };
        }
        Ok(mask)
    }
}

enum Sink {
    Stderr(Mutex<()>),
    File(PathBuf),
    #[cfg(test)]
    Memory(Mutex<Vec<u8>>),
}

/// Timestamped, line-serialized proxy log. Each line is one `write`; file
/// sinks additionally take an exclusive advisory lock so lines from forked
/// workers are not interleaved.
pub struct Logger {
    mask: LogMask,
    sink: Sink,
}

impl Logger {
    pub fn new(mask: LogMask, logfile: Option<PathBuf>) -> Self {
        let sink = match logfile {
            Some(path) => Sink::File(path),
            None => Sink::Stderr(Mutex::new(())),
        };
        Self { mask, sink }
    }

    #[cfg(test)]
    pub fn in_memory(mask: LogMask) -> Self {
        Self {
            mask,
            sink: Sink::Memory(Mutex::new(Vec::new())),
        }
    }

    pub fn enabled(&self, category: LogMask) -> bool {
        self.mask.intersects(category)
    }

    /// Emit one log line if `category` intersects the configured mask.
    /// Logging is best-effort; sink errors are reported through tracing only.
    pub fn log(&self, category: LogMask, message: &str) {
        if !self.enabled(category) {
            return;
        }
        let line = format!("[{}] ({}) {message}\n", timestamp(), getpid());
        if let Err(err) = self.write_line(line.as_bytes()) {
            tracing::debug!(error = %err, "failed to write proxy log line");
        }
    }

    fn write_line(&self, line: &[u8]) -> Result<()> {
        match &self.sink {
            Sink::Stderr(serial) => {
                let _guard = serial.lock().map_err(|_| anyhow!("log lock poisoned"))?;
                std::io::stderr().write_all(line)?;
            }
            Sink::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let mut locked = Flock::lock(file, FlockArg::LockExclusive)
                    .map_err(|(_, errno)| anyhow!("failed to lock log file: {errno}"))?;
                locked.write_all(line)?;
            }
            #[cfg(test)]
            Sink::Memory(buffer) => {
                let mut buffer = buffer.lock().map_err(|_| anyhow!("log lock poisoned"))?;
                buffer.extend_from_slice(line);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn captured(&self) -> String {
        match &self.sink {
            Sink::Memory(buffer) => {
                String::from_utf8_lossy(&buffer.lock().expect("log lock")).into_owned()
            }
            _ => String::new(),
        }
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let month: u8 = month.into();
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}
