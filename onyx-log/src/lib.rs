//! Console logging for the Onyx engine, built on [`tracing`].
//!
//! Every diagnostic in the engine is an ordinary `tracing` event. This
//! crate supplies the [`ConsoleLayer`] that renders them as
//!
//! ```text
//! [14:03:27] [Warning]	Requested device extension VK_EXT_foo is not supported
//! ```
//!
//! plus a handful of macros for the channels `tracing` has no level for.
//!
//! # Channels
//!
//! | channel    | emitted by                          | mask bit     |
//! |------------|-------------------------------------|--------------|
//! | Print      | [`plain!`]                          | `GENERAL`    |
//! | Debug      | `tracing::debug!` / `trace!`        | `DEBUG`      |
//! | Message    | `tracing::info!`                    | `STATUS`     |
//! | Success    | [`success!`]                        | `STATUS`     |
//! | Failure    | [`failure!`]                        | `STATUS`     |
//! | Warning    | `tracing::warn!`                    | `WARNINGS`   |
//! | Error      | `tracing::error!`                   | `ERRORS`     |
//! | Fatal      | [`fatal!`]                          | `ERRORS`     |
//! | Validation | [`validation!`]                     | `VALIDATION` |
//!
//! Library crates only emit events. The process-wide logger is installed
//! by the application through [`init`], or lazily by [`logger`].

use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
};

use thiserror::Error;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod layer;
mod severity;

pub use layer::ConsoleLayer;
pub use severity::{Severity, SeverityFlags, SeverityHandle};
pub use tracing;

/// Event targets that select the engine-specific channels.
pub mod target {
    pub const PRINT: &str = "onyx::print";
    pub const SUCCESS: &str = "onyx::success";
    pub const FAILURE: &str = "onyx::failure";
    pub const FATAL: &str = "onyx::fatal";
    pub const VALIDATION: &str = "onyx::validation";
}

/// Untagged line on the Print channel.
#[macro_export]
macro_rules! plain {
    ($($arg:tt)+) => {
        $crate::tracing::info!(target: $crate::target::PRINT, $($arg)+)
    };
}

#[macro_export]
macro_rules! success {
    ($($arg:tt)+) => {
        $crate::tracing::info!(target: $crate::target::SUCCESS, $($arg)+)
    };
}

#[macro_export]
macro_rules! failure {
    ($($arg:tt)+) => {
        $crate::tracing::info!(target: $crate::target::FAILURE, $($arg)+)
    };
}

/// An unrecoverable condition. Carries file/line/module like `error!`.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::tracing::error!(target: $crate::target::FATAL, $($arg)+)
    };
}

/// Diagnostic from an external validator, tagged `[prefix]`.
///
/// The underlying `tracing` level defaults to `INFO`; pass
/// `level: <Level>` first to forward the validator's own severity to
/// other layers (the console channel is the same either way).
#[macro_export]
macro_rules! validation {
    (level: $lvl:expr, $prefix:expr, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: $crate::target::VALIDATION,
            $lvl,
            prefix = $prefix,
            $($arg)+
        )
    };
    ($prefix:expr, $($arg:tt)+) => {
        $crate::validation!(
            level: $crate::tracing::Level::INFO,
            $prefix,
            $($arg)+
        )
    };
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub severity: SeverityFlags,
    pub ansi: bool,
    /// When set, every event is also written to this file without colour.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            severity: SeverityFlags::ALL,
            ansi: true,
            log_file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("The logger has already been initialised")]
    AlreadyInitialized,
    #[error("Couldn't create log file {path:?}: {source}")]
    LogFile { path: PathBuf, source: io::Error },
    #[error("Couldn't install the global subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Handle onto the process-wide logger.
#[derive(Debug)]
pub struct Logger {
    severity: SeverityHandle,
    log_file: Option<PathBuf>,
}

impl Logger {
    pub fn severity_flags(&self) -> SeverityFlags {
        self.severity.get()
    }

    /// Changes which channels reach the console from now on.
    pub fn set_severity_flags(&self, flags: SeverityFlags) {
        self.severity.set(flags);
    }

    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Installs the console layer (and optional file layer) as the global
/// `tracing` subscriber.
pub fn init(config: LogConfig) -> Result<&'static Logger, LogInitError> {
    if LOGGER.get().is_some() {
        return Err(LogInitError::AlreadyInitialized);
    }
    let logger = install(config)?;
    match LOGGER.set(logger) {
        Ok(()) => LOGGER.get().ok_or(LogInitError::AlreadyInitialized),
        Err(_) => Err(LogInitError::AlreadyInitialized),
    }
}

/// The global logger, initialised with [`LogConfig::default`] on first use.
///
/// If some other global subscriber was installed first the returned
/// logger's mask has no effect on output.
pub fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        install(LogConfig::default()).unwrap_or_else(|_| Logger {
            severity: SeverityHandle::new(SeverityFlags::ALL),
            log_file: None,
        })
    })
}

fn install(config: LogConfig) -> Result<Logger, LogInitError> {
    let console = ConsoleLayer::new(config.severity).with_ansi(config.ansi);
    let severity = console.severity_handle();

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = File::create(path).map_err(|source| {
                LogInitError::LogFile {
                    path: path.clone(),
                    source,
                }
            })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()?;

    Ok(Logger {
        severity,
        log_file: config.log_file,
    })
}

/// An in-memory [`Write`] sink, mainly for asserting on log output.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter(Arc<Mutex<Vec<u8>>>);

impl MemoryWriter {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().expect("memory writer lock poisoned");
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("memory writer lock poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The subscriber is process-wide, so everything touching it lives in
    // this one test.
    #[test]
    fn global_logger_installs_once_and_takes_mask_changes() {
        let quiet = SeverityFlags::WARNINGS | SeverityFlags::ERRORS;
        let installed = init(LogConfig {
            severity: quiet,
            ansi: false,
            log_file: None,
        })
        .unwrap();
        assert_eq!(installed.severity_flags(), quiet);
        assert!(installed.log_file().is_none());

        assert!(matches!(
            init(LogConfig::default()),
            Err(LogInitError::AlreadyInitialized)
        ));
        assert!(std::ptr::eq(installed, logger()));

        assert!(!logger().severity.allows(Severity::Debug));
        logger().set_severity_flags(SeverityFlags::ALL);
        assert_eq!(installed.severity_flags(), SeverityFlags::ALL);
        assert!(installed.severity.allows(Severity::Debug));

        installed.set_severity_flags(SeverityFlags::NONE);
        assert_eq!(logger().severity_flags(), SeverityFlags::NONE);
        assert!(!logger().severity.allows(Severity::Fatal));
    }
}
