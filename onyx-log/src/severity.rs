//! Severity channels and the runtime mask that gates them.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tracing::{Level, Metadata};

use crate::target;

bitflags::bitflags! {
    /// Runtime mask selecting which severity channels reach the console.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SeverityFlags: u32 {
        const GENERAL = 1;
        const DEBUG = 1 << 1;
        const STATUS = 1 << 2;
        const WARNINGS = 1 << 3;
        const ERRORS = 1 << 4;
        const VALIDATION = 1 << 5;
        const ALL = Self::GENERAL.bits()
            | Self::DEBUG.bits()
            | Self::STATUS.bits()
            | Self::WARNINGS.bits()
            | Self::ERRORS.bits()
            | Self::VALIDATION.bits();
    }
}

impl SeverityFlags {
    pub const NONE: Self = Self::empty();
}

impl Default for SeverityFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// The channel an event is written to.
///
/// Engine-specific channels are selected by event target (see
/// [`target`](crate::target)); everything else falls back to the
/// `tracing` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Print,
    Debug,
    Message,
    Success,
    Failure,
    Warning,
    Error,
    Fatal,
    Validation,
}

impl Severity {
    pub fn classify(metadata: &Metadata<'_>) -> Self {
        match metadata.target() {
            target::PRINT => Self::Print,
            target::SUCCESS => Self::Success,
            target::FAILURE => Self::Failure,
            target::FATAL => Self::Fatal,
            target::VALIDATION => Self::Validation,
            _ => match *metadata.level() {
                Level::ERROR => Self::Error,
                Level::WARN => Self::Warning,
                Level::INFO => Self::Message,
                _ => Self::Debug,
            },
        }
    }

    pub fn flag(self) -> SeverityFlags {
        match self {
            Self::Print => SeverityFlags::GENERAL,
            Self::Debug => SeverityFlags::DEBUG,
            Self::Message | Self::Success | Self::Failure => {
                SeverityFlags::STATUS
            }
            Self::Warning => SeverityFlags::WARNINGS,
            Self::Error | Self::Fatal => SeverityFlags::ERRORS,
            Self::Validation => SeverityFlags::VALIDATION,
        }
    }

    /// Line tag. Validation lines are tagged with their prefix instead.
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Self::Print | Self::Validation => "",
            Self::Debug => "[Debug]\t",
            Self::Message => "[Info]\t",
            Self::Success => "[Success]\t",
            Self::Failure => "[Failure]\t",
            Self::Warning => "[Warning]\t",
            Self::Error => "[Error]\t",
            Self::Fatal => "[FATAL]\t",
        }
    }

    pub(crate) fn colour(self) -> &'static str {
        match self {
            Self::Print => "\x1b[37m",
            Self::Debug | Self::Success => "\x1b[32m",
            Self::Message => "\x1b[36m",
            Self::Failure => "\x1b[31m",
            Self::Warning => "\x1b[33m",
            Self::Error => "\x1b[91m",
            Self::Fatal => "\x1b[1;31m",
            Self::Validation => "\x1b[35m",
        }
    }

    /// Error and Fatal carry file/line/module attribution and go to stderr.
    pub fn is_diagnostic(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }
}

/// Shared, atomically updated [`SeverityFlags`].
///
/// Cloning yields another handle onto the same mask.
#[derive(Debug, Clone)]
pub struct SeverityHandle(Arc<AtomicU32>);

impl SeverityHandle {
    pub fn new(flags: SeverityFlags) -> Self {
        Self(Arc::new(AtomicU32::new(flags.bits())))
    }

    pub fn get(&self) -> SeverityFlags {
        SeverityFlags::from_bits_truncate(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, flags: SeverityFlags) {
        self.0.store(flags.bits(), Ordering::Relaxed);
    }

    pub fn allows(&self, severity: Severity) -> bool {
        self.get().contains(severity.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_covers_every_channel() {
        for severity in [
            Severity::Print,
            Severity::Debug,
            Severity::Message,
            Severity::Success,
            Severity::Failure,
            Severity::Warning,
            Severity::Error,
            Severity::Fatal,
            Severity::Validation,
        ] {
            assert!(SeverityFlags::ALL.contains(severity.flag()));
            assert!(!SeverityFlags::NONE.contains(severity.flag()));
        }
        assert_eq!(SeverityFlags::ALL.bits(), 63);
    }

    #[test]
    fn handle_updates_are_shared_between_clones() {
        let handle = SeverityHandle::new(SeverityFlags::ERRORS);
        let other = handle.clone();
        assert!(!other.allows(Severity::Warning));

        handle.set(SeverityFlags::ERRORS | SeverityFlags::WARNINGS);
        assert!(other.allows(Severity::Warning));
        assert!(other.allows(Severity::Fatal));
        assert!(!other.allows(Severity::Validation));
    }
}
