//! Worker exit classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;

/// Diagnostic lines kept from a worker's output.
pub const DIAGNOSTIC_TAIL: usize = 50;

/// Known exit categories derived from exit code or terminating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCategory {
    Clean,
    InitFailure,
    InvalidConfig,
    NotFound,
    Killed,
    Crash,
    Other,
}

impl ExitCategory {
    pub fn description(self) -> &'static str {
        match self {
            ExitCategory::Clean => "Worker exited without being asked to stop",
            ExitCategory::InitFailure => "Worker failed to initialize",
            ExitCategory::InvalidConfig => "Worker rejected its configuration",
            ExitCategory::NotFound => "Worker binary or dependency not found",
            ExitCategory::Killed => "Worker was killed",
            ExitCategory::Crash => "Worker crashed",
            ExitCategory::Other => "Worker exited unexpectedly",
        }
    }
}

/// How a worker process ended, with the tail of its diagnostic output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub diagnostics: Vec<String>,
}

impl ExitReport {
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code), ..Default::default() }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self { signal: Some(signal), ..Default::default() }
    }

    pub fn from_status(status: ExitStatus, diagnostics: Vec<String>) -> Self {
        Self { code: status.code(), signal: status_signal(status), diagnostics }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn category(&self) -> ExitCategory {
        if let Some(signal) = self.signal {
            return signal_category(signal);
        }
        match self.code {
            Some(0) => ExitCategory::Clean,
            Some(1) => ExitCategory::InitFailure,
            Some(2) => ExitCategory::InvalidConfig,
            Some(126 | 127) => ExitCategory::NotFound,
            Some(137 | 143) => ExitCategory::Killed,
            Some(134 | 139) => ExitCategory::Crash,
            _ => ExitCategory::Other,
        }
    }

    /// Last line of output that reports an error, if any.
    pub fn last_error_line(&self) -> Option<&str> {
        self.diagnostics
            .iter()
            .rev()
            .map(|line| line.trim())
            .find(|line| line.contains("ERROR") || line.contains("FATAL"))
    }

    /// Human-readable cause, suitable for `last_error`.
    pub fn describe(&self) -> String {
        let base = match (self.category(), self.code, self.signal) {
            (_, _, Some(signal)) => format!("{} (signal {})", self.category().description(), signal),
            (ExitCategory::Other, Some(code), None) => format!("Worker exited with code {}", code),
            (category, Some(code), None) => format!("{} (exit code {})", category.description(), code),
            (category, None, None) => category.description().to_string(),
        };
        match self.last_error_line() {
            Some(line) => format!("{}: {}", base, line),
            None => base,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(unix)]
fn status_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn status_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_category(signal: i32) -> ExitCategory {
    match signal {
        libc::SIGKILL | libc::SIGTERM => ExitCategory::Killed,
        libc::SIGABRT | libc::SIGSEGV | libc::SIGBUS => ExitCategory::Crash,
        _ => ExitCategory::Other,
    }
}

#[cfg(not(unix))]
fn signal_category(_signal: i32) -> ExitCategory {
    ExitCategory::Crash
}
