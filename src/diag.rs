use serde::Serialize;
use tracing::{debug, error, warn};

/// Aggregated outcome of a validation pass. Errors are fatal for the pass
/// as a whole but never stop it early; the operator sees every problem in
/// one run. Warnings are logged and do not change pass/fail.
#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Record and log an error.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.errors.push(message);
    }

    /// Record and log a warning.
    pub fn warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Log at debug level without recording. Suppressed unless the
    /// subscriber filter admits `debug` (DEBUG_MODE).
    pub fn debug(&self, message: impl Into<String>) {
        debug!("{}", message.into());
    }
}
