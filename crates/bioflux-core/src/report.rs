//! Injected error reporting.
//!
//! Every component receives an `Arc<dyn ErrorReporter>` at construction
//! instead of reaching for a global handler. [`TracingReporter`] is the
//! production implementation; [`RecordingReporter`] keeps reports in memory
//! for assertions.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Report severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Where a report originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: &'static str,
}

impl ErrorContext {
    pub const fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
        }
    }

    /// Build a report originating from this context.
    pub fn report(&self, severity: Severity, message: impl Into<String>) -> ErrorReport {
        ErrorReport {
            context: *self,
            severity,
            message: message.into(),
            attempt: None,
        }
    }
}

/// A single recorded failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub context: ErrorContext,
    pub severity: Severity,
    pub message: String,
    /// Retry attempt (1-based) when reported from a retry loop.
    pub attempt: Option<u32>,
}

impl ErrorReport {
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Sink for failures that are recovered from locally but must not vanish.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, report: ErrorReport);
}

/// Logs reports through `tracing` and counts them by severity.
#[derive(Debug, Default)]
pub struct TracingReporter {
    debug: AtomicU64,
    warnings: AtomicU64,
    errors: AtomicU64,
    critical: AtomicU64,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reports seen at `severity`.
    pub fn count(&self, severity: Severity) -> u64 {
        self.counter(severity).load(Ordering::Relaxed)
    }

    fn counter(&self, severity: Severity) -> &AtomicU64 {
        match severity {
            Severity::Debug => &self.debug,
            Severity::Warning => &self.warnings,
            Severity::Error => &self.errors,
            Severity::Critical => &self.critical,
        }
    }
}

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        self.counter(report.severity).fetch_add(1, Ordering::Relaxed);
        let ErrorReport {
            context,
            severity,
            message,
            attempt,
        } = report;
        match severity {
            Severity::Debug => tracing::debug!(
                component = context.component,
                operation = context.operation,
                ?attempt,
                "{message}"
            ),
            Severity::Warning => tracing::warn!(
                component = context.component,
                operation = context.operation,
                ?attempt,
                "{message}"
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                component = context.component,
                operation = context.operation,
                ?attempt,
                %severity,
                "{message}"
            ),
        }
    }
}

/// Keeps every report in memory. Cloning shares the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<ErrorReport>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Reports raised by `component`.
    pub fn for_component(&self, component: &str) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.context.component == component)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

/// Run `op`; on error report it and return `fallback`.
pub fn safe_execute<T, E, F>(
    reporter: &dyn ErrorReporter,
    context: ErrorContext,
    fallback: T,
    op: F,
) -> T
where
    E: std::fmt::Display,
    F: FnOnce() -> Result<T, E>,
{
    match op() {
        Ok(value) => value,
        Err(e) => {
            reporter.report(context.report(Severity::Error, e.to_string()));
            fallback
        }
    }
}

/// Async variant of [`safe_execute`].
pub async fn safe_execute_async<T, E, Fut>(
    reporter: &dyn ErrorReporter,
    context: ErrorContext,
    fallback: T,
    fut: Fut,
) -> T
where
    E: std::fmt::Display,
    Fut: Future<Output = Result<T, E>>,
{
    match fut.await {
        Ok(value) => value,
        Err(e) => {
            reporter.report(context.report(Severity::Error, e.to_string()));
            fallback
        }
    }
}
