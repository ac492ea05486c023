//! Reporter trait for dependency injection
//!
//! Core operations report progress and ask questions through this trait
//! instead of talking to a terminal directly.

use std::sync::Arc;

pub trait Reporter: Send + Sync {
    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Aggregate progress of a long-running operation, `percent` in 0..=100.
    fn progress(&self, msg: &str, percent: u8);

    /// Ask a yes/no question.
    fn confirm(&self, question: &str) -> bool;

    /// Called once per download batch after every transfer has settled.
    fn downloads_completed(&self, succeeded: usize, failed: usize);
}

impl<T: Reporter + ?Sized> Reporter for Arc<T> {
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
    fn progress(&self, msg: &str, percent: u8) {
        (**self).progress(msg, percent);
    }
    fn confirm(&self, question: &str) -> bool {
        (**self).confirm(question)
    }
    fn downloads_completed(&self, succeeded: usize, failed: usize) {
        (**self).downloads_completed(succeeded, failed);
    }
}

impl std::fmt::Debug for dyn Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Reporter")
    }
}

/// A no-op reporter for silent operations (e.g., testing). Answers no to every question.
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn progress(&self, _: &str, _: u8) {}
    fn confirm(&self, _: &str) -> bool {
        false
    }
    fn downloads_completed(&self, _: usize, _: usize) {}
}
