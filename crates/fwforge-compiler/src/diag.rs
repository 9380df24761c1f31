//! Compile diagnostics.
//!
//! Warnings and errors attach to the rule label they were raised for and do
//! not stop the pipeline; the emitter writes them back as inline comments
//! next to the generated rule, and the driver maps them to an exit status.
//! Aborts are hard failures that end the current (firewall, family) compile.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    /// Fatal condition: recursive groups, unresolved runtime objects,
    /// shadowed rules, illegal action/table combinations.
    #[error("{0}")]
    Abort(String),
    #[error(transparent)]
    Model(#[from] fwforge_model::ModelError),
}

impl CompileError {
    pub fn abort(msg: impl Into<String>) -> Self {
        CompileError::Abort(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct RuleNote {
    pub severity: Severity,
    pub message: String,
}

/// Per-compile diagnostics sink.
#[derive(Debug, Default)]
pub struct Diagnostics {
    notes: BTreeMap<String, Vec<RuleNote>>,
    warnings: u32,
    errors: u32,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, rule_label: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(rule = rule_label, "{}", message);
        self.warnings += 1;
        self.notes
            .entry(rule_label.to_string())
            .or_default()
            .push(RuleNote {
                severity: Severity::Warning,
                message,
            });
    }

    pub fn error(&mut self, rule_label: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(rule = rule_label, "{}", message);
        self.errors += 1;
        self.notes
            .entry(rule_label.to_string())
            .or_default()
            .push(RuleNote {
                severity: Severity::Error,
                message,
            });
    }

    /// Notes recorded for a rule, in the order they were raised.
    pub fn notes_for(&self, rule_label: &str) -> &[RuleNote] {
        self.notes.get(rule_label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn has_warnings(&self) -> bool {
        self.warnings > 0
    }

    /// Merge another sink into this one (used when a rule set finishes and
    /// the driver folds its diagnostics into the compile-wide set).
    pub fn absorb(&mut self, other: Diagnostics) {
        self.warnings += other.warnings;
        self.errors += other.errors;
        for (label, notes) in other.notes {
            self.notes.entry(label).or_default().extend(notes);
        }
    }
}
