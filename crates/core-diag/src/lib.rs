//! The error reporter: formats parse/run diagnostics with source location,
//! logs them through `tracing`, and tallies the `fatals` count that decides
//! the final exit code (§7, §4.11 of the expanded spec).

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Diagnostic {
            severity,
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    pub fn info(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, file, line, message)
    }

    pub fn warning(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, file, line, message)
    }

    pub fn fatal(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, file, line, message)
    }

    fn log(&self) {
        match self.severity {
            Severity::Info => info!(file = %self.file, line = self.line, "{}", self.message),
            Severity::Warning => warn!(file = %self.file, line = self.line, "{}", self.message),
            Severity::Fatal => error!(file = %self.file, line = self.line, "{}", self.message),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Fatal => "error",
        };
        write!(f, "{}:{}: {}: {}", self.file, self.line, label, self.message)
    }
}

/// Accumulates every diagnostic raised during a run and derives the final
/// `fatals` count, optionally promoting `WARNING` to fatal under `-W`.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    warnings_as_errors: bool,
}

impl Diagnostics {
    pub fn new(warnings_as_errors: bool) -> Self {
        Diagnostics {
            entries: Vec::new(),
            warnings_as_errors,
        }
    }

    /// Logs immediately (so diagnostics interleave with other `tracing`
    /// output in declaration order) and records for the end-of-run summary.
    pub fn report(&mut self, diag: Diagnostic) {
        diag.log();
        self.entries.push(diag);
    }

    pub fn fatals(&self) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Fatal || (self.warnings_as_errors && d.severity == Severity::Warning))
            .count()
    }

    pub fn has_fatal(&self) -> bool {
        self.fatals() > 0
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Render the end-of-run summary (§7): one line per diagnostic plus a
    /// trailing total.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for d in &self.entries {
            out.push_str(&d.to_string());
            out.push('\n');
        }
        out.push_str(&format!(
            "{} error(s), {} warning(s)\n",
            self.entries.iter().filter(|d| d.severity == Severity::Fatal).count(),
            self.entries.iter().filter(|d| d.severity == Severity::Warning).count(),
        ));
        out
    }
}

/// Final per-target status printed at the end of a run (§7 "user-visible
/// failure behavior").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    UpToDate,
    Made,
    ErrorInSelfOrDependency,
    MissingPrerequisite,
}

impl std::fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetOutcome::UpToDate => "is up to date",
            TargetOutcome::Made => "made",
            TargetOutcome::ErrorInSelfOrDependency => "not made due to error",
            TargetOutcome::MissingPrerequisite => "not made due to missing prerequisite",
        };
        write!(f, "{s}")
    }
}

pub fn format_target_report(name: &str, outcome: TargetOutcome) -> String {
    match outcome {
        TargetOutcome::UpToDate => format!("`{name}' is up to date."),
        _ => format!("`{name}' {outcome}."),
    }
}

pub fn format_cycle_report(names: &[String]) -> String {
    let mut out = String::from("cycle detected:\n");
    for (i, n) in names.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        out.push_str(n);
    }
    out.push_str(&format!(" -> {}", names.first().cloned().unwrap_or_default()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatals_counts_fatal_only_by_default() {
        let mut d = Diagnostics::new(false);
        d.report(Diagnostic::warning("Makefile", 1, "dup commands"));
        d.report(Diagnostic::fatal("Makefile", 2, "bad op"));
        assert_eq!(d.fatals(), 1);
    }

    #[test]
    fn warnings_as_errors_promotes_warnings() {
        let mut d = Diagnostics::new(true);
        d.report(Diagnostic::warning("Makefile", 1, "dup commands"));
        assert_eq!(d.fatals(), 1);
        assert!(d.has_fatal());
    }

    #[test]
    fn target_report_formats_up_to_date_specially() {
        assert_eq!(
            format_target_report("all", TargetOutcome::UpToDate),
            "`all' is up to date."
        );
        assert_eq!(format_target_report("all", TargetOutcome::Made), "`all' made.");
    }

    #[test]
    fn cycle_report_closes_the_loop() {
        let report = format_cycle_report(&["A".to_string(), "B".to_string()]);
        assert_eq!(report, "cycle detected:\nA -> B -> A");
    }
}
