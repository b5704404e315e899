//! Diagnostic reporting infrastructure.
//!
//! Diagnostics from the effect core are structured values first: every
//! report carries the operation location, the classification that was
//! reached, and — for boundary violations — the handler and foreign call
//! in conflict. A presentation layer renders them; the bundled
//! [`DiagnosticEmitter`] is one such renderer built on `ariadne`.
//!
//! # Error Codes
//!
//! The effect core owns the E0400–E0499 range of Ember error codes
//! (effect and handler errors). Lower ranges belong to the front end.

use crate::span::Span;
use ariadne::{Color, Label, Report, ReportKind, Source};
use serde::Serialize;

/// Effect-core error codes (E0400–E0499).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// An operation is performed with no handler in force for its effect.
    UnhandledEffect = 401,
    /// A reachable operation site has no evidence slot assigned.
    MissingEvidenceSlot = 402,
    /// Handler install/uninstall scopes do not balance across a join point.
    UnbalancedHandlerScopes = 403,
    /// A handler's declared resume strategy contradicts its operation bodies.
    ResumeStrategyMismatch = 404,
    /// A general handler is in force around a raw foreign call.
    GeneralHandlerAcrossForeignCall = 450,
    /// A continuation value crosses a declared foreign barrier.
    ContinuationCrossesBarrier = 451,
}

impl ErrorCode {
    /// Get the formatted error code string (e.g., "E0450").
    pub fn as_str(&self) -> String {
        format!("E{:04}", *self as u16)
    }

    /// Get a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::UnhandledEffect => "operation performed with no handler in force",
            ErrorCode::MissingEvidenceSlot => "operation site has no evidence slot assigned",
            ErrorCode::UnbalancedHandlerScopes => {
                "handler scopes do not balance across control-flow join"
            }
            ErrorCode::ResumeStrategyMismatch => {
                "handler resume strategy contradicts its operation bodies"
            }
            ErrorCode::GeneralHandlerAcrossForeignCall => {
                "general handler may capture a continuation across a foreign call"
            }
            ErrorCode::ContinuationCrossesBarrier => {
                "continuation value passed across a foreign barrier"
            }
        }
    }

    /// Get a help message suggesting how to fix the error.
    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::UnhandledEffect => {
                Some("install a handler for the effect before performing its operations")
            }
            ErrorCode::ResumeStrategyMismatch => Some(
                "a handler declared single-shot must resume at most once per operation; \
                 declare it multi-shot or remove the extra resume",
            ),
            ErrorCode::GeneralHandlerAcrossForeignCall => Some(
                "mark the foreign call for callback conversion so the suspension resolves \
                 a result slot instead of capturing across the foreign frame",
            ),
            ErrorCode::ContinuationCrossesBarrier => {
                Some("continuations cannot leave the managed world; pass a completion callback")
            }
            _ => None,
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    /// An error that prevents compilation of the enclosing function.
    Error,
    /// A warning that doesn't prevent compilation.
    Warning,
    /// An informational note.
    Note,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// The kind of diagnostic.
    pub kind: DiagnosticKind,
    /// The error code (e.g., "E0450").
    pub code: Option<String>,
    /// The main error message.
    pub message: String,
    /// The primary span where the error occurred.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    /// Suggestions for fixing the error.
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Create an error diagnostic from an ErrorCode with automatic message and help.
    pub fn from_error_code(code: ErrorCode, span: Span) -> Self {
        let mut diag = Self::error(code.description(), span);
        diag.code = Some(code.as_str());
        if let Some(help) = code.help() {
            diag.suggestions.push(help.to_string());
        }
        diag
    }

    /// Set the error code from an ErrorCode enum, keeping the current message.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code.as_str());
        if let Some(help) = code.help() {
            self.suggestions.push(help.to_string());
        }
        self
    }

    /// Add a secondary label pointing at related code.
    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    /// Add a primary label with a custom message.
    pub fn with_primary_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::primary(span, message));
        self
    }

    /// Add a suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Check whether this diagnostic stops compilation of its function.
    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }
}

/// A label in a diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticLabel {
    /// The span this label points to.
    pub span: Span,
    /// The label message.
    pub message: String,
    /// Whether this is the primary label.
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Diagnostic emitter that renders diagnostics to stderr via ariadne.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self { filename, source }
    }

    /// Emit a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) {
        let mut builder = Report::build(
            diagnostic.kind.to_report_kind(),
            self.filename,
            diagnostic.span.start,
        );

        let message = if let Some(code) = &diagnostic.code {
            format!("[{}] {}", code, diagnostic.message)
        } else {
            diagnostic.message.clone()
        };
        builder = builder.with_message(&message);

        builder = builder.with_label(
            Label::new((self.filename, diagnostic.span.start..diagnostic.span.end))
                .with_color(diagnostic.kind.color())
                .with_message(&diagnostic.message),
        );

        for label in &diagnostic.labels {
            let color = if label.primary {
                diagnostic.kind.color()
            } else {
                Color::Blue
            };
            builder = builder.with_label(
                Label::new((self.filename, label.span.start..label.span.end))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            let help = diagnostic.suggestions.join("\n");
            builder = builder.with_help(help);
        }

        let report = builder.finish();
        let _ = report.eprint((self.filename, Source::from(self.source)));
    }
}

// ============================================================================
// Structured Reports
// ============================================================================

/// Per-site entry of a classification report.
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    /// Source location of the operation.
    pub span: Span,
    /// Effect identifier (raw index into the registry).
    pub effect: u32,
    /// Operation index within the effect.
    pub op_index: u32,
    /// Classification reached, as a stable string ("tail-resumptive",
    /// "general", "ffi-boundary").
    pub class: &'static str,
}

/// Machine-readable summary of classification decisions for one function.
///
/// This is the structured-report surface: a presentation layer (or a test)
/// consumes it as JSON rather than parsing rendered text.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationReport {
    /// The function the report covers.
    pub function: String,
    /// One entry per remaining operation site.
    pub sites: Vec<SiteReport>,
}

impl ClassificationReport {
    /// Render the report as a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
