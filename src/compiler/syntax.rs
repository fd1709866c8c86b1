use std::fmt;

use crate::common::span::Span;

/// Which stage of the pipeline an error belongs to. Error texts are
/// free-form; the kind and the spans are what callers can rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed token, unterminated construct, unknown character.
    Lex,
    /// Unbalanced parens, missing top-level module, stray tokens.
    Parse,
    /// Malformed field: wrong head keyword, missing required subform.
    Form,
    /// Unresolved symbolic name: function, local, global, or label.
    Name,
    /// Stack-type mismatch.
    Type,
    /// Invariant violation. Always a bug, never the input's fault.
    Internal,
}

impl ErrorKind {
    fn describe(self) -> &'static str {
        match self {
            ErrorKind::Lex => "Lex Error",
            ErrorKind::Parse => "Parse Error",
            ErrorKind::Form => "Form Error",
            ErrorKind::Name => "Name Error",
            ErrorKind::Type => "Type Error",
            ErrorKind::Internal => "Internal Error",
        }
    }
}

/// A location in source code with an optional hint
/// specific to that location.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub span: Span,
    pub hint: Option<String>,
}

impl Note {
    pub fn new(span: Span) -> Note {
        Note { span, hint: None }
    }

    pub fn new_with_hint(hint: &str, span: &Span) -> Note {
        Note {
            span: span.clone(),
            hint: Some(hint.to_string()),
        }
    }
}

/// A static error found at compile time: a reason, the pipeline stage
/// that raised it, and the source locations involved. Fatal to the
/// current compilation; the compiler stops at the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct Syntax {
    pub kind: ErrorKind,
    pub reason: String,
    pub notes: Vec<Note>,
}

impl Syntax {
    /// Creates a new error with a single unhinted note.
    pub fn error(kind: ErrorKind, reason: &str, span: &Span) -> Syntax {
        Syntax {
            kind,
            reason: reason.to_string(),
            notes: vec![Note::new(span.clone())],
        }
    }

    /// Creates a new error with a single note that may carry a hint.
    pub fn error_with_note(kind: ErrorKind, reason: &str, note: Note) -> Syntax {
        Syntax {
            kind,
            reason: reason.to_string(),
            notes: vec![note],
        }
    }

    pub fn lex(reason: &str, span: &Span) -> Syntax {
        Syntax::error(ErrorKind::Lex, reason, span)
    }

    pub fn parse(reason: &str, span: &Span) -> Syntax {
        Syntax::error(ErrorKind::Parse, reason, span)
    }

    pub fn form(reason: &str, span: &Span) -> Syntax {
        Syntax::error(ErrorKind::Form, reason, span)
    }

    pub fn name(reason: &str, span: &Span) -> Syntax {
        Syntax::error(ErrorKind::Name, reason, span)
    }

    pub fn ty(reason: &str, span: &Span) -> Syntax {
        Syntax::error(ErrorKind::Type, reason, span)
    }

    pub fn internal(reason: &str) -> Syntax {
        Syntax {
            kind: ErrorKind::Internal,
            reason: reason.to_string(),
            notes: vec![],
        }
    }

    /// Extends an error with another note.
    pub fn add_note(mut self, note: Note) -> Self {
        self.notes.push(note);
        self
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for note in self.notes.iter() {
            if note.span.is_empty() {
                continue;
            }
            writeln!(f, "{}", note.span)?;
            if let Some(ref hint) = note.hint {
                writeln!(f, "note: {}", hint)?;
            }
        }
        write!(f, "{}: {}", self.kind.describe(), self.reason)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::source::Source;

    #[test]
    fn display_points_at_the_span() {
        let source = Source::source("(module (func nip))");
        let error = Syntax::lex("Unrecognized token `nip`", &Span::new(&source, 14, 3));

        let target = r#"In ./source:1:15
  |
1 | (module (func nip))
  |               ^^^
Lex Error: Unrecognized token `nip`"#;

        assert_eq!(format!("{}", error), target);
    }

    #[test]
    fn internal_errors_have_no_position() {
        let error = Syntax::internal("signature queried before interning");
        assert_eq!(
            format!("{}", error),
            "Internal Error: signature queried before interning"
        );
    }
}
