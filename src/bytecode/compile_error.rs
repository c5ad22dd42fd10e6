use crate::lexer::{LexerError, Span};

/// A fatal compile-time diagnostic. Compilation stops at the first
/// error; there is no recovery and no partial output.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// Malformed syntax: wrong token in this position.
    Syntax {
        message: String,
        line: usize,
        col: usize,
    },
    /// A name that resolves to nothing of the required kind.
    Undefined {
        kind: &'static str,
        name: String,
        line: usize,
        col: usize,
    },
    /// Static type violation.
    Type {
        message: String,
        line: usize,
        col: usize,
    },
    /// Structural violation: arity mismatch, break outside a loop,
    /// table or operand-width limits exceeded.
    Structural {
        message: String,
        line: usize,
        col: usize,
    },
    /// Import could not be resolved or read.
    Import { path: String, message: String },
}

impl CompileError {
    pub fn syntax(message: impl Into<String>, span: Span) -> Self {
        CompileError::Syntax {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    pub fn undefined(kind: &'static str, name: impl Into<String>, span: Span) -> Self {
        CompileError::Undefined {
            kind,
            name: name.into(),
            line: span.line,
            col: span.col,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        CompileError::Type {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    pub fn structural(message: impl Into<String>, span: Span) -> Self {
        CompileError::Structural {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    pub fn import(path: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Import {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<LexerError> for CompileError {
    fn from(err: LexerError) -> Self {
        CompileError::Syntax {
            message: err.message,
            line: err.line,
            col: err.col,
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Syntax { message, line, col } => {
                write!(f, "compile error: {}:{}: {}", line, col, message)
            }
            CompileError::Undefined {
                kind,
                name,
                line,
                col,
            } => {
                write!(
                    f,
                    "compile error: {}:{}: undefined {} '{}'",
                    line, col, kind, name
                )
            }
            CompileError::Type { message, line, col } => {
                write!(f, "compile error: {}:{}: {}", line, col, message)
            }
            CompileError::Structural { message, line, col } => {
                write!(f, "compile error: {}:{}: {}", line, col, message)
            }
            CompileError::Import { path, message } => {
                write!(f, "compile error: import '{}': {}", path, message)
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span { line: 3, col: 14 }
    }

    #[test]
    fn test_syntax_display_has_position() {
        let err = CompileError::syntax("expected ';' but found '}'", span());
        let msg = err.to_string();
        assert!(msg.contains("compile error"));
        assert!(msg.contains("3:14"));
        assert!(msg.contains("expected ';'"));
    }

    #[test]
    fn test_undefined_display_names_the_symbol() {
        let err = CompileError::undefined("variable", "velocty", span());
        let msg = err.to_string();
        assert!(msg.contains("undefined variable"));
        assert!(msg.contains("'velocty'"));
    }

    #[test]
    fn test_import_display() {
        let err = CompileError::import("util/vec.cn", "no such file");
        let msg = err.to_string();
        assert!(msg.contains("import"));
        assert!(msg.contains("util/vec.cn"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_from_lexer_error() {
        let lex = LexerError {
            message: "unknown character '@'".to_string(),
            line: 7,
            col: 2,
        };
        let err: CompileError = lex.into();
        assert!(err.to_string().contains("7:2"));
        assert!(err.to_string().contains("unknown character"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::syntax("x", span());
        let _: &dyn std::error::Error = &err;
    }
}
