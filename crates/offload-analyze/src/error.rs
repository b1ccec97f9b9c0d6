use crate::Span;

/// An error raised while lexing or walking captured Python source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeError {
    pub kind: AnalyzeErrorKind,
    pub span: Span,
    pub message: String,
}

impl AnalyzeError {
    pub fn new(kind: AnalyzeErrorKind, span: Span, message: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AnalyzeError {}

/// Categories of analysis failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeErrorKind {
    /// A string or triple-quoted string literal was never closed.
    UnterminatedString,
    /// A parenthesis, bracket, or brace was never closed.
    UnclosedDelimiter,
    /// The function name given to `analyze` has no `def`/`lambda` in the source.
    FunctionNotFound,
    /// Indentation mixed tabs and spaces within one block.
    IndentationError,
}

impl std::fmt::Display for AnalyzeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnterminatedString => write!(f, "unterminated string"),
            Self::UnclosedDelimiter => write!(f, "unclosed delimiter"),
            Self::FunctionNotFound => write!(f, "function not found"),
            Self::IndentationError => write!(f, "indentation error"),
        }
    }
}
