use thiserror::Error;

/// Every failure the pipeline can produce, tagged by phase.
///
/// Lexical and syntax errors carry a source position and can be collected;
/// semantic and internal errors abort the compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("lexical error at {line}:{column}: unrecognized character {ch:?}")]
    Lexical { line: usize, column: usize, ch: char },

    #[error("syntax error at {line}:{column}: unexpected {token} in state {state}")]
    Syntax {
        line: usize,
        column: usize,
        state: usize,
        token: String,
    },

    #[error("semantic error at line {line}: {message}")]
    Semantic { line: usize, message: String },

    #[error("table error: {0}")]
    Table(String),

    #[error("internal compiler error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn semantic(line: usize, message: impl Into<String>) -> Self {
        CompileError::Semantic {
            line,
            message: message.into(),
        }
    }

    /// Source position for sorted reporting. Errors without a position
    /// sort first.
    pub fn position(&self) -> (usize, usize) {
        match self {
            CompileError::Lexical { line, column, .. } => (*line, *column),
            CompileError::Syntax { line, column, .. } => (*line, *column),
            CompileError::Semantic { line, .. } => (*line, 0),
            _ => (0, 0),
        }
    }
}

/// Accumulator for the opt-in collecting mode.
///
/// The lexer and parser push recoverable errors here and keep going; the
/// driver prints the batch sorted by position and refuses to write output
/// if anything was collected.
#[derive(Default)]
pub struct ErrorBag {
    errors: Vec<CompileError>,
}

impl ErrorBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_sorted(mut self) -> Vec<CompileError> {
        self.errors.sort_by_key(|e| e.position());
        self.errors
    }
}
