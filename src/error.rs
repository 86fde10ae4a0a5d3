use std::fmt::{self, Display, Formatter};

use crate::runtime::RuntimeError;

/// An error produced while turning source into a function, either by the
/// embedder's compiler hook or by the VM when no compiler is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub line: usize,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} [line {}]", self.message, self.line)
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("CompileError: {0}")]
    Compile(#[from] CompileError),
    #[error("RuntimeError: {0}")]
    Runtime(#[from] RuntimeError),
}
