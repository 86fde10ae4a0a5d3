use crate::gc::ObjType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("out of memory")]
    OutOfMemory,
    #[error("type '{0}' is not hashable")]
    UnhashableValue(ObjType),
    #[error("cannot use a finished fiber")]
    FiberFinished,
    #[error("fiber has already been called")]
    FiberAlreadyCalled,
    #[error("too many module variables")]
    TooManyVariables,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
