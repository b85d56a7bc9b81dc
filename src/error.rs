
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntwineError {
    #[error("parameter {parameter} is not specified for argument(s) {args}")]
    NotFound { parameter: String, args: String },
    #[error("filter error: {key} is not a dimension of {class}")]
    Filter { key: String, class: String },
    #[error("error evaluating expression {expr}: {message}")]
    Evaluation { expr: String, message: String },
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    #[error("lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, EntwineError>;
