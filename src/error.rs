use std::sync::PoisonError;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// 持っていないフォークを返そうとした。Philosopher 側のバグ
    #[error("philosopher {agent} released fork {fork} held by {holder:?}")]
    NotHolder {
        agent: usize,
        fork: usize,
        holder: Option<usize>,
    },

    #[error("invalid request from philosopher {agent}: {reason}")]
    InvalidRequest { agent: usize, reason: String },

    #[error("arbitrator invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("arbitrator lock poisoned")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::Poisoned
    }
}

pub type Result<T> = std::result::Result<T, Error>;
