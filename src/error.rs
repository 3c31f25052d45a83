use crate::AcqStatus;
use thiserror::Error;

pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    /// Socket connect/read/write failure or a malformed reply. Fatal to the session.
    #[error("device link error: {0}")]
    Link(String),

    /// Create/resize/write/close failure on the persisted dataset. Fatal to the writer.
    #[error("storage error: {0}")]
    Storage(String),

    /// Illegal control transition. Status is left unchanged.
    #[error("cannot {action} while {status}")]
    State {
        action: &'static str,
        status: AcqStatus,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// A session thread could not be spawned or panicked.
    #[error("thread error: {0}")]
    Thread(String),
}

impl DaqError {
    pub fn link(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Link(format!("{context}: {err}"))
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}

impl From<hdf5::Error> for DaqError {
    fn from(err: hdf5::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
