use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error(transparent)]
    VmService(#[from] dart_vmservice::VmServiceError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown thread {0}")]
    UnknownThread(i64),

    #[error("unknown frameId {0}")]
    UnknownFrame(i64),

    #[error("not connected to a vm service")]
    NotConnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
