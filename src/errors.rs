use thiserror::Error;

/// The crate's internal error currency. Runtime I/O surface methods
/// (`NodeRuntime::{read,write,close}`) never let this cross the actor
/// boundary — they map it to an errno instead (see `runtime.rs`).
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("alias not found: {0}")]
    AliasNotFound(String),
    #[error("ambiguous alias {0}: resolves to {1} nodes")]
    AmbiguousAlias(String, usize),
    #[error("dependency cycle detected: {0}")]
    Cycle(String),
    #[error("pipe already exists: {0}")]
    PipeAlreadyExists(String),
    #[error("pipe not found: {0}")]
    PipeNotFound(String),
    #[error("kv key not found: {0}")]
    KvNotFound(String),
    #[error("bad descriptor: {0}")]
    BadDescriptor(i32),
    #[error("broken pipe, errno {0}")]
    BrokenPipe(i32),
    #[error("unknown notification handle: {0}")]
    UnknownHandle(i64),
    #[error("invalid handle index: {0}")]
    InvalidHandleIndex(usize),
    #[error("registry lookup failed: {0}")]
    RegistryMiss(String),
    #[error("malformed schema/json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot send to channel")]
    CannotSendToChannel,
    #[error("cannot receive from channel")]
    CannotReceiveFromChannel,
    #[error("cannot spawn worker thread: {0}")]
    CannotSpawnThread(#[from] std::io::Error),
    #[error("internal thread panicked: {0}")]
    ThreadPanic(String),
    #[error("{0}")]
    Other(String),
}

impl<T> From<crossbeam::channel::SendError<T>> for ExecutionError {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        ExecutionError::CannotSendToChannel
    }
}

impl From<crossbeam::channel::RecvError> for ExecutionError {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        ExecutionError::CannotReceiveFromChannel
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
