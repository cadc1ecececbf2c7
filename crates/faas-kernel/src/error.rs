//! Core error type shared by every module in this crate.
//!
//! Grounded on `cave-kernel::KernelError`'s variant-per-failure shape and its
//! `From<anyhow::Error>` bridge for errors originating in opaque external
//! collaborators (the store, the compiler, the sandbox launcher).

use thiserror::Error;
use uuid::Uuid;

/// Stable classification of a `CoreError`, used by callers (the HTTP surface,
/// metrics) to pick a status code or a label without matching on variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    QueueFull,
    AcquireVmFailed,
    InitFailed,
    ExecuteFailed,
    Timeout,
    CompileFailed,
    Transport,
    Conflict,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("function not found")]
    FunctionNotFound,
    #[error("function version {0} not found")]
    VersionNotFound(u64),
    #[error("alias {0} not found")]
    AliasNotFound(String),
    #[error("sandbox {0} not found")]
    SandboxNotFound(Uuid),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("work queue is full")]
    QueueFull,
    #[error("failed to acquire a sandbox: {0}")]
    AcquireVmFailed(#[source] anyhow::Error),
    #[error("sandbox init failed: {0}")]
    InitFailed(#[source] anyhow::Error),
    #[error("sandbox execution failed: {0}")]
    ExecuteFailed(#[source] anyhow::Error),
    #[error("deadline exceeded")]
    Timeout,
    #[error("compilation failed: {0}")]
    CompileFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("status transition rejected: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] faas_store::StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::FunctionNotFound
            | CoreError::VersionNotFound(_)
            | CoreError::AliasNotFound(_)
            | CoreError::SandboxNotFound(_) => ErrorKind::NotFound,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::QueueFull => ErrorKind::QueueFull,
            CoreError::AcquireVmFailed(_) => ErrorKind::AcquireVmFailed,
            CoreError::InitFailed(_) => ErrorKind::InitFailed,
            CoreError::ExecuteFailed(_) => ErrorKind::ExecuteFailed,
            CoreError::Timeout => ErrorKind::Timeout,
            CoreError::CompileFailed(_) => ErrorKind::CompileFailed,
            CoreError::Transport(_) => ErrorKind::Transport,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Store(store_err) => match store_err {
                faas_store::StoreError::NotFound => ErrorKind::NotFound,
                faas_store::StoreError::Conflict(_) => ErrorKind::Conflict,
                faas_store::StoreError::Validation(_) => ErrorKind::Validation,
                faas_store::StoreError::Backend(_) => ErrorKind::ExecuteFailed,
            },
            CoreError::Other(_) => ErrorKind::ExecuteFailed,
        }
    }

    /// Conventional HTTP-class status code for this error, per spec §7.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 400,
            ErrorKind::QueueFull => 503,
            ErrorKind::AcquireVmFailed
            | ErrorKind::InitFailed
            | ErrorKind::ExecuteFailed
            | ErrorKind::CompileFailed => 500,
            ErrorKind::Timeout => 504,
            ErrorKind::Transport => 500,
            ErrorKind::Conflict => 409,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
