//! Kinds per §7. Recoverable conditions fold into a `CompileResponse { Success: false, .. }`
//! rather than an HTTP error status (the propagation rule in §7's "Implementation mapping");
//! truly fatal conditions are handled by `main` exiting the process, not by this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server has no baseline index for this project; call /initialize first")]
    NotInitialized,

    #[error("file(s) not recognized by any known assembly: {0:?}")]
    UnknownAssembly(Vec<std::path::PathBuf>),

    #[error("compilation failed:\n{0}")]
    CompileError(String),

    #[error("structural diff failed: {0}")]
    DiffInternal(String),

    #[error("IL rewrite failed: {0}")]
    RewriteInternal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(String),
}

impl ServerError {
    /// Human-readable message for the `ErrorMessage` field of a `CompileResponse`.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
