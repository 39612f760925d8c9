use std::io;

/// Error variants returned by the hooking and dumping engine.
#[derive(Debug, thiserror::Error)]
pub enum LoliError {
    #[error("allocation hooks are already installed")]
    AlreadyInstalled,

    #[error("shared library `{0}` is not loaded")]
    LibraryNotFound(String),

    #[error("failed to patch `{symbol}` in `{library}`: {source}")]
    Patch {
        library: String,
        symbol: String,
        #[source]
        source: io::Error,
    },

    #[error("allocation hooking is not supported on this target")]
    Unsupported,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("allocation hooks are not installed")]
    NotInstalled,

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl LoliError {
    /// The stable integer handed to the host over the C ABI. `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            LoliError::AlreadyInstalled => 1,
            LoliError::LibraryNotFound(_) => 2,
            LoliError::Patch { .. } => 3,
            LoliError::Unsupported => 4,
            LoliError::Io(_) => 5,
            LoliError::InvalidArgument(_) => 6,
            LoliError::NotInstalled => 7,
            LoliError::Parse { .. } => 8,
        }
    }
}

/// Result type for the engine.
pub type Result<T> = std::result::Result<T, LoliError>;
