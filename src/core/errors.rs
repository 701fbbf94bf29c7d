// Custom error types for better error handling and debugging
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation
// - Type-safe error matching
// - Automatic Display/Error trait implementations
// - Source error chaining

use thiserror::Error;

/// Image preparation errors (per-file; never abort the rest of a batch add)
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("unsupported image format for '{file_name}' (accepted: png, jpeg, webp)")]
    UnsupportedFormat { file_name: String },

    #[error("failed to decode '{file_name}': {source}")]
    Decode {
        file_name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode prepared image '{file_name}': {source}")]
    Encode {
        file_name: String,
        #[source]
        source: image::ImageError,
    },
}

impl PrepareError {
    pub fn file_name(&self) -> &str {
        match self {
            Self::UnsupportedFormat { file_name } => file_name,
            Self::Decode { file_name, .. } => file_name,
            Self::Encode { file_name, .. } => file_name,
        }
    }
}

/// Usage ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance: {required} credit(s) required")]
    InsufficientBalance { required: u32 },

    #[error("ledger request failed: {0}")]
    Request(String),

    #[error("unexpected ledger response: {0}")]
    InvalidResponse(String),
}

/// Batch start refusals (all-or-nothing; no item leaves Queued on any of these)
#[derive(Debug, Error)]
pub enum StartError {
    #[error("not signed in")]
    Unauthenticated,

    #[error("no queued images to process")]
    EmptyQueue,

    #[error("insufficient balance: {required} credit(s) required")]
    InsufficientBalance { required: u32 },

    #[error("usage check failed: {0}")]
    Ledger(String),

    #[error("batch engine is not running")]
    EngineGone,
}

impl From<LedgerError> for StartError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { required } => {
                StartError::InsufficientBalance { required }
            }
            other => StartError::Ledger(other.to_string()),
        }
    }
}

/// Archive export errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no completed images to export")]
    NothingToExport,

    #[error("archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("batch engine is not running")]
    EngineGone,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("worker pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),

    #[error("max image dimension must be between 256 and 8192, got {0}")]
    InvalidMaxDimension(u32),

    #[error("model input size must be between 320 and 2048, got {0}")]
    InvalidModelInputSize(u32),

    #[error("images-per-credit must be > 0, got {0}")]
    InvalidCreditDivisor(usize),

    #[error("invalid URL for {name}: {value}")]
    InvalidUrl { name: &'static str, value: String },

    #[error("environment variable parsing failed: {0}")]
    EnvVarError(String),
}

// Convenience type aliases for Results
pub type PrepareResult<T> = Result<T, PrepareError>;
pub type LedgerResult<T> = Result<T, LedgerError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
