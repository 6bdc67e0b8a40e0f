//! Library-specific error types (§7).
//!
//! One variant per row of the error taxonomy. `Config`, `Resolve`, `Compile`,
//! `ExportMissing` and `Param` are fatal at `Load`/`LoadInto`; `Pull` and
//! `Transform` surface from `PipeStage::next`; `Decode` surfaces from
//! `PipeStage::value`.

use thiserror::Error;

/// A result type for errors that occur within lens-engine.
pub type Result<T> = std::result::Result<T, LensError>;

#[derive(Debug, Error)]
pub enum LensError {
    /// Malformed configuration document or stage.
    #[error("invalid lens configuration: {0}")]
    Config(String),

    /// Module bytes could not be fetched or read.
    #[error("could not resolve lens module: {0}")]
    Resolve(String),

    /// The WASM runtime back-end rejected a module's bytes.
    #[error("failed to compile wasm module: {0}")]
    Compile(String),

    /// A required export was absent at instantiation time.
    #[error("required export `{0}` is missing from the guest module")]
    ExportMissing(String),

    /// The guest returned an error frame from `set_param`.
    #[error("lens rejected its parameters: {0}")]
    Param(String),

    /// The source enumerable failed during iteration.
    #[error("upstream source failed: {0}")]
    Pull(String),

    /// A guest trap or back-end failure occurred during `transform`.
    #[error("lens transform failed: {0}")]
    Transform(String),

    /// Output JSON could not be deserialized into the caller's type.
    #[error("could not decode lens output: {0}")]
    Decode(String),

    /// A wire-protocol framing violation (bad tag, truncated length, OOB read).
    #[error("wire protocol violation: {0}")]
    WireProtocol(String),

    /// An underlying WASM runtime failure not covered by the taxonomy above.
    #[error("wasm runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LensError {
    fn from(e: serde_json::Error) -> Self {
        LensError::Decode(e.to_string())
    }
}
