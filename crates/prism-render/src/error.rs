//! Error types surfaced to callers of the renderer.

use crate::device::DeviceError;

/// Errors returned synchronously from renderer and resource API calls.
///
/// Transient device failures during a frame (allocation failure, context loss)
/// are handled inside `render()` and never reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The caller passed a value the pipeline cannot honour.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A device call failed outside of a frame (pre-warm, explicit upload).
    #[error(transparent)]
    Device(#[from] DeviceError),
}
