use thiserror::Error;

/// Raw status reported by a native backend call.
///
/// These mirror the failure codes a D3D9-class device can report. They never reach callers of
/// [`crate::TranslationContext`] directly; [`DeviceError::outcome`] folds them into the three
/// outcomes this layer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("out of video memory")]
    OutOfVideoMemory,
    #[error("out of system memory")]
    OutOfMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("device lost and ready to be reset")]
    DeviceNotReset,
    #[error("device hung")]
    DeviceHung,
    #[error("device removed")]
    DeviceRemoved,
    #[error("resource not available")]
    NotAvailable,
    #[error("invalid backend call")]
    InvalidCall,
    #[error("backend failure (code {0:#x})")]
    Other(u32),
}

/// Classification of a backend status at this layer's boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOutcome {
    Success,
    OutOfMemory,
    DeviceLost,
}

impl DeviceError {
    pub fn outcome(self) -> BackendOutcome {
        if self.is_device_lost() {
            BackendOutcome::DeviceLost
        } else {
            // Every other failure (including transient allocation and lock failures) is reported
            // to the caller as an out-of-memory condition.
            BackendOutcome::OutOfMemory
        }
    }

    pub fn is_device_lost(self) -> bool {
        matches!(
            self,
            DeviceError::DeviceLost
                | DeviceError::DeviceNotReset
                | DeviceError::DeviceHung
                | DeviceError::DeviceRemoved
        )
    }
}

/// Classify the result of a backend call.
pub fn classify<T>(result: &Result<T, DeviceError>) -> BackendOutcome {
    match result {
        Ok(_) => BackendOutcome::Success,
        Err(err) => err.outcome(),
    }
}

/// Errors reported by the translation layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// A native allocation, upload or growth failed. The draw was aborted and every cache was left
    /// in its previous state; retrying later is allowed.
    #[error("out of memory while {0}")]
    OutOfMemory(&'static str),
    /// Caller-supplied data is insufficient or inconsistent. Never retried.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// The device was lost. Translation is refused until the device has been reset.
    #[error("context lost")]
    ContextLost,
    /// Device reset was retried the maximum number of times without success. Fatal.
    #[error("device reset failed after {attempts} attempts")]
    ResetFailed { attempts: u32 },
    /// A backend call observed device loss.
    ///
    /// Produced by the translators and storage; `TranslationContext` converts it into a coordinator
    /// transition plus [`TranslateError::ContextLost`], so it never escapes the context.
    #[error("device lost")]
    DeviceLost,
}

impl TranslateError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        TranslateError::InvalidOperation(msg.into())
    }

    /// Map a raw backend failure, naming the operation for the out-of-memory message.
    pub fn from_device(err: DeviceError, during: &'static str) -> Self {
        match err.outcome() {
            BackendOutcome::DeviceLost => TranslateError::DeviceLost,
            _ => TranslateError::OutOfMemory(during),
        }
    }
}

pub type Result<T, E = TranslateError> = std::result::Result<T, E>;
