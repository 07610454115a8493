use thiserror::Error;

/// Synchronous failures returned by the profile manager API.
///
/// Asynchronous GATT failures never show up here; they are reported through
/// events once the request has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RscError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("profile manager is not initialized")]
    NotInitialized,
    #[error("unable to lock the profile manager context")]
    UnableToLockContext,
    #[error("unable to add entry")]
    UnableToAddEntry,
    #[error("sensor is not connected")]
    NotConnected,
    #[error("sensor is not configured")]
    NotConfigured,
    #[error("sensor is already configured")]
    AlreadyConfigured,
    #[error("sensor configuration is in progress")]
    CurrentlyConfiguring,
    #[error("sensor un-configuration is in progress")]
    CurrentlyUnConfiguring,
    #[error("a control point procedure is already in progress")]
    ProcedureInProgress,
    #[error("remote sensor does not support this feature")]
    FeatureNotSupported,
    #[error("the same request is already outstanding")]
    SameRequestOutstanding,
    #[error("GATT request failed: {0}")]
    Gatt(String),
    #[error("timer request failed: {0}")]
    Timer(String),
}

pub type RscResult<T> = Result<T, RscError>;

impl RscError {
    /// Stable negative status code, used on the IPC surface
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter => -1,
            Self::NotInitialized => -2,
            Self::UnableToLockContext => -3,
            Self::UnableToAddEntry => -4,
            Self::NotConnected => -5,
            Self::NotConfigured => -6,
            Self::AlreadyConfigured => -7,
            Self::CurrentlyConfiguring => -8,
            Self::CurrentlyUnConfiguring => -9,
            Self::ProcedureInProgress => -10,
            Self::FeatureNotSupported => -11,
            Self::SameRequestOutstanding => -12,
            Self::Gatt(_) => -13,
            Self::Timer(_) => -14,
        }
    }
}
