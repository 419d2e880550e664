use std::fmt::Display;

/// Error taxonomy for the orchestrator. Mirrors the shape of an application error
/// enum: a message paired with a small, closed set of kinds a caller can match on.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscodeError {
    pub message: String,
    #[serde(skip)]
    pub kind: TranscodeErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeErrorKind {
    NotFound,
    CapacityReached,
    ProbeFailed,
    SpawnFailed,
    WorkerExitedNonZero,
    SegmentUnavailable,
    WaitTimeout,
}

impl std::error::Error for TranscodeError {}

impl Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TranscodeErrorKind::NotFound => write!(f, "not found: {}", self.message),
            TranscodeErrorKind::CapacityReached => {
                write!(f, "capacity reached: {}", self.message)
            }
            TranscodeErrorKind::ProbeFailed => write!(f, "probe failed: {}", self.message),
            TranscodeErrorKind::SpawnFailed => write!(f, "spawn failed: {}", self.message),
            TranscodeErrorKind::WorkerExitedNonZero => {
                write!(f, "worker exited non-zero: {}", self.message)
            }
            TranscodeErrorKind::SegmentUnavailable => {
                write!(f, "segment unavailable: {}", self.message)
            }
            TranscodeErrorKind::WaitTimeout => write!(f, "wait timeout: {}", self.message),
        }
    }
}

impl TranscodeError {
    pub fn new(kind: TranscodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::NotFound, message)
    }

    pub fn capacity_reached(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::CapacityReached, message)
    }

    pub fn probe_failed(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::ProbeFailed, message)
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::SpawnFailed, message)
    }

    pub fn worker_exited_non_zero(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::WorkerExitedNonZero, message)
    }

    pub fn segment_unavailable(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::SegmentUnavailable, message)
    }

    pub fn wait_timeout(message: impl Into<String>) -> Self {
        Self::new(TranscodeErrorKind::WaitTimeout, message)
    }
}

/// Converts an io error encountered while spawning or managing the worker process.
/// Not meant for io errors arising elsewhere (e.g. segment lookups), which carry
/// their own kind at the call site.
impl From<std::io::Error> for TranscodeError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(value.to_string()),
            _ => Self::spawn_failed(value.to_string()),
        }
    }
}

impl From<anyhow::Error> for TranscodeError {
    fn from(value: anyhow::Error) -> Self {
        Self::probe_failed(value.to_string())
    }
}
