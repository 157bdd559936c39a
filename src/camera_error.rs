// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::error::Error;
use std::fmt;

use canonical_error::{CanonicalError, CanonicalErrorCode};

/// Faults observed by the coordination layer. Unlike the driver-level
/// CanonicalError, a CameraError is Clone so that it can travel inside bus
/// notifications to every subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum CameraError {
    /// Selection criteria matched no camera.
    NoSuchCamera(String),

    /// A capture was requested while one is already in flight.
    CaptureBusy,

    /// The driver failed to open a camera.
    EngineOpen(String),

    /// A driver request on an open camera failed. The camera stays usable.
    Driver(String),

    /// A processing stage failed.
    Processing(String),

    /// The final write of the artifact failed.
    Persist(String),

    /// Unrecoverable driver-level failure.
    FatalEngine(String),

    /// Request made in a state that does not allow it. Rejected
    /// synchronously; never delivered through the bus.
    InvalidState { operation: &'static str, state: String },
}

impl CameraError {
    /// Returns true for faults that end the session:
    /// engine lifecycle failures and missing cameras. Per-capture failures
    /// leave the session usable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self,
                 CameraError::NoSuchCamera(_) |
                 CameraError::EngineOpen(_) |
                 CameraError::FatalEngine(_))
    }

    pub fn engine_open(err: &CanonicalError) -> CameraError {
        CameraError::EngineOpen(err.to_string())
    }

    pub fn fatal(err: &CanonicalError) -> CameraError {
        CameraError::FatalEngine(err.to_string())
    }

    /// Classifies a failed request on an open camera. Internal, data loss
    /// and unknown errors mean the driver itself is broken; anything else
    /// is confined to the request.
    pub fn driver(err: &CanonicalError) -> CameraError {
        match err.code {
            CanonicalErrorCode::Internal |
            CanonicalErrorCode::DataLoss |
            CanonicalErrorCode::Unknown => CameraError::fatal(err),
            _ => CameraError::Driver(err.to_string()),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str,
                                state: impl fmt::Debug) -> CameraError {
        CameraError::InvalidState { operation, state: format!("{:?}", state) }
    }
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraError::NoSuchCamera(msg) => write!(f, "no such camera: {}", msg),
            CameraError::CaptureBusy => write!(f, "a capture is already in flight"),
            CameraError::EngineOpen(msg) => write!(f, "could not open camera: {}", msg),
            CameraError::Driver(msg) => write!(f, "camera request failed: {}", msg),
            CameraError::Processing(msg) => write!(f, "picture processing failed: {}", msg),
            CameraError::Persist(msg) => write!(f, "could not persist picture: {}", msg),
            CameraError::FatalEngine(msg) => write!(f, "fatal engine fault: {}", msg),
            CameraError::InvalidState { operation, state } =>
                write!(f, "{} not allowed in state {}", operation, state),
        }
    }
}

impl Error for CameraError {}
