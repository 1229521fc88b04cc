//! Error reporting for the host application
//!
//! Serializable `{ code, message }` form of a session error.

use crate::recorder::RecordingError;
use serde::{Deserialize, Serialize};

/// Error response for the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

fn recording_code(error: &RecordingError) -> &'static str {
    match error {
        RecordingError::CaptureUnavailable(_) => "CAPTURE_UNAVAILABLE",
        RecordingError::EncoderUnavailable(_) => "ENCODER_UNAVAILABLE",
        RecordingError::FrameWriteFailed(_) => "FRAME_WRITE_FAILED",
        RecordingError::ListenerUnavailable(_) => "LISTENER_UNAVAILABLE",
        RecordingError::OutputVerificationFailed(_) => "OUTPUT_VERIFICATION_FAILED",
        RecordingError::ExternalProcessTimeout(_) => "EXTERNAL_PROCESS_TIMEOUT",
        RecordingError::AlreadyRecording => "ALREADY_RECORDING",
        RecordingError::NotRecording => "NOT_RECORDING",
        RecordingError::Io(_) => "IO_ERROR",
        RecordingError::Serialization(_) => "SERIALIZATION_ERROR",
    }
}

impl From<&RecordingError> for ErrorResponse {
    fn from(error: &RecordingError) -> Self {
        ErrorResponse {
            code: recording_code(error).to_string(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_error_codes() {
        let error = RecordingError::CaptureUnavailable("no display".into());
        let response = ErrorResponse::from(&error);
        assert_eq!(response.code, "CAPTURE_UNAVAILABLE");
        assert!(response.message.contains("no display"));

        let response = ErrorResponse::from(&RecordingError::NotRecording);
        assert_eq!(response.code, "NOT_RECORDING");

        let error = RecordingError::ExternalProcessTimeout("ffmpeg".into());
        let response = ErrorResponse::from(&error);
        assert_eq!(response.code, "EXTERNAL_PROCESS_TIMEOUT");
    }

    #[test]
    fn test_error_response_serializes() {
        let response = ErrorResponse::from(&RecordingError::AlreadyRecording);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], "ALREADY_RECORDING");
        assert_eq!(json["message"], "Already recording");
    }
}
