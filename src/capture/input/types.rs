//! Input event types
//!
//! Serialized form matches the event log file: a `type` discriminator, the
//! payload fields, and `timestamp` in seconds with millisecond precision.

use serde::{Deserialize, Serialize};

/// Mouse button identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    X1,
    X2,
    Unknown,
}

/// Event payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEventKind {
    KeyPress {
        key: String,
    },
    KeyRelease {
        key: String,
    },
    MouseMove {
        x: i32,
        y: i32,
    },
    MouseClick {
        x: i32,
        y: i32,
        button: MouseButton,
        pressed: bool,
    },
    MouseScroll {
        x: i32,
        y: i32,
        dx: i32,
        dy: i32,
    },
}

/// A single timestamped input event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Milliseconds since session start (monotonic clock)
    #[serde(rename = "timestamp", with = "millis_as_seconds")]
    pub timestamp_ms: u64,

    #[serde(flatten)]
    pub kind: InputEventKind,
}

impl InputEvent {
    pub fn new(timestamp_ms: u64, kind: InputEventKind) -> Self {
        Self { timestamp_ms, kind }
    }

    /// Timestamp in seconds
    pub fn seconds(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }

    /// The `type` discriminator as written to the log
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            InputEventKind::KeyPress { .. } => "key_press",
            InputEventKind::KeyRelease { .. } => "key_release",
            InputEventKind::MouseMove { .. } => "mouse_move",
            InputEventKind::MouseClick { .. } => "mouse_click",
            InputEventKind::MouseScroll { .. } => "mouse_scroll",
        }
    }
}

mod millis_as_seconds {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(*ms as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Ok((seconds.max(0.0) * 1000.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = InputEvent::new(
            1234,
            InputEventKind::MouseClick {
                x: 10,
                y: 20,
                button: MouseButton::Left,
                pressed: true,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "mouse_click");
        assert_eq!(value["timestamp"], 1.234);
        assert_eq!(value["button"], "left");
        assert_eq!(value["pressed"], true);
    }

    #[test]
    fn test_event_parses_back() {
        let json = r#"{"type":"key_press","key":"a","timestamp":0.5}"#;
        let event: InputEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.timestamp_ms, 500);
        assert_eq!(event.type_name(), "key_press");
        assert_eq!(event.kind, InputEventKind::KeyPress { key: "a".to_string() });
    }
}
