//! OS input injection contract.
//!
//! A client forwards events in `INPUT` datagrams; the server replays them
//! through its [`InputInjector`]. Injection is best-effort: a session that
//! cannot inject input keeps streaming with input disabled.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Coordinates are in the pixel space of the streamed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    MouseMove { x: i32, y: i32 },
    MouseButton { button: MouseButton, pressed: bool },
    MouseScroll { delta: i32 },
    Key { virtual_key: u8, pressed: bool },
}

impl InputEvent {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StreamError> {
        bincode::serialize(self).map_err(|e| StreamError::Codec(format!("input event: {e}")))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        bincode::deserialize(bytes)
            .map_err(|_| StreamError::MalformedPacket("undecodable input event"))
    }
}

pub trait InputInjector: Send {
    fn inject(&mut self, event: &InputEvent) -> Result<(), StreamError>;

    fn release(&mut self);
}

// ── RecordingInjector ────────────────────────────────────────────

/// Keeps injected events in a log shared by all clones instead of
/// touching the OS.
#[derive(Debug, Clone, Default)]
pub struct RecordingInjector {
    log: Arc<Mutex<Vec<InputEvent>>>,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything injected so far, oldest first.
    pub fn events(&self) -> Vec<InputEvent> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

impl InputInjector for RecordingInjector {
    fn inject(&mut self, event: &InputEvent) -> Result<(), StreamError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| StreamError::Other("input log poisoned".into()))?;
        log.push(*event);
        Ok(())
    }

    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bytes_roundtrip() {
        let event = InputEvent::MouseButton {
            button: MouseButton::Right,
            pressed: true,
        };
        let bytes = event.to_bytes().unwrap();
        assert_eq!(InputEvent::from_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            InputEvent::from_bytes(&[0xFF; 3]),
            Err(StreamError::MalformedPacket(_))
        ));
        assert!(InputEvent::from_bytes(&[]).is_err());
    }

    #[test]
    fn recording_clones_share_one_log() {
        let recorder = RecordingInjector::new();
        let mut handed_out = recorder.clone();
        handed_out
            .inject(&InputEvent::Key {
                virtual_key: 0x41,
                pressed: true,
            })
            .unwrap();
        handed_out.inject(&InputEvent::MouseScroll { delta: -120 }).unwrap();
        assert_eq!(recorder.events().len(), 2);
        assert_eq!(recorder.events()[1], InputEvent::MouseScroll { delta: -120 });
    }
}
