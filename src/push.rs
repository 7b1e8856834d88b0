//! Push-notification boundary.
//!
//! Events only pre-warm sessions; nothing depends on them arriving.

use knock_core::Protocol;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushHint {
    Motion,
    Doorbell,
    /// A new recording or snapshot is waiting on the device.
    FileReady,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub device_id: String,
    pub hint: PushHint,
}

impl PushEvent {
    pub fn new(device_id: impl Into<String>, hint: PushHint) -> Self {
        Self {
            device_id: device_id.into(),
            hint,
        }
    }

    /// The session worth opening ahead of the user.
    pub fn prewarm_protocol(&self) -> Option<Protocol> {
        match self.hint {
            PushHint::Motion | PushHint::Doorbell => Some(Protocol::Rtsp),
            PushHint::FileReady => Some(Protocol::Ftp),
            PushHint::Custom(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_pick_protocols() {
        assert_eq!(PushEvent::new("D1", PushHint::Doorbell).prewarm_protocol(), Some(Protocol::Rtsp));
        assert_eq!(PushEvent::new("D1", PushHint::Motion).prewarm_protocol(), Some(Protocol::Rtsp));
        assert_eq!(PushEvent::new("D1", PushHint::FileReady).prewarm_protocol(), Some(Protocol::Ftp));
        assert_eq!(PushEvent::new("D1", PushHint::Custom("x".into())).prewarm_protocol(), None);
    }

    #[test]
    fn decodes_wire_shape() {
        let event: PushEvent = serde_json::from_str(r#"{"deviceId":"D1","hint":"doorbell"}"#).unwrap();
        assert_eq!(event, PushEvent::new("D1", PushHint::Doorbell));
        let event: PushEvent = serde_json::from_str(r#"{"deviceId":"D1","hint":{"custom":"battery-low"}}"#).unwrap();
        assert_eq!(event.hint, PushHint::Custom("battery-low".into()));
    }
}
