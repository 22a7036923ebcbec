//! Process-wide holder for the probe's server-assigned identity.
//!
//! Written once per session by the control client when the server emits
//! "ready"; read by every check execution loop when naming metrics.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeIdentity {
    pub id: i64,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub public: bool,
}

/// Payload of the server's "ready" event.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub collector: ProbeIdentity,
    #[serde(default)]
    pub socket_id: String,
}

static SELF: Lazy<RwLock<Option<ProbeIdentity>>> = Lazy::new(|| RwLock::new(None));

pub fn set_identity(identity: ProbeIdentity) {
    *SELF.write().expect("probe identity lock poisoned") = Some(identity);
}

pub fn identity() -> Option<ProbeIdentity> {
    SELF.read().expect("probe identity lock poisoned").clone()
}

/// The probe's slug, or an empty string before the first "ready" event.
pub fn slug() -> String {
    SELF.read()
        .expect("probe identity lock poisoned")
        .as_ref()
        .map(|p| p.slug.clone())
        .unwrap_or_default()
}

/// Serializes tests that touch the process-wide identity.
#[cfg(test)]
pub(crate) fn test_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    &LOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_visible_after_ready() {
        let _guard = test_lock().lock().unwrap();
        // slug() must not panic before assignment
        let _ = slug();

        set_identity(ProbeIdentity {
            id: 42,
            slug: "dev-probe".to_string(),
            name: "dev probe".to_string(),
            public: false,
        });
        assert_eq!(slug(), "dev-probe");
        assert_eq!(identity().unwrap().id, 42);
    }

    #[test]
    fn ready_payload_decodes() {
        let json = r#"{
            "collector": {"id": 7, "slug": "nyc-1", "name": "nyc 1", "public": true},
            "socket_id": "abc123"
        }"#;
        let payload: ReadyPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.collector.slug, "nyc-1");
        assert_eq!(payload.socket_id, "abc123");
    }
}
