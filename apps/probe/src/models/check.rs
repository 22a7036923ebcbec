use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Free-form check settings; the schema depends on the check type and is
/// validated by the executor constructors.
pub type Settings = HashMap<String, Value>;

/// The frequencies the control plane is allowed to assign.
pub const VALID_FREQUENCIES: [i64; 6] = [10, 30, 60, 120, 300, 600];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("invalid frequency {0}")]
    InvalidFrequency(i64),
    #[error("offset {offset} out of range for frequency {frequency}")]
    InvalidOffset { offset: i64, frequency: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Https,
    Ping,
    Dns,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckType::Http => write!(f, "http"),
            CheckType::Https => write!(f, "https"),
            CheckType::Ping => write!(f, "ping"),
            CheckType::Dns => write!(f, "dns"),
        }
    }
}

/// A check assignment as pushed by the control server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: i64,
    pub org_id: i64,
    pub endpoint_id: i64,
    /// Endpoint slug, used in metric names and event tags.
    pub slug: String,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// Seconds between executions.
    pub frequency: i64,
    /// Phase within the frequency window, in seconds.
    pub offset: i64,
    pub enabled: bool,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub route: Option<CheckRoute>,
    #[serde(default)]
    pub health_settings: Option<HealthSettings>,
}

impl Check {
    /// Validate the scheduling fields. Executions fire at wall-clock
    /// seconds where `now % frequency == offset`, so the offset must fit
    /// inside the frequency window.
    pub fn validate(&self) -> Result<(), CheckError> {
        if !VALID_FREQUENCIES.contains(&self.frequency) {
            return Err(CheckError::InvalidFrequency(self.frequency));
        }
        if self.offset < 0 || self.offset >= self.frequency {
            return Err(CheckError::InvalidOffset {
                offset: self.offset,
                frequency: self.frequency,
            });
        }
        Ok(())
    }
}

/// Probe routing for a check. The probe does not act on this, but it
/// rides along on the wire model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config")]
pub enum CheckRoute {
    #[serde(rename = "byTags")]
    ByTags { tags: Vec<String> },
    #[serde(rename = "byIds")]
    ByIds { ids: Vec<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSettings {
    #[serde(rename = "num_collectors")]
    pub num_probes: i64,
    pub steps: i64,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationSettings {
    pub enabled: bool,
    #[serde(default)]
    pub addresses: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_json() -> &'static str {
        r#"{
            "id": 17,
            "org_id": 3,
            "endpoint_id": 9,
            "slug": "example_org",
            "type": "http",
            "frequency": 60,
            "offset": 12,
            "enabled": true,
            "updated": "2024-05-01T10:00:00Z",
            "settings": {"host": "example.org", "port": 80, "path": "/"},
            "route": {"type": "byIds", "config": {"ids": [1, 2]}},
            "health_settings": {"num_collectors": 3, "steps": 2}
        }"#
    }

    #[test]
    fn decodes_server_payload() {
        let check: Check = serde_json::from_str(check_json()).unwrap();
        assert_eq!(check.id, 17);
        assert_eq!(check.check_type, CheckType::Http);
        assert_eq!(check.frequency, 60);
        assert_eq!(check.settings["host"], "example.org");
        assert_eq!(check.route, Some(CheckRoute::ByIds { ids: vec![1, 2] }));
        assert_eq!(check.health_settings.clone().unwrap().num_probes, 3);
        assert!(check.validate().is_ok());
    }

    #[test]
    fn route_by_tags_round_trips() {
        let json = r#"{"type": "byTags", "config": {"tags": ["eu", "west"]}}"#;
        let route: CheckRoute = serde_json::from_str(json).unwrap();
        assert_eq!(route, CheckRoute::ByTags { tags: vec!["eu".into(), "west".into()] });
        let out = serde_json::to_value(&route).unwrap();
        assert_eq!(out["type"], "byTags");
        assert_eq!(out["config"]["tags"][0], "eu");
    }

    #[test]
    fn rejects_frequencies_outside_the_map() {
        let mut check: Check = serde_json::from_str(check_json()).unwrap();
        // 45 is inside Range(10,600) but not in the valid map
        check.frequency = 45;
        assert_eq!(check.validate(), Err(CheckError::InvalidFrequency(45)));
    }

    #[test]
    fn rejects_offset_outside_frequency_window() {
        let mut check: Check = serde_json::from_str(check_json()).unwrap();
        check.offset = 60;
        assert!(matches!(check.validate(), Err(CheckError::InvalidOffset { .. })));
        check.offset = -1;
        assert!(check.validate().is_err());
    }
}
