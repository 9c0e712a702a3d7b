//! Closed sets of delivery kinds.
//!
//! Stored rows carry these as lowercase strings. Anything outside the set is
//! rejected when the event is enqueued, never at delivery time.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side effect carried by an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Email,
    Webhook,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Email, EventKind::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
        }
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "webhook" => Ok(Self::Webhook),
            other => Err(CoreError::UnknownEventKind(other.to_string())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination flavour of an export event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    Webhook,
    Crm,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Crm => "crm",
        }
    }
}

impl FromStr for ExportMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "crm" => Ok(Self::Crm),
            other => Err(CoreError::UnknownExportMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trips_through_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = "sms".parse::<EventKind>().unwrap_err();
        assert!(matches!(err, CoreError::UnknownEventKind(ref k) if k == "sms"));
        assert!("Webhook".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_export_mode_serde_is_lowercase() {
        let json = serde_json::to_string(&ExportMode::Crm).unwrap();
        assert_eq!(json, "\"crm\"");
        let mode: ExportMode = serde_json::from_str("\"webhook\"").unwrap();
        assert_eq!(mode, ExportMode::Webhook);
        assert!(serde_json::from_str::<ExportMode>("\"ftp\"").is_err());
    }
}
