//! Shared data model: read events, decoder results, write requests and
//! the backend request/response messages.

use crate::defaults::UNDEFINED_IDENTIFIER;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Read path
// ============================================================================

/// One poll iteration's view of the presented card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    /// Raw card memory, `None` when the card has no readable content.
    pub memory: Option<Vec<u8>>,
    /// Card UID as reported by the reader.
    pub uid: Vec<u8>,
    /// Stable identifier derived from the UID, see [`format_identifier`].
    pub identifier: String,
}

impl ReadEvent {
    pub fn new(memory: Option<Vec<u8>>, uid: &[u8]) -> Self {
        Self {
            memory,
            uid: uid.to_vec(),
            identifier: format_identifier(uid),
        }
    }

    pub fn memory(&self) -> Option<&[u8]> {
        self.memory.as_deref()
    }
}

/// Lowercase hex bytes joined by `:`, without zero padding (`04:a:ff`).
///
/// Identifiers stored in the inventory service use this format, so it must
/// stay stable.
pub fn format_identifier(uid: &[u8]) -> String {
    if uid.is_empty() {
        return UNDEFINED_IDENTIFIER.to_string();
    }
    uid.iter()
        .map(|byte| format!("{:x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Result of one decoder: an optional (spool, filament) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagIds {
    pub spool: Option<String>,
    pub filament: Option<String>,
}

impl TagIds {
    pub fn new(spool: impl Into<String>, filament: impl Into<String>) -> Self {
        Self {
            spool: Some(spool.into()),
            filament: Some(filament.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Both halves present.
    pub fn is_complete(&self) -> bool {
        self.spool.is_some() && self.filament.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.spool.is_none() && self.filament.is_none()
    }

    pub fn pair(&self) -> Option<(&str, &str)> {
        match (&self.spool, &self.filament) {
            (Some(spool), Some(filament)) => Some((spool, filament)),
            _ => None,
        }
    }
}

// ============================================================================
// Write path
// ============================================================================

/// Identifier pair to be written onto the next presented card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub spool: u64,
    pub filament: u64,
}

impl WriteRequest {
    pub fn new(spool: u64, filament: u64) -> Self {
        Self { spool, filament }
    }
}

// ============================================================================
// Backend requests
// ============================================================================

/// Commands accepted by the backend over its local socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    WriteTag { spool: u64, filament: u64 },
    SetNfcId { spool: u64 },
    GetSpools,
    GetState,
}

impl Request {
    pub const COMMANDS: [&'static str; 4] = ["write_tag", "set_nfc_id", "get_spools", "get_state"];

    pub fn command(&self) -> &'static str {
        match self {
            Request::WriteTag { .. } => "write_tag",
            Request::SetNfcId { .. } => "set_nfc_id",
            Request::GetSpools => "get_spools",
            Request::GetState => "get_state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Last identifier and spool seen by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub nfc_id: Option<String>,
    pub spool_id: Option<String>,
}

/// Response to a [`Request`]. Optional parts are omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfc_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spool_id: Option<Option<String>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: None,
            spools: None,
            nfc_id: None,
            spool_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn spools(spools: Vec<Value>) -> Self {
        Self {
            spools: Some(spools),
            ..Self::ok()
        }
    }

    pub fn state(state: StateSnapshot) -> Self {
        Self {
            nfc_id: Some(state.nfc_id),
            spool_id: Some(state.spool_id),
            ..Self::ok()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_is_unpadded_lowercase() {
        assert_eq!(format_identifier(&[0x04, 0x0A, 0xFF]), "4:a:ff");
        assert_eq!(format_identifier(&[]), UNDEFINED_IDENTIFIER);
    }

    #[test]
    fn test_tag_ids_completeness() {
        assert!(TagIds::new("1", "2").is_complete());
        let partial = TagIds {
            spool: Some("1".to_string()),
            filament: None,
        };
        assert!(!partial.is_complete());
        assert!(!partial.is_empty());
        assert!(partial.pair().is_none());
        assert!(TagIds::empty().is_empty());
    }

    #[test]
    fn test_request_json_shape() {
        let request: Request =
            serde_json::from_str(r#"{"command": "write_tag", "spool": 5, "filament": 12}"#).unwrap();
        assert_eq!(request, Request::WriteTag { spool: 5, filament: 12 });

        let json = serde_json::to_string(&Request::GetState).unwrap();
        assert_eq!(json, r#"{"command":"get_state"}"#);
    }

    #[test]
    fn test_response_json_shape() {
        let json = serde_json::to_value(Response::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));

        let json = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "error", "message": "boom"}));

        let json = serde_json::to_value(Response::state(StateSnapshot {
            nfc_id: Some("4:a".to_string()),
            spool_id: None,
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "ok", "nfc_id": "4:a", "spool_id": null})
        );
    }
}
