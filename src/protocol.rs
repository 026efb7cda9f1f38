//! Messages between the foreground and the worker.
//!
//! Wire shape (JSON):
//!   foreground → worker: `{"type":"downloadAll","totalPages":847,"tier":"high"}`
//!   worker → foreground: `{"type":"downloadProgress","downloaded":10,"total":847,"errors":0}`
//!                        `{"type":"downloadComplete","downloaded":846,"total":847,"errors":1}`

use serde::{Deserialize, Serialize};

use crate::asset::Tier;

/// Foreground → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    DownloadAll {
        /// Missing or zero falls back to the worker's configured page count.
        #[serde(rename = "totalPages", default, skip_serializing_if = "Option::is_none")]
        total_pages: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<Tier>,
    },
}

/// Worker → foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    DownloadProgress {
        downloaded: u32,
        total: u32,
        errors: u32,
    },
    DownloadComplete {
        downloaded: u32,
        total: u32,
        errors: u32,
    },
}

impl WorkerMessage {
    /// `(downloaded, total, errors)` regardless of kind.
    pub fn counts(&self) -> (u32, u32, u32) {
        match *self {
            WorkerMessage::DownloadProgress {
                downloaded,
                total,
                errors,
            }
            | WorkerMessage::DownloadComplete {
                downloaded,
                total,
                errors,
            } => (downloaded, total, errors),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, WorkerMessage::DownloadComplete { .. })
    }
}

/// Decode a command posted as JSON. `None` for anything that is not a
/// known command (unknown `type`, malformed JSON); the worker ignores those.
pub fn decode_command(text: &str) -> Option<Command> {
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_shape() {
        let cmd: Command =
            serde_json::from_str(r#"{"type":"downloadAll","totalPages":847,"tier":"high"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::DownloadAll {
                total_pages: Some(847),
                tier: Some(Tier::High)
            }
        );
    }

    #[test]
    fn command_fields_optional() {
        assert_eq!(
            decode_command(r#"{"type":"downloadAll"}"#),
            Some(Command::DownloadAll {
                total_pages: None,
                tier: None
            })
        );
    }

    #[test]
    fn unknown_commands_ignored() {
        assert_eq!(decode_command(r#"{"type":"skipWaiting"}"#), None);
        assert_eq!(decode_command("not json"), None);
        assert_eq!(decode_command(r#"{"type":"downloadAll","tier":"ultra"}"#), None);
    }

    #[test]
    fn progress_wire_shape() {
        let msg = WorkerMessage::DownloadProgress {
            downloaded: 10,
            total: 847,
            errors: 0,
        };
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type":"downloadProgress","downloaded":10,"total":847,"errors":0})
        );
    }

    #[test]
    fn complete_wire_shape() {
        let msg = WorkerMessage::DownloadComplete {
            downloaded: 846,
            total: 847,
            errors: 1,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"downloadComplete","downloaded":846,"total":847,"errors":1}"#
        );
        assert!(msg.is_complete());
        assert_eq!(msg.counts(), (846, 847, 1));
    }
}
