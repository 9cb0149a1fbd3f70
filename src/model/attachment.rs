//! Task attachments: inline base64 blobs or references to a file transport.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Metadata for one file attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum Attachment {
    /// Content stored on the task document itself.
    Inline { data: String, length: u64 },
    /// Content held by a file transport at `path`.
    Remote { path: String, length: u64 },
}

impl Attachment {
    pub fn inline(bytes: &[u8]) -> Self {
        Self::Inline {
            data: ENGINE.encode(bytes),
            length: bytes.len() as u64,
        }
    }

    pub fn remote(path: impl Into<String>, length: u64) -> Self {
        Self::Remote {
            path: path.into(),
            length,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            Self::Inline { length, .. } | Self::Remote { length, .. } => *length,
        }
    }

    /// Decode inline content. `None` for remote attachments.
    pub fn decode_inline(&self, name: &str) -> Option<Result<Vec<u8>, TransportError>> {
        match self {
            Self::Inline { data, .. } => Some(ENGINE.decode(data).map_err(|e| {
                TransportError::InvalidAttachment {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })),
            Self::Remote { .. } => None,
        }
    }
}
