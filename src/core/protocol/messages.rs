//! Session control messages.
//!
//! JSON-serialized with a `type` discriminator and camelCase fields so the
//! wire shape matches `{"type":"file-start","fileId":"0","size":1,"name":"a"}`.

use serde::{Deserialize, Serialize};

/// One entry of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Unique within the session.
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Slash-separated path relative to the shared root.
    #[serde(rename = "path")]
    pub relative_path: String,
}

/// Control messages for the data channel protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Catalog publish (sender → receiver, once per session).
    Metadata { files: Vec<FileMetadata> },
    /// Receiver asks for one file.
    #[serde(rename_all = "camelCase")]
    RequestFile { file_id: String },
    /// Sender announces the next file stream.
    #[serde(rename_all = "camelCase")]
    FileStart {
        file_id: String,
        size: u64,
        name: String,
    },
    /// Receiver has a sink ready; streaming may begin.
    #[serde(rename_all = "camelCase")]
    StartAck { file_id: String },
    /// Receiver has durably written chunk `seq`.
    ///
    /// `seq` is absent when talking to untagged peers, which acknowledge by
    /// file id alone.
    #[serde(rename_all = "camelCase")]
    ChunkAck {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u32>,
    },
    /// Sender finished the stream; no acknowledgement follows.
    #[serde(rename_all = "camelCase")]
    FileEnd { file_id: String },
    /// Either side gives up on a file.
    #[serde(rename_all = "camelCase")]
    TransferFailed { file_id: String, reason: String },
}

impl ControlMessage {
    /// The `type` string as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::RequestFile { .. } => "request-file",
            Self::FileStart { .. } => "file-start",
            Self::StartAck { .. } => "start-ack",
            Self::ChunkAck { .. } => "chunk-ack",
            Self::FileEnd { .. } => "file-end",
            Self::TransferFailed { .. } => "transfer-failed",
        }
    }

    /// The file this message refers to, if any.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::Metadata { .. } => None,
            Self::RequestFile { file_id }
            | Self::FileStart { file_id, .. }
            | Self::StartAck { file_id }
            | Self::ChunkAck { file_id, .. }
            | Self::FileEnd { file_id }
            | Self::TransferFailed { file_id, .. } => Some(file_id),
        }
    }
}
