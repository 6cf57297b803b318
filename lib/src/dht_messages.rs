use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position on the ring, `0..RING_SIZE`.
pub type NodeId = u32;

/// Address-only copy of one finger slot, sent to the successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerRecord {
    pub target_id: NodeId,
    pub node_id: NodeId,
    pub address: String,
}

/// Address-only copy of one pointed-table row, sent to the successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointedRecord {
    pub node_id: NodeId,
    pub count: u32,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    // Client-facing operations; routed by the hash of `key`
    #[serde(rename = "insert")]
    Insert {
        key: Value,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename = "lookup")]
    Lookup {
        key: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename = "remove")]
    Remove {
        key: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    // Ask the ring for the successor of a joining node; routed by `node_id`
    #[serde(rename = "join")]
    Join {
        node_id: NodeId,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    // Ask the ring who is responsible for a finger target; routed by `target_id`
    #[serde(rename = "establishChord")]
    EstablishChord {
        target_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    // Notify a node that we believe we are its predecessor
    #[serde(rename = "imYourPred")]
    ImYourPred { node_id: NodeId, address: String },
    // Tell a node that a new node was inserted right after it
    #[serde(rename = "yourNewSucc")]
    YourNewSucc { node_id: NodeId, address: String },
    #[serde(rename = "imPointingAtYou")]
    ImPointingAtYou { node_id: NodeId, address: String },
    #[serde(rename = "imNotPointingAtYou")]
    ImNotPointingAtYou { node_id: NodeId },
    #[serde(rename = "chordEstablishmentCompleted")]
    ChordEstablishmentCompleted { node_id: NodeId },
    // A new node joined; refresh finger slots it should own
    #[serde(rename = "newNode")]
    NewNode { node_id: NodeId, address: String },
    #[serde(rename = "updatePFT")]
    UpdatePft { finger_table: Vec<FingerRecord> },
    #[serde(rename = "updatePPT")]
    UpdatePpt { pointed_table: Vec<PointedRecord> },
    // `new_id` replaces the failed `old_id` in every table
    #[serde(rename = "takeover")]
    Takeover {
        old_id: NodeId,
        new_id: NodeId,
        address: String,
    },
    // Acknowledges a takeover
    #[serde(rename = "flag")]
    Flag { node_id: NodeId },
    #[serde(rename = "readyForDataTransfer")]
    ReadyForDataTransfer { node_id: NodeId },
    #[serde(rename = "insert_replication")]
    InsertReplication { key: u64, value: Value },
    #[serde(rename = "remove_replication")]
    RemoveReplication { key: u64 },
    // Ask the predecessor to resend its finger and pointed tables
    #[serde(rename = "askForFT")]
    AskForFt,
}

impl Request {
    /// Correlation id, present only on routed requests.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Request::Insert { message_id, .. }
            | Request::Lookup { message_id, .. }
            | Request::Remove { message_id, .. }
            | Request::Join { message_id, .. }
            | Request::EstablishChord { message_id, .. } => message_id.as_deref(),
            _ => None,
        }
    }

    /// Stamps a correlation id on a routed request; other requests are left untouched.
    pub fn set_message_id(&mut self, id: String) {
        match self {
            Request::Insert { message_id, .. }
            | Request::Lookup { message_id, .. }
            | Request::Remove { message_id, .. }
            | Request::Join { message_id, .. }
            | Request::EstablishChord { message_id, .. } => *message_id = Some(id),
            _ => {}
        }
    }

    pub fn is_routed(&self) -> bool {
        matches!(
            self,
            Request::Insert { .. }
                | Request::Lookup { .. }
                | Request::Remove { .. }
                | Request::Join { .. }
                | Request::EstablishChord { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    // Set on join/establishChord answers: the responsible node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            message_id: None,
            value: None,
            message: None,
            node_id: None,
            address: None,
        }
    }

    pub fn with_value(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::success()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn peer(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id),
            address: Some(address.into()),
            ..Self::success()
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// One newline-terminated JSON value on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not a JSON value, or not terminated; the connection cannot continue.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed JSON that is not a known message; answered with a failure.
    #[error("{0}")]
    Invalid(String),
}

impl Frame {
    /// Serializes the frame followed by the `\n` terminator.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = match self {
            Frame::Request(request) => serde_json::to_string(request)?,
            Frame::Response(response) => serde_json::to_string(response)?,
        };
        line.push('\n');
        Ok(line)
    }

    /// Parses one line. The trailing terminator is required.
    pub fn decode(line: &str) -> Result<Frame, FrameError> {
        let Some(body) = line.strip_suffix('\n') else {
            return Err(FrameError::Malformed("missing frame terminator".to_string()));
        };
        let value: Value =
            serde_json::from_str(body).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Some(object) = value.as_object() else {
            return Err(FrameError::Invalid("method required".to_string()));
        };
        if object.contains_key("method") {
            serde_json::from_value(value)
                .map(Frame::Request)
                .map_err(|e| FrameError::Invalid(e.to_string()))
        } else if object.contains_key("status") {
            serde_json::from_value(value)
                .map(Frame::Response)
                .map_err(|e| FrameError::Invalid(e.to_string()))
        } else {
            Err(FrameError::Invalid("method required".to_string()))
        }
    }
}
