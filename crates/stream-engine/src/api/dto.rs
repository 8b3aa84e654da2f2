use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::{StreamRecord, StreamState};

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    pub stream_id: String,
    pub status: StreamState,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub qualities: Vec<String>,
    pub state: StreamState,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub inactivity_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    pub fn from_record(record: StreamRecord, inactivity_timeout_seconds: u64) -> Self {
        Self {
            id: record.id,
            qualities: record.qualities,
            state: record.state,
            created_at: record.created_at,
            last_access: record.last_access,
            inactivity_timeout_seconds,
            error: record.error,
        }
    }
}
