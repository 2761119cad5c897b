use serde::{Deserialize, Serialize};

use courier_infra::jobs::{DeadLetterRecord, Payload};

pub const DEFAULT_DLQ_LIMIT: usize = 50;
pub const MAX_DLQ_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListDeadRequest {
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListDeadRequest {
    /// Absent or zero means the default; anything above the maximum is clamped.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_DLQ_LIMIT,
            Some(n) => n.min(MAX_DLQ_LIMIT),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RequeueRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct DeadLetterList {
    pub items: Vec<DeadLetterRecord>,
}

#[derive(Debug, Serialize)]
pub struct Enqueued {
    pub id: String,
}
