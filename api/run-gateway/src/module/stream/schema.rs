use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

/// Body returned when a subscription is refused before the stream opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRejectedResponse {
    pub subscribed: bool,
    pub run_id: String,
    pub channel: Option<String>,
    pub error_code: String,
    pub retry_after_seconds: Option<u64>,
    pub reason: String,
}
