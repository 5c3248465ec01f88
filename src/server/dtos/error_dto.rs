use serde::Serialize;

/// body for an offline channel, players can tell "come back later" apart from a broken request
#[derive(Debug, Clone, Serialize)]
pub struct OfflineErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

impl Default for OfflineErrorResponse {
    fn default() -> Self {
        Self {
            error: "Stream offline".to_string(),
            message: "The channel is not broadcasting right now".to_string(),
            retryable: true,
        }
    }
}
