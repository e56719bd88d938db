use serde::{Deserialize, Serialize};

/// JSON body of `POST /predict`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PredictRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PredictResponse {
    pub answer: String,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
