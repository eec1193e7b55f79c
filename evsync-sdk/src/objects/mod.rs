pub mod auth;
pub mod events;

use serde::{Deserialize, Serialize};

/// `Code` value carried by every successful API response.
pub const RESPONSE_CODE_SUCCESS: i32 = 1000;

/// Body returned by the API alongside a non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub error: String,
}
