use serde::{Deserialize, Serialize};

/// Body of `POST auth/v4/refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RefreshSessionRequest {
    pub response_type: String,
    pub grant_type: String,
    pub refresh_token: String,
    #[serde(rename = "RedirectURI")]
    pub redirect_uri: String,
}

impl RefreshSessionRequest {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            response_type: "token".to_string(),
            grant_type: "refresh_token".to_string(),
            refresh_token: refresh_token.into(),
            redirect_uri: "http://proton.me".to_string(),
        }
    }
}

/// Tokens returned when a session is created or refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionTokens {
    #[serde(rename = "UID")]
    pub uid: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScopesResponse {
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_request_wire_names() {
        let json = serde_json::to_value(RefreshSessionRequest::new("rt")).unwrap();
        assert_eq!(json["GrantType"], "refresh_token");
        assert_eq!(json["RefreshToken"], "rt");
        assert!(json.get("RedirectURI").is_some());
    }

    #[test]
    fn test_session_tokens_without_scopes() {
        let body = r#"{"UID": "s", "AccessToken": "a", "RefreshToken": "r"}"#;
        let tokens: SessionTokens = serde_json::from_str(body).unwrap();
        assert_eq!(tokens.uid, "s");
        assert!(tokens.scopes.is_empty());
    }
}
