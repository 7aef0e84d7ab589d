use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access-token claims issued by the hosted auth provider.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Claims {
    pub sub: String, // user UUID
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize, // expiration (as UNIX timestamp)
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}
