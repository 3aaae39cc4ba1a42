use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Claude,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Self::Claude,
            _ => Self::Openai,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Claude => "claude",
        }
    }
}

impl<'de> Deserialize<'de> for ProviderKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAuthMode {
    ApiKey,
    Oauth,
}

impl ProviderAuthMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "oauth" => Self::Oauth,
            _ => Self::ApiKey,
        }
    }
}

impl Default for ProviderAuthMode {
    fn default() -> Self {
        Self::ApiKey
    }
}

impl<'de> Deserialize<'de> for ProviderAuthMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Stored secrets that still carry the at-rest encryption prefix were never
/// decrypted; using one is a hard failure, not a silent retry.
pub fn looks_encrypted(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.starts_with("enc:v") && trimmed.splitn(3, ':').count() == 3
}

/// Claude OAuth credentials must be setup-tokens.
pub const CLAUDE_SETUP_TOKEN_PREFIX: &str = "sk-ant-oat01-";

pub fn is_claude_setup_token(value: &str) -> bool {
    value.trim().starts_with(CLAUDE_SETUP_TOKEN_PREFIX)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub auth_mode: ProviderAuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(default)]
    pub default_model: String,
    /// Drops the `anthropic-beta: effort` header when set.
    #[serde(default)]
    pub disable_effort_beta: bool,
}

fn default_kind() -> ProviderKind {
    ProviderKind::Openai
}

impl ProviderSettings {
    pub fn usable_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn usable_oauth_token(&self) -> Option<&str> {
        self.oauth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_shape_is_detected() {
        assert!(looks_encrypted("enc:v1:abcdef"));
        assert!(looks_encrypted(" enc:v2:payload "));
        assert!(!looks_encrypted("sk-live-plaintext"));
        assert!(!looks_encrypted("enc:v1"));
    }

    #[test]
    fn claude_setup_token_shape_is_detected() {
        assert!(is_claude_setup_token("sk-ant-oat01-xyz"));
        assert!(!is_claude_setup_token("sk-ant-api03-xyz"));
    }
}
