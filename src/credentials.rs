// ABOUTME: Supplies the bearer token sent with every API request
// ABOUTME: The environment provider reads MLSGRID_API_TOKEN

use crate::error::{ReplicationError, Result};

pub const TOKEN_ENV_VAR: &str = "MLSGRID_API_TOKEN";

pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String>;

    /// Value for the `Authorization` header.
    fn authorization_header(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.bearer_token()?))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn bearer_token(&self) -> Result<String> {
        let token = std::env::var(TOKEN_ENV_VAR).map_err(|_| {
            ReplicationError::Configuration(format!(
                "{} is not set; export the MLS Grid API token before replicating",
                TOKEN_ENV_VAR
            ))
        })?;
        validate_token(token)
    }
}

/// Fixed token, e.g. one passed on the command line.
#[derive(Clone)]
pub struct StaticCredentialProvider {
    token: String,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentialProvider")
            .field("token", &"***")
            .finish()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn bearer_token(&self) -> Result<String> {
        validate_token(self.token.clone())
    }
}

fn validate_token(token: String) -> Result<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(ReplicationError::Configuration(
            "API token is empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
