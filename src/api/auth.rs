use crate::error::{BotError, Result};
use chrono::{DateTime, Utc};

/// Supplies the bearer credential for outbound calls
pub trait AuthProvider: Send + Sync {
    fn get_token(&self) -> Result<String>;

    fn is_valid(&self) -> bool;
}

/// Token obtained out of band (typically from the environment)
#[derive(Debug, Clone)]
pub struct StaticTokenAuth {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        let token = token.into();
        Self {
            token: (!token.trim().is_empty()).then_some(token),
            expires_at,
        }
    }

    /// Read the token from an environment variable; missing means invalid
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(token) => Self::new(token, None),
            Err(_) => {
                tracing::warn!("{} not set; live order placement will be refused", var);
                Self {
                    token: None,
                    expires_at: None,
                }
            }
        }
    }
}

impl AuthProvider for StaticTokenAuth {
    fn get_token(&self) -> Result<String> {
        if !self.is_valid() {
            return Err(BotError::Auth("access token missing or expired".into()));
        }
        self.token
            .clone()
            .ok_or_else(|| BotError::Auth("access token missing".into()))
    }

    fn is_valid(&self) -> bool {
        let unexpired = self.expires_at.map_or(true, |at| Utc::now() < at);
        self.token.is_some() && unexpired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_valid_token() {
        let auth = StaticTokenAuth::new("abc", Some(Utc::now() + Duration::hours(1)));
        assert!(auth.is_valid());
        assert_eq!(auth.get_token().unwrap(), "abc");
    }

    #[test]
    fn test_expired_token() {
        let auth = StaticTokenAuth::new("abc", Some(Utc::now() - Duration::minutes(1)));
        assert!(!auth.is_valid());
        assert!(matches!(auth.get_token(), Err(BotError::Auth(_))));
    }

    #[test]
    fn test_blank_token_is_invalid() {
        let auth = StaticTokenAuth::new("  ", None);
        assert!(!auth.is_valid());
    }

    #[test]
    fn test_missing_env_var() {
        let auth = StaticTokenAuth::from_env("TRENDBOT_TEST_TOKEN_THAT_IS_NOT_SET");
        assert!(!auth.is_valid());
    }
}
