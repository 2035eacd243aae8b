//! Session credential source.
//!
//! Login and token refresh live in the host application; the engine only asks
//! for the current token when it opens a connection or sends a command.

/// Supplies the bearer token of the current session.
/// Mockable for testing via mockall.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialProvider: Send + Sync {
    /// Current token, `None` when nobody is signed in.
    fn token(&self) -> Option<String>;
}

/// Fixed token, typically taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}
