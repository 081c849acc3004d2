//! SASL exchange driven by AUTHENTICATE / AUTH_CHALLENGE / AUTH_SUCCESS.

use std::fmt::Debug;

use crate::error::DriverResult;

/// Produces the opaque tokens sent in AUTH_RESPONSE
pub trait Authenticator: Send + Sync + Debug {
    /// First token, sent after the server names its authenticator class
    fn initial_response(&self, authenticator: &str) -> DriverResult<Option<Vec<u8>>>;

    fn evaluate_challenge(&self, challenge: Option<&[u8]>) -> DriverResult<Option<Vec<u8>>>;

    fn on_success(&self, _token: Option<&[u8]>) -> DriverResult<()> {
        Ok(())
    }
}

/// SASL PLAIN: `\0username\0password`
#[derive(Clone)]
pub struct PasswordAuthenticator {
    username: String,
    password: String,
}

impl PasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn token(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(2 + self.username.len() + self.password.len());
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }
}

impl Debug for PasswordAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuthenticator")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Authenticator for PasswordAuthenticator {
    fn initial_response(&self, _authenticator: &str) -> DriverResult<Option<Vec<u8>>> {
        Ok(Some(self.token()))
    }

    fn evaluate_challenge(&self, _challenge: Option<&[u8]>) -> DriverResult<Option<Vec<u8>>> {
        Ok(Some(self.token()))
    }
}
