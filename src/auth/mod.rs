//! Authentication Module
//!
//! Username/password authentication against the configured user list.
//! Passwords are stored either in plaintext or as argon2 PHC strings.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use tracing::warn;

use crate::config::AuthConfig;
use crate::hooks::{Authorizer, HookResult};

#[cfg(test)]
mod tests;

/// Stored credential
enum Credential {
    Plain(String),
    Hash(String),
}

struct UserEntry {
    credential: Credential,
    role: Option<String>,
}

/// Authentication provider
pub struct AuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, UserEntry>,
}

impl AuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .filter_map(|user| {
                let credential = match (&user.password, &user.password_hash) {
                    (_, Some(hash)) => Credential::Hash(hash.clone()),
                    (Some(password), None) => Credential::Plain(password.clone()),
                    (None, None) => return None,
                };
                Some((
                    user.username.clone(),
                    UserEntry {
                        credential,
                        role: user.role.clone(),
                    },
                ))
            })
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ACL role configured for a username
    pub fn get_user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    fn verify(credential: &Credential, password: &[u8]) -> bool {
        match credential {
            Credential::Plain(stored) => password == stored.as_bytes(),
            Credential::Hash(phc) => match PasswordHash::new(phc) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password, &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!("unparseable password hash: {}", e);
                    false
                }
            },
        }
    }
}

#[async_trait]
impl Authorizer for AuthProvider {
    async fn check_connect(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let Some(username) = username else {
            return Ok(self.allow_anonymous);
        };

        let Some(user) = self.users.get(username) else {
            warn!(client_id, username, "unknown user");
            return Ok(false);
        };

        let ok = Self::verify(&user.credential, password.unwrap_or(&[]));
        if !ok {
            warn!(client_id, username, "bad password");
        }
        Ok(ok)
    }
}
