//! Auth provider collaborator interface (spec §6): an optional token-refresh
//! hook invoked on (re)connect, plus the static default built from
//! [`crate::config::ClientConfig::auth`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RedisCoreResult;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

/// Invoked by the connection handshake (spec §4.2) each time a fresh
/// connection authenticates. A static-credential implementation is provided
/// below; an IAM/token-refresh implementation is an external collaborator
/// (spec §1's non-goals).
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn credentials(&self) -> RedisCoreResult<Option<Credentials>>;
}

pub struct StaticAuthProvider {
    credentials: std::sync::RwLock<Option<Credentials>>,
}

impl StaticAuthProvider {
    pub fn new(credentials: Option<Credentials>) -> Self {
        StaticAuthProvider {
            credentials: std::sync::RwLock::new(credentials),
        }
    }

    /// Backs `update_password` (spec §6 exposed interface): replaces the
    /// credentials used by the *next* connect/reconnect. `immediate_auth`
    /// additionally re-authenticates already-established connections; that
    /// side effect is orchestrated by [`crate::client::Client`], which owns
    /// the pool, not by the provider itself.
    pub fn set_password(&self, new_password: String) {
        let mut guard = self.credentials.write().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(creds) => creds.password = new_password,
            None => {
                *guard = Some(Credentials {
                    username: None,
                    password: new_password,
                })
            }
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn credentials(&self) -> RedisCoreResult<Option<Credentials>> {
        Ok(self.credentials.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

pub type SharedAuthProvider = Arc<dyn AuthProvider>;
