//! Authorization hooks
//!
//! The broker asks an [`Authorizer`] two questions: may this client connect,
//! and may it publish/subscribe on this topic. Errors from an authorizer are
//! logged by the broker and treated as a denial.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Topic operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclAction {
    Pub,
    Sub,
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclAction::Pub => write!(f, "pub"),
            AclAction::Sub => write!(f, "sub"),
        }
    }
}

/// Authentication and authorization predicates
///
/// Both methods default to allowing everything.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Called once per CONNECT
    ///
    /// * `Ok(true)` - connection accepted
    /// * `Ok(false)` - CONNACK "not authorized" and the connection is closed
    async fn check_connect(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called for every End-Client PUBLISH and every requested SUBSCRIBE filter
    ///
    /// For subscriptions `topic` is the raw filter, including any
    /// `$share/<group>/` prefix.
    async fn check_acl(
        &self,
        _action: AclAction,
        _client_id: &str,
        _username: Option<&str>,
        _source_ip: Option<IpAddr>,
        _topic: &str,
    ) -> HookResult<bool> {
        Ok(true)
    }
}

/// Authorizer that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {}

#[async_trait]
impl<T: Authorizer + ?Sized> Authorizer for Arc<T> {
    async fn check_connect(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self).check_connect(client_id, username, password).await
    }

    async fn check_acl(
        &self,
        action: AclAction,
        client_id: &str,
        username: Option<&str>,
        source_ip: Option<IpAddr>,
        topic: &str,
    ) -> HookResult<bool> {
        (**self)
            .check_acl(action, client_id, username, source_ip, topic)
            .await
    }
}

/// Chains several authorizers; every one of them must allow
pub struct CompositeAuthorizer {
    authorizers: Vec<Box<dyn Authorizer>>,
}

impl CompositeAuthorizer {
    pub fn new() -> Self {
        Self {
            authorizers: Vec::new(),
        }
    }

    pub fn add<A: Authorizer + 'static>(&mut self, authorizer: A) {
        self.authorizers.push(Box::new(authorizer));
    }

    pub fn with<A: Authorizer + 'static>(mut self, authorizer: A) -> Self {
        self.add(authorizer);
        self
    }
}

impl Default for CompositeAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authorizer for CompositeAuthorizer {
    async fn check_connect(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for authorizer in &self.authorizers {
            if !authorizer
                .check_connect(client_id, username, password)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn check_acl(
        &self,
        action: AclAction,
        client_id: &str,
        username: Option<&str>,
        source_ip: Option<IpAddr>,
        topic: &str,
    ) -> HookResult<bool> {
        for authorizer in &self.authorizers {
            if !authorizer
                .check_acl(action, client_id, username, source_ip, topic)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
