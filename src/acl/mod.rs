//! ACL (Access Control List) Module
//!
//! Topic-based authorization with support for:
//! - MQTT wildcards (# and +) in permission patterns
//! - Variable substitution (%c = client_id, %u = username)
//! - Role-based permissions keyed by the authenticated username
//! - Source address deny lists (CIDR)

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::config::AclConfig;
use crate::hooks::{AclAction, Authorizer, HookResult};
use crate::topic::topic_matches_filter;


struct AclRoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl AclRoleEntry {
    fn patterns(&self, action: AclAction) -> &[String] {
        match action {
            AclAction::Pub => &self.publish,
            AclAction::Sub => &self.subscribe,
        }
    }
}

/// ACL provider
pub struct AclProvider {
    enabled: bool,
    roles: HashMap<String, AclRoleEntry>,
    /// Permissions for users without a role, including anonymous clients
    default: AclRoleEntry,
    deny_sources: Vec<IpNet>,
    auth_provider: Arc<AuthProvider>,
}

impl AclProvider {
    pub fn new(config: &AclConfig, auth_provider: Arc<AuthProvider>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclRoleEntry {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        let deny_sources = config
            .deny_sources
            .iter()
            .filter_map(|s| {
                s.parse().ok().or_else(|| {
                    warn!("Invalid ACL deny source CIDR: {}", s);
                    None
                })
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default: AclRoleEntry {
                publish: config.default.publish.clone(),
                subscribe: config.default.subscribe.clone(),
            },
            deny_sources,
            auth_provider,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check if topic matches pattern after variable substitution
    fn matches_pattern(pattern: &str, topic: &str, client_id: &str, username: Option<&str>) -> bool {
        let pattern = pattern
            .replace("%c", client_id)
            .replace("%u", username.unwrap_or(""));
        topic_matches_filter(topic, &pattern)
    }

    fn check_patterns(
        patterns: &[String],
        topic: &str,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        patterns
            .iter()
            .any(|p| Self::matches_pattern(p, topic, client_id, username))
    }

    fn role_for(&self, username: Option<&str>) -> Option<&AclRoleEntry> {
        let role_name = self.auth_provider.get_user_role(username?)?;
        self.roles.get(role_name)
    }

    fn source_denied(&self, source_ip: Option<IpAddr>) -> bool {
        source_ip.is_some_and(|ip| self.deny_sources.iter().any(|net| net.contains(&ip)))
    }
}

#[async_trait]
impl Authorizer for AclProvider {
    async fn check_acl(
        &self,
        action: AclAction,
        client_id: &str,
        username: Option<&str>,
        source_ip: Option<IpAddr>,
        topic: &str,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        if self.source_denied(source_ip) {
            debug!(client_id, %action, topic, "source address denied by ACL");
            return Ok(false);
        }

        if let Some(role) = self.role_for(username) {
            if Self::check_patterns(role.patterns(action), topic, client_id, username) {
                return Ok(true);
            }
        }

        Ok(Self::check_patterns(
            self.default.patterns(action),
            topic,
            client_id,
            username,
        ))
    }
}
