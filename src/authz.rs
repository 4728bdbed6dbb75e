//! Authorization: first-match-wins policy evaluation over an
//! authenticated identity's roles against `kind:name-glob` resource
//! patterns.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::auth::Identity;
use crate::config::{AuthorizationConfig, PolicyConfig, PolicyEffect};
use crate::session::CapabilityKind;

struct CompiledPolicy {
    effect: PolicyEffect,
    /// `None` means the policy carries no role restriction and applies
    /// to any identity, matching an empty `roles` list in config.
    roles: Option<GlobSet>,
    resources: GlobSet,
}

/// Compiled, ready-to-evaluate policy set. Recompiled wholesale on every
/// config reload — policies are small, so this is cheap relative to a
/// reload's other costs.
pub struct Authorizer {
    enabled: bool,
    default_effect: PolicyEffect,
    policies: Vec<CompiledPolicy>,
}

impl Authorizer {
    pub fn compile(config: &AuthorizationConfig) -> anyhow::Result<Self> {
        let policies = config
            .policies
            .iter()
            .map(compile_policy)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            enabled: config.enabled,
            default_effect: config.default_effect,
            policies,
        })
    }

    /// Whether `identity` may invoke `kind:name`. When authorization is
    /// disabled, everything is permitted.
    pub fn is_authorized(&self, identity: &Identity, kind: CapabilityKind, name: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let resource = resource_string(kind, name);
        for policy in &self.policies {
            let role_matches = match &policy.roles {
                None => true,
                Some(globs) => identity.roles.iter().any(|r| globs.is_match(r)),
            };
            if role_matches && policy.resources.is_match(&resource) {
                return policy.effect == PolicyEffect::Allow;
            }
        }
        self.default_effect == PolicyEffect::Allow
    }
}

fn resource_string(kind: CapabilityKind, name: &str) -> String {
    let kind = match kind {
        CapabilityKind::Tool => "tool",
        CapabilityKind::Resource => "resource",
        CapabilityKind::Prompt => "prompt",
    };
    format!("{kind}:{name}")
}

fn compile_policy(config: &PolicyConfig) -> anyhow::Result<CompiledPolicy> {
    let mut builder = GlobSetBuilder::new();
    for pattern in &config.resources {
        builder.add(Glob::new(pattern)?);
    }
    let roles = if config.roles.is_empty() {
        None
    } else {
        let mut roles = GlobSetBuilder::new();
        for pattern in &config.roles {
            roles.add(Glob::new(pattern)?);
        }
        Some(roles.build()?)
    };
    Ok(CompiledPolicy {
        effect: config.effect,
        roles,
        resources: builder.build()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(roles: &[&str]) -> Identity {
        Identity {
            subject: "test".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            email: None,
            display_name: None,
            provider: "local".to_string(),
            claims: Default::default(),
        }
    }

    fn config(default_effect: PolicyEffect, policies: Vec<PolicyConfig>) -> AuthorizationConfig {
        AuthorizationConfig {
            enabled: true,
            default_effect,
            policies,
        }
    }

    #[test]
    fn disabled_authorization_allows_everything() {
        let authorizer = Authorizer::compile(&AuthorizationConfig {
            enabled: false,
            default_effect: PolicyEffect::Deny,
            policies: vec![],
        })
        .unwrap();
        assert!(authorizer.is_authorized(&identity(&[]), CapabilityKind::Tool, "anything"));
    }

    #[test]
    fn default_deny_blocks_unmatched_requests() {
        let authorizer = Authorizer::compile(&config(PolicyEffect::Deny, vec![])).unwrap();
        assert!(!authorizer.is_authorized(&identity(&["guest"]), CapabilityKind::Tool, "web_search"));
    }

    #[test]
    fn matching_role_and_resource_allows() {
        let cfg = config(
            PolicyEffect::Deny,
            vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["operator".to_string()],
                resources: vec!["tool:*".to_string()],
            }],
        );
        let authorizer = Authorizer::compile(&cfg).unwrap();
        assert!(authorizer.is_authorized(&identity(&["operator"]), CapabilityKind::Tool, "web_search"));
        assert!(!authorizer.is_authorized(&identity(&["guest"]), CapabilityKind::Tool, "web_search"));
    }

    #[test]
    fn first_matching_policy_wins() {
        let cfg = config(
            PolicyEffect::Deny,
            vec![
                PolicyConfig {
                    effect: PolicyEffect::Deny,
                    roles: vec![],
                    resources: vec!["tool:dangerous_*".to_string()],
                },
                PolicyConfig {
                    effect: PolicyEffect::Allow,
                    roles: vec![],
                    resources: vec!["tool:*".to_string()],
                },
            ],
        );
        let authorizer = Authorizer::compile(&cfg).unwrap();
        assert!(!authorizer.is_authorized(&identity(&["operator"]), CapabilityKind::Tool, "dangerous_delete"));
        assert!(authorizer.is_authorized(&identity(&["operator"]), CapabilityKind::Tool, "safe_read"));
    }

    #[test]
    fn role_glob_matches_a_wildcarded_role() {
        let cfg = config(
            PolicyEffect::Deny,
            vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["admin-*".to_string()],
                resources: vec!["tool:*".to_string()],
            }],
        );
        let authorizer = Authorizer::compile(&cfg).unwrap();
        assert!(authorizer.is_authorized(&identity(&["admin-prod"]), CapabilityKind::Tool, "web_search"));
        assert!(!authorizer.is_authorized(&identity(&["viewer"]), CapabilityKind::Tool, "web_search"));
    }

    #[test]
    fn policy_with_no_roles_applies_to_anyone() {
        let cfg = config(
            PolicyEffect::Allow,
            vec![PolicyConfig {
                effect: PolicyEffect::Deny,
                roles: vec![],
                resources: vec!["resource:secret_*".to_string()],
            }],
        );
        let authorizer = Authorizer::compile(&cfg).unwrap();
        assert!(!authorizer.is_authorized(&identity(&[]), CapabilityKind::Resource, "secret_config"));
    }
}
