//! End-to-end scenario tests that exercise several modules together —
//! filtering, conflict resolution, authorization, and route-map
//! rebuilding — the way a reload actually composes them, rather than
//! each module's own unit tests in isolation.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::auth::Identity;
    use crate::authz::Authorizer;
    use crate::config::{
        AuthorizationConfig, ConflictResolutionConfig, ConflictStrategy, FiltersConfig, KindFilter, PolicyConfig,
        PolicyEffect,
    };
    use crate::conflict::{self, AttributedCapability};
    use crate::filter::{CompiledFilters, filter_and_rename};
    use crate::registry::RouteMap;
    use crate::session::{CapabilityKind, DiscoveredCapability};

    fn tool(name: &str) -> DiscoveredCapability {
        DiscoveredCapability {
            kind: CapabilityKind::Tool,
            original_name: name.to_string(),
            description: None,
            schema: None,
        }
    }

    fn attribute(backend: &str, discovered: Vec<DiscoveredCapability>) -> Vec<AttributedCapability> {
        let filters = CompiledFilters::compile(&FiltersConfig::default()).unwrap();
        filter_and_rename(discovered, &filters, &HashMap::new())
            .into_iter()
            .map(|capability| AttributedCapability {
                backend: backend.to_string(),
                capability,
            })
            .collect()
    }

    /// Scenario 1: two backends each expose a tool literally named
    /// `search`; the prefix strategy must rename both and leave no
    /// bare `search` entry, routing each prefixed name back to its
    /// own backend under the original name.
    #[test]
    fn prefix_strategy_resolves_collisions() {
        let mut attributed = attribute("gh", vec![tool("search"), tool("issues")]);
        attributed.extend(attribute("jira", vec![tool("search"), tool("tickets")]));

        let config = ConflictResolutionConfig {
            strategy: ConflictStrategy::Prefix,
            separator: "_".to_string(),
            order: Vec::new(),
        };
        let resolved = conflict::resolve(attributed, &config).unwrap();
        let map = RouteMap::build(resolved.resolved);

        assert!(map.resolve(CapabilityKind::Tool, "search").is_none());

        let gh_search = map.resolve(CapabilityKind::Tool, "gh_search").unwrap();
        assert_eq!(gh_search.backend, "gh");
        assert_eq!(gh_search.original_name, "search");

        let jira_search = map.resolve(CapabilityKind::Tool, "jira_search").unwrap();
        assert_eq!(jira_search.backend, "jira");
        assert_eq!(jira_search.original_name, "search");

        assert!(map.resolve(CapabilityKind::Tool, "gh_issues").is_some());
        assert!(map.resolve(CapabilityKind::Tool, "jira_tickets").is_some());
    }

    /// Scenario 2: an allow glob admits `search_*`, but a narrower deny
    /// glob removes `search_internal` from that same set. Deny wins.
    #[test]
    fn deny_overrides_allow() {
        let filters_config = FiltersConfig {
            tools: KindFilter {
                allow: vec!["search_*".to_string()],
                deny: vec!["search_internal".to_string()],
            },
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&filters_config).unwrap();
        let discovered = vec![tool("search_web"), tool("search_internal"), tool("foo")];

        let filtered = filter_and_rename(discovered, &filters, &HashMap::new());
        let names: Vec<&str> = filtered.iter().map(|c| c.exposed_name.as_str()).collect();

        assert_eq!(names, vec!["search_web"]);
    }

    /// Scenario 3: default-deny authorization with a single admin-only
    /// allow policy must reject a viewer's call before any routing
    /// decision is made.
    #[test]
    fn rbac_default_deny_rejects_unlisted_roles() {
        let config = AuthorizationConfig {
            enabled: true,
            default_effect: PolicyEffect::Deny,
            policies: vec![PolicyConfig {
                effect: PolicyEffect::Allow,
                roles: vec!["admin".to_string()],
                resources: vec!["*".to_string()],
            }],
        };
        let authorizer = Authorizer::compile(&config).unwrap();
        let viewer = Identity {
            subject: "alice".to_string(),
            roles: vec!["viewer".to_string()],
            email: None,
            display_name: None,
            provider: "local".to_string(),
            claims: HashMap::new(),
        };

        assert!(!authorizer.is_authorized(&viewer, CapabilityKind::Tool, "anything"));

        let admin = Identity {
            subject: "bob".to_string(),
            roles: vec!["admin".to_string()],
            email: None,
            display_name: None,
            provider: "local".to_string(),
            claims: HashMap::new(),
        };
        assert!(authorizer.is_authorized(&admin, CapabilityKind::Tool, "anything"));
    }

    /// Scenario 4 (registry half): once a backend's capabilities are
    /// excluded from the attributed set fed into a rebuild — which is
    /// what `ReloadCoordinator::republish` does for any backend whose
    /// phase no longer accepts calls — its entries vanish from the
    /// published map and resolving them returns `None`, the same
    /// outcome `Router::route` turns into `capability_not_found`.
    #[test]
    fn excluded_backend_entries_disappear_from_the_route_map() {
        let mut attributed = attribute("gh", vec![tool("search"), tool("issues")]);
        attributed.extend(attribute("jira", vec![tool("tickets")]));

        let config = ConflictResolutionConfig::default();
        let full_map = RouteMap::build(conflict::resolve(attributed.clone(), &config).unwrap().resolved);
        assert!(full_map.resolve(CapabilityKind::Tool, "search").is_some());

        let without_gh: Vec<AttributedCapability> =
            attributed.into_iter().filter(|a| a.backend != "gh").collect();
        let rebuilt = RouteMap::build(conflict::resolve(without_gh, &config).unwrap().resolved);

        assert!(rebuilt.resolve(CapabilityKind::Tool, "search").is_none());
        assert!(rebuilt.resolve(CapabilityKind::Tool, "issues").is_none());
        assert!(rebuilt.resolve(CapabilityKind::Tool, "tickets").is_some());
    }
}
