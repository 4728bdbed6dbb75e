//! Pure allow/deny filtering and rename logic applied to a backend's
//! discovered capabilities before they ever reach the route map.
//!
//! Nothing here touches I/O or shared state: given a backend's
//! discovered capabilities and its config, produce the subset that
//! should be exposed, under the names they should be exposed as.
//! Deny always wins over allow on overlap.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::{FiltersConfig, KindFilter, ToolOverride};
use crate::session::{CapabilityKind, DiscoveredCapability};

/// A discovered capability that survived filtering, carrying the name
/// (and description) it will be exposed under.
#[derive(Debug, Clone)]
pub struct FilteredCapability {
    pub kind: CapabilityKind,
    pub original_name: String,
    pub exposed_name: String,
    pub description: Option<String>,
    pub schema: Option<serde_json::Value>,
}

/// Compiled allow/deny glob sets for one capability kind. Building this
/// once per backend per reload avoids recompiling globs on every call.
pub struct CompiledKindFilter {
    allow: Option<GlobSet>,
    deny: GlobSet,
}

impl CompiledKindFilter {
    pub fn compile(filter: &KindFilter) -> anyhow::Result<Self> {
        let allow = if filter.allow.is_empty() {
            None
        } else {
            Some(build_glob_set(&filter.allow)?)
        };
        let deny = build_glob_set(&filter.deny)?;
        Ok(Self { allow, deny })
    }

    fn passes(&self, name: &str) -> bool {
        if self.deny.is_match(name) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.is_match(name),
            None => true,
        }
    }
}

fn build_glob_set(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Compiled filters for all three kinds, built once per backend config.
pub struct CompiledFilters {
    pub tools: CompiledKindFilter,
    pub resources: CompiledKindFilter,
    pub prompts: CompiledKindFilter,
}

impl CompiledFilters {
    pub fn compile(config: &FiltersConfig) -> anyhow::Result<Self> {
        Ok(Self {
            tools: CompiledKindFilter::compile(&config.tools)?,
            resources: CompiledKindFilter::compile(&config.resources)?,
            prompts: CompiledKindFilter::compile(&config.prompts)?,
        })
    }

    fn for_kind(&self, kind: CapabilityKind) -> &CompiledKindFilter {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }
}

/// Apply filters and overrides to one backend's discovered capabilities.
pub fn filter_and_rename(
    discovered: Vec<DiscoveredCapability>,
    filters: &CompiledFilters,
    overrides: &std::collections::HashMap<String, ToolOverride>,
) -> Vec<FilteredCapability> {
    discovered
        .into_iter()
        .filter(|cap| filters.for_kind(cap.kind).passes(&cap.original_name))
        .map(|cap| {
            let override_entry = overrides.get(&cap.original_name);
            let exposed_name = override_entry
                .and_then(|o| o.name.clone())
                .unwrap_or_else(|| cap.original_name.clone());
            let description = override_entry
                .and_then(|o| o.description.clone())
                .or(cap.description);
            FilteredCapability {
                kind: cap.kind,
                original_name: cap.original_name,
                exposed_name,
                description,
                schema: cap.schema,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(kind: CapabilityKind, name: &str) -> DiscoveredCapability {
        DiscoveredCapability {
            kind,
            original_name: name.to_string(),
            description: None,
            schema: None,
        }
    }

    #[test]
    fn deny_wins_over_allow() {
        let filters = CompiledFilters::compile(&FiltersConfig {
            tools: KindFilter {
                allow: vec!["file_*".to_string()],
                deny: vec!["file_delete".to_string()],
            },
            ..Default::default()
        })
        .unwrap();

        let discovered = vec![
            cap(CapabilityKind::Tool, "file_read"),
            cap(CapabilityKind::Tool, "file_delete"),
            cap(CapabilityKind::Tool, "network_fetch"),
        ];

        let result = filter_and_rename(discovered, &filters, &Default::default());
        let names: Vec<&str> = result.iter().map(|c| c.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["file_read"]);
    }

    #[test]
    fn no_allow_list_means_allow_everything_not_denied() {
        let filters = CompiledFilters::compile(&FiltersConfig {
            tools: KindFilter {
                allow: vec![],
                deny: vec!["dangerous_*".to_string()],
            },
            ..Default::default()
        })
        .unwrap();

        let discovered = vec![cap(CapabilityKind::Tool, "safe_tool"), cap(CapabilityKind::Tool, "dangerous_tool")];
        let result = filter_and_rename(discovered, &filters, &Default::default());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].exposed_name, "safe_tool");
    }

    #[test]
    fn override_renames_and_redescribes() {
        let filters = CompiledFilters::compile(&FiltersConfig::default()).unwrap();
        let mut overrides = std::collections::HashMap::new();
        overrides.insert(
            "search".to_string(),
            ToolOverride {
                name: Some("web_search".to_string()),
                description: Some("Search the web".to_string()),
            },
        );
        let discovered = vec![cap(CapabilityKind::Tool, "search")];
        let result = filter_and_rename(discovered, &filters, &overrides);
        assert_eq!(result[0].exposed_name, "web_search");
        assert_eq!(result[0].description.as_deref(), Some("Search the web"));
    }
}
