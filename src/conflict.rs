//! Conflict resolution: when more than one backend exposes the same
//! name for the same capability kind, decide which one wins the name
//! and what the others are renamed to (or whether the whole reload
//! should be rejected).

use std::collections::HashMap;

use crate::config::{ConflictResolutionConfig, ConflictStrategy};
use crate::filter::FilteredCapability;
use crate::session::CapabilityKind;

/// One capability attributed to the backend it came from, ready for
/// conflict resolution and then publication into the route map.
#[derive(Debug, Clone)]
pub struct AttributedCapability {
    pub backend: String,
    pub capability: FilteredCapability,
}

/// A capability that lost a first-wins collision and never made it into
/// the resolved set, kept around only so the caller can audit it.
#[derive(Debug, Clone)]
pub struct DroppedCapability {
    pub backend: String,
    pub kind: CapabilityKind,
    pub name: String,
}

/// Output of [`resolve`]: the capabilities that survived, plus anything
/// first-wins dropped along the way.
#[derive(Debug, Default)]
pub struct Resolution {
    pub resolved: Vec<AttributedCapability>,
    pub dropped: Vec<DroppedCapability>,
}

/// Resolve name collisions across all backends' filtered capabilities
/// for one capability kind, grouped by exposed name before resolution.
pub fn resolve(mut capabilities: Vec<AttributedCapability>, config: &ConflictResolutionConfig) -> anyhow::Result<Resolution> {
    // Stable grouping by exposed name, preserving backend encounter order
    // so `first-wins` is deterministic given a deterministic input order.
    let mut by_name: HashMap<String, Vec<AttributedCapability>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for item in capabilities.drain(..) {
        let name = item.capability.exposed_name.clone();
        if !by_name.contains_key(&name) {
            order.push(name.clone());
        }
        by_name.entry(name).or_default().push(item);
    }

    let mut resolved = Vec::new();
    let mut dropped = Vec::new();
    for name in order {
        let group = by_name.remove(&name).unwrap();
        if group.len() == 1 {
            resolved.push(group.into_iter().next().unwrap());
            continue;
        }

        match config.strategy {
            ConflictStrategy::Error => {
                let backends: Vec<&str> = group.iter().map(|c| c.backend.as_str()).collect();
                anyhow::bail!("capability '{name}' is exposed by multiple backends: {backends:?}");
            }
            ConflictStrategy::FirstWins => {
                let mut group = group.into_iter();
                resolved.push(group.next().unwrap());
                for loser in group {
                    dropped.push(DroppedCapability {
                        backend: loser.backend,
                        kind: loser.capability.kind,
                        name: loser.capability.exposed_name,
                    });
                }
            }
            ConflictStrategy::Prefix => {
                for mut item in group {
                    item.capability.exposed_name = format!("{}{}{}", item.backend, config.separator, name);
                    resolved.push(item);
                }
            }
            ConflictStrategy::Priority => {
                let mut group = group;
                group.sort_by_key(|item| priority_rank(&config.order, &item.backend));
                resolved.push(group.into_iter().next().unwrap());
            }
        }
    }

    Ok(Resolution { resolved, dropped })
}

fn priority_rank(order: &[String], backend: &str) -> usize {
    order.iter().position(|b| b == backend).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CapabilityKind;

    fn item(backend: &str, exposed: &str) -> AttributedCapability {
        AttributedCapability {
            backend: backend.to_string(),
            capability: FilteredCapability {
                kind: CapabilityKind::Tool,
                original_name: exposed.to_string(),
                exposed_name: exposed.to_string(),
                description: None,
                schema: None,
            },
        }
    }

    fn config(strategy: ConflictStrategy) -> ConflictResolutionConfig {
        ConflictResolutionConfig {
            strategy,
            separator: "_".to_string(),
            order: vec!["b".to_string(), "a".to_string()],
        }
    }

    #[test]
    fn first_wins_keeps_first_encountered() {
        let items = vec![item("a", "search"), item("b", "search")];
        let outcome = resolve(items, &config(ConflictStrategy::FirstWins)).unwrap();
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].backend, "a");
    }

    #[test]
    fn first_wins_reports_every_dropped_loser() {
        let items = vec![item("a", "search"), item("b", "search"), item("c", "search")];
        let outcome = resolve(items, &config(ConflictStrategy::FirstWins)).unwrap();
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.dropped.len(), 2);
        assert_eq!(outcome.dropped[0].backend, "b");
        assert_eq!(outcome.dropped[0].name, "search");
        assert_eq!(outcome.dropped[1].backend, "c");
    }

    #[test]
    fn prefix_renames_every_colliding_entry() {
        let items = vec![item("a", "search"), item("b", "search")];
        let outcome = resolve(items, &config(ConflictStrategy::Prefix)).unwrap();
        assert_eq!(outcome.resolved.len(), 2);
        assert!(outcome.dropped.is_empty());
        let names: Vec<&str> = outcome.resolved.iter().map(|c| c.capability.exposed_name.as_str()).collect();
        assert!(names.contains(&"a_search"));
        assert!(names.contains(&"b_search"));
    }

    #[test]
    fn priority_picks_highest_ranked_backend() {
        let items = vec![item("a", "search"), item("b", "search")];
        let outcome = resolve(items, &config(ConflictStrategy::Priority)).unwrap();
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].backend, "b");
    }

    #[test]
    fn error_strategy_rejects_collisions() {
        let items = vec![item("a", "search"), item("b", "search")];
        assert!(resolve(items, &config(ConflictStrategy::Error)).is_err());
    }

    #[test]
    fn no_collision_passes_through_unchanged() {
        let items = vec![item("a", "search"), item("b", "fetch")];
        let outcome = resolve(items, &config(ConflictStrategy::Error)).unwrap();
        assert_eq!(outcome.resolved.len(), 2);
    }
}
