//! The route map: an immutable, atomically-published mapping from
//! exposed capability name to the backend and original name behind it.
//!
//! Readers never block and never allocate a lock: `RouteMap` is swapped
//! wholesale via `arc_swap::ArcSwap` on every reload, so a request in
//! flight always sees one consistent snapshot even while a reload is
//! rewriting the next one underneath it.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::conflict::AttributedCapability;
use crate::session::CapabilityKind;

/// Where one exposed capability name resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub backend: String,
    pub original_name: String,
    pub description: Option<String>,
    pub schema: Option<serde_json::Value>,
}

/// One fully-resolved, conflict-free snapshot of everything the gateway
/// currently exposes, split by capability kind.
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    tools: HashMap<String, RouteEntry>,
    resources: HashMap<String, RouteEntry>,
    prompts: HashMap<String, RouteEntry>,
}

impl RouteMap {
    pub fn build(capabilities: Vec<AttributedCapability>) -> Self {
        let mut map = RouteMap::default();
        for item in capabilities {
            let entry = RouteEntry {
                backend: item.backend,
                original_name: item.capability.original_name,
                description: item.capability.description,
                schema: item.capability.schema,
            };
            map.table_mut(item.capability.kind)
                .insert(item.capability.exposed_name, entry);
        }
        map
    }

    fn table(&self, kind: CapabilityKind) -> &HashMap<String, RouteEntry> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    fn table_mut(&mut self, kind: CapabilityKind) -> &mut HashMap<String, RouteEntry> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Prompt => &mut self.prompts,
        }
    }

    pub fn resolve(&self, kind: CapabilityKind, exposed_name: &str) -> Option<&RouteEntry> {
        self.table(kind).get(exposed_name)
    }

    pub fn list(&self, kind: CapabilityKind) -> Vec<(&str, &RouteEntry)> {
        self.table(kind).iter().map(|(k, v)| (k.as_str(), v)).collect()
    }

    /// Text search over exposed names/descriptions using BM25, scoped to
    /// one capability kind. Kept from the registry's original search
    /// implementation — a useful `list` filter, not a routing mechanism.
    pub fn search(&self, kind: CapabilityKind, query: &str, limit: u32) -> Vec<(String, RouteEntry)> {
        bm25_search(self.table(kind), query, limit)
    }

    pub fn len(&self, kind: CapabilityKind) -> usize {
        self.table(kind).len()
    }

    pub fn is_empty(&self, kind: CapabilityKind) -> bool {
        self.table(kind).is_empty()
    }
}

/// Holds the currently-published route map behind an atomic pointer.
/// `publish` is the only mutator; every read is a single pointer load.
pub struct RouteRegistry {
    current: ArcSwap<RouteMap>,
}

impl RouteRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(RouteMap::default()),
        })
    }

    pub fn publish(&self, map: RouteMap) {
        self.current.store(Arc::new(map));
    }

    pub fn snapshot(&self) -> Arc<RouteMap> {
        self.current.load_full()
    }
}

fn bm25_search(
    table: &HashMap<String, RouteEntry>,
    query: &str,
    limit: u32,
) -> Vec<(String, RouteEntry)> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return Vec::new();
    }

    let corpus: Vec<(&String, &RouteEntry, Vec<String>)> = table
        .iter()
        .map(|(name, entry)| {
            let mut tokens = tokenize(name);
            let name_tokens = tokens.clone();
            tokens.extend(name_tokens); // name tokens get a 2x boost
            if let Some(desc) = &entry.description {
                tokens.extend(tokenize(desc));
            }
            (name, entry, tokens)
        })
        .collect();

    let n = corpus.len() as f64;
    if n == 0.0 {
        return Vec::new();
    }
    let avgdl: f64 = corpus.iter().map(|(_, _, t)| t.len() as f64).sum::<f64>() / n;

    let mut df: HashMap<&str, f64> = HashMap::new();
    for term in &query_terms {
        let count = corpus.iter().filter(|(_, _, tokens)| tokens.iter().any(|t| t == term)).count();
        df.insert(term.as_str(), count as f64);
    }

    const K1: f64 = 1.2;
    const B: f64 = 0.75;

    let mut scored: Vec<(&String, &RouteEntry, f64)> = corpus
        .into_iter()
        .filter_map(|(name, entry, tokens)| {
            let dl = tokens.len() as f64;
            let mut tf: HashMap<&str, f64> = HashMap::new();
            for term in &query_terms {
                let count = tokens.iter().filter(|t| t.as_str() == term.as_str()).count();
                tf.insert(term.as_str(), count as f64);
            }

            let mut score = 0.0f64;
            for term in &query_terms {
                let term_freq = tf.get(term.as_str()).copied().unwrap_or(0.0);
                if term_freq == 0.0 {
                    continue;
                }
                let doc_freq = df.get(term.as_str()).copied().unwrap_or(0.0);
                let idf = ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln();
                let tf_norm = (term_freq * (K1 + 1.0)) / (term_freq + K1 * (1.0 - B + B * dl / avgdl));
                score += idf * tf_norm;
            }

            if score > 0.0 { Some((name, entry, score)) } else { None }
        })
        .collect();

    scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(b.0)));
    scored.truncate(limit as usize);
    scored.into_iter().map(|(name, entry, _)| (name.clone(), entry.clone())).collect()
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilteredCapability;

    fn attributed(backend: &str, exposed: &str, desc: &str) -> AttributedCapability {
        AttributedCapability {
            backend: backend.to_string(),
            capability: FilteredCapability {
                kind: CapabilityKind::Tool,
                original_name: exposed.to_string(),
                exposed_name: exposed.to_string(),
                description: Some(desc.to_string()),
                schema: None,
            },
        }
    }

    #[test]
    fn build_and_resolve() {
        let map = RouteMap::build(vec![attributed("exa", "web_search", "Search the web")]);
        let entry = map.resolve(CapabilityKind::Tool, "web_search").unwrap();
        assert_eq!(entry.backend, "exa");
        assert!(map.resolve(CapabilityKind::Resource, "web_search").is_none());
    }

    #[test]
    fn publish_replaces_snapshot_atomically() {
        let registry = RouteRegistry::new();
        assert!(registry.snapshot().is_empty(CapabilityKind::Tool));

        registry.publish(RouteMap::build(vec![attributed("exa", "web_search", "Search the web")]));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(CapabilityKind::Tool), 1);
    }

    #[test]
    fn search_boosts_name_matches() {
        let map = RouteMap::build(vec![
            attributed("exa", "web_search", "Search the web using Exa"),
            attributed("tavily", "tavily_search", "Web search via Tavily"),
        ]);
        let results = map.search(CapabilityKind::Tool, "web", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "web_search");
    }

    #[test]
    fn search_with_no_match_is_empty() {
        let map = RouteMap::build(vec![attributed("exa", "web_search", "Search the web")]);
        assert!(map.search(CapabilityKind::Tool, "database", 10).is_empty());
    }

    #[test]
    fn tokenize_splits_on_non_alphanumeric() {
        assert_eq!(tokenize("get_current_time"), vec!["get", "current", "time"]);
        assert_eq!(tokenize("streamable-http"), vec!["streamable", "http"]);
    }
}
