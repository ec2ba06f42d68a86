//! ProjectionEngine: derived per-change-set views over computed kinds.
//!
//! Each source atom's contribution is remembered, so applying a new version
//! (or a removal) first withdraws what the previous version added. Applying
//! the same document twice leaves the projections unchanged.
//!
//! - `IncomingConnections` (id = target component) feeds the outgoing
//!   connection map, keyed by source component.
//! - `ManagementConnections` (id = managing component, outgoing) feeds the
//!   incoming management map, keyed by managed component.
//! - `AttributeTree` (id = component) feeds the default subscription sets.

use atomsync_common::{AtomKey, AtomKind, ChangeSetId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub kind: String,
    pub from_component_id: String,
    pub to_component_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_attribute_value_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_attribute_value_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultSubscription {
    pub component_id: String,
    pub path: String,
}

impl DefaultSubscription {
    fn key(&self) -> String {
        format!("{}-{}", self.component_id, self.path)
    }
}

/// Default subscription sources and who subscribes to them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultSubscriptions {
    pub default_subscriptions: BTreeMap<String, DefaultSubscription>,
    pub components_for_subs: BTreeMap<String, BTreeSet<String>>,
    pub subs_for_components: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Deserialize)]
struct ConnectionsDoc {
    #[serde(default)]
    connections: Vec<Connection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalSource {
    path: String,
    component_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeValueDoc {
    path: String,
    #[serde(default)]
    is_default_source: bool,
    #[serde(default)]
    external_sources: Option<Vec<ExternalSource>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeTreeDoc {
    #[serde(default)]
    attribute_values: HashMap<String, AttributeValueDoc>,
}

enum Contribution {
    Outgoing(Vec<Connection>),
    IncomingManagement(Vec<Connection>),
    Subscriptions {
        defaults: Vec<DefaultSubscription>,
        subscribes_to: Vec<String>,
    },
}

#[derive(Default)]
struct ChangeSetProjections {
    outgoing: HashMap<String, BTreeSet<Connection>>,
    incoming_management: HashMap<String, BTreeSet<Connection>>,
    subscriptions: DefaultSubscriptions,
    contributions: HashMap<AtomKey, Contribution>,
}

fn remove_from<K: std::hash::Hash + Eq, T: Ord>(
    map: &mut HashMap<K, BTreeSet<T>>,
    key: &K,
    item: &T,
) {
    if let Some(set) = map.get_mut(key) {
        set.remove(item);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

fn remove_from_btree(map: &mut BTreeMap<String, BTreeSet<String>>, key: &str, item: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(item);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl ChangeSetProjections {
    fn withdraw(&mut self, source: &AtomKey) {
        let Some(contribution) = self.contributions.remove(source) else {
            return;
        };
        match contribution {
            Contribution::Outgoing(connections) => {
                for connection in &connections {
                    remove_from(&mut self.outgoing, &connection.from_component_id, connection);
                }
            }
            Contribution::IncomingManagement(connections) => {
                for connection in &connections {
                    remove_from(
                        &mut self.incoming_management,
                        &connection.to_component_id,
                        connection,
                    );
                }
            }
            Contribution::Subscriptions {
                defaults,
                subscribes_to,
            } => {
                for default in &defaults {
                    self.subscriptions.default_subscriptions.remove(&default.key());
                }
                for sub in &subscribes_to {
                    remove_from_btree(&mut self.subscriptions.components_for_subs, sub, &source.id);
                    remove_from_btree(&mut self.subscriptions.subs_for_components, &source.id, sub);
                }
            }
        }
    }

    fn contribute(&mut self, source: &AtomKey, document: &Value) -> serde_json::Result<()> {
        let contribution = match source.kind {
            AtomKind::IncomingConnections => {
                let doc = ConnectionsDoc::deserialize(document)?;
                for connection in &doc.connections {
                    self.outgoing
                        .entry(connection.from_component_id.clone())
                        .or_default()
                        .insert(connection.clone());
                }
                Contribution::Outgoing(doc.connections)
            }
            AtomKind::ManagementConnections => {
                let doc = ConnectionsDoc::deserialize(document)?;
                for connection in &doc.connections {
                    self.incoming_management
                        .entry(connection.to_component_id.clone())
                        .or_default()
                        .insert(connection.clone());
                }
                Contribution::IncomingManagement(doc.connections)
            }
            AtomKind::AttributeTree => {
                let doc = AttributeTreeDoc::deserialize(document)?;
                let mut defaults = Vec::new();
                let mut subscribes_to = BTreeSet::new();
                for value in doc.attribute_values.into_values() {
                    if value.is_default_source {
                        let default = DefaultSubscription {
                            component_id: source.id.clone(),
                            path: value.path.clone(),
                        };
                        self.subscriptions
                            .default_subscriptions
                            .insert(default.key(), default.clone());
                        defaults.push(default);
                    }
                    for external in value.external_sources.unwrap_or_default() {
                        let subscription = format!("{}-{}", external.component_id, external.path);
                        subscribes_to.insert(subscription);
                    }
                }
                for sub in &subscribes_to {
                    self.subscriptions
                        .components_for_subs
                        .entry(sub.clone())
                        .or_default()
                        .insert(source.id.clone());
                    self.subscriptions
                        .subs_for_components
                        .entry(source.id.clone())
                        .or_default()
                        .insert(sub.clone());
                }
                Contribution::Subscriptions {
                    defaults,
                    subscribes_to: subscribes_to.into_iter().collect(),
                }
            }
            _ => return Ok(()),
        };
        self.contributions.insert(source.clone(), contribution);
        Ok(())
    }
}

/// Derived projections for every change-set
#[derive(Default)]
pub struct ProjectionEngine {
    change_sets: RwLock<HashMap<ChangeSetId, ChangeSetProjections>>,
}

impl ProjectionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the current document of `source`, or its removal with `None`.
    /// Returns whether the kind is computed at all.
    pub fn apply(
        &self,
        change_set: &ChangeSetId,
        source: &AtomKey,
        document: Option<&Value>,
    ) -> bool {
        if !source.kind.is_computed() {
            return false;
        }
        let mut change_sets = self.change_sets.write();
        let projections = change_sets.entry(change_set.clone()).or_default();
        projections.withdraw(source);
        if let Some(document) = document
            && let Err(e) = projections.contribute(source, document)
        {
            warn!(
                change_set = %change_set,
                atom = %source,
                error = %e,
                "projection input not understood"
            );
        }
        true
    }

    /// Replace a change-set's projections with ones built from `atoms`
    pub fn rebuild<'a>(
        &self,
        change_set: &ChangeSetId,
        atoms: impl IntoIterator<Item = (AtomKey, &'a Value)>,
    ) {
        let mut projections = ChangeSetProjections::default();
        for (source, document) in atoms {
            if source.kind.is_computed()
                && let Err(e) = projections.contribute(&source, document)
            {
                warn!(
                    change_set = %change_set,
                    atom = %source,
                    error = %e,
                    "projection input not understood"
                );
            }
        }
        self.change_sets.write().insert(change_set.clone(), projections);
    }

    pub fn drop_change_set(&self, change_set: &ChangeSetId) {
        self.change_sets.write().remove(change_set);
    }

    pub fn clear(&self) {
        self.change_sets.write().clear();
    }

    /// Connections leaving `component`
    #[must_use]
    pub fn outgoing_connections(
        &self,
        change_set: &ChangeSetId,
        component: &str,
    ) -> Vec<Connection> {
        self.change_sets
            .read()
            .get(change_set)
            .and_then(|p| p.outgoing.get(component))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Management connections arriving at `component`
    #[must_use]
    pub fn incoming_management(
        &self,
        change_set: &ChangeSetId,
        component: &str,
    ) -> Vec<Connection> {
        self.change_sets
            .read()
            .get(change_set)
            .and_then(|p| p.incoming_management.get(component))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn default_subscriptions(&self, change_set: &ChangeSetId) -> DefaultSubscriptions {
        self.change_sets
            .read()
            .get(change_set)
            .map(|p| p.subscriptions.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cs() -> ChangeSetId {
        ChangeSetId::new("cs")
    }

    fn prop(from: &str, to: &str) -> Value {
        json!({"kind": "prop", "fromComponentId": from, "toComponentId": to,
               "fromAttributeValuePath": "/domain/out", "toAttributeValuePath": "/domain/in"})
    }

    #[test]
    fn test_incoming_connections_feed_outgoing_map() {
        let engine = ProjectionEngine::new();
        let source = AtomKey::new(AtomKind::IncomingConnections, "b");
        let doc = json!({"id": "b", "connections": [prop("a", "b")]});
        assert!(engine.apply(&cs(), &source, Some(&doc)));
        // idempotent
        engine.apply(&cs(), &source, Some(&doc));
        let out = engine.outgoing_connections(&cs(), "a");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_component_id, "b");
    }

    #[test]
    fn test_new_version_withdraws_previous_contribution() {
        let engine = ProjectionEngine::new();
        let source = AtomKey::new(AtomKind::IncomingConnections, "b");
        engine.apply(&cs(), &source, Some(&json!({"connections": [prop("a", "b")]})));
        engine.apply(&cs(), &source, Some(&json!({"connections": [prop("c", "b")]})));
        assert!(engine.outgoing_connections(&cs(), "a").is_empty());
        assert_eq!(engine.outgoing_connections(&cs(), "c").len(), 1);

        engine.apply(&cs(), &source, None);
        assert!(engine.outgoing_connections(&cs(), "c").is_empty());
    }

    #[test]
    fn test_management_connections() {
        let engine = ProjectionEngine::new();
        let source = AtomKey::new(AtomKind::ManagementConnections, "mgr");
        let doc = json!({"connections": [
            {"kind": "management", "fromComponentId": "mgr", "toComponentId": "x"}
        ]});
        engine.apply(&cs(), &source, Some(&doc));
        assert_eq!(engine.incoming_management(&cs(), "x").len(), 1);
        assert!(engine.incoming_management(&ChangeSetId::new("other"), "x").is_empty());
    }

    #[test]
    fn test_default_subscriptions() {
        let engine = ProjectionEngine::new();
        let region = AtomKey::new(AtomKind::AttributeTree, "region");
        engine.apply(
            &cs(),
            &region,
            Some(&json!({"attributeValues": {
                "av1": {"path": "/domain/region", "isDefaultSource": true}
            }})),
        );
        let server = AtomKey::new(AtomKind::AttributeTree, "server");
        engine.apply(
            &cs(),
            &server,
            Some(&json!({"attributeValues": {
                "av2": {"path": "/domain/region", "isDefaultSource": false,
                        "externalSources": [{"path": "/domain/region", "componentId": "region"}]}
            }})),
        );

        let subs = engine.default_subscriptions(&cs());
        assert!(subs.default_subscriptions.contains_key("region-/domain/region"));
        assert_eq!(
            subs.components_for_subs["region-/domain/region"],
            BTreeSet::from(["server".to_string()])
        );

        engine.apply(&cs(), &server, None);
        let subs = engine.default_subscriptions(&cs());
        assert!(subs.components_for_subs.is_empty());
        assert!(subs.subs_for_components.is_empty());
        assert_eq!(subs.default_subscriptions.len(), 1);
    }

    #[test]
    fn test_rebuild_and_ignored_kinds() {
        let engine = ProjectionEngine::new();
        assert!(!engine.apply(&cs(), &AtomKey::new(AtomKind::Component, "a"), Some(&json!({}))));
        let doc = json!({"connections": [prop("a", "b")]});
        engine.rebuild(
            &cs(),
            [(AtomKey::new(AtomKind::IncomingConnections, "b"), &doc)],
        );
        assert_eq!(engine.outgoing_connections(&cs(), "a").len(), 1);
        engine.drop_change_set(&cs());
        assert!(engine.outgoing_connections(&cs(), "a").is_empty());
    }
}
