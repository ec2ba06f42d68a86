//! Read path: resolve an atom through its change-set's index and expand the
//! references it embeds.
//!
//! Every reference followed is recorded as a weak reference before any
//! hammer is fired for it, so the referrer is invalidated once the target
//! arrives.

use crate::document::{Reference, expand_references, references};
use crate::engine::EngineInner;
use crate::hammer::HammerRequest;
use atomsync_common::{AtomKey, PairKey, Result, WeakReference};
use atomsync_store::keys;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

impl EngineInner {
    pub(crate) fn get(&self, pair: &PairKey, key: &AtomKey) -> Result<Option<Value>> {
        let change_set = &pair.change_set_id;
        let Some(atom) = self.store.get(change_set, key)? else {
            debug!(pair = %pair, atom = %key, "not present, hammering");
            self.request_hammers(vec![HammerRequest::new(pair.clone(), key.clone(), None)]);
            return Ok(None);
        };
        let mut document = atom.to_value()?;
        let followed = references(&document);
        if followed.is_empty() {
            return Ok(Some(document));
        }

        let resolved = self.store.transact(|txn| -> Result<HashMap<AtomKey, Value>> {
            let mut resolved = HashMap::with_capacity(followed.len());
            for reference in &followed {
                let target = &reference.key;
                let atom = if !keys::storable(&[&target.id]) {
                    None
                } else if target.kind.is_global() {
                    txn.get_global(target)?
                } else {
                    txn.add_weak_reference(&WeakReference {
                        change_set_id: change_set.clone(),
                        target: target.clone(),
                        referrer: key.clone(),
                    })?;
                    txn.resolve(change_set, target)?
                };
                if let Some(atom) = atom {
                    resolved.insert(target.clone(), atom.to_value()?);
                }
            }
            Ok(resolved)
        })?;

        let mut misses: Vec<Reference> = Vec::new();
        expand_references(&mut document, &mut |reference| {
            let hit = resolved.get(&reference.key).cloned();
            if hit.is_none() {
                misses.push(reference.clone());
            }
            hit
        });

        if !misses.is_empty() {
            debug!(pair = %pair, atom = %key, misses = misses.len(), "references not present");
            let (globals, members): (Vec<Reference>, Vec<Reference>) =
                misses.into_iter().partition(|reference| reference.key.kind.is_global());
            self.request_hammers(
                members
                    .into_iter()
                    .map(|reference| {
                        HammerRequest::new(pair.clone(), reference.key, reference.checksum)
                    })
                    .collect(),
            );
            self.fetch_globals(
                pair.workspace_id.clone(),
                globals.into_iter().map(|reference| reference.key).collect(),
            );
        }
        Ok(Some(document))
    }

    pub(crate) fn get_global(&self, key: &AtomKey) -> Result<Option<Value>> {
        match self.store.get_global(key)? {
            Some(atom) => Ok(Some(atom.to_value()?)),
            None => Ok(None),
        }
    }
}
