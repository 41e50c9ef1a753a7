//! Instance cache
//!
//! Maps a service identity to the instances last seen for it. Each entry is
//! an immutable snapshot; writers build a new sequence and swap it in under
//! the entry lock, so readers never see a half-applied change.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::model::{InstanceDescriptor, ServiceIdentity};

/// Result of applying one instance change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// An instance with the same id was replaced in place
    Replaced,
    /// The instance was new and appended
    Appended,
}

/// Concurrent identity → instances map
#[derive(Debug, Default)]
pub struct InstanceCache {
    entries: DashMap<ServiceIdentity, Arc<[InstanceDescriptor]>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole entry, e.g. with a fresh discovery result
    ///
    /// Later duplicates of an instance id win over earlier ones.
    pub fn seed(&self, identity: &ServiceIdentity, instances: Vec<InstanceDescriptor>) {
        let mut deduped: Vec<InstanceDescriptor> = Vec::with_capacity(instances.len());
        for instance in instances {
            upsert(&mut deduped, instance);
        }
        debug!(service = %identity, count = deduped.len(), "Seeded instance cache");
        self.entries.insert(identity.clone(), Arc::from(deduped));
    }

    /// Apply one changed instance: replace by instance id, append otherwise
    pub fn apply_change(
        &self,
        identity: &ServiceIdentity,
        changed: InstanceDescriptor,
    ) -> ChangeOutcome {
        let mut entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| Arc::from(Vec::new()));

        let mut next = entry.to_vec();
        let outcome = upsert(&mut next, changed);
        *entry = Arc::from(next);
        outcome
    }

    /// Drop one instance from an entry; returns whether it was present
    pub fn remove_instance(&self, identity: &ServiceIdentity, instance_id: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(identity) else {
            return false;
        };
        if !entry.iter().any(|i| i.instance_id == instance_id) {
            return false;
        }
        let next: Vec<InstanceDescriptor> = entry
            .iter()
            .filter(|i| i.instance_id != instance_id)
            .cloned()
            .collect();
        *entry = Arc::from(next);
        true
    }

    /// Snapshot of the cached instances for `identity`
    pub fn get(&self, identity: &ServiceIdentity) -> Option<Arc<[InstanceDescriptor]>> {
        self.entries.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, identity: &ServiceIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn upsert(instances: &mut Vec<InstanceDescriptor>, changed: InstanceDescriptor) -> ChangeOutcome {
    match instances
        .iter_mut()
        .find(|i| i.instance_id == changed.instance_id)
    {
        Some(slot) => {
            *slot = changed;
            ChangeOutcome::Replaced
        }
        None => {
            instances.push(changed);
            ChangeOutcome::Appended
        }
    }
}
