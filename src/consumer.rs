//! What a view does with a registry: register a handler that feeds the
//! cache, then start the stream if nobody has yet.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kubernetes::DynamicObject;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::key::{QueryKey, RegistryKey};
use crate::provider::RegistryProvider;
use crate::registry::{Handler, Registration};
use crate::transport::{EventKind, ItemWatchParams, ListEvent, ListWatchParams};

/// The write side of the cache views render from.
pub trait CacheSink: Send + Sync {
    fn apply_list_event(&self, key: &RegistryKey, event: &ListEvent);

    fn replace_item(&self, key: &RegistryKey, object: &DynamicObject);
}

#[derive(Default)]
struct Snapshots {
    lists: HashMap<RegistryKey, BTreeMap<String, DynamicObject>>,
    items: HashMap<RegistryKey, DynamicObject>,
}

/// In-memory snapshots per registry key. Every change bumps a revision,
/// readers wait on [`SnapshotCache::subscribe`] to learn about them.
pub struct SnapshotCache {
    snapshots: RwLock<Snapshots>,
    revision: watch::Sender<u64>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);

        SnapshotCache {
            snapshots: RwLock::new(Snapshots::default()),
            revision,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Replaces the list snapshot of `key`, typically with the result of an
    /// initial list call.
    pub fn seed_list(&self, key: &RegistryKey, objects: impl IntoIterator<Item = DynamicObject>) {
        let objects = objects
            .into_iter()
            .filter_map(|obj| {
                let name = obj.metadata.name()?.to_string();
                Some((name, obj))
            })
            .collect();

        self.snapshots.write().lists.insert(key.clone(), objects);
        self.bump();
    }

    pub fn seed_item(&self, key: &RegistryKey, object: DynamicObject) {
        self.snapshots.write().items.insert(key.clone(), object);
        self.bump();
    }

    /// Objects of the list snapshot, ordered by name.
    pub fn list(&self, key: &RegistryKey) -> Vec<DynamicObject> {
        self.snapshots
            .read()
            .lists
            .get(key)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn item(&self, key: &RegistryKey) -> Option<DynamicObject> {
        self.snapshots.read().items.get(key).cloned()
    }

    /// Forgets everything cached under `key`.
    pub fn invalidate(&self, key: &RegistryKey) {
        let removed = {
            let mut snapshots = self.snapshots.write();
            let list = snapshots.lists.remove(key).is_some();
            let item = snapshots.items.remove(key).is_some();
            list || item
        };

        if removed {
            self.bump();
        }
    }
}

impl CacheSink for SnapshotCache {
    fn apply_list_event(&self, key: &RegistryKey, event: &ListEvent) {
        if event.kind == EventKind::Bookmark {
            return;
        }
        let Some(name) = event.object.metadata.name() else {
            return;
        };

        {
            let mut snapshots = self.snapshots.write();
            let objects = snapshots.lists.entry(key.clone()).or_default();
            match event.kind {
                EventKind::Added | EventKind::Modified => {
                    objects.insert(name.to_string(), event.object.clone());
                }
                EventKind::Deleted => {
                    objects.remove(name);
                }
                EventKind::Bookmark => {}
            }
        }

        self.bump();
    }

    fn replace_item(&self, key: &RegistryKey, object: &DynamicObject) {
        self.snapshots
            .write()
            .items
            .insert(key.clone(), object.clone());
        self.bump();
    }
}

/// Keeps `sink` updated with the collection `query` describes. Returns
/// `None` when nobody is logged in.
pub fn watch_list(
    provider: &RegistryProvider,
    query: &QueryKey,
    resource_version: Option<&str>,
    sink: Arc<dyn CacheSink>,
) -> Option<Registration> {
    let registry = provider.list_watch_registry()?;

    let key = query.registry_key();
    let handler = Handler::new(move |event: &ListEvent| {
        sink.apply_list_event(&key, event);
        Ok(())
    });

    let registration = registry.register(query, ListWatchParams::new(query), handler);
    registry.start_subscription(query, resource_version);

    Some(registration)
}

/// Keeps `sink` updated with the single object `query` names. Returns
/// `None` when nobody is logged in.
pub fn watch_item(
    provider: &RegistryProvider,
    query: &QueryKey,
    resource_version: Option<&str>,
    sink: Arc<dyn CacheSink>,
) -> Option<Registration> {
    let registry = provider.item_watch_registry()?;

    let key = query.registry_key();
    let handler = Handler::new(move |object: &DynamicObject| {
        sink.replace_item(&key, object);
        Ok(())
    });

    let registration = registry.register(query, ItemWatchParams::new(query), handler);
    registry.start_subscription(query, resource_version);

    Some(registration)
}
