use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::ObjectKey;
use crate::store::WatchEvent;

type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

struct CacheState<K> {
    objects: BTreeMap<ObjectKey, Arc<K>>,
    index_fns: BTreeMap<String, IndexFn<K>>,
    /// index name -> indexed value -> keys
    indexes: BTreeMap<String, BTreeMap<String, BTreeSet<ObjectKey>>>,
    synced: bool,
}

impl<K> Default for CacheState<K> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            index_fns: BTreeMap::new(),
            indexes: BTreeMap::new(),
            synced: false,
        }
    }
}

impl<K> CacheState<K> {
    fn unindex(&mut self, key: &ObjectKey, obj: &K) {
        for (name, f) in &self.index_fns {
            let Some(index) = self.indexes.get_mut(name) else {
                continue;
            };
            for value in f(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&mut self, key: &ObjectKey, obj: &K) {
        for (name, f) in &self.index_fns {
            let index = self.indexes.entry(name.clone()).or_default();
            for value in f(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn insert(&mut self, key: ObjectKey, obj: Arc<K>) {
        if let Some(old) = self.objects.remove(&key) {
            self.unindex(&key, &old);
        }
        self.index(&key, &obj);
        self.objects.insert(key, obj);
    }

    fn remove(&mut self, key: &ObjectKey) {
        if let Some(old) = self.objects.remove(key) {
            self.unindex(key, &old);
        }
    }
}

/// Read side of a watch-fed, indexed cache of one kind
pub struct Cache<K> {
    state: Arc<RwLock<CacheState<K>>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// The single writer of a [`Cache`]
pub struct CacheWriter<K> {
    state: Arc<RwLock<CacheState<K>>>,
}

impl<K: kube::Resource> Cache<K> {
    /// A cache and the writer that feeds it
    pub fn new() -> (Cache<K>, CacheWriter<K>) {
        let state = Arc::new(RwLock::new(CacheState::default()));
        (
            Cache {
                state: state.clone(),
            },
            CacheWriter { state },
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().objects.get(key).cloned()
    }

    pub fn state(&self) -> Vec<Arc<K>> {
        self.read().objects.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().objects.keys().cloned().collect()
    }

    /// Objects whose index function produced `value`
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        let state = self.read();
        state
            .indexes
            .get(index)
            .and_then(|i| i.get(value))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| state.objects.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True once the first full listing has been applied
    pub fn is_synced(&self) -> bool {
        self.read().synced
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: kube::Resource> CacheWriter<K> {
    fn write(&self) -> RwLockWriteGuard<'_, CacheState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a named index and indexes what is already cached
    pub fn add_index(&self, name: &str, f: impl Fn(&K) -> Vec<String> + Send + Sync + 'static) {
        let mut state = self.write();
        state.index_fns.insert(name.to_owned(), Arc::new(f));
        let objects: Vec<_> = state
            .objects
            .iter()
            .map(|(k, o)| (k.clone(), o.clone()))
            .collect();
        state.indexes.remove(name);
        for (key, obj) in objects {
            state.index(&key, &obj);
        }
    }

    pub fn apply(&self, event: &WatchEvent<K>)
    where
        K: Clone,
    {
        let mut state = self.write();
        match event {
            WatchEvent::Applied(obj) => state.insert(ObjectKey::of(obj), Arc::new(obj.clone())),
            WatchEvent::Deleted(obj) => state.remove(&ObjectKey::of(obj)),
            WatchEvent::Restarted(objs) => {
                state.objects.clear();
                state.indexes.clear();
                for obj in objs {
                    state.insert(ObjectKey::of(obj), Arc::new(obj.clone()));
                }
                state.synced = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::virtualmachineclaims::VirtualMachineClaim;
    use kube::ResourceExt;
    use std::collections::BTreeMap;

    fn claim(name: &str, se: &str) -> VirtualMachineClaim {
        let mut vmc = VirtualMachineClaim::new(name, Default::default());
        vmc.metadata.namespace = Some("hf".into());
        vmc.metadata.labels = Some(BTreeMap::from([("scheduledevent".into(), se.into())]));
        vmc
    }

    fn by_se(vmc: &VirtualMachineClaim) -> Vec<String> {
        vmc.labels().get("scheduledevent").cloned().into_iter().collect()
    }

    #[test]
    fn indexes_follow_updates_and_deletes() {
        let (cache, writer) = Cache::<VirtualMachineClaim>::new();
        writer.add_index("se", by_se);
        assert!(!cache.is_synced());

        writer.apply(&WatchEvent::Restarted(vec![claim("a", "se-1"), claim("b", "se-1")]));
        assert!(cache.is_synced());
        assert_eq!(cache.by_index("se", "se-1").len(), 2);

        writer.apply(&WatchEvent::Applied(claim("a", "se-2")));
        assert_eq!(cache.by_index("se", "se-1").len(), 1);
        assert_eq!(cache.by_index("se", "se-2")[0].name_any(), "a");

        writer.apply(&WatchEvent::Deleted(claim("b", "se-1")));
        assert!(cache.by_index("se", "se-1").is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn late_index_covers_existing_objects() {
        let (cache, writer) = Cache::<VirtualMachineClaim>::new();
        writer.apply(&WatchEvent::Applied(claim("a", "se-1")));
        writer.add_index("se", by_se);
        assert_eq!(cache.by_index("se", "se-1").len(), 1);
        assert!(cache.get(&ObjectKey::new("hf", "a")).is_some());
    }
}
