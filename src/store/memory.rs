use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{Selector, SelectorExt};
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::trace;

use super::{labels_of, Object, ObjectStore, WatchEvent};
use crate::runtime::Clock;
use crate::{Error, Result};

const EVENT_BUFFER: usize = 4096;

/// (type, namespace, name)
type Key = (String, String, String);

#[derive(Clone, Debug)]
struct Change {
    type_key: String,
    namespace: String,
    deleted: bool,
    object: Value,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    revision: u64,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::StoreUnavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-process object store with the same semantics as the API server:
/// monotonically increasing resourceVersions, a status subresource,
/// owner-reference garbage collection and change notifications.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<Change>,
    clock: Clock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Clock::System)
    }
}

impl MemoryStore {
    pub fn new(clock: Clock) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            clock,
        }
    }

    /// Makes every call fail with [`Error::StoreUnavailable`] until switched back
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Number of stored objects of a kind across namespaces
    pub async fn count<K: Object>(&self) -> usize {
        let type_key = type_key::<K>();
        self.inner
            .lock()
            .await
            .objects
            .keys()
            .filter(|(t, _, _)| *t == type_key)
            .count()
    }

    fn publish(&self, type_key: String, namespace: &str, deleted: bool, object: Value) {
        // no receivers is fine
        let _ = self.events.send(Change {
            type_key,
            namespace: namespace.to_owned(),
            deleted,
            object,
        });
    }

    async fn snapshot<K: Object>(
        &self,
        namespace: &str,
    ) -> (Result<Vec<K>>, broadcast::Receiver<Change>) {
        let inner = self.inner.lock().await;
        let rx = self.events.subscribe();
        let type_key = type_key::<K>();
        let objects = inner
            .objects
            .iter()
            .filter(|((t, ns, _), _)| *t == type_key && ns == namespace)
            .map(|(_, v)| serde_json::from_value::<K>(v.clone()).map_err(Error::from))
            .collect();
        (objects, rx)
    }
}

fn type_key<K: Object>() -> String {
    format!("{}.{}", K::plural(&()), K::group(&()))
}

fn key_of<K: Object>(namespace: &str, name: &str) -> Key {
    (type_key::<K>(), namespace.to_owned(), name.to_owned())
}

fn resource_version(value: &Value) -> Option<&str> {
    value
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

fn uid(value: &Value) -> Option<&str> {
    value.pointer("/metadata/uid").and_then(Value::as_str)
}

fn owned_by(value: &Value, owner_uid: &str) -> bool {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(owner_uid))
        })
}

fn check_version<K: Object>(current: &Value, obj: &K) -> Result<()> {
    match obj.resource_version() {
        Some(expected) if Some(expected.as_str()) != resource_version(current) => {
            Err(Error::Conflict {
                kind: K::kind(&()).into_owned(),
                name: obj.name_any(),
            })
        }
        _ => Ok(()),
    }
}

impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).map_err(Error::from))
            .transpose()
    }

    async fn list<K: Object>(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let type_key = type_key::<K>();
        inner
            .objects
            .iter()
            .filter(|((t, ns, _), _)| *t == type_key && ns == namespace)
            .filter(|(_, v)| selector.matches(&labels_of(v)))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidSpec(format!("{} without a name", K::kind(&()))))?;

        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let key = key_of::<K>(namespace, &name);
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: K::kind(&()).into_owned(),
                name,
            });
        }

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.namespace = Some(namespace.to_owned());
        meta.uid = Some(format!("{:032x}", rand::random::<u128>()));
        meta.creation_timestamp = Some(Time(self.clock.now()));
        meta.resource_version = Some(inner.next_revision());

        let mut value = serde_json::to_value(&obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }

        trace!(kind = %K::kind(&()), %name, "created");
        inner.objects.insert(key, value.clone());
        self.publish(type_key::<K>(), namespace, false, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let key = key_of::<K>(namespace, &name);
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found::<K>(&name))?;
        check_version(&current, obj)?;

        let mut next = obj.clone();
        let meta = next.meta_mut();
        meta.namespace = Some(namespace.to_owned());
        meta.uid = uid(&current).map(str::to_owned);
        meta.creation_timestamp = current
            .pointer("/metadata/creationTimestamp")
            .and_then(|t| serde_json::from_value(t.clone()).ok());
        meta.resource_version = resource_version(&current).map(str::to_owned);

        let mut value = serde_json::to_value(&next)?;
        if let Some(map) = value.as_object_mut() {
            match current.get("status") {
                Some(status) => map.insert("status".into(), status.clone()),
                None => map.remove("status"),
            };
        }

        if value == current {
            return Ok(serde_json::from_value(current)?);
        }

        value["metadata"]["resourceVersion"] = Value::String(inner.next_revision());
        inner.objects.insert(key, value.clone());
        self.publish(type_key::<K>(), namespace, false, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace_status<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let key = key_of::<K>(namespace, &name);
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found::<K>(&name))?;
        check_version(&current, obj)?;

        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .filter(|s| !s.is_null());
        if current.get("status") == status.as_ref() {
            return Ok(serde_json::from_value(current)?);
        }

        let mut value = current;
        if let Some(map) = value.as_object_mut() {
            match status {
                Some(status) => map.insert("status".into(), status),
                None => map.remove("status"),
            };
        }
        value["metadata"]["resourceVersion"] = Value::String(inner.next_revision());
        inner.objects.insert(key, value.clone());
        self.publish(type_key::<K>(), namespace, false, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let key = key_of::<K>(namespace, name);
        let root = inner
            .objects
            .remove(&key)
            .ok_or_else(|| Error::not_found::<K>(name))?;

        // background garbage collection of everything the object (transitively) owns
        let mut pending = VecDeque::from([(key.0, root)]);
        while let Some((type_key, value)) = pending.pop_front() {
            if let Some(owner_uid) = uid(&value) {
                let children: Vec<Key> = inner
                    .objects
                    .iter()
                    .filter(|((_, ns, _), v)| ns == namespace && owned_by(v, owner_uid))
                    .map(|(k, _)| k.clone())
                    .collect();
                for child in children {
                    if let Some(v) = inner.objects.remove(&child) {
                        trace!(child = %child.2, "garbage collected");
                        pending.push_back((child.0, v));
                    }
                }
            }
            self.publish(type_key, namespace, true, value);
        }
        Ok(())
    }

    fn watch<K: Object>(&self, namespace: &str) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let store = self.clone();
        let namespace = namespace.to_owned();
        let type_key = type_key::<K>();

        stream::unfold(
            (store, namespace, type_key, None::<broadcast::Receiver<Change>>),
            |(store, namespace, type_key, rx)| async move {
                let mut rx = match rx {
                    Some(rx) => rx,
                    None => {
                        let (objects, rx) = store.snapshot::<K>(&namespace).await;
                        let event = objects.map(WatchEvent::Restarted);
                        return Some((event, (store, namespace, type_key, Some(rx))));
                    }
                };
                loop {
                    match rx.recv().await {
                        Ok(change) if change.type_key == type_key && change.namespace == namespace => {
                            let event = serde_json::from_value::<K>(change.object)
                                .map_err(Error::from)
                                .map(|obj| {
                                    if change.deleted {
                                        WatchEvent::Deleted(obj)
                                    } else {
                                        WatchEvent::Applied(obj)
                                    }
                                });
                            return Some((event, (store, namespace, type_key, Some(rx))));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            // missed changes; start over from a fresh snapshot
                            let (objects, rx) = store.snapshot::<K>(&namespace).await;
                            let event = objects.map(WatchEvent::Restarted);
                            return Some((event, (store, namespace, type_key, Some(rx))));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcilers::object_meta;
    use crate::resources::scheduledevents::{ScheduledEvent, ScheduledEventStatus};
    use crate::resources::virtualmachines::{VirtualMachine, VirtualMachineStatus};
    use crate::resources::virtualmachinesets::{VirtualMachineSet, VirtualMachineSetSpec};
    use crate::store::labels_selector;
    use kube::Resource;
    use std::collections::BTreeMap;

    const NS: &str = "hf";

    fn vmset(name: &str, env: &str) -> VirtualMachineSet {
        let mut set = VirtualMachineSet::new(
            name,
            VirtualMachineSetSpec {
                count: 1,
                environment: env.into(),
                vm_template: "tmplX".into(),
                base_name: "scheduled-x".into(),
                ..Default::default()
            },
        );
        set.metadata.labels = Some(BTreeMap::from([("environment".into(), env.into())]));
        set
    }

    #[tokio::test]
    async fn create_assigns_identity_and_strips_status() {
        let store = MemoryStore::default();
        let mut se = ScheduledEvent::new("se-a", Default::default());
        se.status = Some(ScheduledEventStatus {
            finished: true,
            ..Default::default()
        });

        let created = store.create(NS, &se).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.namespace().as_deref(), Some(NS));
        assert!(created.status.is_none());

        let err = store.create(NS, &se).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = MemoryStore::default();
        let created = store.create(NS, &vmset("a", "env1")).await.unwrap();

        let mut first = created.clone();
        first.spec.count = 2;
        store.replace(NS, &first).await.unwrap();

        let mut second = created;
        second.spec.count = 3;
        let err = store.replace(NS, &second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn replace_keeps_status_and_replace_status_keeps_spec() {
        let store = MemoryStore::default();
        let mut vm = store
            .create(NS, &VirtualMachine::new("vm-1", Default::default()))
            .await
            .unwrap();
        vm.status = Some(VirtualMachineStatus {
            ready: true,
            ..Default::default()
        });
        let vm = store.replace_status(NS, &vm).await.unwrap();

        let mut spec_edit = vm.clone();
        spec_edit.spec.user_id = "u-1".into();
        spec_edit.status = None;
        let vm = store.replace(NS, &spec_edit).await.unwrap();
        assert!(vm.is_ready());
        assert_eq!(vm.spec.user_id, "u-1");

        let mut status_edit = vm.clone();
        status_edit.spec.user_id = "someone-else".into();
        status_edit.status.as_mut().unwrap().allocated = true;
        let vm = store.replace_status(NS, &status_edit).await.unwrap();
        assert!(vm.is_allocated());
        assert_eq!(vm.spec.user_id, "u-1");
    }

    #[tokio::test]
    async fn unchanged_replace_keeps_resource_version() {
        let store = MemoryStore::default();
        let created = store.create(NS, &vmset("a", "env1")).await.unwrap();
        let again = store.replace(NS, &created).await.unwrap();
        assert_eq!(created.resource_version(), again.resource_version());
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let store = MemoryStore::default();
        store.create(NS, &vmset("a", "env1")).await.unwrap();
        store.create(NS, &vmset("b", "env2")).await.unwrap();
        store.create("other", &vmset("c", "env1")).await.unwrap();

        let found: Vec<VirtualMachineSet> = store
            .list(NS, &labels_selector([("environment", "env1")]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
    }

    #[tokio::test]
    async fn delete_cascades_through_owner_references() {
        let store = MemoryStore::default();
        let se = store
            .create(NS, &ScheduledEvent::new("se-a", Default::default()))
            .await
            .unwrap();
        let mut set = vmset("set-a", "env1");
        set.metadata = object_meta(
            &se.controller_owner_ref(&()).unwrap(),
            "set-a",
            NS,
            BTreeMap::new(),
        );
        let set = store.create(NS, &set).await.unwrap();
        let mut vm = VirtualMachine::new("vm-a", Default::default());
        vm.metadata = object_meta(
            &set.controller_owner_ref(&()).unwrap(),
            "vm-a",
            NS,
            BTreeMap::new(),
        );
        store.create(NS, &vm).await.unwrap();

        store.delete::<ScheduledEvent>(NS, "se-a").await.unwrap();
        assert_eq!(store.count::<VirtualMachineSet>().await, 0);
        assert_eq!(store.count::<VirtualMachine>().await, 0);
        assert!(store
            .delete::<ScheduledEvent>(NS, "se-a")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn watch_starts_with_snapshot_then_streams_changes() {
        let store = MemoryStore::default();
        store.create(NS, &vmset("a", "env1")).await.unwrap();
        let mut events = store.watch::<VirtualMachineSet>(NS);

        match events.next().await.unwrap().unwrap() {
            WatchEvent::Restarted(objs) => assert_eq!(objs.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        store.create(NS, &vmset("b", "env1")).await.unwrap();
        store.delete::<VirtualMachineSet>(NS, "a").await.unwrap();
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            WatchEvent::Applied(o) if o.name_any() == "b"
        ));
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            WatchEvent::Deleted(o) if o.name_any() == "a"
        ));
    }

    #[tokio::test]
    async fn offline_store_fails_transiently() {
        let store = MemoryStore::default();
        store.set_unavailable(true).await;
        let err = store.get::<VirtualMachineSet>(NS, "a").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        store.set_unavailable(false).await;
        assert!(store.get::<VirtualMachineSet>(NS, "a").await.unwrap().is_none());
    }
}
