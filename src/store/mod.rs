use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;

use futures::stream::BoxStream;
use kube::core::{Expression, NamespaceResourceScope, Selector, SelectorExt};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Everything the controllers store: namespaced, typed, serialisable objects
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// A change observed on a watched kind
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    /// The full current state; replaces anything seen before
    Restarted(Vec<K>),
}

/// A versioned, namespaced object store with optimistic concurrency.
///
/// `replace` writes metadata and spec, `replace_status` writes only the status.
/// Both fail with [`crate::Error::Conflict`] when the object's resourceVersion is stale.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    fn get<K: Object>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<K>>> + Send;

    fn list<K: Object>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<K>>> + Send;

    fn create<K: Object>(&self, namespace: &str, obj: &K) -> impl Future<Output = Result<K>> + Send;

    fn replace<K: Object>(&self, namespace: &str, obj: &K) -> impl Future<Output = Result<K>> + Send;

    fn replace_status<K: Object>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> impl Future<Output = Result<K>> + Send;

    /// Deletes the object; owned objects are garbage collected
    fn delete<K: Object>(&self, namespace: &str, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn watch<K: Object>(&self, namespace: &str) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// Builds a selector from a list of label requirements
pub fn selector(expressions: impl IntoIterator<Item = Expression>) -> Selector {
    let mut selector = Selector::default();
    selector.extend(expressions);
    selector
}

/// `key=value` for every pair
pub fn labels_selector<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Selector {
    selector(
        pairs
            .into_iter()
            .map(|(k, v)| Expression::Equal(k.to_owned(), v.to_owned())),
    )
}

pub fn everything() -> Selector {
    Selector::default()
}

pub fn matches<K: Resource>(selector: &Selector, obj: &K) -> bool {
    selector.matches(obj.labels())
}

/// Treats a delete of something already gone as success
pub async fn delete_if_exists<K: Object, S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    match store.delete::<K>(namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Creates the object unless one with the same name exists; returns whatever is stored
pub async fn create_or_get<K: Object, S: ObjectStore>(
    store: &S,
    namespace: &str,
    obj: &K,
) -> Result<K> {
    match store.create(namespace, obj).await {
        Ok(created) => Ok(created),
        Err(e) if e.is_already_exists() => {
            let name = obj.name_any();
            store
                .get::<K>(namespace, &name)
                .await?
                .ok_or_else(|| crate::Error::not_found::<K>(&name))
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn labels_of(obj: &serde_json::Value) -> BTreeMap<String, String> {
    obj.pointer("/metadata/labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default()
}
