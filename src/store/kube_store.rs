use futures::{StreamExt, TryStreamExt};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ErrorResponse, Selector};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use super::{Object, ObjectStore, WatchEvent};
use crate::{Error, Result};

/// Object store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Maps API status codes onto the store error kinds the controllers branch on
fn classify<K: Object>(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ErrorResponse { code: 409, reason, .. }) if reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: K::kind(&()).into_owned(),
                name: name.to_owned(),
            }
        }
        kube::Error::Api(ErrorResponse { code: 409, .. }) => Error::Conflict {
            kind: K::kind(&()).into_owned(),
            name: name.to_owned(),
        },
        kube::Error::Api(ErrorResponse { code: 404, .. }) => Error::not_found::<K>(name),
        kube::Error::Api(ErrorResponse { code, message, .. }) if code >= 500 => {
            Error::StoreUnavailable(message)
        }
        other => Error::KubeError(other),
    }
}

impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify::<K>(e, name))
    }

    async fn list<K: Object>(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(&selector.to_string());
        let mut items = self
            .api::<K>(namespace)
            .list(&lp)
            .await
            .map_err(|e| classify::<K>(e, ""))?
            .items;
        items.sort_by_key(|o| o.name_any());
        Ok(items)
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, &obj.name_any()))
    }

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, &name))
    }

    async fn replace_status<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        // a merge patch carrying resourceVersion is rejected with 409 when stale
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        self.api::<K>(namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify::<K>(e, &name))
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| classify::<K>(e, name))
    }

    fn watch<K: Object>(&self, namespace: &str) -> futures::stream::BoxStream<'static, Result<WatchEvent<K>>> {
        let api = self.api::<K>(namespace);
        let mut init: Vec<K> = Vec::new();
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
            .try_filter_map(move |event| {
                let out = match event {
                    Event::Apply(obj) => Some(WatchEvent::Applied(obj)),
                    Event::Delete(obj) => Some(WatchEvent::Deleted(obj)),
                    Event::Init => {
                        init.clear();
                        None
                    }
                    Event::InitApply(obj) => {
                        init.push(obj);
                        None
                    }
                    Event::InitDone => Some(WatchEvent::Restarted(std::mem::take(&mut init))),
                };
                futures::future::ready(Ok(out))
            })
            .boxed()
    }
}
