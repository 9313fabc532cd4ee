//! Namespaces provides the namespace labels the relays filter on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{self, ObjectRef, Store};

use crate::{filter::Labels, prelude::*};

/// NamespaceState looks up the current labels of a namespace.
///
/// A namespace without labels reports an empty set; a namespace that cannot be found is an error.
pub trait NamespaceState: Send + Sync {
    fn labels(&self, namespace: &str) -> Result<Labels>;
}

impl NamespaceState for Store<Namespace> {
    fn labels(&self, namespace: &str) -> Result<Labels> {
        let ns = self
            .get(&ObjectRef::new(namespace))
            .ok_or_else(|| not_found(namespace))?;
        Ok(ns.metadata.labels.clone().unwrap_or_default())
    }
}

/// A fixed map of namespace name to labels.
impl NamespaceState for BTreeMap<String, Labels> {
    fn labels(&self, namespace: &str) -> Result<Labels> {
        self.get(namespace).cloned().ok_or_else(|| not_found(namespace))
    }
}

fn not_found(namespace: &str) -> Error {
    Error::Namespace {
        namespace: namespace.to_string(),
        reason: "not found".into(),
    }
}

/// Reflector returns a cache of the cluster's namespaces and the task that keeps it filled.
///
/// The store is empty until the task has listed namespaces once; see [`Store::wait_until_ready`].
pub fn reflector(
    cancel: CancellationToken,
    client: kube::Client,
) -> (Store<Namespace>, ControllerFuture) {
    let (reader, writer) = reflector::store();
    let events = watcher(Api::<Namespace>::all(client), watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .touched_objects()
        .take_until(cancel.cancelled_owned());
    let fut = async move {
        info!("spawning namespace reflector");
        events
            .for_each(|ret| {
                if let Err(error) = ret {
                    warn!(%error, "namespace watch error");
                }
                future::ready(())
            })
            .await;
        debug!("namespace reflector finished");
        Ok(())
    }
    .boxed();
    (reader, fut)
}
