#![allow(dead_code)]
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{Json, Router, body::Bytes, extract::State};
use k8s_openapi::api::admissionregistration::v1::{
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use kube::api::ObjectMeta;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use relay::{
    Role,
    filter::{EnforcementMode, INCLUSION_LABEL, Labels},
    namespaces::NamespaceState,
    relay::Relay,
    table::RoutingTable,
};

/// Namespaces returns a fixed namespace set: `team-a` opted in, `team-b` not.
pub fn namespaces() -> Arc<dyn NamespaceState> {
    Arc::new(BTreeMap::from([
        (
            "team-a".to_string(),
            Labels::from([(INCLUSION_LABEL.to_string(), "true".to_string())]),
        ),
        ("team-b".to_string(), Labels::new()),
    ]))
}

pub fn relays(mode: EnforcementMode, table: &Arc<RoutingTable>) -> Vec<Relay> {
    let ns = namespaces();
    Role::ALL
        .into_iter()
        .map(|role| Relay::new(role, mode, table.clone(), ns.clone()))
        .collect()
}

/// Validating returns a configuration declaring one hook per (name, url) pair.
pub fn validating(name: &str, hooks: &[(&str, &str)]) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        webhooks: Some(
            hooks
                .iter()
                .map(|(hook, url)| ValidatingWebhook {
                    name: hook.to_string(),
                    client_config: WebhookClientConfig {
                        url: Some(url.to_string()),
                        ..Default::default()
                    },
                    admission_review_versions: vec!["v1".into()],
                    side_effects: "None".into(),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn review(uid: &str, namespace: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": uid,
            "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
            "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
            "name": "api",
            "namespace": namespace,
            "operation": "UPDATE",
            "userInfo": {"username": "admin", "groups": ["system:masters"]},
            "object": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "api", "namespace": namespace},
            },
            "oldObject": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "api", "namespace": namespace},
            },
        },
    }))
    .unwrap()
}

/// Backend is a delegate webhook that denies everything, naming itself in the message.
pub struct Backend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Backend {
    pub async fn start(name: &'static str) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .fallback(
                move |State(hits): State<Arc<AtomicUsize>>, body: Bytes| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let req: Value = serde_json::from_slice(&body).unwrap();
                    trace!(name, uid = %req["request"]["uid"], "backend called");
                    Json(json!({
                        "apiVersion": "admission.k8s.io/v1",
                        "kind": "AdmissionReview",
                        "response": {
                            "uid": req["request"]["uid"],
                            "allowed": false,
                            "status": {"code": 403, "message": format!("denied by {name}")},
                        },
                    }))
                },
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .unwrap();
        });
        Self { addr, hits, cancel }
    }

    pub fn url(&self) -> String {
        format!("http://{}/validate", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
