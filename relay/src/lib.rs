//! Relay sits in front of a cluster's admission webhooks.
//!
//! Every `MutatingWebhookConfiguration` and `ValidatingWebhookConfiguration` is watched and each
//! declared hook is resolved into a [`delegate::Delegate`] kept in a per-role
//! [`table::RoutingTable`]. Admission requests arriving at `/mutate/<hook>` or `/admit/<hook>` are
//! forwarded to the matching delegate, unless the request's namespace is out of scope for
//! enforcement, in which case the relay allows it outright.

use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use strum::{Display, EnumString, IntoStaticStr};

// Re-exports for everyone's easy use.
pub(crate) mod prelude {
    pub use std::sync::Arc;

    pub use futures::prelude::*;
    pub use kube::{
        self, Resource, ResourceExt,
        api::Api,
        runtime::{
            WatchStreamExt,
            controller::{Action, Controller},
            watcher,
        },
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use super::{Context, ControllerFuture, Error, Result, Role};
}

pub mod delegate;
pub mod filter;
pub mod metrics;
pub mod namespaces;
pub mod reconciler;
pub mod relay;
pub mod table;
pub mod webhook;

#[cfg(test)]
mod testing;

use table::RoutingTable;

// NB The docs are unclear, but backtraces are unsupported on stable.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("tls error: {0}")]
    TLS(#[from] openssl::error::ErrorStack),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    // Configuration errors.
    #[error("invalid trust bundle: {0}")]
    InvalidTrustBundle(String),
    #[error("client config has neither a URL nor a usable service reference")]
    MissingEndpoint,
    #[error("hook {hook}: {source}")]
    Hook {
        hook: String,
        #[source]
        source: Box<Error>,
    },

    // Routing and policy errors.
    #[error("failed to get namespace {namespace}: {reason}")]
    Namespace { namespace: String, reason: String },
    #[error("invalid prefix in {path}, wanted {prefix}")]
    InvalidPath { path: String, prefix: &'static str },
    #[error("no handler found for {0}")]
    NoHandler(String),

    // Transport errors.
    #[error("failed to post to delegate {endpoint}: {source}")]
    Delegate {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("delegate {endpoint} returned HTTP {status}")]
    DelegateStatus {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to read delegate response: {0}")]
    DelegateRead(#[source] reqwest::Error),
    #[error("delegate {endpoint} response exceeds {limit} bytes")]
    DelegateTooLarge { endpoint: String, limit: usize },
    #[error("failed to decode delegate response: {0}")]
    DelegateDecode(#[source] serde_json::Error),
    #[error("delegate response carried no verdict")]
    NoVerdict,
}

/// Result typedef for the relay.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// ControllerFuture is the type of the long-running tasks spawned by `main`.
pub type ControllerFuture = futures::future::BoxFuture<'static, Result<()>>;

/// Role distinguishes the two relays: one in front of mutating webhooks, one in front of
/// validating webhooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Mutating,
    Validating,
}

impl Role {
    /// Every role, in startup order.
    pub const ALL: [Role; 2] = [Role::Mutating, Role::Validating];

    /// Prefix returns the URL path prefix the role serves, including the trailing slash.
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Mutating => "/mutate/",
            Role::Validating => "/admit/",
        }
    }
}

/// Context is the state shared by the controllers and the webhook server.
pub struct Context {
    pub client: kube::Client,
    pub mutating: Arc<RoutingTable>,
    pub validating: Arc<RoutingTable>,
}

impl Context {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            mutating: Default::default(),
            validating: Default::default(),
        }
    }

    /// Table returns the routing table owned by `role`.
    pub fn table(&self, role: Role) -> &Arc<RoutingTable> {
        match role {
            Role::Mutating => &self.mutating,
            Role::Validating => &self.validating,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// USER_AGENT is sent on every call to a delegate.
pub const USER_AGENT: &str = concat!("admission-relay/", env!("CARGO_PKG_VERSION"));

/// MAX_REVIEW_BYTES bounds an admission review in either direction.
pub const MAX_REVIEW_BYTES: usize = 4 << 20;

/// DEFAULT_CERT_DIR is where the serving certificate is looked for if not configured.
pub static DEFAULT_CERT_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| std::env::temp_dir().join("k8s-webhook-server/serving-certs"));
