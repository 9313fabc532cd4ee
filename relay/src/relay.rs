//! Relay is the request pipeline shared by the mutating and validating roles.
//!
//! For each admission request the relay:
//!
//! 1. checks the request's namespace against the [`EnforcementMode`], allowing out-of-scope
//!    requests immediately;
//! 2. takes the hook name from the request path;
//! 3. looks the hook up in the role's [`RoutingTable`];
//! 4. forwards the request body to the delegate and returns the delegate's review unchanged.
//!
//! Every failure along the way becomes a fail verdict carrying the request's UID.

use std::time::Duration;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use serde_json::Value;

use crate::{
    filter::{self, EnforcementMode},
    metrics::{self, Outcome},
    namespaces::NamespaceState,
    prelude::*,
    table::RoutingTable,
};

/// DEFAULT_TIMEOUT bounds each delegate call unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Status code carried by fail verdicts.
const FAIL_CODE: u16 = 500;

/// Exchange is one inbound admission request.
pub struct Exchange {
    pub request: AdmissionRequest<DynamicObject>,
    /// The request body, forwarded to the delegate as-is.
    pub body: Bytes,
}

impl Exchange {
    /// Decode parses `body` as an `AdmissionReview` carrying a request.
    pub fn decode(body: Bytes) -> Result<Self, AdmissionResponse> {
        let review: AdmissionReview<DynamicObject> =
            serde_json::from_slice(&body).map_err(AdmissionResponse::invalid)?;
        let request = review.try_into().map_err(AdmissionResponse::invalid)?;
        Ok(Self { request, body })
    }

    pub fn uid(&self) -> &str {
        &self.request.uid
    }

    /// Namespace is the target namespace, if the resource is namespaced.
    pub fn namespace(&self) -> Option<&str> {
        self.request.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

/// Verdict is the answer to an admission request.
#[derive(Debug)]
pub enum Verdict {
    /// A verdict produced by the relay itself.
    Local(AdmissionResponse),
    /// A delegate's `AdmissionReview`, passed through untouched.
    Delegated(Value),
}

impl Verdict {
    /// Allow is an unconditional allow for `req`.
    pub fn allow(req: &AdmissionRequest<DynamicObject>) -> Self {
        let mut res = AdmissionResponse::from(req);
        res.allowed = true;
        Verdict::Local(res)
    }

    /// Fail is a denial of `req` describing `err`.
    pub fn fail(req: &AdmissionRequest<DynamicObject>, err: &Error) -> Self {
        let mut res = AdmissionResponse::from(req).deny(err.to_string());
        res.result.code = FAIL_CODE;
        Verdict::Local(res)
    }
}

impl IntoResponse for Verdict {
    fn into_response(self) -> Response {
        match self {
            Verdict::Local(res) => Json(res.into_review()).into_response(),
            Verdict::Delegated(review) => Json(review).into_response(),
        }
    }
}

/// Relay forwards admission requests for one [`Role`].
pub struct Relay {
    role: Role,
    mode: EnforcementMode,
    table: Arc<RoutingTable>,
    namespaces: Arc<dyn NamespaceState>,
    timeout: Duration,
}

impl Relay {
    pub fn new(
        role: Role,
        mode: EnforcementMode,
        table: Arc<RoutingTable>,
        namespaces: Arc<dyn NamespaceState>,
    ) -> Self {
        Self {
            role,
            mode,
            table,
            namespaces,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// With_timeout sets the bound on each delegate call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Hook_name extracts the hook name from a request path.
    pub fn hook_name<'p>(&self, path: &'p str) -> Result<&'p str> {
        let prefix = self.role.prefix();
        path.strip_prefix(prefix).ok_or_else(|| Error::InvalidPath {
            path: path.to_string(),
            prefix,
        })
    }

    /// Handle answers the admission request in `body`, received at `path`.
    pub async fn handle(&self, path: &str, body: Bytes) -> Verdict {
        let exchange = match Exchange::decode(body) {
            Ok(exchange) => exchange,
            Err(res) => {
                warn!(role = %self.role, path, "request body is not an admission review");
                metrics::request(self.role, Outcome::Invalid);
                return Verdict::Local(res);
            }
        };
        self.admit(path, exchange).await
    }

    /// Admit runs the relay pipeline for a decoded exchange.
    #[instrument(skip_all, fields(role = %self.role, uid = exchange.uid(), path = path))]
    pub async fn admit(&self, path: &str, exchange: Exchange) -> Verdict {
        let (verdict, outcome) = match self.route(path, &exchange).await {
            Ok(Some(review)) => (Verdict::Delegated(review), Outcome::Relayed),
            Ok(None) => (Verdict::allow(&exchange.request), Outcome::Skipped),
            Err(err) => {
                error!(error = %err, "relay failed");
                (Verdict::fail(&exchange.request, &err), Outcome::Failed)
            }
        };
        metrics::request(self.role, outcome);
        verdict
    }

    // Route returns the delegate's review, or `None` if the namespace is out of scope.
    async fn route(&self, path: &str, exchange: &Exchange) -> Result<Option<Value>> {
        if let Some(namespace) = exchange.namespace() {
            let labels = self
                .namespaces
                .labels(namespace)
                .map_err(|err| match err {
                    Error::Namespace { .. } => err,
                    other => Error::Namespace {
                        namespace: namespace.to_string(),
                        reason: other.to_string(),
                    },
                })?;
            if !filter::should_enforce(self.mode, Some(&labels)) {
                debug!(namespace, "namespace not labeled for inclusion, letting through");
                return Ok(None);
            }
        }

        let hook = self.hook_name(path)?;
        let delegate = self
            .table
            .get(hook)
            .filter(|d| !d.endpoint().is_empty())
            .ok_or_else(|| Error::NoHandler(hook.to_string()))?;
        debug!(hook, endpoint = delegate.endpoint(), "relaying to delegate");
        let review = delegate.review(exchange.body.clone(), self.timeout).await?;
        Ok(Some(review))
    }
}
