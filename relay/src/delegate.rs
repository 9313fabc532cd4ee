//! Delegate holds the normalized form of a webhook's client configuration and knows how to call
//! it.

use std::{fmt, time::Duration};

use bytes::{Bytes, BytesMut};
use k8s_openapi::api::admissionregistration::v1::{ServiceReference, WebhookClientConfig};
use openssl::x509::X509;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::{Error, MAX_REVIEW_BYTES, Result, USER_AGENT};

const DEFAULT_PORT: i32 = 443;
const DEFAULT_PATH: &str = "/";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const JSON: &str = "application/json";
const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Delegate is one upstream webhook.
///
/// A Delegate is never modified once built. The routing table replaces whole values, so a reader
/// always sees an endpoint together with the trust anchors it was resolved with.
#[derive(Clone)]
pub struct Delegate {
    endpoint: String,
    trust_anchors: Option<Vec<X509>>,
    client: reqwest::Client,
}

impl Delegate {
    /// Endpoint is the absolute URL requests are POSTed to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Trust_anchors are the CAs accepted for the delegate's serving certificate.
    ///
    /// `None` means the platform trust store is used.
    pub fn trust_anchors(&self) -> Option<&[X509]> {
        self.trust_anchors.as_deref()
    }

    /// Review sends `body`, an encoded `AdmissionReview`, to the delegate and returns the
    /// `AdmissionReview` it answers with.
    ///
    /// The returned value is guaranteed to hold a `response` object and is otherwise untouched.
    /// Responses larger than [`MAX_REVIEW_BYTES`] are refused.
    #[instrument(skip_all, fields(endpoint = %self.endpoint()))]
    pub async fn review(&self, body: Bytes, timeout: Duration) -> Result<Value> {
        let mut res = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|source| Error::Delegate {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        let status = res.status();
        trace!(%status, "delegate answered");
        if !status.is_success() {
            return Err(Error::DelegateStatus {
                endpoint: self.endpoint.clone(),
                status,
            });
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = res.chunk().await.map_err(Error::DelegateRead)? {
            if buf.len().saturating_add(chunk.len()) > MAX_REVIEW_BYTES {
                return Err(Error::DelegateTooLarge {
                    endpoint: self.endpoint.clone(),
                    limit: MAX_REVIEW_BYTES,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        let review: Value = serde_json::from_slice(&buf).map_err(Error::DelegateDecode)?;
        match review.get("response") {
            Some(Value::Object(_)) => Ok(review),
            _ => Err(Error::NoVerdict),
        }
    }
}

impl fmt::Debug for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate")
            .field("endpoint", &self.endpoint)
            .field(
                "trust_anchors",
                &self.trust_anchors.as_ref().map(|a| a.len()),
            )
            .finish()
    }
}

/// Resolve turns a webhook's client configuration into a [`Delegate`].
///
/// A direct URL is used verbatim; otherwise the service reference is turned into its in-cluster
/// HTTPS address. A non-empty CA bundle must contain at least one PEM certificate that parses;
/// blocks that do not parse are skipped.
pub fn resolve(cfg: &WebhookClientConfig) -> Result<Delegate> {
    let trust_anchors = match cfg.ca_bundle.as_ref().filter(|b| !b.0.is_empty()) {
        Some(bundle) => Some(parse_bundle(&bundle.0)?),
        None => None,
    };
    let endpoint = match (
        cfg.url.as_deref().filter(|u| !u.is_empty()),
        cfg.service.as_ref(),
    ) {
        (Some(url), _) => url.to_string(),
        (None, Some(svc)) => service_endpoint(svc)?,
        (None, None) => return Err(Error::MissingEndpoint),
    };
    let client = client(trust_anchors.as_deref())?;
    Ok(Delegate {
        endpoint,
        trust_anchors,
        client,
    })
}

/// Service_endpoint is the in-cluster address of a webhook service:
/// `https://<name>.<namespace>.svc:<port><path>`.
pub fn service_endpoint(svc: &ServiceReference) -> Result<String> {
    if svc.name.is_empty() || svc.namespace.is_empty() {
        return Err(Error::MissingEndpoint);
    }
    let port = svc.port.unwrap_or(DEFAULT_PORT);
    let path = svc.path.as_deref().unwrap_or(DEFAULT_PATH);
    Ok(format!(
        "https://{}.{}.svc:{port}{path}",
        svc.name, svc.namespace
    ))
}

fn parse_bundle(pem: &[u8]) -> Result<Vec<X509>> {
    let text = String::from_utf8_lossy(pem);
    let certs: Vec<X509> = text
        .split_inclusive(PEM_END)
        .filter(|block| block.contains(PEM_BEGIN))
        .filter_map(|block| match X509::from_pem(block.as_bytes()) {
            Ok(cert) => Some(cert),
            Err(error) => {
                debug!(%error, "skipping unparseable certificate in trust bundle");
                None
            }
        })
        .collect();
    if certs.is_empty() {
        return Err(Error::InvalidTrustBundle("no certificates found".into()));
    }
    Ok(certs)
}

// Client builds the HTTP client for a delegate. With trust anchors present, only those anchors
// are trusted.
fn client(trust_anchors: Option<&[X509]>) -> Result<reqwest::Client> {
    let mut b = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(anchors) = trust_anchors {
        b = b.tls_built_in_root_certs(false);
        for ca in anchors {
            let cert = reqwest::Certificate::from_der(&ca.to_der()?)
                .map_err(|e| Error::InvalidTrustBundle(e.to_string()))?;
            b = b.add_root_certificate(cert);
        }
    }
    Ok(b.build()?)
}
