//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::{
    net::SocketAddr,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{Json, Router, body::Bytes, extract::State, http::StatusCode, http::Uri};
use axum_server::{Handle, tls_openssl::OpenSSLConfig};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    rsa::Rsa,
    x509::{
        X509, X509NameBuilder,
        extension::{BasicConstraints, SubjectAlternativeName},
    },
};
use serde_json::{Value, json};

use crate::prelude::*;

/// Cert_pair returns a self-signed CA certificate and its private key, both PEM encoded.
///
/// The certificate is also valid for serving on `localhost` and `127.0.0.1`.
pub fn cert_pair(cn: &str) -> (String, String) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut b = X509::builder().unwrap();
    b.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    b.set_serial_number(&serial).unwrap();
    b.set_subject_name(&name).unwrap();
    b.set_issuer_name(&name).unwrap();
    b.set_pubkey(&key).unwrap();
    b.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    b.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    b.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&b.x509v3_context(None, None))
        .unwrap();
    b.append_extension(san).unwrap();
    b.sign(&key, MessageDigest::sha256()).unwrap();

    let cert = String::from_utf8(b.build().to_pem().unwrap()).unwrap();
    let key = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert, key)
}

/// Ca_pem returns a fresh PEM encoded CA certificate.
pub fn ca_pem(cn: &str) -> String {
    cert_pair(cn).0
}

/// Review returns an encoded `AdmissionReview` for creating a Pod.
///
/// Passing `None` for the namespace leaves the field out, as for cluster-scoped resources.
pub fn review(uid: &str, namespace: Option<&str>) -> Bytes {
    let mut request = json!({
        "uid": uid,
        "kind": {"group": "", "version": "v1", "kind": "Pod"},
        "resource": {"group": "", "version": "v1", "resource": "pods"},
        "name": "web",
        "operation": "CREATE",
        "userInfo": {"username": "system:admin"},
        "object": {
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web"},
        },
        "dryRun": false,
    });
    if let Some(ns) = namespace {
        request["namespace"] = json!(ns);
        request["object"]["metadata"]["namespace"] = json!(ns);
    }
    let review = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": request,
    });
    Bytes::from(serde_json::to_vec(&review).unwrap())
}

#[derive(Default)]
struct Seen {
    hits: AtomicUsize,
    last: Mutex<Option<(String, Value)>>,
}

/// FakeDelegate is a plain HTTP admission webhook on a loopback port.
///
/// Any path answers with [`FakeDelegate::answer`], except:
///
/// - `/status/<code>` answers with that status code;
/// - `/garbage` answers with a body that is not JSON;
/// - `/empty` answers with a review missing its `response`;
/// - `/slow` waits two seconds before answering;
/// - `/huge` answers with a review padded past [`crate::MAX_REVIEW_BYTES`].
pub struct FakeDelegate {
    addr: SocketAddr,
    seen: Arc<Seen>,
    cancel: CancellationToken,
}

impl FakeDelegate {
    pub async fn start() -> Self {
        let seen = Arc::new(Seen::default());
        let app = Router::new().fallback(Self::handle).with_state(seen.clone());
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
        Self { addr, seen, cancel }
    }

    /// Url returns an absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Hits is the number of requests received.
    pub fn hits(&self) -> usize {
        self.seen.hits.load(Ordering::SeqCst)
    }

    /// Last_request is the decoded body of the most recent request.
    pub fn last_request(&self) -> Option<Value> {
        let last = self.seen.last.lock().unwrap();
        last.as_ref().map(|(_, body)| body.clone())
    }

    /// Last_path is the path of the most recent request.
    pub fn last_path(&self) -> Option<String> {
        let last = self.seen.last.lock().unwrap();
        last.as_ref().map(|(path, _)| path.clone())
    }

    /// Answer is the review returned for a request with `uid`.
    pub fn answer(uid: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "response": {
                "uid": uid,
                "allowed": true,
                "warnings": ["seen by the fake delegate"],
                "auditAnnotations": {"fake": "true"},
            },
        })
    }

    async fn handle(
        State(seen): State<Arc<Seen>>,
        uri: Uri,
        body: Bytes,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;

        seen.hits.fetch_add(1, Ordering::SeqCst);
        let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let uid = body["request"]["uid"].as_str().unwrap_or_default().to_string();
        let path = uri.path().to_string();
        *seen.last.lock().unwrap() = Some((path.clone(), body));

        if let Some(code) = path.strip_prefix("/status/") {
            let code = StatusCode::from_bytes(code.as_bytes()).unwrap();
            return (code, "nope").into_response();
        }
        match path.as_str() {
            "/garbage" => "this is not json".into_response(),
            "/empty" => Json(json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
            }))
            .into_response(),
            "/huge" => {
                let mut answer = Self::answer(&uid);
                answer["response"]["auditAnnotations"]["padding"] =
                    json!("x".repeat(crate::MAX_REVIEW_BYTES));
                Json(answer).into_response()
            }
            "/slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(Self::answer(&uid)).into_response()
            }
            _ => Json(Self::answer(&uid)).into_response(),
        }
    }
}

impl Drop for FakeDelegate {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// TlsDelegate is an HTTPS admission webhook on a loopback port, serving a fresh self-signed
/// certificate. Every request is answered with [`FakeDelegate::answer`].
pub struct TlsDelegate {
    addr: SocketAddr,
    /// PEM encoded serving certificate, which is also its own CA.
    pub cert: String,
    handle: Handle<SocketAddr>,
}

impl TlsDelegate {
    pub async fn start() -> Self {
        let (cert, key) = cert_pair("localhost");
        let config = OpenSSLConfig::from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
        let app = Router::new().fallback(|body: Bytes| async move {
            let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            Json(FakeDelegate::answer(
                body["request"]["uid"].as_str().unwrap_or_default(),
            ))
        });
        let handle = Handle::new();
        let server = axum_server::bind_openssl(SocketAddr::from(([127, 0, 0, 1], 0)), config)
            .handle(handle.clone());
        tokio::spawn(async move { server.serve(app.into_make_service()).await.unwrap() });
        let addr = handle.listening().await.unwrap();
        Self { addr, cert, handle }
    }

    /// Url returns an absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.addr.port(), path)
    }
}

impl Drop for TlsDelegate {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
