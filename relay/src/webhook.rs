//! Webhook is the HTTP(S) front door for the relays.
//!
//! Each [`Relay`] is mounted under its role's path prefix. Every request that reaches a relay is
//! answered with HTTP 200 and an `AdmissionReview`; only requests outside the mounted prefixes
//! see other status codes.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::Uri,
    routing::post,
};
use axum_server::{Handle, tls_openssl::OpenSSLConfig};
use tower_http::trace::TraceLayer;

use crate::{
    MAX_REVIEW_BYTES,
    prelude::*,
    relay::{Relay, Verdict},
};

/// How long in-flight requests get to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// App builds the router serving `relays`.
pub fn app(relays: impl IntoIterator<Item = Relay>) -> Router {
    let mut router = Router::new();
    for relay in relays {
        let prefix = relay.role().prefix();
        let relay = Arc::new(relay);
        debug!(%prefix, "mounting relay");
        router = router
            .route(prefix, post(review).with_state(relay.clone()))
            .route(&format!("{prefix}{{*hook}}"), post(review).with_state(relay));
    }
    router
        .layer(DefaultBodyLimit::max(MAX_REVIEW_BYTES))
        .layer(TraceLayer::new_for_http())
}

async fn review(State(relay): State<Arc<Relay>>, uri: Uri, body: Bytes) -> Verdict {
    relay.handle(uri.path(), body).await
}

/// Tls_files returns the certificate and key paths inside `dir`, if both exist.
pub fn tls_files<P: AsRef<Path>>(dir: P, cert: &str, key: &str) -> Option<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    let (cert, key) = (dir.join(cert), dir.join(key));
    (cert.exists() && key.exists()).then_some((cert, key))
}

/// Serve runs `app` on `addr` until `cancel` fires.
///
/// If `tls` names a certificate and key, HTTPS is served; otherwise plain HTTP.
pub async fn serve(
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
    app: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let handle = Handle::new();
    let h = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        debug!("shutting down webhook server");
        h.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let svc = app.into_make_service();
    match tls {
        Some((cert, key)) => {
            let config = OpenSSLConfig::from_pem_file(&cert, &key).map_err(anyhow::Error::from)?;
            info!(%addr, cert = %cert.display(), "started webhook server (HTTPS)");
            axum_server::bind_openssl(addr, config)
                .handle(handle)
                .serve(svc)
                .await?;
        }
        None => {
            warn!(%addr, "no TLS certificate found, serving plain HTTP");
            info!(%addr, "started webhook server (HTTP)");
            axum_server::bind(addr).handle(handle).serve(svc).await?;
        }
    }
    info!("webhook server finished");
    Ok(())
}
