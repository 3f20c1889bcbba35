//! HTTP publication transport.
//!
//! Serves the advertisement DAG as a static content-addressed tree:
//! `GET /head` returns the signed head record, `GET /<cid>` the raw block
//! bytes. Indexers poll `/head`; there is no pub-sub in this variant.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cid::Cid;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::head::SignedHead;
use crate::link::{LinkError, LinkSystem};
use crate::metrics::Metrics;
use crate::publisher::{PublishError, Publisher};

const IPLD_RAW_CONTENT_TYPE: &str = "application/vnd.ipld.raw";

/// Shared state behind the HTTP routes.
struct HttpState {
    links: LinkSystem,
    key: libp2p::identity::Keypair,
    topic: String,
    head: RwLock<Option<SignedHead>>,
    metrics: Metrics,
}

/// Static-tree HTTP publisher.
pub struct HttpPublisher {
    state: Arc<HttpState>,
    addr: SocketAddr,
    server: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl HttpPublisher {
    /// Bind `addr` and start serving. Use port 0 to pick a free port; the
    /// bound address is available through [`HttpPublisher::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        links: LinkSystem,
        key: libp2p::identity::Keypair,
        topic: String,
        metrics: Metrics,
    ) -> Result<Self, PublishError> {
        let state = Arc::new(HttpState {
            links,
            key,
            topic,
            head: RwLock::new(None),
            metrics,
        });

        let router = Router::new()
            .route("/head", get(get_head))
            .route("/metrics", get(get_metrics))
            .route("/:cid", get(get_block))
            .with_state(Arc::clone(&state))
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("HTTP publisher listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!("HTTP publisher server error: {}", err);
            }
        });

        Ok(Self {
            state,
            addr: local_addr,
            server: Mutex::new(Some((shutdown_tx, handle))),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn update_head(&self, head: Cid) -> Result<(), PublishError> {
        let signed = SignedHead::sign(&head, &self.state.topic, &self.state.key)?;
        let mut slot = self.state.head.write().await;
        *slot = Some(signed);
        debug!("HTTP publisher head updated to {}", head);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PublishError> {
        let mut server = self.server.lock().await;
        if let Some((shutdown_tx, handle)) = server.take() {
            let _ = shutdown_tx.send(());
            handle
                .await
                .map_err(|e| PublishError::Transport(e.to_string()))?;
        }
        Ok(())
    }
}

async fn get_head(State(state): State<Arc<HttpState>>) -> Response {
    state.metrics.head_request();
    let head = state.head.read().await;
    match head.as_ref() {
        Some(signed) => Json(signed.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_metrics(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn get_block(
    State(state): State<Arc<HttpState>>,
    Path(cid_str): Path<String>,
) -> Response {
    let cid: Cid = match cid_str.parse() {
        Ok(cid) => cid,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.links.load(&cid).await {
        Ok(bytes) => {
            state.metrics.block_served();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, IPLD_RAW_CONTENT_TYPE)],
                bytes,
            )
                .into_response()
        }
        Err(LinkError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!("failed to serve block {}: {}", cid, err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::link::AD_CODEC;

    async fn publisher() -> (HttpPublisher, LinkSystem) {
        let links = LinkSystem::new(MemDatastore::shared());
        let key = libp2p::identity::Keypair::generate_ed25519();
        let publisher = HttpPublisher::bind(
            "127.0.0.1:0".parse().unwrap(),
            links.clone(),
            key,
            "/herald/topic".to_string(),
            Metrics::new(),
        )
        .await
        .unwrap();
        (publisher, links)
    }

    #[tokio::test]
    async fn test_head_starts_404_then_serves_signed_record() {
        let (publisher, links) = publisher().await;
        let base = format!("http://{}", publisher.local_addr());

        let resp = reqwest::get(format!("{base}/head")).await.unwrap();
        assert_eq!(resp.status(), 404);

        let head = links.store(AD_CODEC, b"an ad").await.unwrap();
        publisher.update_head(head).await.unwrap();

        let signed: SignedHead = reqwest::get(format!("{base}/head"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let (got, _signer) = signed.verify().unwrap();
        assert_eq!(got, head);

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_raw_block_bytes() {
        let (publisher, links) = publisher().await;
        let base = format!("http://{}", publisher.local_addr());
        let cid = links.store(AD_CODEC, b"block bytes").await.unwrap();

        let resp = reqwest::get(format!("{base}/{cid}")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            IPLD_RAW_CONTENT_TYPE
        );
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"block bytes");

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_cid_is_404() {
        let (publisher, _links) = publisher().await;
        let base = format!("http://{}", publisher.local_addr());
        let missing = crate::link::node_cid(AD_CODEC, b"missing").unwrap();

        let resp = reqwest::get(format!("{base}/{missing}")).await.unwrap();
        assert_eq!(resp.status(), 404);

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (publisher, _links) = publisher().await;
        publisher.shutdown().await.unwrap();
        publisher.shutdown().await.unwrap();
    }
}
