//! HTTP endpoint through which the destination side reports receipts.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, Uri},
    routing::post,
};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::*;
use url::form_urlencoded;

use crate::tx::CrossTxReceipt;

pub const RECEIPT_PATH: &str = "/v1/receipt";

/// Accepts receipts posted to the webhook.
#[async_trait]
pub trait ReceiptSink: Send + Sync {
    async fn submit(&self, receipt: CrossTxReceipt) -> Result<()>;
}

#[derive(Debug, Default)]
struct ReceiptForm {
    crossid: String,
    receipt: String,
    sequence: String,
}

impl ReceiptForm {
    /// Reads the query string, then the body as a url-encoded form whatever its content type. Body fields win.
    fn parse(uri: &Uri, body: &[u8]) -> Self {
        let query = uri.query().unwrap_or_default().as_bytes();
        let mut form = ReceiptForm::default();
        for (key, value) in form_urlencoded::parse(query).chain(form_urlencoded::parse(body)) {
            let field = match &*key {
                "crossid" => &mut form.crossid,
                "receipt" => &mut form.receipt,
                "sequence" => &mut form.sequence,
                _ => continue,
            };
            *field = value.into_owned();
        }
        form
    }
}

pub fn router(sink: Arc<dyn ReceiptSink>) -> Router {
    Router::new()
        .route(RECEIPT_PATH, post(receive).fallback(post_only))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(sink)
}

/// Serves the webhook on `listener` until `stop` is set.
pub async fn serve(
    listener: TcpListener,
    sink: Arc<dyn ReceiptSink>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "receipt webhook listening");
    axum::serve(listener, router(sink))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|s| *s).await;
        })
        .await?;
    Ok(())
}

async fn receive(State(sink): State<Arc<dyn ReceiptSink>>, uri: Uri, body: Bytes) -> StatusCode {
    let form = ReceiptForm::parse(&uri, &body);
    let receipt = CrossTxReceipt {
        cross_id: form.crossid,
        receipt: form.receipt,
        sequence: form.sequence.trim().parse().unwrap_or(0),
    };
    debug!(cross_id = %receipt.cross_id, sequence = receipt.sequence, "receipt posted");
    if let Err(e) = sink.submit(receipt).await {
        warn!(error = %e, "receipt not accepted");
    }
    StatusCode::OK
}

async fn post_only() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "support POST request only")
}

async fn not_found(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{} not found\n", uri.path()))
}
