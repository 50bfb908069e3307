//! HTTP endpoint that runs next to the real token inside the cluster.
//!
//! Each `GET /` reads the token file from disk and answers with the JSON
//! payload the mount side decodes. Nothing is cached.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use clap::Args;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::ENDPOINT_PORT;
use crate::cache::Payload;

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// The path to the token file
    #[arg(long)]
    path: PathBuf,

    /// The address to host the server on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], ENDPOINT_PORT)))]
    addr: SocketAddr,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 5)]
    shutdown_timeout: u64,
}

pub fn router(path: PathBuf) -> Router {
    Router::new()
        .route("/", get(serve_token))
        .with_state(Arc::new(path))
}

async fn serve_token(State(path): State<Arc<PathBuf>>) -> Response {
    let data = match tokio::fs::read(path.as_path()).await {
        Ok(data) => data,
        Err(e) => {
            log::warn!("unable to read {}: {e}", path.display());
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match Payload::new(data).encode() {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            log::warn!("unable to encode payload: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn run(args: ServerArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("unable to listen on {}", args.addr))?;
    log::info!("starting server on {}", listener.local_addr()?);

    let shutdown = cancel.clone();
    let serve = axum::serve(listener, router(args.path))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    let mut server = tokio::spawn(serve.into_future());

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        joined = &mut server => {
            joined.context("server task panicked")?.context("server failed")?;
            if cancel.is_cancelled() {
                return Ok(());
            }
            bail!("server exited unexpectedly");
        }
    }

    log::info!("shutting down server");
    let timeout = Duration::from_secs(args.shutdown_timeout);
    match tokio::time::timeout(timeout, server).await {
        Ok(joined) => joined
            .context("server task panicked")?
            .context("server failed"),
        Err(_) => bail!("unable to shutdown the api server gracefully within {timeout:?}"),
    }
}
