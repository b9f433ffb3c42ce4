//! Process wiring: argument parsing, the kubert runtime, watch spawning,
//! and the plain-HTTP serve loop shared by server and proxy modes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;

pub use self::args::Args;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Accepts connections until drained, serving each on its own task. A
/// request that is in flight when shutdown fires is simply discarded with
/// its connection.
pub(crate) async fn serve<S>(addr: SocketAddr, service: S, drain: drain::Watch) -> Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<Full<Bytes>>>
        + Clone
        + Send
        + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    S::Future: Send,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "server listening");

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, client_addr) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        continue;
                    }
                };
                let service = TowerToHyperService::new(service.clone());
                let drain = drain.clone();
                tokio::spawn(async move {
                    let conn = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    tokio::select! {
                        res = conn.as_mut() => {
                            if let Err(error) = res {
                                debug!(%error, client.addr = %client_addr, "connection closed");
                            }
                        }
                        handle = drain.signaled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = handle.release_after(conn.as_mut()).await;
                        }
                    }
                });
            }
            _ = drain.clone().signaled() => {
                debug!("drained; stopping accept loop");
                return Ok(());
            }
        }
    }
}
