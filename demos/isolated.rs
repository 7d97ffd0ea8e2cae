//! cordon in front of a small hyper server.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example isolated
//!
//! Try:
//!   curl http://localhost:3000/hello
//!   curl http://localhost:3000/later          # replies from a spawned task
//!   curl http://localhost:3000/boom           # fails after the handler returned
//!
//! `/boom` gets a 500, then the default fatal policy sends SIGTERM to the
//! process. The server treats it like any other SIGTERM: it stops accepting,
//! drains in-flight connections (including the 500) and exits. Run with
//! `CORDON_FATAL_ACTION=log-only` to keep serving instead.

use std::net::SocketAddr;
use std::time::Duration;

use cordon::{IsolatedService, Reply, Request, Response, TrappedError, middleware};
use http::StatusCode;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), cordon::Error> {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = std::env::var("CORDON_DEMO_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_owned())
        .parse()
        .map_err(|_| cordon::Error::Config { key: "CORDON_DEMO_ADDR", value: "unparseable".to_owned() })?;

    let service = IsolatedService::new(middleware::isolation(None), pipeline);
    serve(addr, service).await
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

async fn pipeline(req: Request, res: Response, err: Option<TrappedError>) {
    if let Some(err) = err {
        let _ = res.send(
            Reply::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .text(format!("request failed: {err}\n")),
        );
        return;
    }

    match req.path() {
        "/hello" => {
            let _ = res.send(Reply::text("hello\n"));
        }
        "/later" => {
            req.spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                res.send(Reply::text("later\n")).map_err(|_| "already replied")
            });
        }
        "/boom" => {
            // The handler returns before this fails; the context still traps it.
            req.spawn(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<(), _>("boom")
            });
        }
        _ => {
            let _ = res.send(Reply::status(StatusCode::NOT_FOUND));
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

async fn serve(addr: SocketAddr, service: IsolatedService) -> Result<(), cordon::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "demo listening");

    let mut tasks = tokio::task::JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            () = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let service = service.clone();
                tasks.spawn(async move {
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        error!(%peer, "connection error: {e}");
                    }
                });
            }

            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while tasks.join_next().await.is_some() {}
    info!("demo stopped");
    Ok(())
}

/// Resolves on SIGTERM (including the one the fatal policy sends) or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
