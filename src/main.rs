use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rackgate::client::MetaVariables;
use rackgate::config::Config;
use rackgate::error::WorkerError;
use rackgate::pool::{Pool, PoolEvent};
use rackgate::{PKG_NAME, VERSION};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rackgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rackgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        "Configuration loaded"
    );

    let pool = Pool::new(&config.config, config.pool.to_options());
    pool.spawn().await?;

    // Surface aggregated worker output on the proxy's own stdio.
    {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut out = tokio::io::stdout();
            while let Some(chunk) = pool.stdout().recv().await {
                let _ = out.write_all(&chunk.data).await;
                let _ = out.flush().await;
            }
        });
    }
    {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut err = tokio::io::stderr();
            while let Some(chunk) = pool.stderr().recv().await {
                let _ = err.write_all(&chunk.data).await;
                let _ = err.flush().await;
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, workers = pool.len(), config = %config.config.display(), "rackgate listening");

    // Create shutdown channel
    let (shutdown_tx, mut accept_shutdown) = watch::channel(false);

    let server_pool = Arc::clone(&pool);
    let server = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let pool = Arc::clone(&server_pool);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let pool = Arc::clone(&pool);
                                    async move {
                                        let mut meta = MetaVariables::new();
                                        meta.insert("REMOTE_ADDR".to_string(), remote.ip().to_string());
                                        match pool.proxy(req, &meta).await {
                                            Ok(response) => Ok::<_, hyper::Error>(response),
                                            Err(e) => {
                                                error!(error = %e, "proxy error");
                                                Ok(bad_gateway(&e))
                                            }
                                        }
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = accept_shutdown.changed() => {
                    if *accept_shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Stop all workers and wait (bounded) for the pool to wind down.
    info!("Stopping all workers...");
    let mut events = pool.subscribe();
    pool.quit();
    if pool.alive_count() > 0 {
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(PoolEvent::Exit) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .await;
    }

    let _ = server.await;
    info!("Shutdown complete");
    Ok(())
}

fn bad_gateway(err: &WorkerError) -> Response<BoxBody<Bytes, WorkerError>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from(format!("worker unavailable: {}", err)))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static headers")
}
