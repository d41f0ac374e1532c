//! Reference worker program
//!
//! Implements the worker child contract: listen on the given UNIX socket,
//! open then close the handshake pipe's write side to signal readiness,
//! hold the read side open and exit on EOF, and speak the netstring
//! protocol for each accepted connection. SIGQUIT finishes the in-flight
//! exchange before exiting; SIGTERM exits immediately.
//!
//! Behaviour is driven by the runtime configuration file (TOML), which
//! makes this both the development-mode worker and the test fixture.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rackgate::netstring::NetstringCodec;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

/// Behaviour described by the runtime configuration file.
#[derive(Debug, Deserialize, Default, Clone)]
struct Behaviour {
    /// Abort startup with this message instead of serving
    boot_error: Option<String>,

    /// Status code for every response (default: 200)
    #[serde(default = "default_status")]
    status: u16,

    /// Response headers
    #[serde(default)]
    headers: HashMap<String, String>,

    /// Response body
    body: Option<String>,

    /// Respond with the request environment serialized as JSON
    #[serde(default)]
    echo_env: bool,

    /// Milliseconds to sleep before responding
    #[serde(default)]
    delay_ms: u64,

    /// Line printed to stdout once the socket is listening
    stdout_banner: Option<String>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug)]
struct Args {
    file: PathBuf,
    pipe: PathBuf,
    debug: bool,
    config: PathBuf,
}

fn parse_args() -> Result<Args, String> {
    let mut file = None;
    let mut pipe = None;
    let mut debug = false;
    let mut config = None;

    let mut args = std::env::args_os().skip(1);
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--file") => file = args.next().map(PathBuf::from),
            Some("--pipe") => pipe = args.next().map(PathBuf::from),
            Some("--debug") => debug = true,
            _ => config = Some(PathBuf::from(arg)),
        }
    }

    Ok(Args {
        file: file.ok_or("missing --file <socket-path>")?,
        pipe: pipe.ok_or("missing --pipe <pipe-path>")?,
        debug,
        config: config.ok_or("missing <config-path>")?,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = parse_args().map_err(|e| anyhow::anyhow!(e))?;

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load behaviour; failures are reported through the handshake pipe so
    // the supervisor can surface the message verbatim.
    let behaviour = match load_behaviour(&args.config) {
        Ok(behaviour) => behaviour,
        Err(message) => {
            report_boot_failure(&args.pipe, &message).await;
            anyhow::bail!("boot failed: {}", message);
        }
    };

    // Listen before signalling readiness.
    let _ = std::fs::remove_file(&args.file);
    let listener = UnixListener::bind(&args.file)?;

    // Open the pipe for writing and close it: the zero-byte close tells the
    // supervisor the socket is listening.
    signal_ready(&args.pipe).await?;

    // Hold the read side; EOF means the supervisor is gone.
    let watch_pipe = args.pipe.clone();
    let mut supervisor_gone = tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut buf = [0u8; 1];
        if let Ok(mut pipe) = std::fs::File::open(&watch_pipe) {
            let _ = pipe.read(&mut buf);
        }
    });

    if let Some(banner) = &behaviour.stdout_banner {
        println!("{}", banner);
        let _ = std::io::stdout().flush();
    }

    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    info!(socket = %args.file.display(), "worker ready");

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
            _ = sigquit.recv() => {
                debug!("SIGQUIT received, exiting");
                break;
            }
            _ = sigterm.recv() => {
                debug!("SIGTERM received, exiting");
                break;
            }
            _ = &mut supervisor_gone => {
                debug!("supervisor closed the pipe, exiting");
                break;
            }
        };

        // One exchange at a time; the supervisor serialises them. SIGQUIT
        // stays pending until the exchange completes, SIGTERM cuts it off.
        tokio::select! {
            result = handle_exchange(stream, &behaviour) => {
                if let Err(e) = result {
                    error!(error = %e, "exchange failed");
                }
            }
            _ = sigterm.recv() => {
                debug!("SIGTERM received mid-exchange, exiting");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&args.file);
    Ok(())
}

fn load_behaviour(path: &Path) -> Result<Behaviour, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let behaviour: Behaviour = toml::from_str(&content)
        .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
    if let Some(message) = &behaviour.boot_error {
        return Err(message.clone());
    }
    Ok(behaviour)
}

/// Write the failure message into the handshake pipe before exiting.
async fn report_boot_failure(pipe: &Path, message: &str) {
    let pipe = pipe.to_path_buf();
    let message = message.to_string();
    let _ = tokio::task::spawn_blocking(move || {
        if let Ok(mut pipe) = std::fs::OpenOptions::new().write(true).open(&pipe) {
            let _ = pipe.write_all(message.as_bytes());
        }
    })
    .await;
}

async fn signal_ready(pipe: &Path) -> std::io::Result<()> {
    let pipe = pipe.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new().write(true).open(&pipe).map(drop)
    })
    .await
    .expect("blocking task panicked")
}

async fn handle_exchange(stream: UnixStream, behaviour: &Behaviour) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, NetstringCodec);

    // Frame 1: the environment map.
    let env_frame = match framed.next().await {
        Some(frame) => frame?,
        None => return Ok(()), // peer connected and went away
    };
    let env: Map<String, Value> = serde_json::from_slice(&env_frame)?;

    // Body frames up to the sentinel.
    let mut body = Vec::new();
    loop {
        match framed.next().await {
            Some(Ok(frame)) if frame.is_empty() => break,
            Some(Ok(frame)) => body.extend_from_slice(&frame),
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("request ended before the sentinel"),
        }
    }

    debug!(
        method = env
            .get("REQUEST_METHOD")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("-"),
        path = env.get("PATH_INFO").and_then(serde_json::Value::as_str).unwrap_or("-"),
        body_bytes = body.len(),
        "request received"
    );

    if behaviour.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(behaviour.delay_ms)).await;
    }

    let (status, headers, payload) = if behaviour.echo_env {
        let headers = HashMap::from([(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]);
        (200, headers, serde_json::to_vec(&env)?)
    } else {
        let mut headers = behaviour.headers.clone();
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "text/plain".to_string());
        let payload = behaviour.body.clone().unwrap_or_default().into_bytes();
        (behaviour.status, headers, payload)
    };

    framed
        .send(Bytes::from(serde_json::to_vec(&Value::from(status))?))
        .await?;
    let header_map: Map<String, Value> = headers
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect();
    framed
        .send(Bytes::from(serde_json::to_vec(&Value::Object(header_map))?))
        .await?;
    if !payload.is_empty() {
        framed.send(Bytes::from(payload)).await?;
    }
    framed.send(Bytes::new()).await?;
    Ok(())
}
