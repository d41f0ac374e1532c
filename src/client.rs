//! Framing client for worker sockets
//!
//! A [`Connection`] wraps one UNIX-socket connection to a worker and carries
//! at most one request/response exchange. The outbound side is the JSON
//! environment frame followed by body frames and the zero-length sentinel;
//! the inbound side is a JSON status frame, a JSON header frame, body
//! frames, and the sentinel.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{Request, Response};
use serde_json::{Map, Value};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::WorkerError;
use crate::netstring::NetstringCodec;

/// Meta-variables merged into the environment map last; they win over
/// synthesized keys.
pub type MetaVariables = HashMap<String, String>;

type FramedSocket = Framed<UnixStream, NetstringCodec>;

/// Build the CGI-style environment map for one request.
///
/// `target` is the request path with an optional `?query` suffix. Header
/// names are upcased with `-` replaced by `_` and prefixed with `HTTP_`
/// except for `CONTENT_TYPE` and `CONTENT_LENGTH`; a `Host` header of the
/// form `name:port` additionally populates `SERVER_NAME` and `SERVER_PORT`.
pub fn request_env(
    method: &str,
    target: &str,
    headers: &[(String, String)],
    meta: &MetaVariables,
) -> Map<String, Value> {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut env = Map::new();
    env.insert("REQUEST_METHOD".to_string(), method.into());
    env.insert("PATH_INFO".to_string(), path.into());
    env.insert("QUERY_STRING".to_string(), query.into());
    env.insert("SCRIPT_NAME".to_string(), "".into());
    env.insert("REMOTE_ADDR".to_string(), "0.0.0.0".into());
    env.insert("SERVER_ADDR".to_string(), "0.0.0.0".into());

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            if let Some((server_name, server_port)) = value.split_once(':') {
                env.insert("SERVER_NAME".to_string(), server_name.into());
                env.insert("SERVER_PORT".to_string(), server_port.into());
            }
        }
    }

    for (name, value) in headers {
        let mut key = name.to_ascii_uppercase().replace('-', "_");
        if key != "CONTENT_TYPE" && key != "CONTENT_LENGTH" {
            key = format!("HTTP_{}", key);
        }
        env.insert(key, value.as_str().into());
    }

    for (key, value) in meta {
        env.insert(key.clone(), value.as_str().into());
    }

    env
}

/// Parsed status and header frames of a worker response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    /// Header occurrences in wire order. A value with embedded newlines
    /// arrives as one occurrence per line.
    pub headers: Vec<(String, String)>,
}

fn parse_status(frame: &[u8]) -> Result<u16, WorkerError> {
    serde_json::from_slice(frame)
        .map_err(|e| WorkerError::Protocol(format!("bad status frame: {}", e)))
}

fn parse_headers(frame: &[u8]) -> Result<Vec<(String, String)>, WorkerError> {
    let map: HashMap<String, String> = serde_json::from_slice(frame)
        .map_err(|e| WorkerError::Protocol(format!("bad header frame: {}", e)))?;

    let mut headers = Vec::new();
    for (name, value) in map {
        for line in value.split('\n') {
            headers.push((name.clone(), line.to_string()));
        }
    }
    Ok(headers)
}

async fn next_frame(stream: &mut SplitStream<FramedSocket>) -> Result<Bytes, WorkerError> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e),
        None => Err(WorkerError::ConnectionLost),
    }
}

/// Hook invoked when an exchange finishes or is dropped. Workers use this
/// to return from `busy` to `ready` when the socket goes away.
pub struct CloseGuard(Option<Box<dyn FnOnce() + Send>>);

impl CloseGuard {
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(hook)))
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

/// A framing-client connection to one worker socket.
pub struct Connection {
    framed: FramedSocket,
    guard: Option<CloseGuard>,
}

impl Connection {
    /// Connect to a worker socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self {
            framed: Framed::new(stream, NetstringCodec),
            guard: None,
        })
    }

    /// Attach a hook that runs once the exchange is finished or dropped.
    pub fn on_close(&mut self, guard: CloseGuard) {
        self.guard = Some(guard);
    }

    /// Begin an exchange by sending the environment frame.
    pub async fn request(
        mut self,
        method: &str,
        target: &str,
        headers: &[(String, String)],
        meta: &MetaVariables,
    ) -> Result<Exchange, WorkerError> {
        let env = request_env(method, target, headers, meta);
        let frame = serde_json::to_vec(&Value::Object(env))
            .map_err(|e| WorkerError::Protocol(format!("bad environment map: {}", e)))?;
        self.framed.send(Bytes::from(frame)).await?;

        let (sink, stream) = self.framed.split();
        Ok(Exchange {
            sink,
            stream,
            finished: false,
            stopped: false,
            _guard: self.guard,
        })
    }

    /// Run one full proxied exchange: rebuild the request as an environment
    /// frame, pump the inbound body onto the socket concurrently with
    /// response parsing, and return the worker's status, headers, and a
    /// streamed body.
    pub async fn proxy_request<B>(
        mut self,
        req: Request<B>,
        meta: &MetaVariables,
    ) -> Result<Response<BoxBody<Bytes, WorkerError>>, WorkerError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Send,
    {
        let (parts, body) = req.into_parts();
        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let target = match parts.uri.query() {
            Some(query) => format!("{}?{}", parts.uri.path(), query),
            None => parts.uri.path().to_string(),
        };

        let env = request_env(parts.method.as_str(), &target, &headers, meta);
        let frame = serde_json::to_vec(&Value::Object(env))
            .map_err(|e| WorkerError::Protocol(format!("bad environment map: {}", e)))?;
        self.framed.send(Bytes::from(frame)).await?;

        let guard = self.guard.take();
        let (mut sink, mut stream) = self.framed.split();

        // Pump the request body while the response is being parsed, so a
        // worker that responds before draining its input cannot stall us.
        let pump = tokio::spawn(async move {
            let mut body = body;
            while let Some(frame) = body.frame().await {
                let Ok(frame) = frame else { break };
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() && sink.send(data).await.is_err() {
                        return;
                    }
                }
            }
            let _ = sink.send(Bytes::new()).await;
        });

        let status = parse_status(&next_frame(&mut stream).await?)?;
        let resp_headers = parse_headers(&next_frame(&mut stream).await?)?;
        debug!(status, headers = resp_headers.len(), "response head received");

        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Frame<Bytes>, WorkerError>>(8);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                match stream.next().await {
                    Some(Ok(frame)) if frame.is_empty() => break,
                    Some(Ok(frame)) => {
                        if tx.send(Ok(Frame::data(frame))).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    None => {
                        let _ = tx.send(Err(WorkerError::ConnectionLost)).await;
                        break;
                    }
                }
            }
            // Keep the worker claimed until the request side has drained too.
            let _ = pump.await;
        });

        let mut builder = Response::builder().status(status);
        for (name, value) in &resp_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(BodyExt::boxed(StreamBody::new(rx)))
            .map_err(|e| WorkerError::Protocol(format!("bad response head: {}", e)))
    }
}

/// One in-flight request/response pair on a worker socket.
pub struct Exchange {
    sink: SplitSink<FramedSocket, Bytes>,
    stream: SplitStream<FramedSocket>,
    finished: bool,
    stopped: bool,
    _guard: Option<CloseGuard>,
}

impl Exchange {
    /// Send one request body chunk.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), WorkerError> {
        if self.finished {
            return Err(WorkerError::WriteAfterEnd);
        }
        self.sink.send(chunk.into()).await
    }

    /// Close the outbound side, optionally sending a final chunk first.
    pub async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), WorkerError> {
        if self.finished {
            return Err(WorkerError::WriteAfterEnd);
        }
        if let Some(chunk) = chunk {
            if !chunk.is_empty() {
                self.sink.send(chunk).await?;
            }
        }
        self.finished = true;
        self.sink.send(Bytes::new()).await
    }

    /// Read the status and header frames. Call before consuming body chunks.
    pub async fn response_head(&mut self) -> Result<ResponseHead, WorkerError> {
        let status = parse_status(&next_frame(&mut self.stream).await?)?;
        let headers = parse_headers(&next_frame(&mut self.stream).await?)?;
        Ok(ResponseHead { status, headers })
    }

    /// Next response body chunk, or `None` once the sentinel arrives.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, WorkerError> {
        if self.stopped {
            return Ok(None);
        }
        match self.stream.next().await {
            Some(Ok(frame)) if frame.is_empty() => {
                self.stopped = true;
                Ok(None)
            }
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                self.stopped = true;
                Err(e)
            }
            None => {
                self.stopped = true;
                Err(WorkerError::ConnectionLost)
            }
        }
    }
}
