use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use http::{Method, Request};
use hyper::client::connect::{Connected, Connection};
use hyper::client::Client;
use hyper::service::Service;
use hyper::{Body, Uri};
use ipwatch_engine::notify::ConflictEvent;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;

use super::{CheckReply, CheckRequest};

#[derive(Debug, Clone)]
struct UnixConnect(PathBuf);

#[derive(Debug)]
struct UnixConnection(UnixStream);

impl Service<Uri> for UnixConnect {
    type Response = UnixConnection;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn 'static + Send + Future<Output = Result<Self::Response>>>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
    fn call(&mut self, _: Uri) -> Self::Future {
        let path = self.0.clone();
        Box::pin(async move { Ok(UnixConnection(UnixStream::connect(path).await?)) })
    }
}

/// Talks to the control server of a running daemon.
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: Client<UnixConnect, Body>,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::builder().build(UnixConnect(path.into())),
        }
    }

    /// Asks the daemon to probe `ip`; returns the MAC that answered, or an
    /// empty string.
    pub async fn request_check(&self, ip: &str, device: &str) -> Result<String> {
        let body = CheckRequest {
            ip: ip.to_string(),
            device: device.to_string(),
        };
        let request = Request::builder()
            .uri("http://localhost/check")
            .method(Method::PUT)
            .body(Body::from(serde_json::to_vec(&body)?))?;
        let resp = self.client.request(request).await?;
        if !resp.status().is_success() {
            return Err(anyhow!("fail to check {}: status({})", ip, resp.status()));
        }
        let data = hyper::body::to_bytes(resp.into_body()).await?;
        let reply: CheckReply = serde_json::from_slice(&data)?;
        Ok(reply.mac)
    }

    /// Opens the event stream of the daemon.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let request = Request::builder()
            .uri("http://localhost/events")
            .method(Method::GET)
            .body(Body::empty())?;
        let resp = self.client.request(request).await?;
        if !resp.status().is_success() {
            return Err(anyhow!("fail to subscribe: status({})", resp.status()));
        }
        Ok(EventStream {
            body: resp.into_body(),
            buf: vec![],
        })
    }
}

/// Conflict events read off a newline-delimited JSON response.
#[derive(Debug)]
pub struct EventStream {
    body: Body,
    buf: Vec<u8>,
}

impl EventStream {
    /// The next event, or `None` once the daemon closed the stream.
    pub async fn next(&mut self) -> Result<Option<ConflictEvent>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(&line)?));
            }
            match self.body.try_next().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }
}

impl Connection for UnixConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for UnixConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}
