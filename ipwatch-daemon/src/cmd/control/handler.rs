use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{anyhow, Error};
use futures::TryStreamExt;
use http::{header, Method, Request, Response, StatusCode};
use hyper::server::conn::Http;
use hyper::service::Service;
use hyper::Body;
use ipwatch_engine::engine::ConflictEngine;
use ipwatch_engine::notify::ConflictEvent;
use tokio::net::UnixListener;
use tokio::select;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot::{channel, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::instrument;

use super::{CheckReply, CheckRequest};

#[derive(Debug)]
pub struct ControlServer {
    service: ControlService,
    task: Option<JoinHandle<Result<(), Error>>>,
    rx: Option<Receiver<()>>,
    sender: Option<Sender<()>>,
}

impl ControlServer {
    pub fn new(engine: Arc<ConflictEngine>, events: broadcast::Sender<ConflictEvent>) -> Self {
        let (sender, rx) = channel();
        Self {
            service: ControlService { engine, events },
            task: None,
            rx: Some(rx),
            sender: Some(sender),
        }
    }

    /// Binds `path` and serves requests until [`ControlServer::stop`].
    pub fn serve(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow!("control server already serving"))?;
        tracing::info!("ControlServer listener try binding {:?}", path);
        let listener = UnixListener::bind(&path)?;
        let service = self.service.clone();

        self.task = Some(tokio::spawn(async move {
            loop {
                select! {
                    _ = &mut rx => {
                        tracing::trace!("catch signal in control server.");
                        return Ok(());
                    },
                    stream = listener.accept() => {
                        let (stream, _) = match stream {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::error!("accept on {:?} failed: {}", path, e);
                                continue;
                            }
                        };
                        // event streams stay open, so every connection gets its own task
                        let service = service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Http::new().serve_connection(stream, service).await {
                                tracing::error!("{}", e);
                            }
                        });
                    },
                };
            }
        }));
        Ok(())
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        };
        if let Some(handler) = self.task.take() {
            handler.await??;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ControlService {
    engine: Arc<ConflictEngine>,
    events: broadcast::Sender<ConflictEvent>,
}

impl ControlService {
    async fn read_request(request: Request<Body>) -> anyhow::Result<CheckRequest> {
        let request_data: Vec<u8> = request
            .into_body()
            .try_fold(vec![], |mut data, seg| {
                data.extend(seg);
                futures::future::ok(data)
            })
            .await?;

        Ok(serde_json::from_slice(&request_data)?)
    }

    async fn check(&self, request: Request<Body>) -> anyhow::Result<Response<Body>> {
        let check = match Self::read_request(request).await {
            Err(e) => {
                return Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(e.to_string().into())?);
            }
            Ok(c) => c,
        };

        let engine = self.engine.clone();
        let mac =
            tokio::task::spawn_blocking(move || engine.check_conflict(&check.ip, &check.device))
                .await?;
        let reply = CheckReply {
            mac: mac.map(|mac| mac.to_string()).unwrap_or_default(),
        };

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&reply)?.into())?)
    }

    /// One JSON object per line for every event sent after the request.
    fn events(&self) -> anyhow::Result<Response<Body>> {
        let stream = futures::stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let line = match serde_json::to_vec(&event) {
                            Ok(mut line) => {
                                line.push(b'\n');
                                line
                            }
                            Err(e) => return Some((Err(Error::from(e)), rx)),
                        };
                        return Some((Ok(line), rx));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("event subscriber lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(Body::wrap_stream(stream))?)
    }

    #[instrument]
    async fn handle(&self, request: Request<Body>) -> anyhow::Result<Response<Body>> {
        let status = match (request.method(), request.uri().path()) {
            (&Method::PUT, "/check") => return self.check(request).await,
            (&Method::GET, "/events") => return self.events(),
            (_, "/check") | (_, "/events") => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::NOT_FOUND,
        };
        Ok(Response::builder().status(status).body(Body::empty())?)
    }
}

impl Service<Request<Body>> for ControlService {
    type Response = Response<Body>;
    type Error = anyhow::Error;
    #[allow(clippy::type_complexity)]
    type Future =
        Pin<Box<dyn 'static + Send + Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle(request).await })
    }
}
