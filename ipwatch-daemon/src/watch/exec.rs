use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ipwatch_engine::capture::{CaptureTransport, PcapTransport};
use ipwatch_engine::codec::EthernetArpCodec;
use ipwatch_engine::device::{DeviceInfoProvider, PnetDeviceInfo};
use ipwatch_engine::engine::{ConflictEngine, EngineHandle};
use ipwatch_engine::notify::{ConflictEvent, ConflictKind};
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::oneshot::{channel, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::watch::config::Config;
use crate::watch::notifier::ChannelNotifier;
use crate::watch::script::run_script;

const EVENT_BACKLOG: usize = 64;

/// Only root may open the capture and send raw frames.
pub fn check_privilege() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(anyhow!("You must be root to run ipwatch"));
    }
    Ok(())
}

/// Lifecycle of the conflict engine inside the daemon: capture thread, event
/// pump and user script.
#[derive(Debug)]
pub struct Watcher {
    pub config: Config,
    events: broadcast::Sender<ConflictEvent>,
    handle: Option<EngineHandle>,
    sender: Option<Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        Self {
            config,
            events,
            handle: None,
            sender: None,
            task: None,
        }
    }

    /// Fan-out of conflict events; every subscriber sees events sent after it
    /// subscribed.
    pub fn events(&self) -> broadcast::Sender<ConflictEvent> {
        self.events.clone()
    }

    pub fn engine(&self) -> Option<Arc<ConflictEngine>> {
        self.handle.as_ref().map(|handle| handle.engine().clone())
    }

    /// Checks privileges, opens the capture on every interface and starts
    /// watching.
    pub fn start(&mut self) -> Result<()> {
        check_privilege()?;
        let transport = PcapTransport::open_any()?;
        self.start_with(Box::new(transport), Arc::new(PnetDeviceInfo))
    }

    /// Starts watching over the given capture and interface source.
    pub fn start_with(
        &mut self,
        transport: Box<dyn CaptureTransport>,
        provider: Arc<dyn DeviceInfoProvider>,
    ) -> Result<()> {
        if self.handle.is_some() {
            return Err(anyhow!("watcher already started"));
        }
        let devices = self.config.device_set(provider.as_ref());
        let (tx, rx) = unbounded_channel();
        let engine = Arc::new(ConflictEngine::new(
            self.config.engine,
            devices,
            transport,
            provider,
            Arc::new(EthernetArpCodec),
            Arc::new(ChannelNotifier::new(tx)),
        ));
        let handle = engine.start()?;

        let (sender, stop_rx) = channel();
        self.task = Some(tokio::spawn(pump(
            rx,
            stop_rx,
            self.events.clone(),
            self.config.user_script.clone(),
        )));
        self.sender = Some(sender);
        self.handle = Some(handle);
        tracing::info!("ipwatch started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            tokio::task::spawn_blocking(move || handle.stop()).await??;
        }
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        tracing::info!("ipwatch stopped");
        Ok(())
    }
}

/// Moves events from the capture thread to subscribers and the user script.
/// On stop, events already queued by the capture thread are still delivered.
async fn pump(
    mut rx: UnboundedReceiver<ConflictEvent>,
    mut stop: Receiver<()>,
    events: broadcast::Sender<ConflictEvent>,
    script: Option<PathBuf>,
) {
    loop {
        select! {
            biased;
            _ = &mut stop => {
                tracing::trace!("catch signal in event pump.");
                while let Ok(event) = rx.try_recv() {
                    forward(event, &events, &script);
                }
                return;
            },
            event = rx.recv() => match event {
                Some(event) => forward(event, &events, &script),
                None => return,
            },
        };
    }
}

fn forward(
    event: ConflictEvent,
    events: &broadcast::Sender<ConflictEvent>,
    script: &Option<PathBuf>,
) {
    if event.kind == ConflictKind::Conflict {
        if let Some(script) = script.clone() {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = run_script(&script, &event).await {
                    tracing::error!("{:?}", e);
                }
            });
        }
    }
    // no subscriber is fine
    let _ = events.send(event);
}
