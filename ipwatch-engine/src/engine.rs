use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureScheduler, CaptureTransport};
use crate::classifier::Observation;
use crate::codec::{ArpKind, MacAddr, PacketCodec, BROADCAST_MAC};
use crate::context::{CheckContext, ProbeState};
use crate::device::{DefendMode, Device, DeviceInfoProvider, DeviceSet};
use crate::notify::{ConflictNotifier, ConflictTracker};
use crate::policy::PollConfig;

/// Bounds of one active probe.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProbeConfig {
    pub attempts: u32,
    /// Wait between sending a request and draining the capture.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EngineConfig {
    pub poll: PollConfig,
    pub probe: ProbeConfig,
    pub defend_interval: Duration,
    pub conflict_hold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            probe: ProbeConfig::default(),
            defend_interval: Duration::from_secs(10),
            conflict_hold: Duration::from_secs(60),
        }
    }
}

/// Everything guarded by the engine lock.
#[derive(Debug)]
struct EngineState {
    scheduler: CaptureScheduler,
    context: CheckContext,
    tracker: ConflictTracker,
}

/// A gratuitous ARP to send once the current drain is over.
#[derive(Debug)]
struct Defense {
    device: String,
    ip: Ipv4Addr,
    mac: MacAddr,
}

fn parse_target(target: &str) -> Option<Ipv4Addr> {
    target
        .parse::<Ipv4Addr>()
        .ok()
        .filter(|ip| !ip.is_unspecified())
}

/// Conflict detection engine.
///
/// One instance owns the capture handle, the check context and the conflict
/// tracker behind a single lock. The passive loop takes the lock for one drain
/// at a time; an active probe holds it for its whole attempt sequence, so
/// probes are serialized with each other and with the loop.
pub struct ConflictEngine {
    state: Mutex<EngineState>,
    stop: AtomicBool,
    devices: DeviceSet,
    provider: Arc<dyn DeviceInfoProvider>,
    codec: Arc<dyn PacketCodec>,
    notifier: Arc<dyn ConflictNotifier>,
    config: EngineConfig,
}

impl ConflictEngine {
    pub fn new(
        config: EngineConfig,
        devices: DeviceSet,
        transport: Box<dyn CaptureTransport>,
        provider: Arc<dyn DeviceInfoProvider>,
        codec: Arc<dyn PacketCodec>,
        notifier: Arc<dyn ConflictNotifier>,
    ) -> Self {
        let scheduler = CaptureScheduler::new(transport, codec.clone(), config.poll);
        Self {
            state: Mutex::new(EngineState {
                scheduler,
                context: CheckContext::default(),
                tracker: ConflictTracker::default(),
            }),
            stop: AtomicBool::new(false),
            devices,
            provider,
            codec,
            notifier,
            config,
        }
    }

    /// Spawns the passive capture loop on its own thread.
    pub fn start(self: Arc<Self>) -> Result<EngineHandle> {
        if self.devices.is_empty() {
            return Err(anyhow!("no interface to watch"));
        }
        for spec in self.devices.specs() {
            tracing::info!("watching {} in {:?} mode", spec.name, spec.mode);
        }
        let engine = self.clone();
        let worker = thread::Builder::new()
            .name("ipwatch-capture".to_string())
            .spawn(move || engine.run_passive_loop())?;
        Ok(EngineHandle {
            engine: self,
            worker: Some(worker),
        })
    }

    /// Asks the passive loop to exit after its current iteration. An active
    /// probe in flight is not interrupted.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("engine lock poisoned, recovering state");
            poisoned.into_inner()
        })
    }

    /// Runs until [`ConflictEngine::stop`] is called, then closes the capture
    /// handle.
    pub fn run_passive_loop(&self) {
        tracing::debug!("entering capture loop");
        while !self.is_stopped() {
            let pause = {
                let mut state = self.lock();
                if state.scheduler.is_closed() {
                    break;
                }
                if let Err(e) = self.drain(&mut state) {
                    tracing::error!("capture drain failed: {:?}", e);
                }
                self.expire_conflicts(&mut state);
                state.scheduler.settle();
                state.scheduler.policy().loop_yield()
            };
            thread::sleep(pause);
        }
        self.lock().scheduler.close();
        tracing::info!("capture loop stopped");
    }

    /// Probes `target` and returns the MAC of whoever answered for it.
    ///
    /// `None` means nobody answered within the attempt budget, or the request
    /// was invalid (malformed or zero address, unknown device).
    pub fn check_conflict(&self, target: &str, hint: &str) -> Option<MacAddr> {
        let mut state = self.lock();
        state.scheduler.begin_probe();

        let target_ip = match parse_target(target) {
            Some(ip) => ip,
            None => {
                tracing::error!("unable to convert target IP address {:?}", target);
                return None;
            }
        };
        if state.scheduler.is_closed() {
            tracing::warn!("check of {} refused, capture is closed", target_ip);
            return None;
        }
        let device = match self
            .devices
            .resolve(self.provider.as_ref(), target_ip, hint)
        {
            Some(device) => device,
            None => {
                tracing::warn!("can't find dev: {} - {:?}", target_ip, hint);
                return None;
            }
        };
        let sender_mac = device.mac?;
        let name = device.name.clone();
        state.context.begin(target_ip, hint, device);
        tracing::debug!(
            "check ip {} use dev: {} (hint {:?})",
            target_ip,
            name,
            state.context.hint()
        );

        let frame = self.codec.build_arp(
            sender_mac,
            Ipv4Addr::UNSPECIFIED,
            BROADCAST_MAC,
            target_ip,
            ArpKind::Request,
        );
        for attempt in 1..=self.config.probe.attempts {
            if let Err(e) = state.scheduler.send(&name, &frame) {
                tracing::warn!(
                    "probe {} of {} on {} not sent: {}",
                    attempt,
                    target_ip,
                    name,
                    e
                );
            }
            thread::sleep(self.config.probe.interval);
            if let Err(e) = self.drain(&mut state) {
                tracing::error!("capture drain failed during probe: {:?}", e);
            }
            if state.context.state() == ProbeState::MatchFound {
                break;
            }
        }

        let outcome = state.context.conclude();
        let device = state.context.device().map(|d| d.name.as_str()).unwrap_or_default();
        match (outcome, state.context.conflicting_mac()) {
            (ProbeState::MatchFound, Some(mac)) => {
                tracing::info!("{} is in use by {} (seen from {})", target_ip, mac, device)
            }
            _ => tracing::debug!("no answer for {} on {}", target_ip, device),
        }
        state.context.finish()
    }

    /// Drains the capture once, dispatching every observation, then sends the
    /// defenses the observations asked for.
    fn drain(&self, state: &mut EngineState) -> Result<usize> {
        let EngineState {
            scheduler,
            context,
            tracker,
        } = state;
        let mut local: Option<Vec<Device>> = None;
        let mut defenses = vec![];
        let count = scheduler.drain_once(|observation| {
            let local = local.get_or_insert_with(|| self.devices.snapshot(self.provider.as_ref()));
            self.on_observation(context, tracker, observation, local, &mut defenses);
        })?;

        for defense in defenses {
            let frame = self.codec.build_arp(
                defense.mac,
                defense.ip,
                BROADCAST_MAC,
                defense.ip,
                ArpKind::Request,
            );
            match scheduler.send(&defense.device, &frame) {
                Ok(()) => tracing::info!("defending {} on {}", defense.ip, defense.device),
                Err(e) => tracing::error!("gratuitous arp send fail : {}", e),
            }
        }
        Ok(count)
    }

    fn on_observation(
        &self,
        context: &mut CheckContext,
        tracker: &mut ConflictTracker,
        observation: Observation,
        local: &[Device],
        defenses: &mut Vec<Defense>,
    ) {
        if observation.kind == ArpKind::Reply
            && context.record_reply(observation.source_ip, observation.source_mac)
        {
            tracing::debug!(
                "probe of {} answered by {}",
                observation.source_ip,
                observation.source_mac
            );
        }

        if observation.source_ip.is_unspecified()
            || local.iter().any(|d| d.mac == Some(observation.source_mac))
        {
            return;
        }

        let owner = local
            .iter()
            .find(|d| d.ip == Some(observation.source_ip))
            .and_then(|d| d.mac.map(|mac| (d, mac)));
        let (device, local_mac) = match owner {
            Some(owner) => owner,
            None => {
                let released =
                    tracker.observe_release(observation.source_ip, observation.source_mac);
                for event in released {
                    self.notifier.notify(event);
                }
                return;
            }
        };

        let now = Instant::now();
        if let Some(event) = tracker.observe_claim(
            &device.name,
            observation.source_ip,
            local_mac,
            observation.source_mac,
            now,
        ) {
            self.notifier.notify(event);
        }
        if device.mode == DefendMode::Active
            && tracker.defend_due(
                observation.source_ip,
                observation.source_mac,
                self.config.defend_interval,
                now,
            )
        {
            defenses.push(Defense {
                device: device.name.clone(),
                ip: observation.source_ip,
                mac: local_mac,
            });
        }
    }

    fn expire_conflicts(&self, state: &mut EngineState) {
        if state.tracker.is_empty() {
            return;
        }
        let mut owned = vec![];
        let mut unreadable = vec![];
        for (spec, device) in self.devices.survey(self.provider.as_ref()) {
            match device.and_then(|d| d.ip) {
                Some(ip) => owned.push(ip),
                None => unreadable.push(spec.name.clone()),
            }
        }
        for event in state.tracker.expire(
            Instant::now(),
            self.config.conflict_hold,
            &owned,
            &unreadable,
        ) {
            self.notifier.notify(event);
        }
    }
}

impl std::fmt::Debug for ConflictEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictEngine")
            .field("devices", &self.devices)
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A started engine and its capture thread.
#[derive(Debug)]
pub struct EngineHandle {
    engine: Arc<ConflictEngine>,
    worker: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<ConflictEngine> {
        &self.engine
    }

    /// Stops the passive loop and waits for it to close the capture.
    pub fn stop(mut self) -> Result<()> {
        self.engine.stop();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
        }
        Ok(())
    }
}
