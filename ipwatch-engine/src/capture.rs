use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use pcap::{Active, Capture, Device, Linktype};

use crate::classifier::{FrameClassifier, Observation};
use crate::codec::{LinkLayer, PacketCodec};
use crate::policy::{PollConfig, PollPolicy};

/// The pcap pseudo-device capturing on every interface at once.
pub const ANY_DEVICE: &str = "any";
const ARP_FILTER: &str = "arp";
const SNAPLEN: i32 = 65535;
/// Upper bound of frames handed out by one dispatch, so a flood cannot pin the
/// lock forever.
const MAX_FRAMES_PER_DISPATCH: usize = 4096;

/// The capture handle as seen by the scheduler.
pub trait CaptureTransport: Send {
    fn link_layer(&self) -> LinkLayer;

    /// Waits at most `timeout` for traffic, then hands every frame currently
    /// buffered to `sink` in capture order. Returns the number of frames.
    fn dispatch(&mut self, timeout: Duration, sink: &mut dyn FnMut(&[u8])) -> Result<usize>;

    /// Transmits one complete link-layer frame on the named interface.
    fn send(&mut self, device: &str, frame: &[u8]) -> Result<()>;
}

/// libpcap capture on the "any" pseudo-device, restricted to ARP.
///
/// The handle runs in non-blocking mode and waits with `poll(2)`, which lets
/// the timeout change on every call.
pub struct PcapTransport {
    capture: Capture<Active>,
    link: LinkLayer,
    senders: HashMap<String, Capture<Active>>,
}

impl PcapTransport {
    pub fn open_any() -> Result<Self> {
        let devices = Device::list()
            .map_err(|e| anyhow!("unable to get network device list - {}", e))?;
        if !devices
            .iter()
            .any(|device| device.name.eq_ignore_ascii_case(ANY_DEVICE))
        {
            return Err(anyhow!(
                "pseudodevice \"{}\" used by libpcap is not available",
                ANY_DEVICE
            ));
        }

        let mut capture = Capture::from_device(ANY_DEVICE)
            .and_then(|inactive| {
                inactive
                    .promisc(false)
                    .snaplen(SNAPLEN)
                    .immediate_mode(true)
                    .open()
            })
            .map_err(|e| anyhow!("unable to create packet capture object - {}", e))?;
        capture
            .filter(ARP_FILTER, true)
            .map_err(|e| anyhow!("unable to set packet capture filter - {}", e))?;
        let capture = capture.setnonblock()?;

        let datalink = capture.get_datalink();
        let link = if datalink == Linktype::LINUX_SLL {
            LinkLayer::LinuxSll
        } else if datalink == Linktype::ETHERNET {
            LinkLayer::Ethernet
        } else {
            return Err(anyhow!("unsupported capture link type {:?}", datalink));
        };
        tracing::info!("capturing ARP on {:?} with link type {:?}", ANY_DEVICE, link);

        Ok(Self {
            capture,
            link,
            senders: HashMap::new(),
        })
    }

    fn sender(&mut self, device: &str) -> Result<&mut Capture<Active>> {
        if !self.senders.contains_key(device) {
            let capture = Capture::from_device(device)
                .and_then(|inactive| inactive.open())
                .map_err(|e| anyhow!("unable to open {} for sending - {}", device, e))?;
            self.senders.insert(device.to_string(), capture);
        }
        self.senders
            .get_mut(device)
            .ok_or_else(|| anyhow!("sender for {} vanished", device))
    }
}

/// Waits until `fd` is readable or `timeout` elapses.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(rc > 0)
}

impl CaptureTransport for PcapTransport {
    fn link_layer(&self) -> LinkLayer {
        self.link
    }

    fn dispatch(&mut self, timeout: Duration, sink: &mut dyn FnMut(&[u8])) -> Result<usize> {
        if !wait_readable(self.capture.as_raw_fd(), timeout)? {
            return Ok(0);
        }
        let mut count = 0;
        while count < MAX_FRAMES_PER_DISPATCH {
            match self.capture.next_packet() {
                Ok(packet) => {
                    sink(packet.data);
                    count += 1;
                }
                Err(pcap::Error::TimeoutExpired) | Err(pcap::Error::NoMorePackets) => break,
                Err(e) if count > 0 => {
                    tracing::debug!("capture read stopped after {} frames: {}", count, e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    fn send(&mut self, device: &str, frame: &[u8]) -> Result<()> {
        self.sender(device)?.sendpacket(frame)?;
        Ok(())
    }
}

/// Owns the single capture handle and its poll policy.
///
/// Every method expects the caller to hold the engine lock; the scheduler
/// itself is not synchronized.
pub struct CaptureScheduler {
    transport: Option<Box<dyn CaptureTransport>>,
    classifier: FrameClassifier,
    policy: PollPolicy,
}

impl CaptureScheduler {
    pub fn new(
        transport: Box<dyn CaptureTransport>,
        codec: Arc<dyn PacketCodec>,
        poll: PollConfig,
    ) -> Self {
        let classifier = FrameClassifier::new(codec, transport.link_layer());
        Self {
            transport: Some(transport),
            classifier,
            policy: PollPolicy::new(poll),
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Lowers the capture timeout so probe replies are seen quickly.
    pub fn begin_probe(&mut self) {
        self.policy.on_probe_begin();
    }

    /// Raises the capture timeout back to its idle value.
    pub fn settle(&mut self) {
        self.policy.on_passive_iteration();
    }

    /// Drains whatever is currently captured through the classifier and hands
    /// each observation to `on_observation`. Returns the number of frames read.
    pub fn drain_once(&mut self, mut on_observation: impl FnMut(Observation)) -> Result<usize> {
        let timeout = self.policy.current();
        let classifier = &self.classifier;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| anyhow!("capture handle is closed"))?;
        transport.dispatch(timeout, &mut |frame| {
            if let Some(observation) = classifier.classify(frame) {
                on_observation(observation);
            }
        })
    }

    pub fn send(&mut self, device: &str, frame: &[u8]) -> Result<()> {
        self.transport
            .as_mut()
            .ok_or_else(|| anyhow!("capture handle is closed"))?
            .send(device, frame)
    }

    /// Drops the capture handle; the scheduler cannot be used afterwards.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            tracing::info!("capture handle closed");
        }
    }
}

impl std::fmt::Debug for CaptureScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureScheduler")
            .field("closed", &self.is_closed())
            .field("policy", &self.policy)
            .finish()
    }
}
