#![allow(dead_code)]

use amun_hub::{
    HubConfig,
    core::{clock::Timestamp, protocol::CommandMsg, protocol::RawPacket, protocol::StatusMsg},
    hub::{processor::Processor, router::VisionSource},
    net::{
        interfaces::{FixedInterfaces, NetInterface},
        multicaster::{Multicaster, SendReport},
    },
};
use parking_lot::Mutex;
use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

pub fn loopback() -> NetInterface {
    NetInterface {
        name: "lo".into(),
        addr: Ipv4Addr::LOCALHOST,
        up: true,
        multicast: true,
        loopback: true,
    }
}

pub fn loopback_interfaces() -> Arc<FixedInterfaces> {
    Arc::new(FixedInterfaces::new(vec![loopback()]))
}

/// Every endpoint on 127.0.0.1, unicast, with fast shutdown.
pub fn localhost_config(vision_port: u16, referee_port: u16, tracker_port: u16) -> HubConfig {
    HubConfig {
        vision_addr: Ipv4Addr::LOCALHOST,
        vision_port,
        referee_addr: Ipv4Addr::LOCALHOST,
        referee_port,
        tracker_addr: Ipv4Addr::LOCALHOST,
        tracker_port,
        shutdown_timeout: Duration::from_millis(500),
        simulator_period: Duration::from_millis(2),
        processor_tick: Duration::from_millis(5),
        ..HubConfig::default()
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub fn send_datagram(port: u16, payload: &[u8]) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.send_to(payload, (Ipv4Addr::LOCALHOST, port)).unwrap();
}

/// Sends one datagram to `group` out of the loopback interface.
pub fn send_multicast(group: Ipv4Addr, port: u16, payload: &[u8]) -> SendReport {
    Multicaster::open_on(SocketAddrV4::new(group, port), &[loopback()]).send(payload)
}

/// What a `RecordingProcessor` saw, readable from the test thread.
#[derive(Debug, Default)]
pub struct Observed {
    pub vision: Vec<(VisionSource, RawPacket)>,
    pub referee: Vec<RawPacket>,
    pub commands: Vec<CommandMsg>,
    pub switches: Vec<VisionSource>,
    /// Vision packets from a source other than the connected one.
    pub violations: usize,
}

pub struct RecordingProcessor {
    observed: Arc<Mutex<Observed>>,
    connected: VisionSource,
}

impl RecordingProcessor {
    pub fn new(connected: VisionSource) -> (Self, Arc<Mutex<Observed>>) {
        let observed = Arc::new(Mutex::new(Observed::default()));
        (
            Self {
                observed: observed.clone(),
                connected,
            },
            observed,
        )
    }
}

impl Processor for RecordingProcessor {
    fn handle_vision_packet(&mut self, packet: &RawPacket, source: VisionSource) {
        let mut observed = self.observed.lock();
        if source != self.connected {
            observed.violations += 1;
        }
        observed.vision.push((source, packet.clone()));
    }

    fn handle_referee_packet(&mut self, packet: &RawPacket) {
        self.observed.lock().referee.push(packet.clone());
    }

    fn handle_command(&mut self, command: &CommandMsg) {
        self.observed.lock().commands.push(command.clone());
    }

    fn tick(&mut self, _now: Timestamp) -> Vec<StatusMsg> {
        Vec::new()
    }

    fn source_switched(&mut self, source: VisionSource) {
        self.connected = source;
        self.observed.lock().switches.push(source);
    }
}

/// First value `pick` extracts from the stream within `timeout`.
pub fn next_matching<T, U>(
    rx: &crossbeam::channel::Receiver<T>,
    timeout: Duration,
    mut pick: impl FnMut(&T) -> Option<U>,
) -> Option<U> {
    let deadline = Instant::now() + timeout;
    while let Ok(item) = rx.recv_deadline(deadline) {
        if let Some(found) = pick(&item) {
            return Some(found);
        }
    }
    None
}
