//! receiver.rs
//! Per-stream UDP listener (vision or referee).
//! - owns its socket exclusively; other threads reach it only through `ReceiverCtl`
//! - stamps every datagram with the logical clock and the sender's host on arrival
//! - fans each datagram out synchronously to its sinks on this thread, so sinks must not block
//! - a bind failure becomes a `port_bind_error` Status (once per port), never a panic
//!
//! State: Idle -> Listening -> Idle, passing through Updating while rebinding.

use crossbeam::channel::{self, Sender};
use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    core::{
        clock::LogicalClock,
        protocol::{RawPacket, StatusMsg, StreamKind},
    },
    hub::worker::StatusSender,
    net::interfaces::{NetInterface, multicast_capable},
    utils::metrics::HubMetrics,
};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;
const BIND_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub stream: StreamKind,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum ReceiverCtl {
    UpdatePort(u16),
    UpdateInterfaces(Vec<NetInterface>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReceiverState {
    Idle = 0,
    Listening = 1,
    Updating = 2,
}

impl ReceiverState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReceiverState::Listening,
            2 => ReceiverState::Updating,
            _ => ReceiverState::Idle,
        }
    }
}

/// Consumer of received datagrams. Runs on the receiver thread.
pub trait PacketSink: Send {
    fn deliver(&mut self, packet: &RawPacket);
}

impl<F> PacketSink for F
where
    F: FnMut(&RawPacket) + Send,
{
    fn deliver(&mut self, packet: &RawPacket) {
        self(packet)
    }
}

/// Cross-thread view of a running receiver.
#[derive(Clone)]
pub struct ReceiverHandle {
    stream: StreamKind,
    ctl: Sender<ReceiverCtl>,
    state: Arc<AtomicU8>,
    bound_port: Arc<AtomicU16>,
}

impl ReceiverHandle {
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn state(&self) -> ReceiverState {
        ReceiverState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Port currently bound, 0 while unbound.
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    pub fn update_port(&self, port: u16) {
        let _ = self.ctl.send(ReceiverCtl::UpdatePort(port));
    }

    pub fn update_interfaces(&self, interfaces: Vec<NetInterface>) {
        let _ = self.ctl.send(ReceiverCtl::UpdateInterfaces(interfaces));
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    clock: Arc<LogicalClock>,
    status: StatusSender,
    metrics: Arc<HubMetrics>,
    sinks: Vec<Box<dyn PacketSink>>,
    ctl_rx: channel::Receiver<ReceiverCtl>,

    socket: Option<UdpSocket>,
    interfaces: Vec<NetInterface>,
    joined: Vec<Ipv4Addr>,
    bind_error_reported: Option<u16>,
    last_bind_attempt: Option<Instant>,

    state: Arc<AtomicU8>,
    bound_port: Arc<AtomicU16>,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        clock: Arc<LogicalClock>,
        status: StatusSender,
        metrics: Arc<HubMetrics>,
    ) -> (Self, ReceiverHandle) {
        let (ctl_tx, ctl_rx) = channel::unbounded();
        let state = Arc::new(AtomicU8::new(ReceiverState::Idle as u8));
        let bound_port = Arc::new(AtomicU16::new(0));
        let handle = ReceiverHandle {
            stream: config.stream,
            ctl: ctl_tx,
            state: state.clone(),
            bound_port: bound_port.clone(),
        };
        let receiver = Self {
            config,
            clock,
            status,
            metrics,
            sinks: Vec::new(),
            ctl_rx,
            socket: None,
            interfaces: Vec::new(),
            joined: Vec::new(),
            bind_error_reported: None,
            last_bind_attempt: None,
            state,
            bound_port,
        };
        (receiver, handle)
    }

    pub fn add_sink(&mut self, sink: Box<dyn PacketSink>) {
        self.sinks.push(sink);
    }

    /// Interface set used for multicast membership until the next update.
    pub fn with_interfaces(mut self, interfaces: Vec<NetInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Receive loop. Returns once `running` clears; the socket is closed on exit.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        let tag = self.config.stream;
        self.start_listen();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        while running.load(Ordering::Relaxed) {
            while let Ok(ctl) = self.ctl_rx.try_recv() {
                self.apply(ctl);
            }

            let received = self.socket.as_ref().map(|s| s.recv_from(&mut buf));
            match received {
                Some(Ok((len, from))) => self.dispatch(&buf[..len], from),
                Some(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Some(Err(e)) => {
                    warn!("[Receiver {}] receive failed: {}", tag, e);
                }
                None => {
                    if let Ok(ctl) = self.ctl_rx.recv_timeout(self.config.read_timeout) {
                        self.apply(ctl);
                    } else if self
                        .last_bind_attempt
                        .is_none_or(|t| t.elapsed() >= BIND_RETRY)
                    {
                        self.start_listen();
                    }
                }
            }
        }

        self.close();
        debug!("[Receiver {}] exiting", tag);
    }

    /// Binds the configured address/port and joins the multicast group.
    pub fn start_listen(&mut self) {
        let port = self.config.port;
        self.last_bind_attempt = Some(Instant::now());
        match self.open_socket(port) {
            Ok(socket) => {
                self.socket = Some(socket);
                self.bind_error_reported = None;
                self.joined.clear();
                self.sync_membership();
                self.bound_port.store(port, Ordering::Release);
                self.state
                    .store(ReceiverState::Listening as u8, Ordering::Release);
                info!(
                    "[Receiver {}] listening on {}:{}",
                    self.config.stream, self.config.addr, port
                );
            }
            Err(e) => {
                self.state.store(ReceiverState::Idle as u8, Ordering::Release);
                if self.bind_error_reported != Some(port) {
                    warn!(
                        "[Receiver {}] cannot bind {}:{}: {}",
                        self.config.stream, self.config.addr, port, e
                    );
                    self.status.send(StatusMsg::port_bind_error(
                        self.config.stream,
                        port,
                        e.to_string(),
                    ));
                    self.bind_error_reported = Some(port);
                }
            }
        }
    }

    /// Closes the socket and rebinds at the same address on `port`.
    /// Datagrams arriving during the swap may be lost.
    pub fn update_port(&mut self, port: u16) {
        if port == self.config.port && self.socket.is_some() {
            return;
        }
        self.state
            .store(ReceiverState::Updating as u8, Ordering::Release);
        info!(
            "[Receiver {}] port {} -> {}",
            self.config.stream, self.config.port, port
        );
        self.close();
        self.config.port = port;
        self.start_listen();
    }

    /// Re-syncs group membership with the given interface set.
    pub fn update_interfaces(&mut self, interfaces: Vec<NetInterface>) {
        self.interfaces = interfaces;
        if self.socket.is_some() {
            self.state
                .store(ReceiverState::Updating as u8, Ordering::Release);
            self.sync_membership();
            self.state
                .store(ReceiverState::Listening as u8, Ordering::Release);
        }
    }

    fn apply(&mut self, ctl: ReceiverCtl) {
        match ctl {
            ReceiverCtl::UpdatePort(port) => self.update_port(port),
            ReceiverCtl::UpdateInterfaces(list) => self.update_interfaces(list),
        }
    }

    fn dispatch(&mut self, payload: &[u8], from: SocketAddr) {
        let packet = RawPacket {
            payload: payload.to_vec(),
            received_at: self.clock.current_time(),
            host: from.ip().to_string(),
        };
        trace!(
            "[Receiver {}] {} bytes from {}",
            self.config.stream,
            payload.len(),
            packet.host
        );
        self.metrics.record_packet(self.config.stream);
        for sink in self.sinks.iter_mut() {
            sink.deliver(&packet);
        }
    }

    fn open_socket(&self, port: u16) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        let bind_ip = if self.config.addr.is_multicast() {
            // several processes on one host listen to the same group
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
            Ipv4Addr::UNSPECIFIED
        } else {
            self.config.addr
        };
        socket.bind(&SockAddr::from(SocketAddrV4::new(bind_ip, port)))?;
        socket.set_read_timeout(Some(self.config.read_timeout))?;
        Ok(socket.into())
    }

    fn sync_membership(&mut self) {
        let group = self.config.addr;
        if !group.is_multicast() {
            return;
        }
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let mut wanted: Vec<Ipv4Addr> = multicast_capable(&self.interfaces)
            .iter()
            .map(|i| i.addr)
            .collect();
        if wanted.is_empty() {
            wanted.push(Ipv4Addr::UNSPECIFIED);
        }

        self.joined.retain(|iface| {
            if wanted.contains(iface) {
                return true;
            }
            if let Err(e) = socket.leave_multicast_v4(&group, iface) {
                debug!("[Receiver] leave {} on {} failed: {}", group, iface, e);
            }
            false
        });

        for iface in wanted {
            if self.joined.contains(&iface) {
                continue;
            }
            match socket.join_multicast_v4(&group, &iface) {
                Ok(()) => {
                    debug!("[Receiver {}] joined {} on {}", self.config.stream, group, iface);
                    self.joined.push(iface);
                }
                Err(e) => warn!(
                    "[Receiver {}] join {} on {} failed: {}",
                    self.config.stream, group, iface, e
                ),
            }
        }
    }

    fn close(&mut self) {
        self.socket = None;
        self.joined.clear();
        self.bound_port.store(0, Ordering::Release);
        self.state.store(ReceiverState::Idle as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::worker::{Origin, StatusEnvelope};
    use std::thread;

    fn local_receiver(port: u16) -> (Receiver, ReceiverHandle, channel::Receiver<StatusEnvelope>) {
        let (status_tx, status_rx) = channel::unbounded();
        let (receiver, handle) = Receiver::new(
            ReceiverConfig {
                stream: StreamKind::Referee,
                addr: Ipv4Addr::LOCALHOST,
                port,
                read_timeout: Duration::from_millis(10),
            },
            Arc::new(LogicalClock::new()),
            StatusSender::new(Origin::Network, status_tx),
            Arc::new(HubMetrics::new()),
        );
        (receiver, handle, status_rx)
    }

    #[test]
    fn delivers_payload_with_host_and_time() {
        let (mut receiver, handle, _status) = local_receiver(38411);
        let (tx, rx) = channel::unbounded();
        receiver.add_sink(Box::new(move |p: &RawPacket| {
            let _ = tx.send(p.clone());
        }));
        let before = receiver.clock.current_time();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let worker = thread::spawn(move || receiver.run(flag));

        while handle.bound_port() != 38411 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.state(), ReceiverState::Listening);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"\x01\x02\x03", "127.0.0.1:38411").unwrap();

        let packet = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(packet.payload, vec![1, 2, 3]);
        assert_eq!(packet.host, "127.0.0.1");
        assert!(packet.received_at >= before);

        running.store(false, Ordering::Relaxed);
        worker.join().unwrap();
        assert_eq!(handle.state(), ReceiverState::Idle);
        assert_eq!(handle.bound_port(), 0);
    }

    #[test]
    fn bind_error_reported_once_per_port() {
        let blocker = UdpSocket::bind("127.0.0.1:38412").unwrap();
        let (mut receiver, _handle, status) = local_receiver(38412);

        receiver.start_listen();
        receiver.start_listen();

        let fault = status.try_recv().unwrap();
        assert_eq!(fault.origin, Origin::Network);
        let err = fault.status.amun_state.unwrap().port_bind_error.unwrap();
        assert_eq!(err.stream, StreamKind::Referee);
        assert_eq!(err.port, 38412);
        assert!(status.try_recv().is_err());
        assert!(receiver.socket.is_none());

        drop(blocker);
        receiver.start_listen();
        assert!(receiver.socket.is_some());
    }
}
