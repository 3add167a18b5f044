//! publisher.rs
//! VisionTrackedPublisher: world-state Status -> tracked wire packet -> Multicaster.
//! - runs on its own thread, fed by the hub through `PublisherInput`
//! - a frame that fails to serialize is dropped, never sent partially
//! - port or interface changes rebuild the multicaster wholesale

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    core::protocol::{Status, StatusMsg},
    net::{
        interfaces::{InterfaceSource, NetInterface},
        multicaster::{Multicaster, SendReport},
        tracked::{TrackedFrameBuilder, encode},
    },
    utils::metrics::HubMetrics,
};

const STOP_CHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub enum PublisherInput {
    Status(Status),
    UpdatePort(u16),
    SetFlip(bool),
    Interfaces(Vec<NetInterface>),
}

pub struct VisionTrackedPublisher {
    addr: Ipv4Addr,
    port: u16,
    builder: TrackedFrameBuilder,
    multicaster: Multicaster,
    interfaces: Arc<dyn InterfaceSource>,
    metrics: Arc<HubMetrics>,
}

impl VisionTrackedPublisher {
    pub fn new(
        addr: Ipv4Addr,
        port: u16,
        interfaces: Arc<dyn InterfaceSource>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        let multicaster = Multicaster::open(SocketAddrV4::new(addr, port), interfaces.as_ref());
        Self {
            addr,
            port,
            builder: TrackedFrameBuilder::new(format!("{:016x}", rand::random::<u64>())),
            multicaster,
            interfaces,
            metrics,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn flip(&self) -> bool {
        self.builder.flip()
    }

    /// Publishes the world state carried by `status`, if any.
    pub fn handle_status(&mut self, status: &StatusMsg) -> Option<SendReport> {
        let world = status.world_state.as_ref()?;
        let packet = self.builder.create(world);
        let Some(data) = encode(&packet) else {
            debug!("[Publisher] tracked frame could not be serialized, dropped");
            self.metrics.record_tracked_dropped();
            return None;
        };
        let report = self.multicaster.send(&data);
        self.metrics.record_tracked_published(report.delivered, report.failed());
        Some(report)
    }

    pub fn set_flip(&mut self, flip: bool) {
        if flip != self.builder.flip() {
            info!("[Publisher] flip {}", if flip { "on" } else { "off" });
        }
        self.builder.set_flip(flip);
    }

    /// Reopens the multicaster on the new port.
    pub fn update_port(&mut self, port: u16) {
        info!("[Publisher] tracker port {} -> {}", self.port, port);
        self.port = port;
        self.reopen(None);
    }

    pub fn update_interfaces(&mut self, interfaces: &[NetInterface]) {
        self.reopen(Some(interfaces));
    }

    fn reopen(&mut self, interfaces: Option<&[NetInterface]>) {
        let dest = SocketAddrV4::new(self.addr, self.port);
        self.multicaster = match interfaces {
            Some(list) => Multicaster::open_on(dest, list),
            None => Multicaster::open(dest, self.interfaces.as_ref()),
        };
    }

    pub fn run(mut self, rx: Receiver<PublisherInput>, running: Arc<AtomicBool>) {
        debug!("[Publisher] started on {}:{}", self.addr, self.port);
        while running.load(Ordering::Relaxed) {
            match rx.recv_timeout(STOP_CHECK) {
                Ok(PublisherInput::Status(status)) => {
                    self.handle_status(&status);
                }
                Ok(PublisherInput::UpdatePort(port)) => self.update_port(port),
                Ok(PublisherInput::SetFlip(flip)) => self.set_flip(flip),
                Ok(PublisherInput::Interfaces(list)) => self.update_interfaces(&list),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("[Publisher] exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::protocol::{BallState, WorldState},
        net::{interfaces::FixedInterfaces, tracked::TrackerWrapperPacket},
    };
    use std::net::UdpSocket;

    fn listener() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn publisher(port: u16) -> VisionTrackedPublisher {
        VisionTrackedPublisher::new(
            Ipv4Addr::LOCALHOST,
            port,
            Arc::new(FixedInterfaces::default()),
            Arc::new(HubMetrics::new()),
        )
    }

    fn world_status(x: f32) -> StatusMsg {
        StatusMsg {
            world_state: Some(WorldState {
                balls: vec![BallState {
                    p_x: x,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn recv_packet(socket: &UdpSocket) -> TrackerWrapperPacket {
        let mut buf = [0u8; 2048];
        let n = socket.recv(&mut buf).unwrap();
        bincode::deserialize(&buf[..n]).unwrap()
    }

    #[test]
    fn publishes_world_state_only() {
        let (socket, port) = listener();
        let mut publisher = publisher(port);

        assert!(publisher.handle_status(&StatusMsg::debug_log("x", "y")).is_none());

        let report = publisher.handle_status(&world_status(1.0)).unwrap();
        assert_eq!(report.delivered, 1);
        let packet = recv_packet(&socket);
        let ball = &packet.tracked_frame.unwrap().balls[0];
        assert_eq!(ball.pos.y, -1.0);
    }

    #[test]
    fn flip_applies_to_following_frames() {
        let (socket, port) = listener();
        let mut publisher = publisher(port);
        publisher.set_flip(true);
        publisher.handle_status(&world_status(1.0));
        let ball = &recv_packet(&socket).tracked_frame.unwrap().balls[0];
        assert_eq!(ball.pos.y, 1.0);
    }

    #[test]
    fn update_port_moves_the_destination() {
        let (old_socket, old_port) = listener();
        let (new_socket, new_port) = listener();
        let mut publisher = publisher(old_port);

        publisher.update_port(new_port);
        assert_eq!(publisher.port(), new_port);
        publisher.handle_status(&world_status(2.0));

        recv_packet(&new_socket);
        old_socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(old_socket.recv(&mut buf).is_err());
    }
}
