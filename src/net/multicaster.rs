//! multicaster.rs
//! Fan-out UDP sender: one outbound socket per multicast-capable interface,
//! all aimed at the same destination. `send` writes the payload on each one.
//! A failed write is logged and does not stop the remaining outlets.
//!
//! The socket set is never patched in place. A new destination or interface
//! set means a new `Multicaster`.

use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
};

use crate::net::interfaces::{InterfaceSource, NetInterface, multicast_capable};

/// One way out of the host.
pub trait Outlet: Send {
    fn send(&self, payload: &[u8]) -> io::Result<usize>;
    fn label(&self) -> &str;
}

/// UDP socket whose multicast traffic leaves through a single interface.
pub struct InterfaceSocket {
    socket: UdpSocket,
    label: String,
}

impl InterfaceSocket {
    pub fn open(dest: SocketAddrV4, iface: Option<&NetInterface>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if dest.ip().is_multicast() {
            if let Some(iface) = iface {
                socket.set_multicast_if_v4(&iface.addr)?;
            }
            socket.set_multicast_loop_v4(true)?;
            socket.set_multicast_ttl_v4(1)?;
        }
        socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.connect(&SockAddr::from(dest))?;

        let label = match iface {
            Some(i) => format!("{} ({})", i.name, i.addr),
            None => "default route".to_string(),
        };
        Ok(Self {
            socket: socket.into(),
            label,
        })
    }
}

impl Outlet for InterfaceSocket {
    fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub attempted: usize,
    pub delivered: usize,
}

impl SendReport {
    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

pub struct Multicaster {
    dest: SocketAddrV4,
    outlets: Vec<Box<dyn Outlet>>,
}

impl Multicaster {
    /// Enumerates interfaces now and opens one socket per multicast-capable one.
    /// Never fails: enumeration or socket errors leave fewer outlets.
    pub fn open(dest: SocketAddrV4, source: &dyn InterfaceSource) -> Self {
        let interfaces = source.list().unwrap_or_else(|e| {
            warn!("[Multicaster] interface enumeration failed: {}", e);
            Vec::new()
        });
        Self::open_on(dest, &interfaces)
    }

    pub fn open_on(dest: SocketAddrV4, interfaces: &[NetInterface]) -> Self {
        let mut outlets: Vec<Box<dyn Outlet>> = Vec::new();

        if !dest.ip().is_multicast() {
            // unicast destination: the routing table picks the interface
            match InterfaceSocket::open(dest, None) {
                Ok(s) => outlets.push(Box::new(s)),
                Err(e) => warn!("[Multicaster] cannot open socket to {}: {}", dest, e),
            }
        } else {
            for iface in multicast_capable(interfaces) {
                match InterfaceSocket::open(dest, Some(&iface)) {
                    Ok(s) => {
                        debug!("[Multicaster] {} via {}", dest, s.label());
                        outlets.push(Box::new(s));
                    }
                    Err(e) => warn!(
                        "[Multicaster] cannot open {} via {}: {}",
                        dest, iface.name, e
                    ),
                }
            }
            if outlets.is_empty() {
                warn!("[Multicaster] no multicast-capable interface for {}", dest);
            }
        }

        info!("[Multicaster] {} open on {} socket(s)", dest, outlets.len());
        Self { dest, outlets }
    }

    pub fn from_outlets(dest: SocketAddrV4, outlets: Vec<Box<dyn Outlet>>) -> Self {
        Self { dest, outlets }
    }

    pub fn destination(&self) -> SocketAddrV4 {
        self.dest
    }

    pub fn outlet_count(&self) -> usize {
        self.outlets.len()
    }

    /// Writes `payload` once per outlet.
    pub fn send(&self, payload: &[u8]) -> SendReport {
        let mut report = SendReport {
            attempted: self.outlets.len(),
            delivered: 0,
        };
        for outlet in &self.outlets {
            match outlet.send(payload) {
                Ok(_) => report.delivered += 1,
                Err(e) => warn!(
                    "[Multicaster] write to {} via {} failed: {}",
                    self.dest,
                    outlet.label(),
                    e
                ),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::interfaces::FixedInterfaces;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    struct CountingOutlet {
        writes: Arc<AtomicUsize>,
        broken: bool,
    }

    impl Outlet for CountingOutlet {
        fn send(&self, payload: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "link down"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(payload.len())
        }

        fn label(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn one_broken_interface_does_not_block_the_rest() {
        let writes = Arc::new(AtomicUsize::new(0));
        let outlets: Vec<Box<dyn Outlet>> = (0..4)
            .map(|i| {
                Box::new(CountingOutlet {
                    writes: writes.clone(),
                    broken: i == 1,
                }) as Box<dyn Outlet>
            })
            .collect();
        let dest = SocketAddrV4::new(Ipv4Addr::new(224, 5, 23, 2), 10010);
        let multicaster = Multicaster::from_outlets(dest, outlets);

        let report = multicaster.send(&[0u8; 64]);
        assert_eq!(report.attempted, 4);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed(), 1);
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn skips_interfaces_that_cannot_multicast() {
        let dest = SocketAddrV4::new(Ipv4Addr::new(224, 5, 23, 2), 10010);
        let source = FixedInterfaces::new(vec![NetInterface {
            name: "dummy0".into(),
            addr: Ipv4Addr::new(10, 0, 0, 1),
            up: true,
            multicast: false,
            loopback: false,
        }]);
        let multicaster = Multicaster::open(dest, &source);
        assert_eq!(multicaster.outlet_count(), 0);
        assert_eq!(multicaster.send(b"frame").attempted, 0);
    }

    #[test]
    fn unicast_destination_uses_one_socket() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let multicaster = Multicaster::open_on(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), &[]);
        assert_eq!(multicaster.outlet_count(), 1);
        assert_eq!(multicaster.send(b"tracked").delivered, 1);

        let mut buf = [0u8; 16];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"tracked");
    }
}
