//! interfaces.rs
//! Host network interface enumeration and the NetworkInterfaceWatcher.
//!
//! - `InterfaceSource` is the enumeration seam (system `getifaddrs`, or a fixed list)
//! - the watcher polls on its own thread, diffs against the last seen set and
//!   notifies every subscriber on change
//! - enumeration failures are logged and retried on the next tick

use crossbeam::channel::{Receiver, tick};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    io,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

const STOP_CHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetInterface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub up: bool,
    pub multicast: bool,
    pub loopback: bool,
}

impl NetInterface {
    pub fn can_multicast(&self) -> bool {
        self.up && self.multicast
    }
}

/// Up, multicast-capable interfaces only.
pub fn multicast_capable(interfaces: &[NetInterface]) -> Vec<NetInterface> {
    interfaces.iter().filter(|i| i.can_multicast()).cloned().collect()
}

pub trait InterfaceSource: Send + Sync {
    fn list(&self) -> io::Result<Vec<NetInterface>>;
}

/// IPv4 interfaces as reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    #[cfg(unix)]
    fn list(&self) -> io::Result<Vec<NetInterface>> {
        use std::ffi::CStr;

        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut out = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: cursor walks the list returned by getifaddrs, freed below
            let ifa = unsafe { &*cursor };
            cursor = ifa.ifa_next;

            if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
                continue;
            }
            let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
            if family != libc::AF_INET {
                continue;
            }
            let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
            let addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
                .to_string_lossy()
                .into_owned();
            let flags = ifa.ifa_flags as libc::c_int;

            out.push(NetInterface {
                name,
                addr,
                up: flags & libc::IFF_UP != 0,
                multicast: flags & libc::IFF_MULTICAST != 0,
                loopback: flags & libc::IFF_LOOPBACK != 0,
            });
        }
        unsafe { libc::freeifaddrs(head) };

        out.sort();
        Ok(out)
    }

    #[cfg(not(unix))]
    fn list(&self) -> io::Result<Vec<NetInterface>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface enumeration is only implemented for unix",
        ))
    }
}

/// A fixed, replaceable interface list. Pins the interface set when the
/// operator does not want the host's to be followed.
#[derive(Debug, Default)]
pub struct FixedInterfaces {
    interfaces: Mutex<Vec<NetInterface>>,
}

impl FixedInterfaces {
    pub fn new(interfaces: Vec<NetInterface>) -> Self {
        Self {
            interfaces: Mutex::new(interfaces),
        }
    }

    pub fn set(&self, interfaces: Vec<NetInterface>) {
        *self.interfaces.lock() = interfaces;
    }
}

impl InterfaceSource for FixedInterfaces {
    fn list(&self) -> io::Result<Vec<NetInterface>> {
        let mut list = self.interfaces.lock().clone();
        list.sort();
        Ok(list)
    }
}

pub type InterfaceSubscriber = Box<dyn Fn(&[NetInterface]) + Send>;

pub struct NetworkInterfaceWatcher {
    source: Arc<dyn InterfaceSource>,
    subscribers: Vec<InterfaceSubscriber>,
    last_seen: Option<Vec<NetInterface>>,
    poll: Duration,
}

impl NetworkInterfaceWatcher {
    pub fn new(source: Arc<dyn InterfaceSource>, poll: Duration) -> Self {
        Self {
            source,
            subscribers: Vec::new(),
            last_seen: None,
            poll,
        }
    }

    pub fn subscribe(&mut self, subscriber: InterfaceSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Sets the baseline without notifying anyone.
    pub fn prime(&mut self, mut interfaces: Vec<NetInterface>) {
        interfaces.sort();
        self.last_seen = Some(interfaces);
    }

    /// One enumeration pass. Returns true when subscribers were notified.
    pub fn poll_once(&mut self) -> bool {
        let mut current = match self.source.list() {
            Ok(list) => list,
            Err(e) => {
                warn!("[Interfaces] enumeration failed, retrying next tick: {}", e);
                return false;
            }
        };
        current.sort();

        if self.last_seen.as_ref() == Some(&current) {
            return false;
        }

        info!(
            "[Interfaces] interface set changed: {} interface(s), {} multicast-capable",
            current.len(),
            current.iter().filter(|i| i.can_multicast()).count()
        );
        for subscriber in &self.subscribers {
            subscriber(&current);
        }
        self.last_seen = Some(current);
        true
    }

    /// Polls until `running` clears.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        debug!("[Interfaces] watching every {:?}", self.poll);
        let ticker: Receiver<_> = tick(self.poll);
        while running.load(Ordering::Relaxed) {
            if ticker.recv_timeout(STOP_CHECK).is_ok() {
                self.poll_once();
            }
        }
        debug!("[Interfaces] watcher exiting");
    }
}
