//! router.rs
//! Routing table for the Processor's vision input.
//!
//! Exactly one upstream (network receiver or simulator) is connected at a time.
//! `switch` swaps the current source and bumps a generation counter under one
//! short lock, and pushes a switch marker downstream while still holding it, so
//! the marker precedes every packet of the new generation. `deliver` reads the
//! route under the lock but sends after releasing it; a packet that loses the
//! race carries the old generation and is discarded by `RouteGate`.

use crossbeam::channel::Sender;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{core::protocol::RawPacket, hub::processor::ProcessorInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VisionSource {
    Network,
    Simulator,
}

impl fmt::Display for VisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisionSource::Network => f.write_str("network"),
            VisionSource::Simulator => f.write_str("simulator"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutedPacket {
    pub source: VisionSource,
    pub generation: u64,
    pub packet: RawPacket,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    current: VisionSource,
    generation: u64,
}

pub struct VisionRouter {
    route: Mutex<Route>,
    downstream: Sender<ProcessorInput>,
}

impl VisionRouter {
    pub fn new(initial: VisionSource, downstream: Sender<ProcessorInput>) -> Self {
        Self {
            route: Mutex::new(Route {
                current: initial,
                generation: 0,
            }),
            downstream,
        }
    }

    pub fn current(&self) -> VisionSource {
        self.route.lock().current
    }

    pub fn generation(&self) -> u64 {
        self.route.lock().generation
    }

    /// Forwards `packet` if `source` is the connected upstream.
    pub fn deliver(&self, source: VisionSource, packet: RawPacket) -> bool {
        let generation = {
            let route = self.route.lock();
            if route.current != source {
                return false;
            }
            route.generation
        };
        self.downstream
            .send(ProcessorInput::Vision(RoutedPacket {
                source,
                generation,
                packet,
            }))
            .is_ok()
    }

    /// Connects `source`, disconnecting the previous one. No-op if already connected.
    pub fn switch(&self, source: VisionSource) -> bool {
        let mut route = self.route.lock();
        if route.current == source {
            debug!("[Router] {} already connected", source);
            return false;
        }
        route.current = source;
        route.generation += 1;
        let _ = self.downstream.send(ProcessorInput::SourceSwitched {
            source,
            generation: route.generation,
        });
        info!(
            "[Router] vision source -> {} (generation {})",
            source, route.generation
        );
        true
    }
}

/// Downstream half of the routing table: admits a packet only if its
/// generation is not older than the latest switch seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteGate {
    latest: u64,
}

impl RouteGate {
    pub fn switched(&mut self, generation: u64) {
        self.latest = self.latest.max(generation);
    }

    pub fn admit(&mut self, generation: u64) -> bool {
        if generation < self.latest {
            return false;
        }
        self.latest = generation;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    fn packet(tag: u8) -> RawPacket {
        RawPacket {
            payload: vec![tag],
            received_at: 0,
            host: "test".into(),
        }
    }

    #[test]
    fn only_connected_source_is_forwarded() {
        let (tx, rx) = channel::unbounded();
        let router = VisionRouter::new(VisionSource::Network, tx);

        assert!(router.deliver(VisionSource::Network, packet(1)));
        assert!(!router.deliver(VisionSource::Simulator, packet(2)));
        assert!(router.switch(VisionSource::Simulator));
        assert!(!router.switch(VisionSource::Simulator));
        assert!(!router.deliver(VisionSource::Network, packet(3)));
        assert!(router.deliver(VisionSource::Simulator, packet(4)));

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 3);
        assert!(matches!(&got[0], ProcessorInput::Vision(p) if p.packet.payload == vec![1]));
        assert!(matches!(
            &got[1],
            ProcessorInput::SourceSwitched { source: VisionSource::Simulator, generation: 1 }
        ));
        assert!(matches!(&got[2], ProcessorInput::Vision(p) if p.generation == 1));
    }

    #[test]
    fn gate_drops_stale_generations() {
        let mut gate = RouteGate::default();
        assert!(gate.admit(0));
        gate.switched(1);
        assert!(!gate.admit(0));
        assert!(gate.admit(1));
        assert!(gate.admit(2));
        assert!(!gate.admit(1));
    }

    #[test]
    fn rapid_toggling_never_mixes_sources() {
        let (tx, rx) = channel::unbounded();
        let router = Arc::new(VisionRouter::new(VisionSource::Network, tx));
        let running = Arc::new(AtomicBool::new(true));

        let feeders: Vec<_> = [VisionSource::Network, VisionSource::Simulator]
            .into_iter()
            .map(|source| {
                let router = router.clone();
                let running = running.clone();
                thread::spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        router.deliver(source, packet(0));
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let source = if i % 2 == 0 {
                VisionSource::Simulator
            } else {
                VisionSource::Network
            };
            router.switch(source);
        }
        running.store(false, Ordering::Relaxed);
        for f in feeders {
            f.join().unwrap();
        }

        let mut gate = RouteGate::default();
        let mut connected = VisionSource::Network;
        let mut violations = 0;
        for input in rx.try_iter() {
            match input {
                ProcessorInput::SourceSwitched { source, generation } => {
                    gate.switched(generation);
                    connected = source;
                }
                ProcessorInput::Vision(p) => {
                    if gate.admit(p.generation) && p.source != connected {
                        violations += 1;
                    }
                }
                _ => {}
            }
        }
        assert_eq!(violations, 0);
    }
}
