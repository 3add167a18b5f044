//! processor.rs
//! Processor boundary and its worker thread.
//!
//! Pipeline: routed vision / referee datagrams -> `Processor` -> world-state Status on each tick.
//! The worker owns the Processor exclusively; commands arrive as `ProcessorInput::Command`.
//! `FrameTracker` is the built-in Processor. It understands the detection frames
//! produced by the vision simulator and counts everything else as opaque.

use crossbeam::channel::{Receiver, select, tick};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    core::{
        clock::{LogicalClock, Timestamp},
        protocol::{
            BallState, Command, CommandMsg, Geometry, RawPacket, RobotState, StatusMsg, WorldState,
        },
    },
    hub::{
        router::{RouteGate, RoutedPacket, VisionSource},
        worker::StatusSender,
    },
};

const STOP_CHECK: Duration = Duration::from_millis(50);

pub enum ProcessorInput {
    Vision(RoutedPacket),
    /// Sent by the router while it holds the route lock.
    SourceSwitched { source: VisionSource, generation: u64 },
    Referee(RawPacket),
    Command(Command),
}

/// Turns raw datagrams into tracked state. Runs on the processor thread only.
pub trait Processor: Send {
    fn handle_vision_packet(&mut self, packet: &RawPacket, source: VisionSource);
    fn handle_referee_packet(&mut self, packet: &RawPacket);
    fn handle_command(&mut self, command: &CommandMsg);
    /// Called every processor tick with the logical time; returned statuses go to the hub.
    fn tick(&mut self, now: Timestamp) -> Vec<StatusMsg>;
    /// The connected vision upstream changed.
    fn source_switched(&mut self, _source: VisionSource) {}
}

// ============================================================================
// Detection frames
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBall {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRobot {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub orientation: f32,
}

/// One camera frame in the hub's coordinate frame (metres, radians).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub frame_number: u32,
    pub t_capture: Timestamp,
    pub camera_id: u32,
    pub balls: Vec<DetectionBall>,
    pub robots_yellow: Vec<DetectionRobot>,
    pub robots_blue: Vec<DetectionRobot>,
}

impl DetectionFrame {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        bincode::deserialize(payload).ok()
    }

    pub fn encode(&self) -> Option<Vec<u8>> {
        bincode::serialize(self).ok()
    }
}

// ============================================================================
// FrameTracker
// ============================================================================

#[derive(Default)]
pub struct FrameTracker {
    latest: Option<DetectionFrame>,
    previous_ball: Option<(Timestamp, DetectionBall)>,
    ball_velocity: (f32, f32),
    fresh: bool,
    geometry_sent: bool,
    transmission_delay_ns: i64,
    opaque_vision: u64,
    referee_packets: u64,
}

impl FrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opaque_vision_packets(&self) -> u64 {
        self.opaque_vision
    }

    pub fn referee_packets(&self) -> u64 {
        self.referee_packets
    }

    fn reset(&mut self) {
        self.latest = None;
        self.previous_ball = None;
        self.ball_velocity = (0.0, 0.0);
        self.fresh = false;
    }

    fn world_state(&self, frame: &DetectionFrame) -> WorldState {
        let robot = |r: &DetectionRobot| RobotState {
            id: r.id,
            p_x: r.x,
            p_y: r.y,
            phi: r.orientation,
            ..Default::default()
        };
        WorldState {
            time: frame.t_capture,
            balls: frame
                .balls
                .iter()
                .map(|b| BallState {
                    p_x: b.x,
                    p_y: b.y,
                    p_z: b.z,
                    v_x: self.ball_velocity.0,
                    v_y: self.ball_velocity.1,
                    v_z: 0.0,
                })
                .collect(),
            yellow: frame.robots_yellow.iter().map(robot).collect(),
            blue: frame.robots_blue.iter().map(robot).collect(),
        }
    }
}

impl Processor for FrameTracker {
    fn handle_vision_packet(&mut self, packet: &RawPacket, _source: VisionSource) {
        let Some(mut frame) = DetectionFrame::decode(&packet.payload) else {
            self.opaque_vision += 1;
            trace!("[Processor] opaque vision packet from {}", packet.host);
            return;
        };
        frame.t_capture = packet.received_at - self.transmission_delay_ns;

        if let Some(ball) = frame.balls.first().copied() {
            if let Some((t, prev)) = self.previous_ball {
                let dt = (frame.t_capture - t) as f32 * 1e-9;
                if dt > 0.0 {
                    self.ball_velocity = ((ball.x - prev.x) / dt, (ball.y - prev.y) / dt);
                }
            }
            self.previous_ball = Some((frame.t_capture, ball));
        }
        self.latest = Some(frame);
        self.fresh = true;
    }

    fn handle_referee_packet(&mut self, _packet: &RawPacket) {
        self.referee_packets += 1;
    }

    fn handle_command(&mut self, command: &CommandMsg) {
        if let Some(delay) = command
            .tracking
            .as_ref()
            .and_then(|t| t.vision_transmission_delay_ms)
        {
            self.transmission_delay_ns = delay as i64 * 1_000_000;
            debug!("[Processor] vision transmission delay {} ms", delay);
        }
    }

    fn tick(&mut self, _now: Timestamp) -> Vec<StatusMsg> {
        if !self.fresh {
            return Vec::new();
        }
        self.fresh = false;
        let Some(frame) = self.latest.as_ref() else {
            return Vec::new();
        };

        let mut status = StatusMsg {
            world_state: Some(self.world_state(frame)),
            ..Default::default()
        };
        if !self.geometry_sent {
            status.geometry = Some(Geometry::default());
            self.geometry_sent = true;
        }
        vec![status]
    }

    fn source_switched(&mut self, source: VisionSource) {
        debug!("[Processor] tracking reset, now fed by {}", source);
        self.reset();
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct ProcessorWorker {
    processor: Box<dyn Processor>,
    rx: Receiver<ProcessorInput>,
    status: StatusSender,
    clock: Arc<LogicalClock>,
    period: Duration,
    pin_core: Option<usize>,
    gate: RouteGate,
}

impl ProcessorWorker {
    pub fn new(
        processor: Box<dyn Processor>,
        rx: Receiver<ProcessorInput>,
        status: StatusSender,
        clock: Arc<LogicalClock>,
        period: Duration,
    ) -> Self {
        Self {
            processor,
            rx,
            status,
            clock,
            period,
            pin_core: None,
            gate: RouteGate::default(),
        }
    }

    pub fn pin_to_core(mut self, core: Option<usize>) -> Self {
        self.pin_core = core;
        self
    }

    pub fn run(mut self, running: Arc<AtomicBool>) {
        if let Some(id) = self.pin_core {
            if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                info!("[Processor] pinned to core {}", id);
            } else {
                warn!("[Processor] could not pin to core {}", id);
            }
        }
        info!("[Processor] started tick={:?}", self.period);

        let ticker = tick(self.period);
        let rx = self.rx.clone();
        while running.load(Ordering::Relaxed) {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(input) => self.handle(input),
                    Err(_) => {
                        debug!("[Processor] input closed; exiting");
                        break;
                    }
                },
                recv(ticker) -> _ => {
                    for status in self.processor.tick(self.clock.current_time()) {
                        self.status.send(status);
                    }
                },
                default(STOP_CHECK) => {}
            }
        }
        debug!("[Processor] exiting");
    }

    fn handle(&mut self, input: ProcessorInput) {
        match input {
            ProcessorInput::Vision(routed) => {
                if self.gate.admit(routed.generation) {
                    self.processor
                        .handle_vision_packet(&routed.packet, routed.source);
                } else {
                    trace!("[Processor] dropped stale frame from {}", routed.source);
                }
            }
            ProcessorInput::SourceSwitched { source, generation } => {
                self.gate.switched(generation);
                self.processor.source_switched(source);
            }
            ProcessorInput::Referee(packet) => self.processor.handle_referee_packet(&packet),
            ProcessorInput::Command(command) => self.processor.handle_command(&command),
        }
    }
}
