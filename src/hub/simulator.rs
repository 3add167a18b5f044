//! simulator.rs
//! Simulated vision source.
//!
//! While enabled, emits one detection frame per period into the router as
//! `VisionSource::Simulator`. The period is in logical time, so a clock scaled
//! by 2.0 produces frames twice as often in real time. No physics: the ball
//! follows an ellipse with a little measurement noise, robots stand still.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
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
        protocol::RawPacket,
    },
    hub::{
        processor::{DetectionBall, DetectionFrame, DetectionRobot},
        router::{VisionRouter, VisionSource},
    },
    utils::metrics::HubMetrics,
};

const STOP_CHECK: Duration = Duration::from_millis(50);
const NOISE_M: f32 = 0.002;
pub const SIMULATOR_HOST: &str = "simulator";

#[derive(Debug, Clone, Copy)]
pub enum SimulatorCtl {
    Enable(bool),
}

pub struct VisionSimulator {
    router: Arc<VisionRouter>,
    clock: Arc<LogicalClock>,
    metrics: Arc<HubMetrics>,
    ctl: Receiver<SimulatorCtl>,
    period: Duration,
    enabled: bool,
    /// Logical time the ball path is measured from.
    start: Timestamp,
    frame_number: u32,
    rng: StdRng,
}

impl VisionSimulator {
    pub fn new(
        router: Arc<VisionRouter>,
        clock: Arc<LogicalClock>,
        metrics: Arc<HubMetrics>,
        ctl: Receiver<SimulatorCtl>,
        period: Duration,
        enabled: bool,
    ) -> Self {
        let start = clock.current_time();
        Self {
            router,
            clock,
            metrics,
            ctl,
            period,
            enabled,
            start,
            frame_number: 0,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    pub fn run(mut self, running: Arc<AtomicBool>) {
        info!("[Simulator] ready, period {:?}", self.period);
        while running.load(Ordering::Relaxed) {
            while let Ok(ctl) = self.ctl.try_recv() {
                self.apply(ctl);
            }

            if !self.enabled {
                match self.ctl.recv_timeout(STOP_CHECK) {
                    Ok(ctl) => self.apply(ctl),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            self.emit();

            // one period of logical time, slept in slices so stop and ctl stay responsive
            let wait = self.period.as_secs_f64() / self.clock.scaling();
            let mut remaining = Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX);
            while !remaining.is_zero() && running.load(Ordering::Relaxed) && self.ctl.is_empty() {
                let step = remaining.min(STOP_CHECK);
                spin_sleep::sleep(step);
                remaining -= step;
            }
        }
        debug!("[Simulator] exiting");
    }

    fn apply(&mut self, ctl: SimulatorCtl) {
        match ctl {
            SimulatorCtl::Enable(enable) if enable != self.enabled => {
                self.enabled = enable;
                info!("[Simulator] {}", if enable { "enabled" } else { "disabled" });
            }
            SimulatorCtl::Enable(_) => {}
        }
    }

    /// Builds and routes one frame. False if the simulator is not the connected source.
    pub fn emit(&mut self) -> bool {
        let now = self.clock.current_time();
        let frame = self.frame(now);
        let Some(payload) = frame.encode() else {
            return false;
        };
        let delivered = self.router.deliver(
            VisionSource::Simulator,
            RawPacket {
                payload,
                received_at: now,
                host: SIMULATOR_HOST.to_string(),
            },
        );
        if delivered {
            self.metrics.record_simulated_frame();
        }
        delivered
    }

    fn frame(&mut self, now: Timestamp) -> DetectionFrame {
        // f64 until the offset is small; f32 cannot resolve seconds at epoch scale
        let phase = ((now - self.start) as f64 * 1e-9 * 0.5) as f32;
        let ball = DetectionBall {
            x: 1.5 * phase.cos() + self.noise(),
            y: 3.0 * phase.sin() + self.noise(),
            z: 0.0,
        };
        let line = |id: u32, y: f32| DetectionRobot {
            id,
            x: -1.5 + id as f32,
            y,
            orientation: if y < 0.0 {
                std::f32::consts::FRAC_PI_2
            } else {
                -std::f32::consts::FRAC_PI_2
            },
        };

        let frame = DetectionFrame {
            frame_number: self.frame_number,
            t_capture: now,
            camera_id: 0,
            balls: vec![ball],
            robots_yellow: (0..4).map(|id| line(id, -2.0)).collect(),
            robots_blue: (0..4).map(|id| line(id, 2.0)).collect(),
        };
        self.frame_number = self.frame_number.wrapping_add(1);
        frame
    }

    fn noise(&mut self) -> f32 {
        self.rng.random_range(-NOISE_M..NOISE_M)
    }
}
