//! tracked.rs
//! Tracked wire format: the world-state packet republished for external viewers.
//!
//! World state uses the hub's frame (y towards the attacked goal, x to the right).
//! The tracked frame puts x along the field length, so positions are rotated
//! by -90 degrees on the way out. With `flip` set the field ends are swapped,
//! which is a 180 degree rotation on top.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};

use crate::core::{
    clock::Timestamp,
    protocol::{BallState, RobotState, WorldState},
};

/// Upper bound for one tracked datagram.
pub const MAX_TRACKED_DATAGRAM: usize = 65_507;
pub const SOURCE_NAME: &str = "amun-hub";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Team {
    Unknown,
    Yellow,
    Blue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotId {
    pub id: u32,
    pub team: Team,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedBall {
    pub pos: Vector3,
    pub vel: Option<Vector3>,
    pub visibility: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRobot {
    pub robot_id: RobotId,
    pub pos: Vector2,
    pub orientation: f32,
    pub vel: Option<Vector2>,
    pub vel_angular: Option<f32>,
    pub visibility: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedFrame {
    pub frame_number: u32,
    /// Seconds since the unix epoch.
    pub timestamp: f64,
    pub balls: Vec<TrackedBall>,
    pub robots: Vec<TrackedRobot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerWrapperPacket {
    pub uuid: String,
    pub source_name: Option<String>,
    pub tracked_frame: Option<TrackedFrame>,
}

/// Builds tracked packets from world state, numbering frames as it goes.
#[derive(Debug, Clone)]
pub struct TrackedFrameBuilder {
    uuid: String,
    frame_number: u32,
    flip: bool,
}

impl TrackedFrameBuilder {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            frame_number: 0,
            flip: false,
        }
    }

    pub fn set_flip(&mut self, flip: bool) {
        self.flip = flip;
    }

    pub fn flip(&self) -> bool {
        self.flip
    }

    pub fn create(&mut self, world: &WorldState) -> TrackerWrapperPacket {
        let frame = TrackedFrame {
            frame_number: self.frame_number,
            timestamp: timestamp_secs(world.time),
            balls: world.balls.iter().map(|b| self.ball(b)).collect(),
            robots: world
                .yellow
                .iter()
                .map(|r| self.robot(r, Team::Yellow))
                .chain(world.blue.iter().map(|r| self.robot(r, Team::Blue)))
                .collect(),
        };
        self.frame_number = self.frame_number.wrapping_add(1);

        TrackerWrapperPacket {
            uuid: self.uuid.clone(),
            source_name: Some(SOURCE_NAME.to_string()),
            tracked_frame: Some(frame),
        }
    }

    fn position(&self, x: f32, y: f32) -> Vector2 {
        let (tx, ty) = (y, -x);
        if self.flip {
            Vector2 { x: -tx, y: -ty }
        } else {
            Vector2 { x: tx, y: ty }
        }
    }

    fn ball(&self, ball: &BallState) -> TrackedBall {
        let pos = self.position(ball.p_x, ball.p_y);
        let vel = self.position(ball.v_x, ball.v_y);
        TrackedBall {
            pos: Vector3 {
                x: pos.x,
                y: pos.y,
                z: ball.p_z,
            },
            vel: Some(Vector3 {
                x: vel.x,
                y: vel.y,
                z: ball.v_z,
            }),
            visibility: Some(1.0),
        }
    }

    fn robot(&self, robot: &RobotState, team: Team) -> TrackedRobot {
        let mut orientation = robot.phi - FRAC_PI_2;
        if self.flip {
            orientation += PI;
        }
        TrackedRobot {
            robot_id: RobotId { id: robot.id, team },
            pos: self.position(robot.p_x, robot.p_y),
            orientation: normalize_angle(orientation),
            vel: Some(self.position(robot.v_x, robot.v_y)),
            vel_angular: Some(robot.omega),
            visibility: Some(1.0),
        }
    }
}

/// Serializes into a buffer sized up front. `None` means the packet cannot be
/// represented and must not be sent.
pub fn encode(packet: &TrackerWrapperPacket) -> Option<Vec<u8>> {
    let size = bincode::serialized_size(packet).ok()? as usize;
    if size > MAX_TRACKED_DATAGRAM {
        return None;
    }
    let mut data = vec![0u8; size];
    bincode::serialize_into(&mut data[..], packet).ok()?;
    Some(data)
}

fn timestamp_secs(time: Timestamp) -> f64 {
    time as f64 * 1e-9
}

/// Wraps into (-pi, pi].
pub fn normalize_angle(angle: f32) -> f32 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}
