//! protocol.rs
//! Command and Status messages exchanged between the hub, its workers and its listeners.
//!
//! Both are tree-shaped with optional sub-messages. Once handed to the hub they are
//! wrapped in an `Arc` and only ever read: every subscriber sees the same immutable value.

use serde::{Deserialize, Serialize};
use std::{fmt, ops::BitOr, sync::Arc};

use crate::core::{
    clock::Timestamp,
    error::{HubError, Result},
};

/// Shared, immutable command as seen by subscribers.
pub type Command = Arc<CommandMsg>;
/// Shared, immutable status as seen by listeners. `time` is set by the hub.
pub type Status = Arc<StatusMsg>;

// ============================================================================
// Interests
// ============================================================================

/// Which command sub-fields a subscriber wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const NETWORK: Interest = Interest(1 << 0);
    pub const SIMULATOR: Interest = Interest(1 << 1);
    pub const SPEED: Interest = Interest(1 << 2);
    pub const STRATEGY: Interest = Interest(1 << 3);
    pub const REFEREE: Interest = Interest(1 << 4);
    pub const TRACKING: Interest = Interest(1 << 5);
    pub const ALL: Interest = Interest(0b0011_1111);

    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

// ============================================================================
// Command
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amun: Option<AmunCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulator: Option<SimulatorCommand>,
    /// Time scaling factor; only applied to the clock while the simulator runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_autoref: Option<StrategyCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referee: Option<RefereeCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingCommand>,
}

/// Network reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmunCommand {
    pub vision_port: Option<u16>,
    pub referee_port: Option<u16>,
    pub tracker_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorCommand {
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyCommand {
    pub load: Option<LoadScript>,
    pub reload: bool,
    pub close: bool,
    pub enable_debug: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadScript {
    pub filename: String,
    pub entry_point: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefereeCommand {
    /// Playing field ends are swapped.
    pub flipped: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingCommand {
    pub vision_transmission_delay_ms: Option<u32>,
}

impl CommandMsg {
    pub fn with_vision_port(mut self, port: u16) -> Self {
        self.amun.get_or_insert_with(Default::default).vision_port = Some(port);
        self
    }

    pub fn with_referee_port(mut self, port: u16) -> Self {
        self.amun.get_or_insert_with(Default::default).referee_port = Some(port);
        self
    }

    pub fn with_tracker_port(mut self, port: u16) -> Self {
        self.amun.get_or_insert_with(Default::default).tracker_port = Some(port);
        self
    }

    pub fn with_simulator(mut self, enable: bool) -> Self {
        self.simulator = Some(SimulatorCommand { enable: Some(enable) });
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_flipped(mut self, flipped: bool) -> Self {
        self.referee = Some(RefereeCommand { flipped: Some(flipped) });
        self
    }

    pub fn with_script(mut self, filename: impl Into<String>, entry_point: Option<String>) -> Self {
        let strategy = self.strategy_autoref.get_or_insert_with(Default::default);
        strategy.load = Some(LoadScript {
            filename: filename.into(),
            entry_point,
        });
        strategy.enable_debug = Some(true);
        self
    }

    /// Interests touched by the populated sub-fields.
    pub fn interests(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.amun.is_some() {
            interest = interest | Interest::NETWORK;
        }
        if self.simulator.is_some() {
            interest = interest | Interest::SIMULATOR;
        }
        if self.speed.is_some() {
            interest = interest | Interest::SPEED;
        }
        if self.strategy_autoref.is_some() {
            interest = interest | Interest::STRATEGY;
        }
        if self.referee.is_some() {
            interest = interest | Interest::REFEREE;
        }
        if self.tracking.is_some() {
            interest = interest | Interest::TRACKING;
        }
        interest
    }

    /// Rejects commands no worker may observe.
    pub fn validate(&self) -> Result<()> {
        if let Some(amun) = &self.amun {
            for (what, port) in [
                ("vision", amun.vision_port),
                ("referee", amun.referee_port),
                ("tracker", amun.tracker_port),
            ] {
                if port == Some(0) {
                    return Err(HubError::InvalidPort { what, value: 0 });
                }
            }
        }
        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(HubError::InvalidScaling(speed as f64));
            }
        }
        if let Some(load) = self
            .strategy_autoref
            .as_ref()
            .and_then(|s| s.load.as_ref())
        {
            if load.filename.trim().is_empty() {
                return Err(HubError::InvalidCommand("empty script filename".into()));
            }
        }
        if self.interests().is_empty() {
            return Err(HubError::InvalidCommand("command carries no fields".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusMsg {
    /// Logical time of relay; overwritten by the hub.
    pub time: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_state: Option<WorldState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_state: Option<GameState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amun_state: Option<AmunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_autoref: Option<StrategyState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub debug: Vec<DebugLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldState {
    /// Capture time of the newest frame that went into this state.
    pub time: Timestamp,
    pub balls: Vec<BallState>,
    pub blue: Vec<RobotState>,
    pub yellow: Vec<RobotState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BallState {
    pub p_x: f32,
    pub p_y: f32,
    pub p_z: f32,
    pub v_x: f32,
    pub v_y: f32,
    pub v_z: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub id: u32,
    pub p_x: f32,
    pub p_y: f32,
    pub phi: f32,
    pub v_x: f32,
    pub v_y: f32,
    pub omega: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub field_width: f32,
    pub field_height: f32,
}

impl Default for Geometry {
    // division A field, metres
    fn default() -> Self {
        Self {
            field_width: 9.0,
            field_height: 12.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameState {
    pub stage: String,
    pub state: String,
    pub goals_flipped: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmunState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_bind_error: Option<PortBindError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulator_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBindError {
    pub stream: StreamKind,
    pub port: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Vision,
    Referee,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Vision => "vision",
            StreamKind::Referee => "referee",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptState {
    #[default]
    Closed,
    Running,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyState {
    pub state: ScriptState,
    pub filename: Option<String>,
    pub entry_point: Option<String>,
    pub debug_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLog {
    pub source: String,
    pub text: String,
}

impl StatusMsg {
    pub fn debug_log(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            debug: vec![DebugLog {
                source: source.into(),
                text: text.into(),
            }],
            ..Default::default()
        }
    }

    pub fn port_bind_error(stream: StreamKind, port: u16, reason: impl Into<String>) -> Self {
        Self {
            amun_state: Some(AmunState {
                port_bind_error: Some(PortBindError {
                    stream,
                    port,
                    reason: reason.into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Carries tracking, geometry or referee state, i.e. input for the strategy.
    pub fn is_game_input(&self) -> bool {
        self.world_state.is_some() || self.geometry.is_some() || self.game_state.is_some()
    }
}

// ============================================================================
// Raw datagrams
// ============================================================================

/// One inbound datagram with its arrival metadata. The payload is opaque here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub payload: Vec<u8>,
    pub received_at: Timestamp,
    pub host: String,
}
