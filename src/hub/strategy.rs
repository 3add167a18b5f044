//! strategy.rs
//! Strategy boundary and its worker thread.
//!
//! The strategy sees tracking/referee Status, the commands it subscribed to and
//! referee host changes. Whatever it wants to say goes into `StrategyOutput` and
//! re-enters the hub through the ordinary command and status paths.
//! `ScriptSupervisor` is the built-in Strategy: it follows script load/reload/close
//! commands and reports script state, without interpreting the script.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    core::protocol::{
        Command, CommandMsg, ScriptState, Status, StatusMsg, StrategyState,
    },
    hub::worker::{CommandSender, StatusSender},
};

const STOP_CHECK: Duration = Duration::from_millis(50);
const DEBUG_SOURCE: &str = "autoref";

#[derive(Debug)]
pub enum StrategyInput {
    Status(Status),
    Command(Command),
    RefereeHost(String),
}

#[derive(Debug, Default)]
pub struct StrategyOutput {
    pub commands: Vec<CommandMsg>,
    pub statuses: Vec<StatusMsg>,
}

impl StrategyOutput {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.statuses.is_empty()
    }
}

pub trait Strategy: Send {
    fn handle_command(&mut self, command: &CommandMsg, out: &mut StrategyOutput);
    fn handle_status(&mut self, status: &StatusMsg, out: &mut StrategyOutput);
    fn handle_referee_host(&mut self, host: &str, out: &mut StrategyOutput);
}

// ============================================================================
// ScriptSupervisor
// ============================================================================

#[derive(Debug, Default)]
pub struct ScriptSupervisor {
    state: StrategyState,
    referee_host: Option<String>,
    frames_seen: u64,
    last_game_state: Option<String>,
}

impl ScriptSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    fn open(&mut self, out: &mut StrategyOutput) {
        let Some(filename) = self.state.filename.clone() else {
            self.log(out, "no script to reload");
            return;
        };
        if Path::new(&filename).is_file() {
            self.state.state = ScriptState::Running;
            info!("[Strategy] script {} loaded", filename);
            self.log(out, format!("loaded {}", filename));
        } else {
            self.state.state = ScriptState::Failed;
            warn!("[Strategy] script {} not found", filename);
            self.log(out, format!("cannot open {}", filename));
        }
    }

    fn log(&self, out: &mut StrategyOutput, text: impl Into<String>) {
        out.statuses.push(StatusMsg::debug_log(DEBUG_SOURCE, text));
    }

    fn report(&self, out: &mut StrategyOutput) {
        out.statuses.push(StatusMsg {
            strategy_autoref: Some(self.state.clone()),
            ..Default::default()
        });
    }
}

impl Strategy for ScriptSupervisor {
    fn handle_command(&mut self, command: &CommandMsg, out: &mut StrategyOutput) {
        let Some(cmd) = command.strategy_autoref.as_ref() else {
            return;
        };
        let before = self.state.clone();

        if let Some(enable) = cmd.enable_debug {
            self.state.debug_enabled = enable;
        }
        if let Some(load) = cmd.load.as_ref() {
            self.state.filename = Some(load.filename.clone());
            self.state.entry_point = load.entry_point.clone();
            self.open(out);
        } else if cmd.reload {
            self.open(out);
        }
        if cmd.close {
            self.state.state = ScriptState::Closed;
            self.log(out, "script closed");
        }

        if self.state != before {
            self.report(out);
        }
    }

    fn handle_status(&mut self, status: &StatusMsg, out: &mut StrategyOutput) {
        if self.state.state != ScriptState::Running {
            return;
        }
        if status.world_state.is_some() {
            self.frames_seen += 1;
        }
        if let Some(game) = status.game_state.as_ref() {
            if self.last_game_state.as_deref() != Some(game.state.as_str()) {
                if self.state.debug_enabled {
                    self.log(out, format!("game state {}", game.state));
                }
                self.last_game_state = Some(game.state.clone());
            }
        }
    }

    fn handle_referee_host(&mut self, host: &str, out: &mut StrategyOutput) {
        if self.referee_host.as_deref() == Some(host) {
            return;
        }
        self.referee_host = Some(host.to_string());
        if self.state.debug_enabled {
            self.log(out, format!("referee source {}", host));
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct StrategyWorker {
    strategy: Box<dyn Strategy>,
    rx: Receiver<StrategyInput>,
    status: StatusSender,
    commands: CommandSender,
}

impl StrategyWorker {
    pub fn new(
        strategy: Box<dyn Strategy>,
        rx: Receiver<StrategyInput>,
        status: StatusSender,
        commands: CommandSender,
    ) -> Self {
        Self {
            strategy,
            rx,
            status,
            commands,
        }
    }

    pub fn run(mut self, running: Arc<AtomicBool>) {
        debug!("[Strategy] started");
        while running.load(Ordering::Relaxed) {
            let input = match self.rx.recv_timeout(STOP_CHECK) {
                Ok(input) => input,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let mut out = StrategyOutput::default();
            match &input {
                StrategyInput::Status(status) => self.strategy.handle_status(status, &mut out),
                StrategyInput::Command(command) => self.strategy.handle_command(command, &mut out),
                StrategyInput::RefereeHost(host) => {
                    self.strategy.handle_referee_host(host, &mut out)
                }
            }
            self.flush(out);
        }
        debug!("[Strategy] exiting");
    }

    fn flush(&self, out: StrategyOutput) {
        for status in out.statuses {
            self.status.send(status);
        }
        for command in out.commands {
            if let Err(e) = self.commands.send(command) {
                debug!("[Strategy] command dropped: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(path: &str) -> CommandMsg {
        CommandMsg::default().with_script(path, Some("init".into()))
    }

    #[test]
    fn load_existing_script_runs() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut supervisor = ScriptSupervisor::new();
        let mut out = StrategyOutput::default();

        supervisor.handle_command(&load(file.path().to_str().unwrap()), &mut out);

        assert_eq!(supervisor.state().state, ScriptState::Running);
        assert_eq!(supervisor.state().entry_point.as_deref(), Some("init"));
        assert!(supervisor.state().debug_enabled);
        let reported = out
            .statuses
            .iter()
            .find_map(|s| s.strategy_autoref.as_ref())
            .unwrap();
        assert_eq!(reported.state, ScriptState::Running);
        assert!(out.statuses.iter().any(|s| !s.debug.is_empty()));
    }

    #[test]
    fn missing_script_fails() {
        let mut supervisor = ScriptSupervisor::new();
        let mut out = StrategyOutput::default();
        supervisor.handle_command(&load("/definitely/not/here.lua"), &mut out);
        assert_eq!(supervisor.state().state, ScriptState::Failed);
    }

    #[test]
    fn close_and_ignore_status_afterwards() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut supervisor = ScriptSupervisor::new();
        let mut out = StrategyOutput::default();
        supervisor.handle_command(&load(file.path().to_str().unwrap()), &mut out);

        let world = StatusMsg {
            world_state: Some(Default::default()),
            ..Default::default()
        };
        supervisor.handle_status(&world, &mut out);
        assert_eq!(supervisor.frames_seen(), 1);

        let mut close = CommandMsg::default();
        close.strategy_autoref = Some(crate::core::protocol::StrategyCommand {
            close: true,
            ..Default::default()
        });
        supervisor.handle_command(&close, &mut out);
        assert_eq!(supervisor.state().state, ScriptState::Closed);
        supervisor.handle_status(&world, &mut out);
        assert_eq!(supervisor.frames_seen(), 1);
    }

    #[test]
    fn referee_host_change_is_logged_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut supervisor = ScriptSupervisor::new();
        let mut out = StrategyOutput::default();
        supervisor.handle_command(&load(file.path().to_str().unwrap()), &mut out);

        let mut out = StrategyOutput::default();
        supervisor.handle_referee_host("10.0.0.7", &mut out);
        supervisor.handle_referee_host("10.0.0.7", &mut out);
        assert_eq!(out.statuses.len(), 1);
        assert!(out.statuses[0].debug[0].text.contains("10.0.0.7"));
    }
}
