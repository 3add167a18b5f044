//! worker.rs
//! Thread plumbing shared by every hub worker.
//! - `spawn_worker` names the thread and arms a completion signal that fires
//!   even if the worker panics
//! - `WorkerThread::join_with_timeout` waits for that signal up to a budget and
//!   detaches the thread if it does not arrive
//! - `StatusSender` / `CommandSender` are the only way a worker talks back to the hub

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use std::{
    fmt, io,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::core::{
    error::{HubError, Result},
    protocol::{CommandMsg, StatusMsg},
};

/// Where a message entered the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    External,
    Strategy,
    Processor,
    Network,
    Simulator,
    Hub,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Origin::External => "external",
            Origin::Strategy => "strategy",
            Origin::Processor => "processor",
            Origin::Network => "network",
            Origin::Simulator => "simulator",
            Origin::Hub => "hub",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct StatusEnvelope {
    pub origin: Origin,
    pub status: StatusMsg,
}

#[derive(Debug)]
pub struct CommandEnvelope {
    pub origin: Origin,
    pub command: CommandMsg,
}

/// Status path into the hub. Cloneable; one per producing worker.
#[derive(Clone)]
pub struct StatusSender {
    origin: Origin,
    tx: Sender<StatusEnvelope>,
}

impl StatusSender {
    pub fn new(origin: Origin, tx: Sender<StatusEnvelope>) -> Self {
        Self { origin, tx }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Fire-and-forget. False once the hub is gone.
    pub fn send(&self, status: StatusMsg) -> bool {
        self.tx
            .send(StatusEnvelope {
                origin: self.origin,
                status,
            })
            .is_ok()
    }
}

/// Command path into the hub. Validation happens on the hub thread.
#[derive(Clone)]
pub struct CommandSender {
    origin: Origin,
    tx: Sender<CommandEnvelope>,
}

impl CommandSender {
    pub fn new(origin: Origin, tx: Sender<CommandEnvelope>) -> Self {
        Self { origin, tx }
    }

    pub fn send(&self, command: CommandMsg) -> Result<()> {
        self.tx
            .send(CommandEnvelope {
                origin: self.origin,
                command,
            })
            .map_err(|_| HubError::Stopped)
    }
}

struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct WorkerThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

pub fn spawn_worker<F>(name: &str, body: F) -> io::Result<WorkerThread>
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = channel::bounded(1);
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        let _guard = DoneGuard(done_tx);
        body();
    })?;
    debug!("[Hub] spawned {}", name);
    Ok(WorkerThread {
        name: name.to_string(),
        handle: Some(handle),
        done: done_rx,
    })
}

impl WorkerThread {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the thread finished within `timeout`. Otherwise it is detached.
    pub fn join_with_timeout(mut self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        error!("[Hub] worker {} panicked", self.name);
                    }
                }
                debug!("[Hub] {} stopped", self.name);
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "[Hub] worker {} did not stop within {:?}, detaching it",
                    self.name, timeout
                );
                self.handle.take();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    #[test]
    fn joins_a_finished_worker() {
        let worker = spawn_worker("quick", || {}).unwrap();
        assert_eq!(worker.name(), "quick");
        assert!(worker.join_with_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn panicking_worker_still_signals_done() {
        let worker = spawn_worker("panics", || panic!("boom")).unwrap();
        assert!(worker.join_with_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn stuck_worker_is_detached() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();
        let worker = spawn_worker("stuck", move || {
            while !flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert!(!worker.join_with_timeout(Duration::from_millis(30)));
        release.store(true, Ordering::Relaxed);
    }

    #[test]
    fn senders_tag_origin() {
        let (tx, rx) = channel::unbounded();
        let sender = StatusSender::new(Origin::Strategy, tx);
        assert!(sender.send(StatusMsg::debug_log("s", "hi")));
        assert_eq!(rx.recv().unwrap().origin, Origin::Strategy);

        drop(rx);
        assert!(!sender.send(StatusMsg::default()));

        let (tx, rx) = channel::unbounded();
        let commands = CommandSender::new(Origin::External, tx);
        commands.send(CommandMsg::default().with_speed(2.0)).unwrap();
        assert_eq!(rx.recv().unwrap().command.speed, Some(2.0));
    }
}
