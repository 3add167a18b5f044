//! orchestrator.rs
//! The hub: owns every worker thread, the Command/Status fan-out and live reconfiguration.
//!
//! Threads: hub relay, processor, strategy, tracked publisher, vision simulator,
//! vision receiver, referee receiver, interface watcher.
//!
//! - Commands enter through one channel, are validated on the hub thread and only
//!   then broadcast to subscribers whose interest matches the populated fields
//! - every Status is stamped with the logical clock at the moment it is relayed
//! - the relay never blocks on a subscriber: all inboxes are unbounded channels,
//!   and a listener whose channel is gone is pruned
//! - simulator toggles swap the Processor's vision upstream through `VisionRouter`
//! - `start` builds every worker and all wiring before the first thread starts;
//!   `stop` clears the running flag and joins each thread within the shutdown budget

use crossbeam::channel::{self, Receiver, Sender, select};
use log::{debug, info, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    core::{
        clock::LogicalClock,
        config::HubConfig,
        error::{HubError, Result},
        protocol::{
            AmunState, Command, CommandMsg, Interest, RawPacket, Status, StatusMsg, StreamKind,
        },
    },
    hub::{
        processor::{FrameTracker, Processor, ProcessorInput, ProcessorWorker},
        router::{VisionRouter, VisionSource},
        simulator::{SimulatorCtl, VisionSimulator},
        strategy::{ScriptSupervisor, Strategy, StrategyInput, StrategyWorker},
        worker::{
            CommandEnvelope, CommandSender, Origin, StatusEnvelope, StatusSender, WorkerThread,
            spawn_worker,
        },
    },
    net::{
        interfaces::{InterfaceSource, NetInterface, NetworkInterfaceWatcher, SystemInterfaces},
        publisher::{PublisherInput, VisionTrackedPublisher},
        receiver::{Receiver as UdpReceiver, ReceiverConfig, ReceiverHandle},
    },
    utils::metrics::HubMetrics,
};

const STOP_CHECK: Duration = Duration::from_millis(50);

const PROCESSOR_INTEREST: Interest = Interest::TRACKING
    .union(Interest::SIMULATOR)
    .union(Interest::REFEREE);
const STRATEGY_INTEREST: Interest = Interest::STRATEGY.union(Interest::REFEREE);

enum HubCtl {
    SubscribeStatus(Sender<Status>),
    SubscribeCommands(Interest, Sender<Command>),
    SubscribeRefereeHost(Sender<String>),
}

enum CommandSink {
    Processor(Sender<ProcessorInput>),
    Strategy(Sender<StrategyInput>),
    External(Sender<Command>),
}

impl CommandSink {
    fn send(&self, command: &Command) -> bool {
        match self {
            CommandSink::Processor(tx) => tx.send(ProcessorInput::Command(command.clone())).is_ok(),
            CommandSink::Strategy(tx) => tx.send(StrategyInput::Command(command.clone())).is_ok(),
            CommandSink::External(tx) => tx.send(command.clone()).is_ok(),
        }
    }
}

struct CommandSubscriber {
    interest: Interest,
    sink: CommandSink,
}

// ============================================================================
// Builder
// ============================================================================

pub struct OrchestratorBuilder {
    config: HubConfig,
    processor: Option<Box<dyn Processor>>,
    strategy: Option<Box<dyn Strategy>>,
    interfaces: Option<Arc<dyn InterfaceSource>>,
    clock: Option<Arc<LogicalClock>>,
}

impl OrchestratorBuilder {
    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    pub fn strategy(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    pub fn interfaces(mut self, source: Arc<dyn InterfaceSource>) -> Self {
        self.interfaces = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<LogicalClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let (command_tx, command_rx) = channel::unbounded();
        let (status_tx, status_rx) = channel::unbounded();
        let (host_tx, host_rx) = channel::unbounded();
        let (ctl_tx, ctl_rx) = channel::unbounded();

        Ok(Orchestrator {
            config: self.config,
            clock: self.clock.unwrap_or_else(|| Arc::new(LogicalClock::new())),
            metrics: Arc::new(HubMetrics::new()),
            running: Arc::new(AtomicBool::new(false)),
            command_tx,
            status_tx,
            host_tx,
            ctl_tx,
            pending: Some(Pending {
                processor: self
                    .processor
                    .unwrap_or_else(|| Box::new(FrameTracker::new())),
                strategy: self
                    .strategy
                    .unwrap_or_else(|| Box::new(ScriptSupervisor::new())),
                interfaces: self
                    .interfaces
                    .unwrap_or_else(|| Arc::new(SystemInterfaces)),
                command_rx,
                status_rx,
                host_rx,
                ctl_rx,
            }),
            workers: Vec::new(),
            receivers: Vec::new(),
            stopped: false,
        })
    }
}

/// Everything `start` consumes.
struct Pending {
    processor: Box<dyn Processor>,
    strategy: Box<dyn Strategy>,
    interfaces: Arc<dyn InterfaceSource>,
    command_rx: Receiver<CommandEnvelope>,
    status_rx: Receiver<StatusEnvelope>,
    host_rx: Receiver<String>,
    ctl_rx: Receiver<HubCtl>,
}

/// Built workers waiting for their threads.
struct Launch {
    core: HubCore,
    processor: ProcessorWorker,
    strategy: StrategyWorker,
    publisher: VisionTrackedPublisher,
    publisher_rx: Receiver<PublisherInput>,
    simulator: VisionSimulator,
    vision: UdpReceiver,
    referee: UdpReceiver,
    watcher: NetworkInterfaceWatcher,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    config: HubConfig,
    clock: Arc<LogicalClock>,
    metrics: Arc<HubMetrics>,
    running: Arc<AtomicBool>,
    command_tx: Sender<CommandEnvelope>,
    status_tx: Sender<StatusEnvelope>,
    host_tx: Sender<String>,
    ctl_tx: Sender<HubCtl>,
    pending: Option<Pending>,
    workers: Vec<WorkerThread>,
    receivers: Vec<ReceiverHandle>,
    stopped: bool,
}

impl Orchestrator {
    pub fn builder(config: HubConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            processor: None,
            strategy: None,
            interfaces: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<LogicalClock> {
        self.clock.clone()
    }

    pub fn metrics(&self) -> Arc<HubMetrics> {
        self.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Builds all workers and their wiring, then starts every thread.
    pub fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(HubError::Stopped);
        }
        let pending = self.pending.take().ok_or(HubError::AlreadyStarted)?;
        let cfg = self.config.clone();

        let (processor_tx, processor_rx) = channel::unbounded();
        let (strategy_tx, strategy_rx) = channel::unbounded();
        let (publisher_tx, publisher_rx) = channel::unbounded();
        let (simulator_tx, simulator_rx) = channel::unbounded();

        let initial_source = if cfg.simulator_only {
            VisionSource::Simulator
        } else {
            VisionSource::Network
        };
        let router = Arc::new(VisionRouter::new(initial_source, processor_tx.clone()));

        let interfaces = pending.interfaces.list().unwrap_or_else(|e| {
            warn!("[Hub] interface enumeration failed at startup: {}", e);
            Vec::new()
        });

        // receivers
        let (vision, vision_handle) = UdpReceiver::new(
            ReceiverConfig {
                stream: StreamKind::Vision,
                addr: cfg.vision_addr,
                port: cfg.vision_port,
                read_timeout: cfg.receiver_read_timeout,
            },
            self.clock.clone(),
            StatusSender::new(Origin::Network, self.status_tx.clone()),
            self.metrics.clone(),
        );
        let mut vision = vision.with_interfaces(interfaces.clone());
        {
            let router = router.clone();
            vision.add_sink(Box::new(move |packet: &RawPacket| {
                router.deliver(VisionSource::Network, packet.clone());
            }));
        }

        let (referee, referee_handle) = UdpReceiver::new(
            ReceiverConfig {
                stream: StreamKind::Referee,
                addr: cfg.referee_addr,
                port: cfg.referee_port,
                read_timeout: cfg.receiver_read_timeout,
            },
            self.clock.clone(),
            StatusSender::new(Origin::Network, self.status_tx.clone()),
            self.metrics.clone(),
        );
        let mut referee = referee.with_interfaces(interfaces.clone());
        {
            let tx = processor_tx.clone();
            referee.add_sink(Box::new(move |packet: &RawPacket| {
                let _ = tx.send(ProcessorInput::Referee(packet.clone()));
            }));
        }
        {
            let host_tx = self.host_tx.clone();
            let mut last_host: Option<String> = None;
            referee.add_sink(Box::new(move |packet: &RawPacket| {
                if last_host.as_deref() != Some(packet.host.as_str()) {
                    last_host = Some(packet.host.clone());
                    let _ = host_tx.send(packet.host.clone());
                }
            }));
        }

        let publisher = VisionTrackedPublisher::new(
            cfg.tracker_addr,
            cfg.tracker_port,
            pending.interfaces.clone(),
            self.metrics.clone(),
        );

        let processor = ProcessorWorker::new(
            pending.processor,
            processor_rx,
            StatusSender::new(Origin::Processor, self.status_tx.clone()),
            self.clock.clone(),
            cfg.processor_tick,
        )
        .pin_to_core(cfg.pin_processor_core);

        let strategy = StrategyWorker::new(
            pending.strategy,
            strategy_rx,
            StatusSender::new(Origin::Strategy, self.status_tx.clone()),
            CommandSender::new(Origin::Strategy, self.command_tx.clone()),
        );

        let simulator = VisionSimulator::new(
            router.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            simulator_rx,
            cfg.simulator_period,
            cfg.simulator_only,
        );

        let mut watcher = NetworkInterfaceWatcher::new(pending.interfaces.clone(), cfg.interface_poll);
        watcher.prime(interfaces);
        {
            let vision = vision_handle.clone();
            let referee = referee_handle.clone();
            let publisher = publisher_tx.clone();
            watcher.subscribe(Box::new(move |list: &[NetInterface]| {
                vision.update_interfaces(list.to_vec());
                referee.update_interfaces(list.to_vec());
                let _ = publisher.send(PublisherInput::Interfaces(list.to_vec()));
            }));
        }

        let core = HubCore {
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            router,
            command_rx: pending.command_rx,
            status_rx: pending.status_rx,
            host_rx: pending.host_rx,
            ctl_rx: pending.ctl_rx,
            command_subscribers: vec![
                CommandSubscriber {
                    interest: PROCESSOR_INTEREST,
                    sink: CommandSink::Processor(processor_tx),
                },
                CommandSubscriber {
                    interest: STRATEGY_INTEREST,
                    sink: CommandSink::Strategy(strategy_tx.clone()),
                },
            ],
            status_listeners: Vec::new(),
            host_listeners: Vec::new(),
            strategy_tx,
            publisher_tx,
            simulator_tx,
            vision: vision_handle.clone(),
            referee: referee_handle.clone(),
            simulator_enabled: cfg.simulator_only,
            speed: 1.0,
        };
        self.receivers = vec![vision_handle, referee_handle];

        // wiring is complete; only threads start below
        self.running.store(true, Ordering::Release);
        let launched = self.launch(Launch {
            core,
            processor,
            strategy,
            publisher,
            publisher_rx,
            simulator,
            vision,
            referee,
            watcher,
        });
        if let Err(e) = launched {
            self.stop();
            return Err(e);
        }
        info!(
            "[Hub] started: vision {}:{} referee {}:{} tracker {}:{}{}",
            cfg.vision_addr,
            cfg.vision_port,
            cfg.referee_addr,
            cfg.referee_port,
            cfg.tracker_addr,
            cfg.tracker_port,
            if cfg.simulator_only { " (simulator)" } else { "" }
        );
        Ok(())
    }

    fn launch(&mut self, parts: Launch) -> Result<()> {
        let Launch {
            core,
            processor,
            strategy,
            publisher,
            publisher_rx,
            simulator,
            vision,
            referee,
            watcher,
        } = parts;

        let running = self.running.clone();
        self.spawn("amun-hub", move || core.run(running))?;
        let running = self.running.clone();
        self.spawn("amun-processor", move || processor.run(running))?;
        let running = self.running.clone();
        self.spawn("amun-strategy", move || strategy.run(running))?;
        let running = self.running.clone();
        self.spawn("amun-publisher", move || publisher.run(publisher_rx, running))?;
        let running = self.running.clone();
        self.spawn("amun-simulator", move || simulator.run(running))?;
        let running = self.running.clone();
        self.spawn("amun-vision", move || vision.run(running))?;
        let running = self.running.clone();
        self.spawn("amun-referee", move || referee.run(running))?;
        let running = self.running.clone();
        self.spawn("amun-interfaces", move || watcher.run(running))?;
        Ok(())
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let worker = spawn_worker(name, body)?;
        self.workers.push(worker);
        Ok(())
    }

    /// Asks every worker to quit and waits for each within the shutdown budget.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.pending = None;
        self.running.store(false, Ordering::Release);

        let budget = self.config.shutdown_timeout;
        let mut detached = 0;
        for worker in self.workers.drain(..) {
            if !worker.join_with_timeout(budget) {
                detached += 1;
            }
        }
        if detached == 0 {
            info!("[Hub] stopped");
        } else {
            warn!("[Hub] stopped with {} worker(s) detached", detached);
        }
    }

    /// Validates and enqueues a command from outside the hub.
    pub fn send_command(&self, command: CommandMsg) -> Result<()> {
        if self.stopped {
            return Err(HubError::Stopped);
        }
        if let Err(e) = command.validate() {
            self.metrics.record_command(false);
            return Err(e);
        }
        self.command_sender(Origin::External).send(command)
    }

    pub fn command_sender(&self, origin: Origin) -> CommandSender {
        CommandSender::new(origin, self.command_tx.clone())
    }

    /// Status path for producers outside the hub (GUI, log replay).
    pub fn status_sender(&self) -> StatusSender {
        StatusSender::new(Origin::External, self.status_tx.clone())
    }

    /// Every relayed Status, stamped.
    pub fn subscribe(&self) -> Receiver<Status> {
        let (tx, rx) = channel::unbounded();
        let _ = self.ctl_tx.send(HubCtl::SubscribeStatus(tx));
        rx
    }

    /// Validated commands touching any of `interest`.
    pub fn subscribe_commands(&self, interest: Interest) -> Receiver<Command> {
        let (tx, rx) = channel::unbounded();
        let _ = self.ctl_tx.send(HubCtl::SubscribeCommands(interest, tx));
        rx
    }

    /// Referee source host, once per change.
    pub fn subscribe_referee_host(&self) -> Receiver<String> {
        let (tx, rx) = channel::unbounded();
        let _ = self.ctl_tx.send(HubCtl::SubscribeRefereeHost(tx));
        rx
    }

    /// Port the given stream's receiver is bound to right now, 0 if none.
    pub fn bound_port(&self, stream: StreamKind) -> u16 {
        self.receivers
            .iter()
            .find(|r| r.stream() == stream)
            .map(|r| r.bound_port())
            .unwrap_or(0)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Hub thread
// ============================================================================

struct HubCore {
    clock: Arc<LogicalClock>,
    metrics: Arc<HubMetrics>,
    router: Arc<VisionRouter>,

    command_rx: Receiver<CommandEnvelope>,
    status_rx: Receiver<StatusEnvelope>,
    host_rx: Receiver<String>,
    ctl_rx: Receiver<HubCtl>,

    command_subscribers: Vec<CommandSubscriber>,
    status_listeners: Vec<Sender<Status>>,
    host_listeners: Vec<Sender<String>>,

    strategy_tx: Sender<StrategyInput>,
    publisher_tx: Sender<PublisherInput>,
    simulator_tx: Sender<SimulatorCtl>,
    vision: ReceiverHandle,
    referee: ReceiverHandle,

    simulator_enabled: bool,
    speed: f32,
}

impl HubCore {
    fn run(mut self, running: Arc<AtomicBool>) {
        info!("[Hub] relay running");
        let (ctl_rx, command_rx, status_rx, host_rx) = (
            self.ctl_rx.clone(),
            self.command_rx.clone(),
            self.status_rx.clone(),
            self.host_rx.clone(),
        );
        while running.load(Ordering::Relaxed) {
            select! {
                recv(ctl_rx) -> msg => match msg {
                    Ok(ctl) => self.apply_ctl(ctl),
                    Err(_) => break,
                },
                recv(command_rx) -> msg => match msg {
                    Ok(envelope) => {
                        self.drain_ctl();
                        self.ingest_command(envelope);
                    }
                    Err(_) => break,
                },
                recv(status_rx) -> msg => match msg {
                    Ok(envelope) => {
                        self.drain_ctl();
                        self.relay_status(envelope.origin, envelope.status);
                    }
                    Err(_) => break,
                },
                recv(host_rx) -> msg => match msg {
                    Ok(host) => {
                        self.drain_ctl();
                        self.relay_referee_host(host);
                    }
                    Err(_) => break,
                },
                default(STOP_CHECK) => {}
            }
        }
        debug!("[Hub] relay exiting");
    }

    /// Subscriptions made before a message was sent must see that message.
    fn drain_ctl(&mut self) {
        while let Ok(ctl) = self.ctl_rx.try_recv() {
            self.apply_ctl(ctl);
        }
    }

    fn apply_ctl(&mut self, ctl: HubCtl) {
        match ctl {
            HubCtl::SubscribeStatus(tx) => self.status_listeners.push(tx),
            HubCtl::SubscribeCommands(interest, tx) => {
                self.command_subscribers.push(CommandSubscriber {
                    interest,
                    sink: CommandSink::External(tx),
                })
            }
            HubCtl::SubscribeRefereeHost(tx) => self.host_listeners.push(tx),
        }
    }

    fn ingest_command(&mut self, envelope: CommandEnvelope) {
        let CommandEnvelope { origin, command } = envelope;
        if let Err(e) = command.validate() {
            warn!("[Hub] rejected command from {}: {}", origin, e);
            self.metrics.record_command(false);
            return;
        }
        self.metrics.record_command(true);

        let command: Command = Arc::new(command);
        debug!("[Hub] command from {}: {:?}", origin, command.interests());
        self.apply_command(&command);
        self.broadcast(&command);
    }

    /// Effects the hub applies itself: source switch, clock, ports, flip.
    fn apply_command(&mut self, command: &CommandMsg) {
        if let Some(enable) = command.simulator.as_ref().and_then(|s| s.enable) {
            self.set_simulator(enable);
        }
        if let Some(speed) = command.speed {
            self.set_speed(speed);
        }
        if let Some(amun) = command.amun.as_ref() {
            if let Some(port) = amun.vision_port {
                self.vision.update_port(port);
            }
            if let Some(port) = amun.referee_port {
                self.referee.update_port(port);
            }
            if let Some(port) = amun.tracker_port {
                let _ = self.publisher_tx.send(PublisherInput::UpdatePort(port));
            }
        }
        if let Some(flip) = command.referee.as_ref().and_then(|r| r.flipped) {
            let _ = self.publisher_tx.send(PublisherInput::SetFlip(flip));
        }
    }

    fn set_simulator(&mut self, enable: bool) {
        if enable == self.simulator_enabled {
            return;
        }
        self.simulator_enabled = enable;

        let source = if enable {
            VisionSource::Simulator
        } else {
            VisionSource::Network
        };
        if self.router.switch(source) {
            self.metrics.record_source_switch();
        }
        let _ = self.simulator_tx.send(SimulatorCtl::Enable(enable));

        if enable {
            if let Err(e) = self.clock.set_scaling(self.speed as f64) {
                warn!("[Hub] keeping clock scaling: {}", e);
            }
        } else {
            // steps back to real time; the state report below is the first stamp after it
            self.clock.reset();
        }
        self.report_amun_state();
    }

    /// Remembered always, applied to the clock only while simulating.
    fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
        if !self.simulator_enabled {
            debug!("[Hub] speed {} stored until the simulator runs", speed);
            return;
        }
        match self.clock.set_scaling(speed as f64) {
            Ok(()) => self.report_amun_state(),
            Err(e) => warn!("[Hub] speed rejected: {}", e),
        }
    }

    fn report_amun_state(&mut self) {
        let status = StatusMsg {
            amun_state: Some(AmunState {
                port_bind_error: None,
                simulator_enabled: Some(self.simulator_enabled),
                scaling: Some(self.clock.scaling() as f32),
            }),
            ..Default::default()
        };
        self.relay_status(Origin::Hub, status);
    }

    fn broadcast(&mut self, command: &Command) {
        let interests = command.interests();
        let before = self.command_subscribers.len();
        self.command_subscribers
            .retain(|s| !s.interest.intersects(interests) || s.sink.send(command));
        let pruned = before - self.command_subscribers.len();
        if pruned > 0 {
            debug!("[Hub] pruned {} command subscriber(s)", pruned);
            self.metrics.record_pruned(pruned);
        }
    }

    fn relay_status(&mut self, origin: Origin, mut status: StatusMsg) {
        status.time = self.clock.current_time();
        let status: Status = Arc::new(status);
        self.metrics.record_relay();

        let before = self.status_listeners.len();
        self.status_listeners
            .retain(|listener| listener.send(status.clone()).is_ok());
        let pruned = before - self.status_listeners.len();
        if pruned > 0 {
            debug!("[Hub] pruned {} status listener(s)", pruned);
            self.metrics.record_pruned(pruned);
        }

        if status.world_state.is_some() {
            let _ = self.publisher_tx.send(PublisherInput::Status(status.clone()));
        }
        if origin != Origin::Strategy && status.is_game_input() {
            let _ = self.strategy_tx.send(StrategyInput::Status(status));
        }
    }

    fn relay_referee_host(&mut self, host: String) {
        info!("[Hub] referee packets now from {}", host);
        let _ = self.strategy_tx.send(StrategyInput::RefereeHost(host.clone()));
        self.host_listeners
            .retain(|listener| listener.send(host.clone()).is_ok());
    }
}
