//! Boot: build every worker, register it under a unique name, then start
//! them all at once.
//!
//! Registration happens in two phases. The kernel-facing surface (outbound
//! multiplexers, then incoming dispatchers) comes first; the interpreter unit
//! and the execute relay second. Nothing is spawned until both phases have
//! succeeded, so a failed boot leaves no worker running.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use kernel_protocol::{IncomingType, KernelMessage, OutgoingType, ProtocolError, SocketChannel};
use strum::IntoEnumIterator;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::{Mailbox, WorkerGone, WorkerHandle};
use crate::comm::CommRegistry;
use crate::config::KernelConfig;
use crate::correlation::CorrelationTable;
use crate::dispatch::{self, DispatchConfig, DispatchWorker, HandlerDeps};
use crate::interpreter::{
    CaptureFlags, Interpreter, InterpreterConfig, InterpreterHandle, InterpreterTask,
    InterpreterUnit, Passthrough, ProcessStreams,
};
use crate::logger::Logger;
use crate::magic::{MagicCatalog, MagicError, MagicLoader};
use crate::multiplexer::{MultiplexerConfig, Outbound, OutboundMux, SocketSet};
use crate::relay::{ExecuteRelay, RelayConfig};
use crate::transformer::{DefaultPostProcessor, PostProcessor};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("worker name `{0}` is already registered")]
    DuplicateName(String),

    #[error("boot needs a {0}, none was provided")]
    MissingCollaborator(&'static str),

    #[error("no handler factory for `{0}`")]
    NoFactory(IncomingType),

    #[error("magic commands failed to load: {0:#}")]
    MagicLoad(anyhow::Error),

    #[error(transparent)]
    MagicCatalog(#[from] MagicError),

    #[error("could not start the interpreter thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Closed(#[from] WorkerGone),
}

/// Where an outgoing kind ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub socket: SocketChannel,
    pub worker: String,
}

/// The registered workers, queryable by name and by message kind.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    names: Vec<String>,
    dispatchers: HashMap<IncomingType, WorkerHandle<KernelMessage>>,
    bindings: HashMap<OutgoingType, Binding>,
}

impl Topology {
    /// Worker names in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn dispatcher(&self, kind: IncomingType) -> Option<&WorkerHandle<KernelMessage>> {
        self.dispatchers.get(&kind)
    }

    pub fn binding(&self, kind: OutgoingType) -> Option<&Binding> {
        self.bindings.get(&kind)
    }

    /// Outgoing kinds grouped by the socket they share.
    pub fn socket_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for kind in OutgoingType::iter() {
            if let Some(binding) = self.bindings.get(&kind) {
                map.entry(binding.socket.to_string())
                    .or_default()
                    .push(kind.to_string());
            }
        }
        map
    }
}

/// Collects collaborators, then stages and boots the topology.
pub struct TopologyBuilder {
    config: KernelConfig,
    logger: Logger,
    interpreter: Option<Box<dyn Interpreter>>,
    magic_loader: Option<Box<dyn MagicLoader>>,
    sockets: Option<SocketSet>,
    comms: CommRegistry,
    correlation: CorrelationTable,
    post: Arc<dyn PostProcessor>,
    passthrough: Arc<dyn Passthrough>,
}

impl TopologyBuilder {
    pub fn new(config: KernelConfig, logger: Logger) -> Self {
        Self {
            config,
            logger,
            interpreter: None,
            magic_loader: None,
            sockets: None,
            comms: CommRegistry::new(),
            correlation: CorrelationTable::new(),
            post: Arc::new(DefaultPostProcessor),
            passthrough: Arc::new(ProcessStreams),
        }
    }

    pub fn interpreter(mut self, interpreter: Box<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn magic_loader(mut self, loader: Box<dyn MagicLoader>) -> Self {
        self.magic_loader = Some(loader);
        self
    }

    pub fn sockets(mut self, sockets: SocketSet) -> Self {
        self.sockets = Some(sockets);
        self
    }

    pub fn comms(mut self, comms: CommRegistry) -> Self {
        self.comms = comms;
        self
    }

    pub fn correlation(mut self, correlation: CorrelationTable) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn post_processor(mut self, post: Arc<dyn PostProcessor>) -> Self {
        self.post = post;
        self
    }

    /// Where uncaptured interpreter output goes; the process streams by default.
    pub fn passthrough(mut self, passthrough: Arc<dyn Passthrough>) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Run both registration phases without starting anything.
    pub fn stage(self) -> Result<StagedTopology, TopologyError> {
        let session = self
            .interpreter
            .ok_or(TopologyError::MissingCollaborator("interpreter"))?;
        let magic_loader = self
            .magic_loader
            .ok_or(TopologyError::MissingCollaborator("magic loader"))?;
        let sockets = self
            .sockets
            .ok_or(TopologyError::MissingCollaborator("socket set"))?;

        // Allocated up front: dispatchers need both handles in phase one.
        let relay = Mailbox::new(ExecuteRelay::NAME);
        let interpreter = Mailbox::new(InterpreterUnit::NAME);
        let mut staged = StagedTopology {
            capture: CaptureFlags {
                stdout: self.config.capture_stdout,
                stderr: self.config.capture_stderr,
            },
            passthrough: self.passthrough,
            shutdown: CancellationToken::new(),
            config: self.config,
            logger: self.logger,
            comms: self.comms,
            correlation: self.correlation,
            topology: Topology::default(),
            taken: HashSet::new(),
            relay: relay.handle,
            relay_rx: Some(relay.rx),
            interpreter: interpreter.handle,
            interpreter_rx: Some(interpreter.rx),
            routes: HashMap::new(),
            deps: None,
            muxes: vec![],
            dispatchers: vec![],
            execution: None,
        };

        staged.register_kernel_surface(&sockets)?;
        staged.register_execution(session, magic_loader.as_ref(), self.post)?;
        Ok(staged)
    }

    /// Stage, then spawn every worker.
    pub async fn boot(self) -> Result<Kernel, TopologyError> {
        self.stage()?.spawn()
    }
}

struct Execution {
    unit: InterpreterUnit,
    relay: ExecuteRelay,
}

/// A fully registered topology whose workers have not been started.
pub struct StagedTopology {
    config: KernelConfig,
    capture: CaptureFlags,
    passthrough: Arc<dyn Passthrough>,
    shutdown: CancellationToken,
    logger: Logger,
    comms: CommRegistry,
    correlation: CorrelationTable,
    topology: Topology,
    taken: HashSet<String>,
    relay: WorkerHandle<KernelMessage>,
    relay_rx: Option<mpsc::UnboundedReceiver<KernelMessage>>,
    interpreter: WorkerHandle<InterpreterTask>,
    interpreter_rx: Option<mpsc::UnboundedReceiver<InterpreterTask>>,
    routes: HashMap<OutgoingType, WorkerHandle<KernelMessage>>,
    deps: Option<HandlerDeps>,
    muxes: Vec<OutboundMux>,
    dispatchers: Vec<DispatchWorker>,
    execution: Option<Execution>,
}

impl StagedTopology {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn claim(&mut self, name: &str) -> Result<(), TopologyError> {
        if !self.taken.insert(name.to_string()) {
            return Err(TopologyError::DuplicateName(name.to_string()));
        }
        self.topology.names.push(name.to_string());
        Ok(())
    }

    /// Phase one: every outbound binding, then every incoming dispatcher.
    fn register_kernel_surface(&mut self, sockets: &SocketSet) -> Result<(), TopologyError> {
        for kind in OutgoingType::iter() {
            self.register_binding(kind, sockets)?;
        }
        let outbound = Outbound::new(
            &self.config.session,
            &self.config.username,
            self.routes.clone(),
        );
        self.deps = Some(HandlerDeps {
            relay: self.relay.clone(),
            interpreter: InterpreterHandle::new(self.interpreter.clone()),
            correlation: self.correlation.clone(),
            comms: self.comms.clone(),
            outbound,
            kernel_info: self.config.kernel_info.clone(),
            logger: self.logger.clone(),
        });
        for kind in IncomingType::iter() {
            self.register_dispatcher(kind)?;
        }
        Ok(())
    }

    pub fn register_binding(
        &mut self,
        kind: OutgoingType,
        sockets: &SocketSet,
    ) -> Result<(), TopologyError> {
        let name = OutboundMux::worker_name(kind);
        self.claim(&name)?;
        let socket = kind.socket();
        let mailbox = Mailbox::new(&name);
        self.routes.insert(kind, mailbox.handle);
        self.muxes.push(OutboundMux::new(
            MultiplexerConfig {
                kind,
                socket,
                sink: sockets.sink(socket),
                logger: self.logger.clone(),
            },
            mailbox.rx,
        ));
        self.topology.bindings.insert(
            kind,
            Binding {
                socket,
                worker: name,
            },
        );
        Ok(())
    }

    pub fn register_dispatcher(&mut self, kind: IncomingType) -> Result<(), TopologyError> {
        let name = DispatchWorker::worker_name(kind);
        self.claim(&name)?;
        let factory = dispatch::factory(kind).ok_or(TopologyError::NoFactory(kind))?;
        let deps = self
            .deps
            .as_ref()
            .ok_or(TopologyError::MissingCollaborator("outbound surface"))?;
        let mailbox = Mailbox::new(&name);
        self.dispatchers.push(DispatchWorker::new(
            DispatchConfig {
                kind,
                handler: factory(deps),
                logger: self.logger.clone(),
            },
            mailbox.rx,
        ));
        self.topology.dispatchers.insert(kind, mailbox.handle);
        Ok(())
    }

    /// Phase two: the interpreter unit and the relay in front of it.
    fn register_execution(
        &mut self,
        session: Box<dyn Interpreter>,
        loader: &dyn MagicLoader,
        post: Arc<dyn PostProcessor>,
    ) -> Result<(), TopologyError> {
        let commands = loader.load().map_err(TopologyError::MagicLoad)?;
        let catalog = Arc::new(MagicCatalog::from_commands(commands)?);
        let deps = self
            .deps
            .clone()
            .ok_or(TopologyError::MissingCollaborator("outbound surface"))?;

        self.claim(InterpreterUnit::NAME)?;
        let unit_rx = self
            .interpreter_rx
            .take()
            .ok_or(TopologyError::MissingCollaborator("interpreter mailbox"))?;
        let unit = InterpreterUnit::new(
            session,
            InterpreterConfig {
                capture: self.capture,
                passthrough: Arc::clone(&self.passthrough),
                shutdown: self.shutdown.clone(),
                correlation: self.correlation.clone(),
                outbound: deps.outbound.clone(),
                logger: self.logger.clone(),
            },
            unit_rx,
        );

        self.claim(ExecuteRelay::NAME)?;
        let relay_rx = self
            .relay_rx
            .take()
            .ok_or(TopologyError::MissingCollaborator("relay mailbox"))?;
        let relay = ExecuteRelay::new(
            RelayConfig {
                interpreter: deps.interpreter.clone(),
                catalog,
                post,
                outbound: deps.outbound,
                logger: self.logger.clone(),
            },
            relay_rx,
        );

        self.execution = Some(Execution { unit, relay });
        Ok(())
    }

    /// Start every staged worker. The interpreter thread goes first since it
    /// is the only start that can fail.
    pub fn spawn(self) -> Result<Kernel, TopologyError> {
        let Execution { unit, relay } = self
            .execution
            .ok_or(TopologyError::MissingCollaborator("interpreter unit"))?;
        let deps = self
            .deps
            .ok_or(TopologyError::MissingCollaborator("outbound surface"))?;

        let interpreter_thread = unit.spawn()?;
        let shutdown = self.shutdown;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for mux in self.muxes {
            tasks.push(tokio::spawn(mux.run(shutdown.clone())));
        }
        tasks.push(tokio::spawn(relay.run(shutdown.clone())));
        let mut replies: Vec<JoinHandle<()>> = Vec::new();
        for worker in self.dispatchers {
            let kind = worker.kind();
            let task = tokio::spawn(worker.run(shutdown.clone()));
            if kind == IncomingType::InputReply {
                replies.push(task);
            } else {
                tasks.push(task);
            }
        }

        self.logger.info(
            "topology",
            &format!("kernel up with {} workers", self.topology.names.len()),
        );

        Ok(Kernel {
            topology: self.topology,
            outbound: deps.outbound,
            interpreter: deps.interpreter,
            correlation: self.correlation,
            comms: self.comms,
            logger: self.logger,
            shutdown,
            replies,
            tasks,
            interpreter_thread: Some(interpreter_thread),
        })
    }
}

/// A running kernel.
pub struct Kernel {
    topology: Topology,
    outbound: Outbound,
    interpreter: InterpreterHandle,
    correlation: CorrelationTable,
    comms: CommRegistry,
    logger: Logger,
    shutdown: CancellationToken,
    /// The input reply dispatcher, joined before the correlation table closes.
    replies: Vec<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    interpreter_thread: Option<thread::JoinHandle<()>>,
}

impl Kernel {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn comms(&self) -> &CommRegistry {
        &self.comms
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }

    /// Hand a decoded inbound message to its dispatcher.
    pub fn route(&self, message: KernelMessage) -> Result<(), RouteError> {
        let kind = match message.incoming_type() {
            Ok(kind) => kind,
            Err(err) => {
                self.logger.warn("topology", &err.to_string());
                return Err(err.into());
            }
        };
        let dispatcher = self
            .topology
            .dispatcher(kind)
            .ok_or_else(|| WorkerGone(DispatchWorker::worker_name(kind)))?;
        dispatcher.send(message)?;
        Ok(())
    }

    /// Stop every worker now; queued messages are dropped. The interpreter
    /// finishes the task it is running and skips the ones queued behind it.
    /// A reader blocked on `input_request` is released by closing the
    /// correlation table.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.correlation.close();
        self.interpreter.shutdown();
        self.join().await;
    }

    /// Stop accepting input and let every queued message run to completion.
    /// Each worker ends once the workers feeding it have ended, so the
    /// multiplexers flush last.
    pub async fn drain(self) {
        self.join().await;
    }

    async fn join(self) {
        let Kernel {
            topology,
            outbound,
            interpreter,
            correlation,
            logger,
            replies,
            tasks,
            interpreter_thread,
            ..
        } = self;
        drop(topology);
        for task in replies {
            if let Err(err) = task.await {
                logger.error("topology", &format!("input reply task failed: {err}"));
            }
        }
        // every queued reply has been delivered; nothing else can answer
        let abandoned = correlation.close();
        if abandoned > 0 {
            logger.warn(
                "topology",
                &format!("{abandoned} input requests abandoned at shutdown"),
            );
        }

        drop(outbound);
        drop(interpreter);
        for task in tasks {
            if let Err(err) = task.await {
                logger.error("topology", &format!("worker task failed: {err}"));
            }
        }
        if let Some(thread) = interpreter_thread {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                logger.error("topology", "interpreter thread did not stop cleanly");
            }
        }
        logger.info("topology", "kernel stopped");
    }
}
