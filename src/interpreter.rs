//! The single serialized execution worker.
//!
//! The session it owns is not safe for concurrent use, so the unit runs on a
//! dedicated OS thread and drains its mailbox one task at a time. Everything
//! that touches interpreter state (code, magics, completion) goes through
//! this queue.
use std::fmt;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use kernel_protocol::content::{InputRequest, Stream, StreamName};
use kernel_protocol::{KernelMessage, OutgoingType};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::actor::{WorkerGone, WorkerHandle};
use crate::correlation::{CorrelationError, CorrelationTable};
use crate::logger::Logger;
use crate::magic::{MagicCatalog, MagicCommand, MagicContext, MagicInvocation};
use crate::multiplexer::{Outbound, OutboundError};

/// A failed execution, shaped like the protocol's `error` content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

impl ExecutionFailure {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        let ename = ename.into();
        let evalue = evalue.into();
        Self {
            traceback: vec![format!("{ename}: {evalue}")],
            ename,
            evalue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureFlags {
    pub stdout: bool,
    pub stderr: bool,
}

/// Where a stream that is not captured ends up.
pub trait Passthrough: Send + Sync + fmt::Debug {
    fn write(&self, stream: StreamName, text: &str);
}

/// Each stream goes to the matching process stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStreams;

impl Passthrough for ProcessStreams {
    fn write(&self, stream: StreamName, text: &str) {
        match stream {
            StreamName::Stdout => write_locked(&mut std::io::stdout().lock(), text),
            StreamName::Stderr => write_locked(&mut std::io::stderr().lock(), text),
        }
    }
}

/// Both streams go to the process stderr. Use this when stdout carries
/// protocol traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrOnly;

impl Passthrough for StderrOnly {
    fn write(&self, _stream: StreamName, text: &str) {
        write_locked(&mut std::io::stderr().lock(), text);
    }
}

fn write_locked(out: &mut impl Write, text: &str) {
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

/// What one execution produced before post-processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    pub value: Result<Option<String>, ExecutionFailure>,
    pub stdout: String,
    pub stderr: String,
}

impl RawResult {
    pub fn failure(failure: ExecutionFailure) -> Self {
        Self {
            value: Err(failure),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// The language runtime behind the kernel.
pub trait Interpreter: Send + 'static {
    /// Run `code` against the session; `Ok(None)` means "no displayable value".
    fn execute(&mut self, code: &str, io: &mut SessionIo)
    -> Result<Option<String>, ExecutionFailure>;

    fn complete(&mut self, code: &str, cursor_pos: usize) -> Completion {
        let _ = code;
        Completion {
            matches: vec![],
            cursor_start: cursor_pos,
            cursor_end: cursor_pos,
        }
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("the frontend does not accept input requests for this execution")]
    NotAllowed,

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("input request `{0}` was abandoned before a reply arrived")]
    Abandoned(String),
}

/// Asks the frontend for a line over the stdin socket and waits for the
/// correlated `input_reply`.
#[derive(Clone, Debug)]
pub struct StdinBridge {
    correlation: CorrelationTable,
    outbound: Outbound,
    parent: KernelMessage,
}

impl StdinBridge {
    pub fn new(correlation: CorrelationTable, outbound: Outbound, parent: KernelMessage) -> Self {
        Self {
            correlation,
            outbound,
            parent,
        }
    }

    /// Blocks the calling thread; only call from the interpreter thread.
    pub fn read_line(&self, prompt: &str, password: bool) -> Result<String, InputError> {
        let request = InputRequest {
            prompt: prompt.to_string(),
            password,
        };
        let message = self
            .outbound
            .message(OutgoingType::InputRequest, Some(&self.parent), &request)?;
        let request_id = message.msg_id().to_string();

        let (tx, rx) = oneshot::channel();
        self.correlation.insert(&request_id, tx)?;
        if let Err(err) = self.outbound.send(OutgoingType::InputRequest, message) {
            self.correlation.abandon(&request_id);
            return Err(err.into());
        }

        rx.blocking_recv()
            .map(|reply| reply.value)
            .map_err(|_| InputError::Abandoned(request_id))
    }

    /// Publish `text` as a `stream` message parented on the request.
    pub fn publish(&self, name: StreamName, text: &str) -> Result<(), OutboundError> {
        let content = Stream {
            name,
            text: text.to_string(),
        };
        self.outbound
            .emit(OutgoingType::Stream, Some(&self.parent), &content)?;
        Ok(())
    }
}

/// Output and input plumbing for a single execution.
#[derive(Debug)]
pub struct SessionIo {
    capture: CaptureFlags,
    passthrough: Arc<dyn Passthrough>,
    stdout: String,
    stderr: String,
    stdin: Option<StdinBridge>,
}

impl Default for SessionIo {
    fn default() -> Self {
        Self::new(CaptureFlags::default(), None)
    }
}

impl SessionIo {
    pub fn new(capture: CaptureFlags, stdin: Option<StdinBridge>) -> Self {
        Self {
            capture,
            passthrough: Arc::new(ProcessStreams),
            stdout: String::new(),
            stderr: String::new(),
            stdin,
        }
    }

    pub fn with_passthrough(mut self, passthrough: Arc<dyn Passthrough>) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Captured streams are buffered into the result; the others go to the
    /// passthrough.
    pub fn write(&mut self, stream: StreamName, text: &str) {
        match stream {
            StreamName::Stdout if self.capture.stdout => self.stdout.push_str(text),
            StreamName::Stderr if self.capture.stderr => self.stderr.push_str(text),
            _ => self.passthrough.write(stream, text),
        }
    }

    /// Ask the frontend for a line. Output buffered so far is published
    /// first so it reaches the frontend ahead of the prompt.
    pub fn read_line(&mut self, prompt: &str, password: bool) -> Result<String, InputError> {
        let Some(bridge) = self.stdin.as_ref() else {
            return Err(InputError::NotAllowed);
        };
        for (name, buffered) in [
            (StreamName::Stdout, &mut self.stdout),
            (StreamName::Stderr, &mut self.stderr),
        ] {
            if !buffered.is_empty() {
                bridge.publish(name, buffered.as_str())?;
                buffered.clear();
            }
        }
        bridge.read_line(prompt, password)
    }

    pub fn captured(&self) -> (&str, &str) {
        (&self.stdout, &self.stderr)
    }

    fn finish(self, value: Result<Option<String>, ExecutionFailure>) -> RawResult {
        RawResult {
            value,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

pub enum InterpreterTask {
    Execute {
        code: String,
        parent: KernelMessage,
        allow_stdin: bool,
        reply: oneshot::Sender<RawResult>,
    },
    Magic {
        command: Arc<dyn MagicCommand>,
        invocation: MagicInvocation,
        catalog: Arc<MagicCatalog>,
        parent: KernelMessage,
        allow_stdin: bool,
        reply: oneshot::Sender<RawResult>,
    },
    Complete {
        code: String,
        cursor_pos: usize,
        reply: oneshot::Sender<Completion>,
    },
    Shutdown,
}

pub struct InterpreterConfig {
    pub capture: CaptureFlags,
    pub passthrough: Arc<dyn Passthrough>,
    /// Once cancelled, queued tasks are dropped unrun.
    pub shutdown: CancellationToken,
    pub correlation: CorrelationTable,
    pub outbound: Outbound,
    pub logger: Logger,
}

pub struct InterpreterUnit {
    session: Box<dyn Interpreter>,
    config: InterpreterConfig,
    rx: mpsc::UnboundedReceiver<InterpreterTask>,
}

impl InterpreterUnit {
    pub const NAME: &'static str = "system.interpreter";

    pub fn new(
        session: Box<dyn Interpreter>,
        config: InterpreterConfig,
        rx: mpsc::UnboundedReceiver<InterpreterTask>,
    ) -> Self {
        Self {
            session,
            config,
            rx,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("interpreter".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        while let Some(task) = self.rx.blocking_recv() {
            if self.config.shutdown.is_cancelled() {
                break;
            }
            match task {
                InterpreterTask::Execute {
                    code,
                    parent,
                    allow_stdin,
                    reply,
                } => {
                    let mut io = self.session_io(&parent, allow_stdin);
                    let session = &mut self.session;
                    let value = guarded(|| session.execute(&code, &mut io));
                    if reply.send(io.finish(value)).is_err() {
                        self.config
                            .logger
                            .warn(Self::NAME, "execute result dropped, requester went away");
                    }
                }
                InterpreterTask::Magic {
                    command,
                    invocation,
                    catalog,
                    parent,
                    allow_stdin,
                    reply,
                } => {
                    let mut io = self.session_io(&parent, allow_stdin);
                    let session = self.session.as_mut();
                    let value = guarded(|| {
                        let mut ctx = MagicContext {
                            session: &mut *session,
                            io: &mut io,
                            catalog: &catalog,
                        };
                        command.invoke(&invocation, &mut ctx)
                    });
                    if reply.send(io.finish(value)).is_err() {
                        self.config
                            .logger
                            .warn(Self::NAME, "magic result dropped, requester went away");
                    }
                }
                InterpreterTask::Complete {
                    code,
                    cursor_pos,
                    reply,
                } => {
                    let session = &mut self.session;
                    let completion = catch_unwind(AssertUnwindSafe(|| {
                        session.complete(&code, cursor_pos)
                    }))
                    .unwrap_or(Completion {
                        matches: vec![],
                        cursor_start: cursor_pos,
                        cursor_end: cursor_pos,
                    });
                    let _ = reply.send(completion);
                }
                InterpreterTask::Shutdown => break,
            }
        }
        self.config.logger.debug(Self::NAME, "interpreter stopped");
    }

    fn session_io(&self, parent: &KernelMessage, allow_stdin: bool) -> SessionIo {
        let stdin = allow_stdin.then(|| {
            StdinBridge::new(
                self.config.correlation.clone(),
                self.config.outbound.clone(),
                parent.clone(),
            )
        });
        SessionIo::new(self.config.capture, stdin)
            .with_passthrough(Arc::clone(&self.config.passthrough))
    }
}

/// A panicking session turns into a failure; the unit keeps serving.
fn guarded<F>(f: F) -> Result<Option<String>, ExecutionFailure>
where
    F: FnOnce() -> Result<Option<String>, ExecutionFailure>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "interpreter panicked".to_string());
            Err(ExecutionFailure::new("InterpreterPanic", reason))
        }
    }
}

/// Async front door to the interpreter's queue.
#[derive(Clone, Debug)]
pub struct InterpreterHandle(WorkerHandle<InterpreterTask>);

impl InterpreterHandle {
    pub fn new(handle: WorkerHandle<InterpreterTask>) -> Self {
        Self(handle)
    }

    pub async fn execute(
        &self,
        code: String,
        parent: KernelMessage,
        allow_stdin: bool,
    ) -> Result<RawResult, WorkerGone> {
        let (reply, rx) = oneshot::channel();
        self.0.send(InterpreterTask::Execute {
            code,
            parent,
            allow_stdin,
            reply,
        })?;
        rx.await.map_err(|_| WorkerGone(self.0.name().to_string()))
    }

    pub async fn run_magic(
        &self,
        command: Arc<dyn MagicCommand>,
        invocation: MagicInvocation,
        catalog: Arc<MagicCatalog>,
        parent: KernelMessage,
        allow_stdin: bool,
    ) -> Result<RawResult, WorkerGone> {
        let (reply, rx) = oneshot::channel();
        self.0.send(InterpreterTask::Magic {
            command,
            invocation,
            catalog,
            parent,
            allow_stdin,
            reply,
        })?;
        rx.await.map_err(|_| WorkerGone(self.0.name().to_string()))
    }

    pub async fn complete(&self, code: String, cursor_pos: usize) -> Result<Completion, WorkerGone> {
        let (reply, rx) = oneshot::channel();
        self.0.send(InterpreterTask::Complete {
            code,
            cursor_pos,
            reply,
        })?;
        rx.await.map_err(|_| WorkerGone(self.0.name().to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.0.send(InterpreterTask::Shutdown);
    }
}

impl std::fmt::Debug for InterpreterTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpreterTask::Execute { code, .. } => {
                f.debug_struct("Execute").field("code", code).finish()
            }
            InterpreterTask::Magic { invocation, .. } => {
                f.debug_struct("Magic").field("invocation", invocation).finish()
            }
            InterpreterTask::Complete {
                code, cursor_pos, ..
            } => f
                .debug_struct("Complete")
                .field("code", code)
                .field("cursor_pos", cursor_pos)
                .finish(),
            InterpreterTask::Shutdown => f.write_str("Shutdown"),
        }
    }
}
