//! Outgoing side: one worker per (message kind, socket) binding, all fanning
//! into a handful of socket sinks.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kernel_protocol::{Envelope, Header, KernelMessage, OutgoingType, SocketChannel};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actor::{WorkerGone, WorkerHandle};
use crate::logger::Logger;

/// The transport side of a socket. Implementations own framing and I/O.
#[async_trait]
pub trait SocketSink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// In-process sink; every envelope lands on an unbounded channel.
#[derive(Clone, Debug)]
pub struct MemorySocket {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MemorySocket {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SocketSink for MemorySocket {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("memory socket receiver dropped"))
    }
}

/// One sink per logical socket.
#[derive(Clone)]
pub struct SocketSet {
    pub shell: Arc<dyn SocketSink>,
    pub stdin: Arc<dyn SocketSink>,
    pub iopub: Arc<dyn SocketSink>,
}

impl SocketSet {
    /// All three sockets share one sink; envelopes still carry their socket.
    pub fn shared(sink: Arc<dyn SocketSink>) -> Self {
        Self {
            shell: Arc::clone(&sink),
            stdin: Arc::clone(&sink),
            iopub: sink,
        }
    }

    pub fn sink(&self, socket: SocketChannel) -> Arc<dyn SocketSink> {
        match socket {
            SocketChannel::Shell => Arc::clone(&self.shell),
            SocketChannel::Stdin => Arc::clone(&self.stdin),
            SocketChannel::IoPub => Arc::clone(&self.iopub),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboundError {
    #[error("no multiplexer bound for `{0}`")]
    Unbound(OutgoingType),

    #[error("could not encode `{kind}` content: {reason}")]
    Encode { kind: OutgoingType, reason: String },

    #[error(transparent)]
    Closed(#[from] WorkerGone),
}

/// Per-binding configuration built by the topology builder.
pub struct MultiplexerConfig {
    pub kind: OutgoingType,
    pub socket: SocketChannel,
    pub sink: Arc<dyn SocketSink>,
    pub logger: Logger,
}

pub struct OutboundMux {
    name: String,
    config: MultiplexerConfig,
    rx: mpsc::UnboundedReceiver<KernelMessage>,
}

impl OutboundMux {
    pub fn worker_name(kind: OutgoingType) -> String {
        format!("{}.{}", kind.socket(), kind)
    }

    pub fn new(config: MultiplexerConfig, rx: mpsc::UnboundedReceiver<KernelMessage>) -> Self {
        Self {
            name: Self::worker_name(config.kind),
            config,
            rx,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(message) => self.forward(message).await,
                    None => break,
                },
            }
        }
        self.config.logger.debug(&self.name, "multiplexer stopped");
    }

    async fn forward(&self, message: KernelMessage) {
        if message.msg_type() != self.config.kind.as_ref() {
            self.config.logger.warn(
                &self.name,
                &format!(
                    "dropping `{}` message handed to the `{}` binding",
                    message.msg_type(),
                    self.config.kind
                ),
            );
            return;
        }
        let envelope = Envelope {
            socket: self.config.socket,
            message,
        };
        if let Err(err) = self.config.sink.send(envelope).await {
            self.config
                .logger
                .error(&self.name, &format!("socket write failed: {err:#}"));
        }
    }
}

/// Fan-in facade producers use to emit outgoing messages.
#[derive(Clone, Debug)]
pub struct Outbound {
    session: Arc<str>,
    username: Arc<str>,
    routes: Arc<HashMap<OutgoingType, WorkerHandle<KernelMessage>>>,
}

impl Outbound {
    pub fn new(
        session: &str,
        username: &str,
        routes: HashMap<OutgoingType, WorkerHandle<KernelMessage>>,
    ) -> Self {
        Self {
            session: Arc::from(session),
            username: Arc::from(username),
            routes: Arc::new(routes),
        }
    }

    /// Build a message with a fresh header, parented on `parent`.
    pub fn message<C: Serialize>(
        &self,
        kind: OutgoingType,
        parent: Option<&KernelMessage>,
        content: &C,
    ) -> Result<KernelMessage, OutboundError> {
        let content = serde_json::to_value(content).map_err(|err| OutboundError::Encode {
            kind,
            reason: err.to_string(),
        })?;
        let header = Header::new(kind.as_ref(), &self.session, &self.username);
        Ok(KernelMessage::new(header, parent, content))
    }

    /// Queue an already built message on the multiplexer for `kind`.
    pub fn send(&self, kind: OutgoingType, message: KernelMessage) -> Result<(), OutboundError> {
        let route = self.routes.get(&kind).ok_or(OutboundError::Unbound(kind))?;
        route.send(message)?;
        Ok(())
    }

    /// Build and queue in one go; returns the new message id.
    pub fn emit<C: Serialize>(
        &self,
        kind: OutgoingType,
        parent: Option<&KernelMessage>,
        content: &C,
    ) -> Result<String, OutboundError> {
        let message = self.message(kind, parent, content)?;
        let msg_id = message.msg_id().to_string();
        self.send(kind, message)?;
        Ok(msg_id)
    }
}
