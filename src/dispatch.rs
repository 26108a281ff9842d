//! Incoming side: one worker per incoming message kind.
//!
//! A worker validates what it receives and forwards it downstream. It never
//! answers from its own loop; replies come from whatever it forwards to.
//! Failures are logged and the worker moves on to the next message.
use async_trait::async_trait;
use kernel_protocol::content::{
    CommClose, CommMsg, CommOpen, CompleteReply, CompleteRequest, ExecuteRequest, InputReply,
    KernelInfoReply, ReplyStatus,
};
use kernel_protocol::{IncomingType, KernelMessage, OutgoingType, ProtocolError, PROTOCOL_VERSION};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actor::{WorkerGone, WorkerHandle};
use crate::comm::{CommError, CommRegistry, OpenOutcome};
use crate::config::KernelInfo;
use crate::correlation::{CorrelationError, CorrelationTable};
use crate::interpreter::InterpreterHandle;
use crate::logger::Logger;
use crate::multiplexer::{Outbound, OutboundError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("`{expected}` worker was handed a `{got}` message")]
    WrongKind { expected: IncomingType, got: String },

    #[error("input_reply without a parent header cannot be correlated")]
    MissingParent,

    #[error("stale input reply: {0}")]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Downstream(#[from] WorkerGone),
}

/// Type-specific half of a dispatch worker.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, message: KernelMessage) -> Result<(), DispatchError>;
}

/// Everything a handler constructor may draw on.
#[derive(Clone, Debug)]
pub struct HandlerDeps {
    pub relay: WorkerHandle<KernelMessage>,
    pub interpreter: InterpreterHandle,
    pub correlation: CorrelationTable,
    pub comms: CommRegistry,
    pub outbound: Outbound,
    pub kernel_info: KernelInfo,
    pub logger: Logger,
}

pub type HandlerFactory = fn(&HandlerDeps) -> Box<dyn RequestHandler>;

/// Incoming kind → handler constructor. Every kind appears exactly once.
pub static HANDLER_FACTORIES: &[(IncomingType, HandlerFactory)] = &[
    (IncomingType::ExecuteRequest, execute_request),
    (IncomingType::KernelInfoRequest, kernel_info_request),
    (IncomingType::CompleteRequest, complete_request),
    (IncomingType::InputReply, input_reply),
    (IncomingType::CommOpen, comm_open),
    (IncomingType::CommMsg, comm_msg),
    (IncomingType::CommClose, comm_close),
];

fn execute_request(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(ExecuteRequestHandler {
        relay: deps.relay.clone(),
    })
}

fn kernel_info_request(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(KernelInfoHandler {
        outbound: deps.outbound.clone(),
        info: deps.kernel_info.clone(),
    })
}

fn complete_request(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(CompleteRequestHandler {
        interpreter: deps.interpreter.clone(),
        outbound: deps.outbound.clone(),
    })
}

fn input_reply(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(InputReplyHandler {
        correlation: deps.correlation.clone(),
    })
}

fn comm_open(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(CommHandler::new(CommOp::Open, deps))
}

fn comm_msg(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(CommHandler::new(CommOp::Msg, deps))
}

fn comm_close(deps: &HandlerDeps) -> Box<dyn RequestHandler> {
    Box::new(CommHandler::new(CommOp::Close, deps))
}

pub fn factory(kind: IncomingType) -> Option<HandlerFactory> {
    HANDLER_FACTORIES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, f)| *f)
}

pub struct DispatchConfig {
    pub kind: IncomingType,
    pub handler: Box<dyn RequestHandler>,
    pub logger: Logger,
}

pub struct DispatchWorker {
    name: String,
    config: DispatchConfig,
    rx: mpsc::UnboundedReceiver<KernelMessage>,
}

impl DispatchWorker {
    pub fn worker_name(kind: IncomingType) -> String {
        format!("{}.{}", kind.socket(), kind)
    }

    pub fn new(config: DispatchConfig, rx: mpsc::UnboundedReceiver<KernelMessage>) -> Self {
        Self {
            name: Self::worker_name(config.kind),
            config,
            rx,
        }
    }

    pub fn kind(&self) -> IncomingType {
        self.config.kind
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                },
            }
        }
        self.config.logger.debug(&self.name, "dispatcher stopped");
    }

    #[tracing::instrument(name = "dispatch", skip_all, fields(worker = %self.name, msg_id = %message.msg_id()))]
    async fn dispatch(&self, message: KernelMessage) {
        if message.msg_type() != self.config.kind.as_ref() {
            let err = DispatchError::WrongKind {
                expected: self.config.kind,
                got: message.msg_type().to_string(),
            };
            self.config.logger.warn(&self.name, &err.to_string());
            return;
        }
        if let Err(err) = self.config.handler.handle(message).await {
            self.config.logger.warn(&self.name, &err.to_string());
        }
    }
}

/// Validates `code` and hands the request to the relay untouched.
pub struct ExecuteRequestHandler {
    pub relay: WorkerHandle<KernelMessage>,
}

#[async_trait]
impl RequestHandler for ExecuteRequestHandler {
    async fn handle(&self, message: KernelMessage) -> Result<(), DispatchError> {
        message.content_as::<ExecuteRequest>()?;
        self.relay.send(message)?;
        Ok(())
    }
}

pub struct KernelInfoHandler {
    pub outbound: Outbound,
    pub info: KernelInfo,
}

#[async_trait]
impl RequestHandler for KernelInfoHandler {
    async fn handle(&self, message: KernelMessage) -> Result<(), DispatchError> {
        let reply = KernelInfoReply {
            status: ReplyStatus::Ok,
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: self.info.implementation.clone(),
            implementation_version: self.info.implementation_version.clone(),
            language_info: self.info.language_info.clone(),
            banner: self.info.banner.clone(),
        };
        self.outbound
            .emit(OutgoingType::KernelInfoReply, Some(&message), &reply)?;
        Ok(())
    }
}

/// Completion goes through the interpreter queue like everything else that
/// reads session state.
pub struct CompleteRequestHandler {
    pub interpreter: InterpreterHandle,
    pub outbound: Outbound,
}

#[async_trait]
impl RequestHandler for CompleteRequestHandler {
    async fn handle(&self, message: KernelMessage) -> Result<(), DispatchError> {
        let request: CompleteRequest = message.content_as()?;
        let completion = self
            .interpreter
            .complete(request.code, request.cursor_pos)
            .await?;
        let reply = CompleteReply {
            status: ReplyStatus::Ok,
            matches: completion.matches,
            cursor_start: completion.cursor_start,
            cursor_end: completion.cursor_end,
            metadata: Map::new(),
        };
        self.outbound
            .emit(OutgoingType::CompleteReply, Some(&message), &reply)?;
        Ok(())
    }
}

/// Routes a reply to whoever issued the `input_request` it answers.
pub struct InputReplyHandler {
    pub correlation: CorrelationTable,
}

#[async_trait]
impl RequestHandler for InputReplyHandler {
    async fn handle(&self, message: KernelMessage) -> Result<(), DispatchError> {
        let request_id = message
            .parent_msg_id()
            .ok_or(DispatchError::MissingParent)?;
        let reply: InputReply = message.content_as()?;
        self.correlation.resolve(request_id, reply)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommOp {
    Open,
    Msg,
    Close,
}

pub struct CommHandler {
    op: CommOp,
    comms: CommRegistry,
    outbound: Outbound,
    logger: Logger,
}

impl CommHandler {
    pub fn new(op: CommOp, deps: &HandlerDeps) -> Self {
        Self {
            op,
            comms: deps.comms.clone(),
            outbound: deps.outbound.clone(),
            logger: deps.logger.clone(),
        }
    }

    fn answer(&self, parent: &KernelMessage, comm_id: String, data: Option<Value>) -> Result<(), DispatchError> {
        if let Some(data) = data {
            self.outbound
                .emit(OutgoingType::CommMsg, Some(parent), &CommMsg { comm_id, data })?;
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for CommHandler {
    async fn handle(&self, message: KernelMessage) -> Result<(), DispatchError> {
        match self.op {
            CommOp::Open => {
                let open: CommOpen = message.content_as()?;
                match self.comms.open(&open.comm_id, &open.target_name, &open.data) {
                    Ok((outcome, data)) => {
                        if outcome == OpenOutcome::Reopened {
                            self.logger.debug(
                                "comm",
                                &format!("comm `{}` reopened, previous state replaced", open.comm_id),
                            );
                        }
                        self.answer(&message, open.comm_id, data)
                    }
                    Err(err) => {
                        let close = CommClose {
                            comm_id: open.comm_id,
                            data: Value::Object(Map::new()),
                        };
                        self.outbound
                            .emit(OutgoingType::CommClose, Some(&message), &close)?;
                        Err(err.into())
                    }
                }
            }
            CommOp::Msg => {
                let msg: CommMsg = message.content_as()?;
                let data = self.comms.message(&msg.comm_id, &msg.data)?;
                self.answer(&message, msg.comm_id, data)
            }
            CommOp::Close => {
                let close: CommClose = message.content_as()?;
                self.comms.close(&close.comm_id, &close.data)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Mailbox;
    use crate::comm::{CommState, EchoTarget};
    use crate::logger::MemoryLogger;
    use kernel_protocol::{Header, LogLevel};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use strum::IntoEnumIterator;
    use tokio::sync::oneshot;

    struct Fixture {
        deps: HandlerDeps,
        relay_rx: mpsc::UnboundedReceiver<KernelMessage>,
        out: mpsc::UnboundedReceiver<KernelMessage>,
    }

    fn fixture() -> Fixture {
        let (tx, out) = mpsc::unbounded_channel();
        let routes: HashMap<_, _> = OutgoingType::iter()
            .map(|kind| (kind, WorkerHandle::new(kind.as_ref(), tx.clone())))
            .collect();
        let relay = Mailbox::new("system.relay");
        let interpreter = Mailbox::new("system.interpreter");
        let comms = CommRegistry::new();
        comms.register_target("echo", Arc::new(EchoTarget));
        Fixture {
            deps: HandlerDeps {
                relay: relay.handle,
                interpreter: InterpreterHandle::new(interpreter.handle),
                correlation: CorrelationTable::new(),
                comms,
                outbound: Outbound::new("s", "u", routes),
                kernel_info: KernelInfo::default(),
                logger: Logger::tracing(),
            },
            relay_rx: relay.rx,
            out,
        }
    }

    fn message(kind: &str, parent: Option<&KernelMessage>, content: Value) -> KernelMessage {
        KernelMessage::new(Header::new(kind, "s", "u"), parent, content)
    }

    fn handler(kind: IncomingType, deps: &HandlerDeps) -> Box<dyn RequestHandler> {
        factory(kind).expect("every kind has a factory")(deps)
    }

    #[test]
    fn test_factory_table_covers_every_kind_once() {
        for kind in IncomingType::iter() {
            let count = HANDLER_FACTORIES.iter().filter(|(k, _)| *k == kind).count();
            assert_eq!(count, 1, "{kind}");
        }
        assert_eq!(HANDLER_FACTORIES.len(), IncomingType::iter().count());
    }

    #[tokio::test]
    async fn test_execute_request_forwarded_unchanged() {
        let mut f = fixture();
        let h = handler(IncomingType::ExecuteRequest, &f.deps);
        let req = message("execute_request", None, json!({"code": "1+1"}));
        h.handle(req.clone()).await.unwrap();
        let forwarded = f.relay_rx.recv().await.unwrap();
        assert_eq!(forwarded.msg_id(), req.msg_id());
        assert_eq!(forwarded.content, req.content);
    }

    #[tokio::test]
    async fn test_execute_request_without_code_rejected() {
        let mut f = fixture();
        let h = handler(IncomingType::ExecuteRequest, &f.deps);
        let err = h
            .handle(message("execute_request", None, json!({"code": 5})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
        assert!(f.relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kernel_info_reply() {
        let mut f = fixture();
        let h = handler(IncomingType::KernelInfoRequest, &f.deps);
        let req = message("kernel_info_request", None, json!({}));
        h.handle(req.clone()).await.unwrap();
        let reply = f.out.recv().await.unwrap();
        assert_eq!(reply.msg_type(), "kernel_info_reply");
        assert_eq!(reply.parent_msg_id(), Some(req.msg_id()));
        assert_eq!(reply.content["protocol_version"], PROTOCOL_VERSION);
        assert_eq!(reply.content["language_info"]["name"], "rhai");
    }

    #[tokio::test]
    async fn test_input_reply_delivered_then_stale() {
        let f = fixture();
        let h = handler(IncomingType::InputReply, &f.deps);
        let request = message("input_request", None, json!({"prompt": "> "}));
        let (tx, rx) = oneshot::channel();
        f.deps.correlation.insert(request.msg_id(), tx).unwrap();

        let reply = message("input_reply", Some(&request), json!({"value": "42"}));
        h.handle(reply.clone()).await.unwrap();
        assert_eq!(rx.await.unwrap().value, "42");

        let again = h.handle(reply).await.unwrap_err();
        assert!(matches!(
            again,
            DispatchError::Correlation(CorrelationError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_input_reply_without_parent() {
        let f = fixture();
        let h = handler(IncomingType::InputReply, &f.deps);
        let err = h
            .handle(message("input_reply", None, json!({"value": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingParent));
    }

    #[tokio::test]
    async fn test_comm_lifecycle_through_handlers() {
        let mut f = fixture();
        let open = handler(IncomingType::CommOpen, &f.deps);
        let msg = handler(IncomingType::CommMsg, &f.deps);
        let close = handler(IncomingType::CommClose, &f.deps);

        open.handle(message(
            "comm_open",
            None,
            json!({"comm_id": "abc", "target_name": "echo", "data": {}}),
        ))
        .await
        .unwrap();
        msg.handle(message("comm_msg", None, json!({"comm_id": "abc", "data": {"n": 1}})))
            .await
            .unwrap();
        let echoed = f.out.recv().await.unwrap();
        assert_eq!(echoed.msg_type(), "comm_msg");
        assert_eq!(echoed.content["data"]["n"], 1);

        close
            .handle(message("comm_close", None, json!({"comm_id": "abc"})))
            .await
            .unwrap();
        assert_eq!(f.deps.comms.state("abc"), CommState::Closed);

        let err = msg
            .handle(message("comm_msg", None, json!({"comm_id": "abc", "data": {}})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Comm(CommError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_unknown_target_answered_with_close() {
        let mut f = fixture();
        let open = handler(IncomingType::CommOpen, &f.deps);
        let err = open
            .handle(message(
                "comm_open",
                None,
                json!({"comm_id": "x1", "target_name": "nobody"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Comm(CommError::UnknownTarget { .. })));
        let answer = f.out.recv().await.unwrap();
        assert_eq!(answer.msg_type(), "comm_close");
        assert_eq!(answer.content["comm_id"], "x1");
    }

    #[tokio::test]
    async fn test_worker_logs_and_keeps_running() {
        let mut f = fixture();
        let memory = MemoryLogger::new();
        let mailbox = Mailbox::new(&DispatchWorker::worker_name(IncomingType::ExecuteRequest));
        let worker = DispatchWorker::new(
            DispatchConfig {
                kind: IncomingType::ExecuteRequest,
                handler: handler(IncomingType::ExecuteRequest, &f.deps),
                logger: memory.logger(),
            },
            mailbox.rx,
        );
        mailbox
            .handle
            .send(message("execute_request", None, json!({})))
            .unwrap();
        mailbox
            .handle
            .send(message("comm_msg", None, json!({"comm_id": "a"})))
            .unwrap();
        mailbox
            .handle
            .send(message("execute_request", None, json!({"code": "ok"})))
            .unwrap();
        drop(mailbox.handle);
        worker.run(CancellationToken::new()).await;

        assert!(memory.contains(LogLevel::Warn, "malformed `execute_request` content"));
        assert!(memory.contains(LogLevel::Warn, "handed a `comm_msg` message"));
        assert_eq!(f.relay_rx.recv().await.unwrap().content["code"], "ok");
    }

    #[test]
    fn test_worker_names() {
        assert_eq!(
            DispatchWorker::worker_name(IncomingType::ExecuteRequest),
            "shell.execute_request"
        );
        assert_eq!(
            DispatchWorker::worker_name(IncomingType::InputReply),
            "stdin.input_reply"
        );
    }
}
