//! `execute_request` pipeline: parse for magics, dispatch to the interpreter
//! queue, post-process the raw result into outgoing messages.
use std::sync::Arc;
use std::time::Instant;

use kernel_protocol::content::{ExecuteInput, ExecuteRequest, ExecutionState, Status};
use kernel_protocol::{KernelMessage, OutgoingType};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::interpreter::{ExecutionFailure, InterpreterHandle, RawResult};
use crate::logger::{Logger, REQUEST_TARGET};
use crate::magic::{self, MagicCatalog, ParsedCode};
use crate::multiplexer::Outbound;
use crate::transformer::{PostContext, PostProcessor};

pub struct RelayConfig {
    pub interpreter: InterpreterHandle,
    pub catalog: Arc<MagicCatalog>,
    pub post: Arc<dyn PostProcessor>,
    pub outbound: Outbound,
    pub logger: Logger,
}

pub struct ExecuteRelay {
    config: RelayConfig,
    rx: mpsc::UnboundedReceiver<KernelMessage>,
    execution_count: u32,
}

impl ExecuteRelay {
    pub const NAME: &'static str = "system.relay";

    pub fn new(config: RelayConfig, rx: mpsc::UnboundedReceiver<KernelMessage>) -> Self {
        Self {
            config,
            rx,
            execution_count: 0,
        }
    }

    /// Requests are handled strictly one after another; the next one is not
    /// read until the previous reply has been queued.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
        self.config.logger.debug(Self::NAME, "relay stopped");
    }

    #[tracing::instrument(name = "relay.execute", skip_all, fields(msg_id = %request.msg_id()))]
    async fn handle(&mut self, request: KernelMessage) {
        let content: ExecuteRequest = match request.content_as() {
            Ok(content) => content,
            Err(err) => {
                self.config.logger.warn(Self::NAME, &err.to_string());
                return;
            }
        };

        let started = Instant::now();
        self.status(&request, ExecutionState::Busy);

        if content.store_history && !content.silent {
            self.execution_count += 1;
        }
        let execution_count = self.execution_count;

        if !content.silent {
            let echo = ExecuteInput {
                code: content.code.clone(),
                execution_count,
            };
            self.emit(OutgoingType::ExecuteInput, &request, &echo);
        }

        let raw = self.dispatch(&content, &request).await;
        let status = if raw.value.is_ok() { "ok" } else { "error" };
        let ctx = PostContext {
            execution_count,
            silent: content.silent,
        };
        for emission in self.config.post.transform(raw, &ctx) {
            if let Err(err) = emission.emit(&self.config.outbound, &request) {
                self.config.logger.error(Self::NAME, &err.to_string());
            }
        }

        self.status(&request, ExecutionState::Idle);
        tracing::info!(
            target: REQUEST_TARGET,
            msg_id = %request.msg_id(),
            execution_count,
            status,
            silent = content.silent,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execute_request handled"
        );
    }

    async fn dispatch(&self, content: &ExecuteRequest, request: &KernelMessage) -> RawResult {
        let outcome = match magic::parse(&content.code) {
            ParsedCode::Plain(code) => {
                self.config
                    .interpreter
                    .execute(code, request.clone(), content.allow_stdin)
                    .await
            }
            ParsedCode::Magic(invocation) => match self.config.catalog.resolve(&invocation) {
                Ok(command) => {
                    self.config
                        .interpreter
                        .run_magic(
                            command,
                            invocation,
                            Arc::clone(&self.config.catalog),
                            request.clone(),
                            content.allow_stdin,
                        )
                        .await
                }
                Err(err) => {
                    self.config.logger.info(Self::NAME, &err.to_string());
                    return RawResult::failure(err.to_failure());
                }
            },
        };
        outcome.unwrap_or_else(|gone| {
            self.config.logger.error(Self::NAME, &gone.to_string());
            RawResult::failure(ExecutionFailure::new("KernelError", gone.to_string()))
        })
    }

    fn status(&self, parent: &KernelMessage, execution_state: ExecutionState) {
        self.emit(OutgoingType::Status, parent, &Status { execution_state });
    }

    fn emit<C: serde::Serialize>(&self, kind: OutgoingType, parent: &KernelMessage, content: &C) {
        if let Err(err) = self.config.outbound.emit(kind, Some(parent), content) {
            self.config.logger.error(Self::NAME, &err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Mailbox, WorkerHandle};
    use crate::correlation::CorrelationTable;
    use crate::interpreter::{
        CaptureFlags, Interpreter, InterpreterConfig, InterpreterUnit, ProcessStreams, SessionIo,
    };
    use crate::magic::{BuiltinMagics, MagicLoader};
    use crate::transformer::DefaultPostProcessor;
    use kernel_protocol::content::StreamName;
    use kernel_protocol::Header;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strum::IntoEnumIterator;

    /// Adds two integers written as `a+b`; prints anything starting with `print `.
    struct Adder {
        calls: Arc<AtomicUsize>,
    }

    impl Interpreter for Adder {
        fn execute(
            &mut self,
            code: &str,
            io: &mut SessionIo,
        ) -> Result<Option<String>, ExecutionFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(text) = code.strip_prefix("print ") {
                io.write(StreamName::Stdout, &format!("{text}\n"));
                return Ok(None);
            }
            let (a, b) = code
                .split_once('+')
                .ok_or_else(|| ExecutionFailure::new("SyntaxError", code))?;
            let parse = |s: &str| {
                s.trim()
                    .parse::<i64>()
                    .map_err(|e| ExecutionFailure::new("ValueError", e.to_string()))
            };
            Ok(Some((parse(a)? + parse(b)?).to_string()))
        }
    }

    struct Harness {
        relay: WorkerHandle<KernelMessage>,
        out: mpsc::UnboundedReceiver<KernelMessage>,
        calls: Arc<AtomicUsize>,
        shutdown: CancellationToken,
    }

    fn start() -> Harness {
        // every outgoing kind lands on one channel so emission order is visible
        let (tx, out) = mpsc::unbounded_channel();
        let routes: HashMap<_, _> = OutgoingType::iter()
            .map(|kind| (kind, WorkerHandle::new(kind.as_ref(), tx.clone())))
            .collect();
        let outbound = Outbound::new("s", "u", routes);

        let calls = Arc::new(AtomicUsize::new(0));
        let unit_box = Mailbox::new(InterpreterUnit::NAME);
        InterpreterUnit::new(
            Box::new(Adder {
                calls: calls.clone(),
            }),
            InterpreterConfig {
                capture: CaptureFlags {
                    stdout: true,
                    stderr: true,
                },
                passthrough: Arc::new(ProcessStreams),
                shutdown: CancellationToken::new(),
                correlation: CorrelationTable::new(),
                outbound: outbound.clone(),
                logger: Logger::tracing(),
            },
            unit_box.rx,
        )
        .spawn()
        .unwrap();

        let catalog = MagicCatalog::from_commands(BuiltinMagics.load().unwrap()).unwrap();
        let relay_box = Mailbox::new(ExecuteRelay::NAME);
        let relay = ExecuteRelay::new(
            RelayConfig {
                interpreter: InterpreterHandle::new(unit_box.handle),
                catalog: Arc::new(catalog),
                post: Arc::new(DefaultPostProcessor),
                outbound,
                logger: Logger::tracing(),
            },
            relay_box.rx,
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(relay.run(shutdown.clone()));
        Harness {
            relay: relay_box.handle,
            out,
            calls,
            shutdown,
        }
    }

    fn request(content: serde_json::Value) -> KernelMessage {
        KernelMessage::new(Header::new("execute_request", "s", "u"), None, content)
    }

    async fn collect_until_idle(out: &mut mpsc::UnboundedReceiver<KernelMessage>) -> Vec<KernelMessage> {
        let mut seen = vec![];
        loop {
            let message = out.recv().await.unwrap();
            let idle = message.msg_type() == "status" && message.content["execution_state"] == "idle";
            seen.push(message);
            if idle {
                return seen;
            }
        }
    }

    fn kinds(messages: &[KernelMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.msg_type()).collect()
    }

    #[tokio::test]
    async fn test_plain_code_produces_result() {
        let mut h = start();
        let req = request(json!({"code": "1+1"}));
        h.relay.send(req.clone()).unwrap();
        let seen = collect_until_idle(&mut h.out).await;

        assert_eq!(
            kinds(&seen),
            vec!["status", "execute_input", "execute_result", "execute_reply", "status"]
        );
        assert_eq!(seen[2].content["data"]["text/plain"], "2");
        assert_eq!(seen[2].content["execution_count"], 1);
        assert_eq!(seen[3].content["status"], "ok");
        assert!(seen.iter().all(|m| m.parent_msg_id() == Some(req.msg_id())));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_magic_never_reaches_interpreter() {
        let mut h = start();
        h.relay.send(request(json!({"code": "%nosuchmagic"}))).unwrap();
        let seen = collect_until_idle(&mut h.out).await;

        assert_eq!(
            kinds(&seen),
            vec!["status", "execute_input", "error", "execute_reply", "status"]
        );
        assert_eq!(seen[2].content["ename"], "UsageError");
        assert!(seen[2].content["evalue"]
            .as_str()
            .unwrap()
            .contains("%nosuchmagic"));
        assert_eq!(seen[3].content["status"], "error");
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_time_magic_runs_code_on_interpreter() {
        let mut h = start();
        h.relay.send(request(json!({"code": "%time 2+3"}))).unwrap();
        let seen = collect_until_idle(&mut h.out).await;

        let stream = seen.iter().find(|m| m.msg_type() == "stream").unwrap();
        assert!(stream.content["text"].as_str().unwrap().contains("Wall time"));
        let result = seen.iter().find(|m| m.msg_type() == "execute_result").unwrap();
        assert_eq!(result.content["data"]["text/plain"], "5");
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_silent_and_history_control_the_counter() {
        let mut h = start();
        h.relay
            .send(request(json!({"code": "1+1", "silent": true})))
            .unwrap();
        let silent = collect_until_idle(&mut h.out).await;
        assert_eq!(kinds(&silent), vec!["status", "execute_reply", "status"]);
        assert_eq!(silent[1].content["execution_count"], 0);

        h.relay
            .send(request(json!({"code": "1+2", "store_history": false})))
            .unwrap();
        let unstored = collect_until_idle(&mut h.out).await;
        let reply = unstored.iter().find(|m| m.msg_type() == "execute_reply").unwrap();
        assert_eq!(reply.content["execution_count"], 0);

        h.relay.send(request(json!({"code": "1+3"}))).unwrap();
        let stored = collect_until_idle(&mut h.out).await;
        let reply = stored.iter().find(|m| m.msg_type() == "execute_reply").unwrap();
        assert_eq!(reply.content["execution_count"], 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failure_keeps_relay_serving() {
        let mut h = start();
        h.relay.send(request(json!({"code": "nonsense"}))).unwrap();
        h.relay.send(request(json!({"code": "print hi"}))).unwrap();

        let first = collect_until_idle(&mut h.out).await;
        assert!(kinds(&first).contains(&"error"));

        let second = collect_until_idle(&mut h.out).await;
        let stream = second.iter().find(|m| m.msg_type() == "stream").unwrap();
        assert_eq!(stream.content["text"], "hi\n");
        assert_eq!(stream.content["name"], "stdout");
        h.shutdown.cancel();
    }

    /// Collects the target of every event seen on this thread.
    #[derive(Clone, Default)]
    struct Targets(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Targets {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0
                .lock()
                .unwrap()
                .push(event.metadata().target().to_string());
        }
    }

    #[tokio::test]
    async fn test_one_request_event_per_execution() {
        use tracing_subscriber::prelude::*;

        let targets = Targets::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(targets.clone()));

        let mut h = start();
        h.relay.send(request(json!({"code": "1+1"}))).unwrap();
        collect_until_idle(&mut h.out).await;
        h.relay.send(request(json!({"code": "%nosuchmagic"}))).unwrap();
        collect_until_idle(&mut h.out).await;
        h.shutdown.cancel();

        let seen = targets.0.lock().unwrap();
        assert_eq!(seen.iter().filter(|t| *t == REQUEST_TARGET).count(), 2);
    }
}
