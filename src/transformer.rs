//! Post-processing: turn a raw execution result into the protocol messages the
//! relay hands to the outbound multiplexers.
use std::collections::HashMap;

use kernel_protocol::content::{
    ErrorContent, ExecuteReply, ExecuteResult, ReplyStatus, Stream, StreamName,
};
use kernel_protocol::{KernelMessage, OutgoingType};
use serde_json::{Map, Value};

use crate::interpreter::RawResult;
use crate::multiplexer::{Outbound, OutboundError};

/// Facts about the request the transform may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostContext {
    pub execution_count: u32,
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Stream(Stream),
    ExecuteResult(ExecuteResult),
    Error(ErrorContent),
    ExecuteReply(ExecuteReply),
}

impl Emission {
    pub fn kind(&self) -> OutgoingType {
        match self {
            Emission::Stream(_) => OutgoingType::Stream,
            Emission::ExecuteResult(_) => OutgoingType::ExecuteResult,
            Emission::Error(_) => OutgoingType::Error,
            Emission::ExecuteReply(_) => OutgoingType::ExecuteReply,
        }
    }

    pub fn emit(&self, outbound: &Outbound, parent: &KernelMessage) -> Result<String, OutboundError> {
        match self {
            Emission::Stream(c) => outbound.emit(self.kind(), Some(parent), c),
            Emission::ExecuteResult(c) => outbound.emit(self.kind(), Some(parent), c),
            Emission::Error(c) => outbound.emit(self.kind(), Some(parent), c),
            Emission::ExecuteReply(c) => outbound.emit(self.kind(), Some(parent), c),
        }
    }
}

pub trait PostProcessor: Send + Sync {
    fn transform(&self, raw: RawResult, ctx: &PostContext) -> Vec<Emission>;
}

/// Streams first, then the value or the error, then the reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPostProcessor;

impl PostProcessor for DefaultPostProcessor {
    fn transform(&self, raw: RawResult, ctx: &PostContext) -> Vec<Emission> {
        let mut out = Vec::new();

        for (name, text) in [(StreamName::Stdout, raw.stdout), (StreamName::Stderr, raw.stderr)] {
            if !text.is_empty() {
                out.push(Emission::Stream(Stream { name, text }));
            }
        }

        match raw.value {
            Ok(value) => {
                if let Some(text) = value.filter(|_| !ctx.silent) {
                    let text = text.trim_end_matches('\n').to_string();
                    out.push(Emission::ExecuteResult(ExecuteResult {
                        execution_count: ctx.execution_count,
                        data: HashMap::from([("text/plain".to_string(), Value::String(text))]),
                        metadata: Map::new(),
                    }));
                }
                out.push(Emission::ExecuteReply(ExecuteReply {
                    status: ReplyStatus::Ok,
                    execution_count: ctx.execution_count,
                    user_expressions: Map::new(),
                    payload: vec![],
                    ename: None,
                    evalue: None,
                    traceback: None,
                }));
            }
            Err(failure) => {
                let traceback = if failure.traceback.is_empty() {
                    vec![format!("{}: {}", failure.ename, failure.evalue)]
                } else {
                    failure.traceback
                };
                out.push(Emission::Error(ErrorContent {
                    ename: failure.ename.clone(),
                    evalue: failure.evalue.clone(),
                    traceback: traceback.clone(),
                }));
                out.push(Emission::ExecuteReply(ExecuteReply {
                    status: ReplyStatus::Error,
                    execution_count: ctx.execution_count,
                    user_expressions: Map::new(),
                    payload: vec![],
                    ename: Some(failure.ename),
                    evalue: Some(failure.evalue),
                    traceback: Some(traceback),
                }));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::ExecutionFailure;

    fn ctx(silent: bool) -> PostContext {
        PostContext {
            execution_count: 7,
            silent,
        }
    }

    #[test]
    fn test_value_with_streams() {
        let raw = RawResult {
            value: Ok(Some("2\n".into())),
            stdout: "hello\n".into(),
            stderr: String::new(),
        };
        let out = DefaultPostProcessor.transform(raw, &ctx(false));
        let kinds: Vec<_> = out.iter().map(Emission::kind).collect();
        assert_eq!(
            kinds,
            vec![OutgoingType::Stream, OutgoingType::ExecuteResult, OutgoingType::ExecuteReply]
        );
        let Emission::ExecuteResult(result) = &out[1] else {
            panic!("expected execute_result");
        };
        assert_eq!(result.data["text/plain"], "2");
        assert_eq!(result.execution_count, 7);
    }

    #[test]
    fn test_silent_suppresses_result_only() {
        let raw = RawResult {
            value: Ok(Some("2".into())),
            stdout: String::new(),
            stderr: "warn\n".into(),
        };
        let out = DefaultPostProcessor.transform(raw, &ctx(true));
        let kinds: Vec<_> = out.iter().map(Emission::kind).collect();
        assert_eq!(kinds, vec![OutgoingType::Stream, OutgoingType::ExecuteReply]);
        let Emission::Stream(stream) = &out[0] else {
            panic!("expected stream");
        };
        assert_eq!(stream.name, StreamName::Stderr);
    }

    #[test]
    fn test_failure_becomes_error_and_error_reply() {
        let mut failure = ExecutionFailure::new("UsageError", "nope");
        failure.traceback.clear();
        let out = DefaultPostProcessor.transform(RawResult::failure(failure), &ctx(false));
        assert_eq!(out.len(), 2);
        let Emission::Error(err) = &out[0] else {
            panic!("expected error");
        };
        assert_eq!(err.traceback, vec!["UsageError: nope".to_string()]);
        let Emission::ExecuteReply(reply) = &out[1] else {
            panic!("expected reply");
        };
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.ename.as_deref(), Some("UsageError"));
    }
}
