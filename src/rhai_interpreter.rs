//! A [Rhai](https://rhai.rs) session behind the `Interpreter` seam.
//!
//! Top-level `let` bindings live in a persistent scope and `fn` definitions
//! are merged into a function library, so later cells see what earlier ones
//! defined. `print` goes to stdout, `debug` to stderr, and `input(prompt)`
//! asks the frontend over the stdin socket. The cell's `SessionIo` is lent to
//! the engine hooks while it runs, so output is routed as it happens.
use std::sync::{Arc, Mutex, PoisonError};

use kernel_protocol::content::StreamName;
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope, AST};

use crate::interpreter::{Completion, ExecutionFailure, InputError, Interpreter, SessionIo};

const KEYWORDS: &[&str] = &[
    "let", "const", "fn", "if", "else", "switch", "while", "loop", "for", "in", "do", "until",
    "break", "continue", "return", "throw", "try", "catch", "true", "false", "import", "export",
    "private", "this", "print", "debug", "input",
];

type IoSlot = Arc<Mutex<Option<SessionIo>>>;

pub struct RhaiInterpreter {
    engine: Engine,
    scope: Scope<'static>,
    library: AST,
    io: IoSlot,
}

impl RhaiInterpreter {
    pub fn new() -> Self {
        let io: IoSlot = Arc::default();
        let mut engine = Engine::new();

        let slot = Arc::clone(&io);
        engine.on_print(move |text| {
            write(&slot, StreamName::Stdout, &format!("{text}\n"));
        });
        let slot = Arc::clone(&io);
        engine.on_debug(move |text, source, pos| {
            let line = match (source, pos.is_none()) {
                (Some(source), false) => format!("{source} @ {pos:?} | {text}\n"),
                (None, false) => format!("{pos:?} | {text}\n"),
                _ => format!("{text}\n"),
            };
            write(&slot, StreamName::Stderr, &line);
        });

        let slot = Arc::clone(&io);
        engine.register_fn("input", move |prompt: &str| read_input(&slot, prompt));
        let slot = Arc::clone(&io);
        engine.register_fn("input", move || read_input(&slot, ""));

        Self {
            engine,
            scope: Scope::new(),
            library: AST::empty(),
            io,
        }
    }

    fn eval(&mut self, code: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        let ast = self.engine.compile_with_scope(&self.scope, code)?;
        let runnable = self.library.merge(&ast);
        // Function definitions survive even if the statements fail.
        self.library = self.library.merge(&ast.clone_functions_only());
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &runnable)
    }
}

impl Default for RhaiInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter for RhaiInterpreter {
    fn execute(&mut self, code: &str, io: &mut SessionIo) -> Result<Option<String>, ExecutionFailure> {
        *lock(&self.io) = Some(std::mem::take(io));
        let result = self.eval(code);
        if let Some(lent) = lock(&self.io).take() {
            *io = lent;
        }

        match result {
            Ok(value) if value.is_unit() => Ok(None),
            Ok(value) => Ok(Some(value.to_string())),
            Err(err) => Err(failure(&err)),
        }
    }

    fn complete(&mut self, code: &str, cursor_pos: usize) -> Completion {
        let end = code
            .char_indices()
            .nth(cursor_pos)
            .map(|(i, _)| i)
            .unwrap_or(code.len());
        let head = &code[..end];
        let prefix: String = head
            .chars()
            .rev()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let cursor_end = head.chars().count();
        let cursor_start = cursor_end - prefix.chars().count();

        let mut matches: Vec<String> = KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .chain(self.scope.iter().map(|(name, _, _)| name.to_string()))
            .chain(self.library.iter_functions().map(|f| f.name.to_string()))
            .filter(|candidate| !prefix.is_empty() && candidate.starts_with(&prefix))
            .collect();
        matches.sort();
        matches.dedup();

        Completion {
            matches,
            cursor_start,
            cursor_end,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write(slot: &IoSlot, stream: StreamName, text: &str) {
    if let Some(io) = lock(slot).as_mut() {
        io.write(stream, text);
    }
}

fn read_input(slot: &IoSlot, prompt: &str) -> Result<String, Box<EvalAltResult>> {
    let mut guard = lock(slot);
    let Some(io) = guard.as_mut() else {
        return Err("input() called outside a cell".into());
    };
    io.read_line(prompt, false).map_err(|err| match err {
        InputError::NotAllowed => {
            "input() is not available: the frontend does not accept input requests".into()
        }
        other => other.to_string().into(),
    })
}

fn failure(err: &EvalAltResult) -> ExecutionFailure {
    let ename = match err {
        EvalAltResult::ErrorParsing(..) => "SyntaxError",
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            "NameError"
        }
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeError"
        }
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorStringBounds(..) => "IndexError",
        EvalAltResult::ErrorRuntime(..) => "RuntimeError",
        _ => "EvalError",
    };
    let mut failure = ExecutionFailure::new(ename, err.to_string());
    let pos: Position = err.position();
    if !pos.is_none() {
        failure.traceback.push(format!("  at {pos}"));
    }
    failure
}
