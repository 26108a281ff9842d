//! Magic directives: parsing the `%name` / `%%name` prefix, the catalog the
//! relay resolves names against, and the built-in commands.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use kernel_protocol::content::StreamName;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::interpreter::{ExecutionFailure, Interpreter, SessionIo};

static MAGIC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(%%?)([A-Za-z_][A-Za-z0-9_.]*)(?:[ \t]+(.*))?$").expect("magic pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagicKind {
    Line,
    Cell,
}

impl MagicKind {
    pub fn prefix(self) -> &'static str {
        match self {
            MagicKind::Line => "%",
            MagicKind::Cell => "%%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicInvocation {
    pub kind: MagicKind,
    pub name: String,
    /// Raw argument string, untouched apart from surrounding whitespace.
    pub args: String,
    /// Cell body; always `None` for line magics.
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCode {
    Plain(String),
    Magic(MagicInvocation),
}

/// Look at the first non-blank line for a magic prefix.
///
/// `%name args` is a line magic whose argument string is everything after the
/// name. `%%name args` is a cell magic; the remaining lines are its body.
pub fn parse(code: &str) -> ParsedCode {
    let text = code.trim_start();
    let (first, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first.trim_end(), Some(rest)),
        None => (text.trim_end(), None),
    };

    let Some(caps) = MAGIC_LINE.captures(first) else {
        return ParsedCode::Plain(code.to_string());
    };
    let name = caps[2].to_string();
    let inline_args = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();

    let invocation = if &caps[1] == "%%" {
        MagicInvocation {
            kind: MagicKind::Cell,
            name,
            args: inline_args.to_string(),
            body: Some(rest.unwrap_or_default().to_string()),
        }
    } else {
        let args = match rest {
            Some(rest) if !rest.trim().is_empty() => format!("{inline_args}\n{rest}"),
            _ => inline_args.to_string(),
        };
        MagicInvocation {
            kind: MagicKind::Line,
            name,
            args: args.trim().to_string(),
            body: None,
        }
    };
    ParsedCode::Magic(invocation)
}

/// What a magic gets to work with while it runs on the interpreter thread.
pub struct MagicContext<'a> {
    pub session: &'a mut dyn Interpreter,
    pub io: &'a mut SessionIo,
    pub catalog: &'a MagicCatalog,
}

pub trait MagicCommand: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, kind: MagicKind) -> bool;
    fn invoke(
        &self,
        invocation: &MagicInvocation,
        ctx: &mut MagicContext<'_>,
    ) -> Result<Option<String>, ExecutionFailure>;
}

/// Supplies the magic commands available at boot.
pub trait MagicLoader: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<Arc<dyn MagicCommand>>>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MagicError {
    #[error("{} magic function `{}{name}` not found.", kind_label(.kind), .kind.prefix())]
    NotFound { kind: MagicKind, name: String },

    #[error("magic `{name}` cannot be used as a {} magic", kind_word(.kind))]
    UnsupportedMode { kind: MagicKind, name: String },

    #[error("magic `{0}` is defined twice")]
    Duplicate(String),
}

fn kind_label(kind: &MagicKind) -> &'static str {
    match kind {
        MagicKind::Line => "Line",
        MagicKind::Cell => "Cell",
    }
}

fn kind_word(kind: &MagicKind) -> &'static str {
    match kind {
        MagicKind::Line => "line",
        MagicKind::Cell => "cell",
    }
}

impl MagicError {
    pub fn to_failure(&self) -> ExecutionFailure {
        ExecutionFailure::new("UsageError", self.to_string())
    }
}

#[derive(Default)]
pub struct MagicCatalog {
    commands: BTreeMap<String, Arc<dyn MagicCommand>>,
}

impl MagicCatalog {
    pub fn from_commands(commands: Vec<Arc<dyn MagicCommand>>) -> Result<Self, MagicError> {
        let mut map = BTreeMap::new();
        for command in commands {
            let name = command.name().to_string();
            if map.insert(name.clone(), command).is_some() {
                return Err(MagicError::Duplicate(name));
            }
        }
        Ok(Self { commands: map })
    }

    pub fn resolve(&self, invocation: &MagicInvocation) -> Result<Arc<dyn MagicCommand>, MagicError> {
        let command = self
            .commands
            .get(&invocation.name)
            .ok_or_else(|| MagicError::NotFound {
                kind: invocation.kind,
                name: invocation.name.clone(),
            })?;
        if !command.supports(invocation.kind) {
            return Err(MagicError::UnsupportedMode {
                kind: invocation.kind,
                name: invocation.name.clone(),
            });
        }
        Ok(Arc::clone(command))
    }

    pub fn names(&self, kind: MagicKind) -> Vec<String> {
        self.commands
            .values()
            .filter(|c| c.supports(kind))
            .map(|c| format!("{}{}", kind.prefix(), c.name()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Debug for MagicCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagicCatalog")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `%lsmagic`: list what the catalog holds.
pub struct LsMagic;

impl MagicCommand for LsMagic {
    fn name(&self) -> &str {
        "lsmagic"
    }

    fn supports(&self, kind: MagicKind) -> bool {
        kind == MagicKind::Line
    }

    fn invoke(
        &self,
        _invocation: &MagicInvocation,
        ctx: &mut MagicContext<'_>,
    ) -> Result<Option<String>, ExecutionFailure> {
        Ok(Some(format!(
            "Available line magics:\n{}\n\nAvailable cell magics:\n{}",
            ctx.catalog.names(MagicKind::Line).join("  "),
            ctx.catalog.names(MagicKind::Cell).join("  "),
        )))
    }
}

/// `%time code` / `%%time`: run code and report the wall time on stdout.
pub struct TimeMagic;

impl MagicCommand for TimeMagic {
    fn name(&self) -> &str {
        "time"
    }

    fn supports(&self, _kind: MagicKind) -> bool {
        true
    }

    fn invoke(
        &self,
        invocation: &MagicInvocation,
        ctx: &mut MagicContext<'_>,
    ) -> Result<Option<String>, ExecutionFailure> {
        let code = match invocation.kind {
            MagicKind::Line => invocation.args.as_str(),
            MagicKind::Cell => invocation.body.as_deref().unwrap_or_default(),
        };
        let started = Instant::now();
        let result = ctx.session.execute(code, &mut *ctx.io);
        ctx.io
            .write(StreamName::Stdout, &format!("Wall time: {:?}\n", started.elapsed()));
        result
    }
}

/// The magics compiled into the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinMagics;

impl MagicLoader for BuiltinMagics {
    fn load(&self) -> anyhow::Result<Vec<Arc<dyn MagicCommand>>> {
        let commands: Vec<Arc<dyn MagicCommand>> = vec![Arc::new(LsMagic), Arc::new(TimeMagic)];
        Ok(commands)
    }
}
