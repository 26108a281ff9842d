use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use kernel_relay::{
    comm::{CommRegistry, EchoTarget},
    config::{EnvConfigManager, KernelConfig},
    interpreter::StderrOnly,
    logger::init_tracing,
    magic::BuiltinMagics,
    multiplexer::SocketSet,
    rhai_interpreter::RhaiInterpreter,
    schema::write_schema,
    topology::TopologyBuilder,
    transport::{pump, LineSink},
};
use tokio::io::BufReader;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "kernel_relay",
    about = "Jupyter-style kernel message relay with a Rhai interpreter",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot the kernel: JSON messages on stdin, JSON envelopes on stdout
    Run(RunArgs),

    /// Emit JSON-Schema for every message content type
    Schema(SchemaArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Log level (error, warn, info, debug, trace) or a full filter directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to daily files next to this path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// `.env` file read before the process environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Override KERNEL_CAPTURE_STDOUT
    #[arg(long)]
    capture_stdout: Option<bool>,

    /// Override KERNEL_CAPTURE_STDERR
    #[arg(long)]
    capture_stderr: Option<bool>,

    /// Override KERNEL_SESSION
    #[arg(long)]
    session: Option<String>,

    /// Override KERNEL_USERNAME
    #[arg(long)]
    username: Option<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Where the schema files go
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| {
        Commands::Run(RunArgs {
            log_level: "info".to_string(),
            env_file: PathBuf::from(".env"),
            ..RunArgs::default()
        })
    }) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let written = write_schema(&args.out_dir)?;
            eprintln!(
                "{} schemas written to {}",
                written.len(),
                args.out_dir.display()
            );
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    // stdout carries protocol traffic, so logs only ever go to stderr or files
    let logger = init_tracing(&args.log_level, args.log_file.clone())?;

    let mut config = KernelConfig::load(&EnvConfigManager::new(&args.env_file))
        .map_err(anyhow::Error::msg)
        .context("invalid kernel configuration")?;
    if let Some(capture) = args.capture_stdout {
        config.capture_stdout = capture;
    }
    if let Some(capture) = args.capture_stderr {
        config.capture_stderr = capture;
    }
    if let Some(session) = args.session {
        config.session = session;
    }
    if let Some(username) = args.username {
        config.username = username;
    }
    info!(
        session = %config.session,
        capture_stdout = config.capture_stdout,
        capture_stderr = config.capture_stderr,
        "kernel starting"
    );

    let comms = CommRegistry::new();
    comms.register_target("echo", Arc::new(EchoTarget));

    let kernel = TopologyBuilder::new(config, logger.clone())
        .interpreter(Box::new(RhaiInterpreter::new()))
        .magic_loader(Box::new(BuiltinMagics))
        .sockets(SocketSet::shared(Arc::new(LineSink::stdout())))
        // stdout is the protocol stream
        .passthrough(Arc::new(StderrOnly))
        .comms(comms)
        .boot()
        .await
        .context("kernel boot failed")?;

    let reader = BufReader::new(tokio::io::stdin());
    let interrupted = tokio::select! {
        routed = pump(reader, &kernel, &logger) => {
            info!(routed = routed?, "input closed, draining");
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        info!("interrupted, shutting down");
        kernel.shutdown().await;
    } else {
        kernel.drain().await;
    }
    Ok(())
}
