//! JSON-lines stand-in for the socket layer: one decoded `KernelMessage` per
//! input line, one `Envelope` per output line.
use async_trait::async_trait;
use kernel_protocol::{Envelope, KernelMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::logger::Logger;
use crate::multiplexer::SocketSink;
use crate::topology::{Kernel, RouteError};

pub struct LineSink<W> {
    writer: Mutex<W>,
}

impl<W> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl LineSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> SocketSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Feed every line of `reader` into the kernel until EOF. Undecodable lines
/// and unroutable messages are logged and skipped. Returns how many messages
/// were routed.
pub async fn pump<R>(reader: R, kernel: &Kernel, logger: &Logger) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut routed = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: KernelMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                logger.warn("transport", &format!("undecodable line skipped: {err}"));
                continue;
            }
        };
        match kernel.route(message) {
            Ok(()) => routed += 1,
            // already logged by the kernel
            Err(RouteError::Protocol(_)) => {}
            Err(err @ RouteError::Closed(_)) => logger.error("transport", &err.to_string()),
        }
    }
    Ok(routed)
}
