//! Line-delimited transports
//!
//! One JSON-RPC request per line in, one response per line out.

use crate::{IpamServer, Result, RpcError};
use ipam_store::Store;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

/// STDIO transport
///
/// Reads JSON-RPC requests from stdin and writes responses to stdout.
pub struct StdioTransport<S> {
    server: Arc<IpamServer<S>>,
}

impl<S: Store> StdioTransport<S> {
    /// Create new STDIO transport
    pub fn new(server: Arc<IpamServer<S>>) -> Self {
        Self { server }
    }

    /// Serve stdin until EOF
    pub async fn run(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.serve(stdin, stdout).await
    }

    /// Serve any line-oriented reader/writer pair until EOF
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let io_error = |e: std::io::Error| RpcError::InternalError(e.to_string());
        let mut line = String::new();
        let mut handled = 0usize;

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.map_err(io_error)?;

            // EOF
            if n == 0 {
                break;
            }

            if line.trim().is_empty() {
                continue;
            }

            let response = self.server.handle_request(&line).await?;
            writer
                .write_all(response.as_bytes())
                .await
                .map_err(io_error)?;
            writer.write_all(b"\n").await.map_err(io_error)?;
            writer.flush().await.map_err(io_error)?;
            handled += 1;
        }

        info!(requests = handled, "Transport closed");
        Ok(())
    }
}
