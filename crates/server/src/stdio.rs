//! Newline-delimited JSON-RPC over stdin/stdout.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::rpc::McpServer;

/// Collect tasks that already finished without waiting on the rest.
fn reap_finished(in_flight: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = in_flight.try_join_next() {
        if let Err(e) = joined {
            warn!(error = %e, "Request task failed");
        }
        reaped += 1;
    }
    reaped
}

/// Serve requests from `reader` until EOF, writing one response per line.
///
/// Requests are handled concurrently; responses are written in completion
/// order.
pub async fn serve_lines<R, W>(server: Arc<McpServer>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let write_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut in_flight = JoinSet::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        reap_finished(&mut in_flight);
        if line.trim().is_empty() {
            continue;
        }
        let server = Arc::clone(&server);
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(response) = server.handle_message(&line).await {
                if tx.send(response).is_err() {
                    debug!("Output closed before response was written");
                }
            }
        });
    }

    debug!(pending = in_flight.len(), "Input closed, draining requests");
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Request task failed");
        }
    }
    drop(tx);
    write_task.await??;
    Ok(())
}

/// Run the stdio transport on the process's stdin and stdout.
pub async fn run_stdio(server: Arc<McpServer>) -> anyhow::Result<()> {
    info!("Serving MCP over stdio");
    let stdin = BufReader::new(tokio::io::stdin());
    serve_lines(server, stdin, tokio::io::stdout()).await
}
