use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::Instrument;

/// Accepts connections on `bind` until interrupted with Ctrl-C.
pub async fn run(bind: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind to {bind}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    tokio::select! {
        result = serve(listener) => result,
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

/// Accepts connections forever, spawning one task per connection.
pub async fn serve(listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(%error, "Accept error");
                continue;
            }
        };

        let span = tracing::info_span!("connection", %peer);
        tokio::spawn(handle_connection(stream).instrument(span));
    }
}

/// Logs every line read from `stream` until it is closed, returning the number of lines.
async fn handle_connection<R>(stream: R) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut count = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!("Read line {line}");
                count += 1;
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, "Read line error");
                break;
            }
        }
    }

    tracing::debug!("Connection closed after {count} lines");
    count
}
