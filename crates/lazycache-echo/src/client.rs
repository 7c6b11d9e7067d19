use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use lazycache::{CacheConfig, LazyCache};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal;
use tokio::sync::{Mutex, Notify};

use crate::config::SendConfig;

/// A connection shared by all tasks writing to the same address.
pub type Connection = Arc<Mutex<TcpStream>>;

/// Connections keyed by the address they were dialed to.
pub type ConnectionCache = LazyCache<String, Connection, DialError>;

/// An error obtaining a [`Connection`] from the [`ConnectionCache`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DialError {
    /// The cache could not produce a connection.
    #[error(transparent)]
    Cache(#[from] lazycache::Error),
    /// Connecting to the address failed.
    #[error("failed to connect to {addr}")]
    Connect {
        /// The address that was dialed.
        addr: String,
        /// The underlying I/O error, shared between all waiting tasks.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Creates the connection cache.
///
/// Connections leaving the cache are shut down, and `closed` is notified once that is done.
pub fn connection_cache(config: &CacheConfig, closed: Arc<Notify>) -> ConnectionCache {
    LazyCache::builder()
        .config(config)
        .constructor(dial)
        .on_delete(move |addr, connection: Connection| {
            tracing::info!("Closing connection to {addr}");
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                if let Err(error) = connection.lock().await.shutdown().await {
                    tracing::warn!(%error, "Failed to shut down connection to {addr}");
                }
                closed.notify_one();
            });
        })
        .build()
}

async fn dial(addr: String) -> Result<Connection, DialError> {
    tracing::info!("Connecting to {addr}");
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| DialError::Connect {
            addr: addr.clone(),
            source: Arc::new(source),
        })?;
    Ok(Arc::new(Mutex::new(stream)))
}

/// Writes a single numbered line to the connection for `addr`.
///
/// A connection that fails to write is evicted, so the next caller dials a fresh one.
async fn send_line(cache: &ConnectionCache, addr: String, line: usize) -> Result<()> {
    let connection = cache.get(addr.clone()).await?;

    tracing::debug!("Write data {line}");
    let written = connection
        .lock()
        .await
        .write_all(format!("{line}\n").as_bytes())
        .await;

    if let Err(error) = written {
        cache.delete(&addr);
        return Err(error).with_context(|| format!("failed to write line {line} to {addr}"));
    }

    Ok(())
}

/// Sends one line from each of `tasks` concurrent tasks, returning how many succeeded.
pub async fn send_lines(cache: &ConnectionCache, addr: &str, tasks: usize) -> usize {
    let handles = (0..tasks).map(|line| {
        let cache = cache.clone();
        let addr = addr.to_owned();
        tokio::spawn(async move { send_line(&cache, addr, line).await })
    });

    let mut sent = 0;
    for result in join_all(handles).await {
        match result {
            Ok(Ok(())) => sent += 1,
            Ok(Err(error)) => tracing::warn!("{error:#}"),
            Err(error) => tracing::warn!(%error, "Sending task failed"),
        }
    }
    sent
}

/// Sends lines from many tasks over one cached connection, then waits for it to be closed.
pub async fn run(config: &SendConfig, cache_config: &CacheConfig) -> Result<()> {
    let closed = Arc::new(Notify::new());
    let cache = connection_cache(cache_config, Arc::clone(&closed));

    let sent = send_lines(&cache, &config.addr, config.tasks).await;
    tracing::info!("Sent {sent} of {} lines", config.tasks);
    if sent == 0 {
        anyhow::bail!("failed to send any line to {}", config.addr);
    }
    if cache.is_empty() {
        return Ok(());
    }

    match cache.lifetime() {
        Some(lifetime) => tracing::info!(
            "Waiting for the connection to idle out after {}",
            humantime::format_duration(lifetime)
        ),
        None => cache.clear(),
    }

    tokio::select! {
        _ = closed.notified() => {}
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            cache.clear();
            closed.notified().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn no_expiry() -> CacheConfig {
        CacheConfig {
            name: Some("test".into()),
            lifetime: None,
        }
    }

    #[tokio::test]
    async fn test_lines_share_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let received = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line.parse::<usize>().unwrap());
            }
            received
        });

        let closed = Arc::new(Notify::new());
        let cache = connection_cache(&no_expiry(), Arc::clone(&closed));

        assert_eq!(send_lines(&cache, &addr, 10).await, 10);
        assert_eq!(cache.len(), 1);

        cache.clear();
        closed.notified().await;

        let mut received = received.await.unwrap();
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_dial_is_not_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cache = connection_cache(&no_expiry(), Arc::new(Notify::new()));

        let result = cache.get(addr.clone()).await;
        assert!(matches!(result, Err(DialError::Connect { addr: ref failed, .. }) if *failed == addr));
        assert!(cache.is_empty());

        assert_eq!(send_lines(&cache, &addr, 3).await, 0);
        assert!(cache.is_empty());
    }
}
