//! Bounded TCP connect probe.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Check whether `host:port` accepts a TCP connection within `timeout_ms`.
///
/// Never fails: refusal, timeout and resolution errors all yield `false`.
/// The socket is dropped as soon as the connect completes; no payload is sent.
pub async fn is_port_open(host: &str, port: u16, timeout_ms: u64) -> bool {
    match timeout(
        Duration::from_millis(timeout_ms),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            tracing::trace!("Probe {}:{} refused: {}", host, port, e);
            false
        }
        Err(_) => {
            tracing::trace!("Probe {}:{} timed out after {}ms", host, port, timeout_ms);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_open("127.0.0.1", port, 500).await);
    }

    #[tokio::test]
    async fn test_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!is_port_open("127.0.0.1", port, 500).await);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        assert!(!is_port_open("host.invalid", 4045, 200).await);
    }

    #[tokio::test]
    async fn test_many_concurrent_probes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probes = (0..32).map(|_| is_port_open("127.0.0.1", port, 1000));
        let results = futures::future::join_all(probes).await;
        assert!(results.into_iter().all(|open| open));
    }
}
