//! Loopback stand-ins for analyzer firmware used by unit tests.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

async fn bind_loopback() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Read one framed request (up to the end marker) from a client.
async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(&[0xAA, 0x55]) {
        match stream.read(&mut byte).await {
            Ok(1) => request.push(byte[0]),
            _ => break,
        }
    }
    request
}

/// Answers every device-info request with `response`, then closes.
pub(crate) async fn spawn_fake_analyzer(response: &'static str) -> u16 {
    spawn_fragmented_analyzer(response, usize::MAX).await
}

/// Like [`spawn_fake_analyzer`] but writes `chunk` bytes at a time.
pub(crate) async fn spawn_fragmented_analyzer(response: &'static str, chunk: usize) -> u16 {
    let (listener, port) = bind_loopback().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request(&mut stream).await;
                for part in response.as_bytes().chunks(chunk.max(1)) {
                    if stream.write_all(part).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// Accepts connections and never answers.
pub(crate) async fn spawn_silent_server() -> u16 {
    let (listener, port) = bind_loopback().await;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// Listener whose accept queue is full, so new connects hang in SYN-SENT.
pub(crate) struct SaturatedListener {
    pub port: u16,
    _socket: socket2::Socket,
    _queued: Vec<TcpStream>,
}

impl SaturatedListener {
    pub(crate) async fn spawn() -> Self {
        use socket2::{Domain, Protocol, SockAddr, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&SockAddr::from(addr)).unwrap();
        socket.listen(0).unwrap();
        let port = socket.local_addr().unwrap().as_socket().unwrap().port();

        // Never accepted: fill the queue until a connect stops completing
        let mut queued = Vec::new();
        for _ in 0..16 {
            match tokio::time::timeout(
                Duration::from_millis(200),
                TcpStream::connect(("127.0.0.1", port)),
            )
            .await
            {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }

        Self {
            port,
            _socket: socket,
            _queued: queued,
        }
    }
}

/// Device stand-in for connection tests.
///
/// Drains everything a client writes, forwarding byte counts on `received`.
/// Dropping `shutdown` (or sending on it) closes the listener and every
/// accepted socket, simulating the device going away.
pub(crate) struct SinkServer {
    pub port: u16,
    pub received: mpsc::UnboundedReceiver<usize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SinkServer {
    pub(crate) async fn spawn() -> Self {
        let (listener, port) = bind_loopback().await;
        let (tx, received) = mpsc::unbounded_channel();
        let (shutdown, mut stop) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut connections = Vec::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        let tx = tx.clone();
                        connections.push(tokio::spawn(async move {
                            let mut buf = [0u8; 4096];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        let _ = tx.send(n);
                                    }
                                }
                            }
                        }));
                    }
                    _ = &mut stop => break,
                }
            }
            for connection in connections {
                connection.abort();
            }
        });

        Self {
            port,
            received,
            shutdown: Some(shutdown),
        }
    }

    /// Close the listener and all accepted sockets.
    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

}

impl Drop for SinkServer {
    fn drop(&mut self) {
        self.stop();
    }
}
