use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, TimeoutConfig};
use crate::connection::{
    ConnectionBuffer, SendSummary, configure_stream, receive_until_zero, send_all, within,
};
use crate::error::{Error, Result};
use crate::gate::CompletionGate;
use crate::payload::Payload;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    AcceptPending,
    Stopped,
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    responses_sent: AtomicU64,
    failed: AtomicU64,
}

impl ListenerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections whose full payload was written.
    pub fn responses_sent(&self) -> u64 {
        self.responses_sent.load(Ordering::Relaxed)
    }

    /// Failed accepts plus connections abandoned after an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Everything a connection task needs, shared by all connections.
struct ConnectionContext {
    payload: Payload,
    buffer_size: usize,
    io_timeout: Option<Duration>,
    stats: Arc<ListenerStats>,
}

/// Owns the listening socket and runs the accept cycle: one accept in
/// flight at a time, each accepted connection served on its own task.
pub struct ListenerController {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    accept_done: CompletionGate,
    context: Arc<ConnectionContext>,
    state: Arc<watch::Sender<ListenerState>>,
    shutdown: Arc<Notify>,
}

/// Observes and stops a running listener from outside its task.
#[derive(Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    state: watch::Receiver<ListenerState>,
    shutdown: Arc<Notify>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Stops the accept cycle; connections already accepted run to completion.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl ListenerController {
    /// Binds and starts listening. Failure here is fatal for the listener.
    pub async fn bind(config: &ServerConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let payload = Payload::generate(config.response_data_count, config.payload_seed);
        Self::bind_with_payload(config, timeouts, payload).await
    }

    pub async fn bind_with_payload(
        config: &ServerConfig,
        timeouts: &TimeoutConfig,
        payload: Payload,
    ) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let listener = listen(addr, config.listen_queue_size)
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (state, _) = watch::channel(ListenerState::Listening);

        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
            accept_done: CompletionGate::new("accept"),
            context: Arc::new(ConnectionContext {
                payload,
                buffer_size: config.buffer_size,
                io_timeout: timeouts.io_timeout(),
                stats: Arc::new(ListenerStats::default()),
            }),
            state: Arc::new(state),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn payload(&self) -> &Payload {
        &self.context.payload
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            local_addr: self.local_addr,
            stats: self.context.stats.clone(),
            state: self.state.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "Listening on {} ({} byte payload)",
            self.local_addr,
            self.context.payload.len()
        );

        loop {
            // reset strictly before the accept that signals it is issued
            self.accept_done.reset();
            self.state.send_replace(ListenerState::AcceptPending);
            debug!("Waiting for a connection...");

            let accept = tokio::spawn(accept_one(
                self.listener.clone(),
                self.accept_done.clone(),
                self.context.clone(),
            ));

            tokio::select! {
                _ = self.accept_done.wait() => {}
                _ = self.shutdown.notified() => {
                    if !self.accept_done.is_signaled() {
                        accept.abort();
                    }
                    break;
                }
            }
        }

        self.state.send_replace(ListenerState::Stopped);
        info!("Listener on {} stopped", self.local_addr);
        Ok(())
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

async fn accept_one(
    listener: Arc<TcpListener>,
    accept_done: CompletionGate,
    context: Arc<ConnectionContext>,
) {
    let accepted = listener.accept().await;
    let stats = &context.stats;

    let (stream, peer) = match accepted {
        Ok(accepted) => {
            accept_done.signal();
            accepted
        }
        Err(e) => {
            error!("Failed to accept connection: {}", e);
            stats.failed.fetch_add(1, Ordering::Relaxed);
            time::sleep(ACCEPT_BACKOFF).await;
            accept_done.signal();
            return;
        }
    };

    stats.accepted.fetch_add(1, Ordering::Relaxed);
    debug!("New connection from {}", peer);

    match serve(stream, &context).await {
        Ok(sent) => info!("Sent {} bytes to {} in {} writes", sent.bytes, peer, sent.writes),
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("Error handling connection from {}: {}", peer, e);
        }
    }
}

/// Receive until the peer half-closes, answer with the payload, close.
async fn serve(mut stream: TcpStream, context: &ConnectionContext) -> Result<SendSummary> {
    if let Err(e) = configure_stream(&stream) {
        warn!("Failed to configure accepted stream: {}", e);
    }

    let mut buffer = ConnectionBuffer::new(context.buffer_size);
    let received = within(
        "receive",
        context.io_timeout,
        receive_until_zero(&mut stream, &mut buffer),
    )
    .await?;
    debug!(
        "Request complete: {} bytes in {} reads",
        received.bytes, received.reads
    );

    let sent = within(
        "send",
        context.io_timeout,
        send_all(&mut stream, context.payload.as_bytes()),
    )
    .await?;
    context.stats.responses_sent.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = socket2::SockRef::from(&stream).shutdown(std::net::Shutdown::Both) {
        debug!("Shutdown after send failed: {}", e);
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback(response_data_count: usize) -> ServerConfig {
        ServerConfig {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            response_data_count,
            payload_seed: Some(1),
            ..ServerConfig::default()
        }
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let first = ListenerController::bind(&loopback(4), &TimeoutConfig::default())
            .await
            .unwrap();

        let mut taken = loopback(4);
        taken.port = first.local_addr().port();
        // SO_REUSEADDR does not allow two listeners on one port
        let err = ListenerController::bind(&taken, &TimeoutConfig::default())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn answers_request_with_payload() {
        let controller = ListenerController::bind(&loopback(4096), &TimeoutConfig::default())
            .await
            .unwrap();
        let expected = controller.payload().clone();
        let handle = controller.handle();
        tokio::spawn(controller.run());

        let response = exchange(handle.local_addr(), b"/").await;

        assert_eq!(response, expected.as_bytes());
        assert_eq!(handle.stats().responses_sent(), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn stalled_request_is_abandoned_after_deadline() {
        let timeouts = TimeoutConfig { io_timeout_ms: 50 };
        let controller = ListenerController::bind(&loopback(16), &timeouts)
            .await
            .unwrap();
        let handle = controller.handle();
        tokio::spawn(controller.run());

        // connect and never half-close
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        stream.write_all(b"/").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();

        assert!(response.is_empty());
        // the stream drops before the failure is counted
        for _ in 0..100 {
            if handle.stats().failed() == 1 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().failed(), 1);
        assert_eq!(handle.stats().responses_sent(), 0);
        assert_eq!(handle.state(), ListenerState::AcceptPending);
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_cycle() {
        let controller = ListenerController::bind(&loopback(8), &TimeoutConfig::default())
            .await
            .unwrap();
        let handle = controller.handle();
        let task = tokio::spawn(controller.run());

        handle.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(handle.state(), ListenerState::Stopped);
    }
}
