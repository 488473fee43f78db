use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, error, info};

use crate::config::{ClientConfig, TimeoutConfig};
use crate::connection::{
    ConnectionBuffer, DEFAULT_BUFFER_SIZE, configure_stream, receive_until_zero, send_all,
};
use crate::error::{Error, Result};
use crate::gate::CompletionGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::InvalidEndpoint("empty host".to_string()));
        }
        if port == 0 {
            return Err(Error::InvalidEndpoint(format!("{}: port 0", host)));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Sending,
    Sent,
    Receiving,
    Closed,
    Failed,
}

impl ClientState {
    fn name(self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Sending => "sending",
            ClientState::Sent => "sent",
            ClientState::Receiving => "receiving",
            ClientState::Closed => "closed",
            ClientState::Failed => "failed",
        }
    }
}

/// Resolves `endpoint`, preferring the first IPv4 address.
pub async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((endpoint.host(), endpoint.port()))
        .await
        .map_err(|source| Error::Resolve {
            host: endpoint.host().to_string(),
            source,
        })?
        .collect();

    pick_address(&addrs).ok_or_else(|| Error::NoAddress(endpoint.to_string()))
}

fn pick_address(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Drives one request: connect, send the token and half-close, receive
/// until the server closes, close. Each phase runs on its own task and
/// signals its gate; the controller waits on that gate before moving on.
pub struct ClientController {
    endpoint: Endpoint,
    buffer_size: usize,
    io_timeout: Option<Duration>,
    state: ClientState,
    stream: Option<TcpStream>,
    response: Option<Vec<u8>>,
    connect_done: CompletionGate,
    send_done: CompletionGate,
    receive_done: CompletionGate,
}

impl ClientController {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            buffer_size: DEFAULT_BUFFER_SIZE,
            io_timeout: TimeoutConfig::default().io_timeout(),
            state: ClientState::Idle,
            stream: None,
            response: None,
            connect_done: CompletionGate::new("connect"),
            send_done: CompletionGate::new("send"),
            receive_done: CompletionGate::new("receive"),
        }
    }

    pub fn from_config(config: &ClientConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let endpoint = Endpoint::new(config.host.clone(), config.port)?;
        Ok(Self::new(endpoint)
            .with_buffer_size(config.buffer_size)
            .with_io_timeout(timeouts.io_timeout()))
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether a socket is currently held.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The accumulated response; `None` until the receive phase completed.
    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        self.response.take()
    }

    pub async fn connect(&mut self) -> Result<SocketAddr> {
        self.enter(ClientState::Idle, ClientState::Connecting, "connect")?;

        // no socket exists until resolution succeeded
        let addr = match resolve(&self.endpoint).await {
            Ok(addr) => addr,
            Err(e) => return self.fail(e),
        };
        debug!("Resolved {} to {}", self.endpoint, addr);

        let outcome = run_phase(&self.connect_done, self.io_timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            configure_stream(&stream)?;
            Ok::<_, Error>(stream)
        })
        .await;

        match outcome {
            Ok(stream) => {
                debug!("Socket connected to {}", addr);
                self.stream = Some(stream);
                self.state = ClientState::Connected;
                Ok(addr)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Writes `token` in full, then half-closes the write side so the
    /// server sees the end of the request.
    pub async fn send(&mut self, token: &[u8]) -> Result<usize> {
        self.enter(ClientState::Connected, ClientState::Sending, "send")?;
        let mut stream = self.take_stream("send")?;
        let token = token.to_vec();

        let outcome = run_phase(&self.send_done, self.io_timeout, async move {
            let sent = send_all(&mut stream, &token).await?;
            stream.shutdown().await?;
            Ok::<_, Error>((stream, sent))
        })
        .await;

        match outcome {
            Ok((stream, sent)) => {
                debug!("Sent {} bytes to server", sent.bytes);
                self.stream = Some(stream);
                self.state = ClientState::Sent;
                Ok(sent.bytes)
            }
            Err(e) => self.fail(e),
        }
    }

    pub async fn receive(&mut self) -> Result<&[u8]> {
        self.enter(ClientState::Sent, ClientState::Receiving, "receive")?;
        let mut stream = self.take_stream("receive")?;
        let mut buffer = ConnectionBuffer::new(self.buffer_size);

        let outcome = run_phase(&self.receive_done, self.io_timeout, async move {
            receive_until_zero(&mut stream, &mut buffer).await?;
            Ok::<_, Error>((stream, buffer))
        })
        .await;

        match outcome {
            Ok((stream, buffer)) => {
                debug!("Response received: {} bytes", buffer.len());
                self.stream = Some(stream);
                Ok(self.response.insert(buffer.into_accumulated()).as_slice())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Shuts down both directions and releases the socket. Safe to call in
    /// any state.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = socket2::SockRef::from(&stream).shutdown(Shutdown::Both) {
                debug!("Shutdown on close failed: {}", e);
            }
        }
        if self.state != ClientState::Failed {
            self.state = ClientState::Closed;
        }
    }

    /// Runs every phase in order and returns the response.
    pub async fn request(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        let outcome = self.run_phases(token).await;
        self.close();
        outcome?;

        let response = self.take_response().unwrap_or_default();
        info!("Received {} bytes from {}", response.len(), self.endpoint);
        Ok(response)
    }

    async fn run_phases(&mut self, token: &[u8]) -> Result<()> {
        self.connect().await?;
        self.send(token).await?;
        self.receive().await?;
        Ok(())
    }

    fn enter(&mut self, from: ClientState, to: ClientState, operation: &'static str) -> Result<()> {
        if self.state != from {
            return Err(Error::InvalidState {
                operation,
                state: self.state.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    fn take_stream(&mut self, operation: &'static str) -> Result<TcpStream> {
        match self.stream.take() {
            Some(stream) => Ok(stream),
            None => {
                let err = Error::InvalidState {
                    operation,
                    state: "disconnected",
                };
                self.fail(err)
            }
        }
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        error!("Request to {} abandoned: {}", self.endpoint, err);
        self.stream = None;
        self.state = ClientState::Failed;
        Err(err)
    }
}

/// Issues `op` on its own task and waits for it through `gate`. The task
/// owns whatever socket `op` captured, so a timed-out phase drops it.
async fn run_phase<T, F>(gate: &CompletionGate, deadline: Option<Duration>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    gate.reset();
    let completion = gate.clone();
    let task = tokio::spawn(async move {
        let outcome = op.await;
        completion.signal();
        outcome
    });

    if let Err(e) = gate.wait_timeout(deadline).await {
        task.abort();
        return Err(e);
    }

    task.await.map_err(|e| Error::Io(io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv6Addr};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_rejects_port_zero_and_empty_host() {
        assert!(matches!(
            Endpoint::new("localhost", 0),
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(Endpoint::new("", 5050), Err(Error::InvalidEndpoint(_))));
        assert_eq!(Endpoint::new("localhost", 5050).unwrap().to_string(), "localhost:5050");
    }

    #[test]
    fn prefers_first_ipv4_address() {
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5050);
        let v4 = SocketAddr::from(([127, 0, 0, 1], 5050));
        let other = SocketAddr::from(([10, 0, 0, 1], 5050));

        assert_eq!(pick_address(&[v6, v4, other]), Some(v4));
        assert_eq!(pick_address(&[v6]), Some(v6));
        assert_eq!(pick_address(&[]), None);
    }

    #[tokio::test]
    async fn phases_out_of_order_are_rejected() {
        let mut client = ClientController::new(Endpoint::new("127.0.0.1", 5050).unwrap());

        let err = client.send(b"/").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "send", state: "idle" }));
        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "receive", .. }));
        // rejected phases leave the client untouched
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn half_closes_after_sending_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            // completes only if the client half-closed
            stream.read_to_end(&mut request).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            request
        });

        let mut client = ClientController::new(Endpoint::new("127.0.0.1", port).unwrap());
        client.connect().await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.send(b"/ping").await.unwrap(), 5);
        assert_eq!(client.state(), ClientState::Sent);
        assert_eq!(client.receive().await.unwrap(), b"pong");
        client.close();

        assert_eq!(server.await.unwrap(), b"/ping");
        assert_eq!(client.state(), ClientState::Closed);
        assert!(!client.is_open());
        assert_eq!(client.response(), Some(&b"pong"[..]));
    }

    #[tokio::test]
    async fn silent_server_times_out_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let mut client = ClientController::new(Endpoint::new("127.0.0.1", port).unwrap())
            .with_io_timeout(Some(Duration::from_millis(100)));

        let err = client.request(b"/").await.unwrap_err();

        assert!(matches!(err, Error::Timeout { phase: "receive", .. }));
        assert_eq!(client.state(), ClientState::Failed);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn refused_connection_fails_the_client() {
        // grab a free port, then release it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = ClientController::new(Endpoint::new("127.0.0.1", port).unwrap());
        let err = client.connect().await.unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(client.state(), ClientState::Failed);
        assert!(client.send(b"/").await.is_err());
    }
}
