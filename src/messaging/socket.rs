use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{
    DeliveryTag, Disposition, EventSink, EventSource, MessageEnvelope, SendReceipt, Substrate,
    TransportError, TransportResult,
};

// ============================================================================
// Push/pull over framed TCP
// ============================================================================
//
// The publisher binds and pushes; workers connect and pull. Every message
// goes to exactly one connected worker, chosen round-robin.
//
// Frame: u32 big-endian payload length, then the payload bytes.
//
// There is no acknowledgement channel back to the publisher. A message handed
// to a worker that disconnects before reading it is gone, and a worker cannot
// ask for a message again. Sends are local hand-offs only.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct SocketSettings {
    /// `tcp://host:port`; `*` as host binds every interface
    pub endpoint: String,
    /// Messages buffered per peer, and while no peer is connected
    pub high_water_mark: usize,
    pub reconnect_interval: Duration,
    /// How long a single pull waits for a frame
    pub read_timeout: Duration,
    pub max_frame_len: usize,
}

impl SocketSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            high_water_mark: 1000,
            reconnect_interval: Duration::from_millis(250),
            read_timeout: Duration::from_millis(250),
            max_frame_len: 1024 * 1024,
        }
    }
}

/// Turn `tcp://host:port` into a `host:port` socket address string.
pub fn parse_endpoint(endpoint: &str) -> TransportResult<String> {
    let invalid = |reason: &str| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let address = endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| invalid("only tcp:// endpoints are supported"))?;

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;

    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

// ============================================================================
// Push side
// ============================================================================

struct Peer {
    addr: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

/// Connected workers plus the backlog held while none is connected
struct PeerSet {
    peers: Vec<Peer>,
    next: usize,
    pending: VecDeque<Vec<u8>>,
    high_water_mark: usize,
}

impl PeerSet {
    fn new(high_water_mark: usize) -> Self {
        Self {
            peers: Vec::new(),
            next: 0,
            pending: VecDeque::new(),
            high_water_mark,
        }
    }

    /// Hand the payload to the next peer with room, round-robin.
    /// Returns the payload back when no peer could take it.
    fn try_send(&mut self, mut payload: Vec<u8>) -> Result<(), Vec<u8>> {
        self.peers.retain(|peer| !peer.tx.is_closed());

        for _ in 0..self.peers.len() {
            let index = self.next % self.peers.len();
            self.next = index + 1;

            match self.peers[index].tx.try_send(payload) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(returned))
                | Err(mpsc::error::TrySendError::Closed(returned)) => payload = returned,
            }
        }
        Err(payload)
    }

    fn dispatch(&mut self, payload: Vec<u8>) -> TransportResult<()> {
        match self.try_send(payload) {
            Ok(()) => Ok(()),
            Err(payload) if self.pending.len() < self.high_water_mark => {
                self.pending.push_back(payload);
                Ok(())
            }
            Err(_) => Err(TransportError::Publish(format!(
                "high-water mark of {} reached with no worker able to accept",
                self.high_water_mark
            ))),
        }
    }

    fn add_peer(&mut self, addr: SocketAddr, tx: mpsc::Sender<Vec<u8>>) {
        self.peers.push(Peer { addr, tx });

        while let Some(payload) = self.pending.pop_front() {
            if let Err(payload) = self.try_send(payload) {
                self.pending.push_front(payload);
                break;
            }
        }
    }

    fn connected(&self) -> usize {
        self.peers.iter().filter(|peer| !peer.tx.is_closed()).count()
    }

    /// Drop every peer sender so the writers drain and exit.
    /// Returns how many buffered messages never reached a peer.
    fn close(&mut self) -> usize {
        self.peers.clear();
        let abandoned = self.pending.len();
        self.pending.clear();
        abandoned
    }
}

/// Bound end that distributes messages across connected workers
pub struct PushSocket {
    local_addr: SocketAddr,
    peers: Arc<StdMutex<PeerSet>>,
    writers: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

impl PushSocket {
    pub async fn bind(settings: &SocketSettings) -> TransportResult<Self> {
        let address = parse_endpoint(&settings.endpoint)?;
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| TransportError::Connection(format!("bind {}: {}", address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let peers = Arc::new(StdMutex::new(PeerSet::new(settings.high_water_mark)));
        let writers = Arc::new(StdMutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            peers.clone(),
            writers.clone(),
            settings.high_water_mark,
        ));

        tracing::info!(endpoint = %settings.endpoint, %local_addr, "Push socket bound");

        Ok(Self {
            local_addr,
            peers,
            writers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.lock().map(|peers| peers.connected()).unwrap_or(0)
    }

    /// Stop accepting workers and flush what was already sent.
    ///
    /// Messages buffered while no worker was connected get until `linger`
    /// for one to connect. Then every peer channel is closed and the writers
    /// are awaited, bounded by the same deadline. Fails if anything was left
    /// undelivered.
    pub async fn close(&self, linger: Duration) -> TransportResult<()> {
        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(linger).unwrap_or(now + Duration::from_secs(86_400));
        tracing::info!(
            local_addr = %self.local_addr,
            workers = self.connected_peers(),
            buffered = self.pending_len(),
            "Closing push socket"
        );

        while self.pending_len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.accept_task.abort();
        let abandoned = self
            .peers
            .lock()
            .map(|mut peers| peers.close())
            .map_err(|_| TransportError::Publish("peer set lock poisoned".into()))?;

        let writers = self
            .writers
            .lock()
            .map(|mut writers| std::mem::take(&mut *writers))
            .map_err(|_| TransportError::Publish("writer list lock poisoned".into()))?;

        let mut unflushed = 0;
        for writer in writers {
            if tokio::time::timeout_at(deadline, writer).await.is_err() {
                unflushed += 1;
            }
        }

        if abandoned > 0 || unflushed > 0 {
            tracing::warn!(
                local_addr = %self.local_addr,
                abandoned,
                unflushed,
                "Push socket closed with undelivered messages"
            );
            return Err(TransportError::Publish(format!(
                "{} buffered messages never reached a worker, {} workers not flushed within {:?}",
                abandoned, unflushed, linger
            )));
        }

        tracing::info!(local_addr = %self.local_addr, "Push socket closed, all messages flushed");
        Ok(())
    }

    fn pending_len(&self) -> usize {
        self.peers.lock().map(|peers| peers.pending.len()).unwrap_or(0)
    }
}

impl Drop for PushSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<StdMutex<PeerSet>>,
    writers: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    capacity: usize,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept worker connection");
                continue;
            }
        };

        let (tx, rx) = mpsc::channel(capacity.max(1));
        match peers.lock() {
            Ok(mut peers) => peers.add_peer(addr, tx),
            Err(_) => {
                tracing::error!("Peer set lock poisoned, stopping accept loop");
                return;
            }
        }

        tracing::info!(peer = %addr, "🔌 Worker connected");
        let writer = tokio::spawn(peer_writer(stream, addr, rx));
        if let Ok(mut writers) = writers.lock() {
            writers.retain(|writer| !writer.is_finished());
            writers.push(writer);
        }
    }
}

async fn peer_writer(stream: TcpStream, addr: SocketAddr, mut rx: mpsc::Receiver<Vec<u8>>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(payload) = message else { break };
                if let Err(e) = write_frame(&mut write_half, &payload).await {
                    tracing::warn!(peer = %addr, error = %e, "Lost message on failed write to worker");
                    break;
                }
            }
            // Workers never send; a read completing means the peer went away
            read = read_half.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }

    let dropped = rx.len();
    if dropped > 0 {
        tracing::warn!(peer = %addr, dropped, "Worker disconnected with undelivered messages");
    } else {
        tracing::info!(peer = %addr, "Worker disconnected");
    }
}

#[async_trait]
impl EventSink for PushSocket {
    fn substrate(&self) -> Substrate {
        Substrate::PushPull
    }

    async fn send(&self, _key: &str, payload: &[u8]) -> TransportResult<SendReceipt> {
        let mut peers = self
            .peers
            .lock()
            .map_err(|_| TransportError::Publish("peer set lock poisoned".into()))?;
        peers.dispatch(payload.to_vec())?;
        Ok(SendReceipt::local_only())
    }
}

// ============================================================================
// Pull side
// ============================================================================

/// Connected end that receives the share of messages pushed to this worker
pub struct PullSocket {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    sequence: AtomicU64,
    read_timeout: Duration,
    reader: JoinHandle<()>,
}

impl PullSocket {
    /// Connect to the publisher. The first connection must succeed; later
    /// disconnects are retried in the background.
    pub async fn connect(settings: &SocketSettings) -> TransportResult<Self> {
        let address = parse_endpoint(&settings.endpoint)?;
        if address.starts_with("0.0.0.0:") {
            return Err(TransportError::InvalidEndpoint {
                endpoint: settings.endpoint.clone(),
                reason: "wildcard host can only be bound, not connected to".into(),
            });
        }

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| TransportError::Connection(format!("connect {}: {}", address, e)))?;

        tracing::info!(endpoint = %settings.endpoint, "Pull socket connected");

        let (tx, rx) = mpsc::channel(settings.high_water_mark.max(1));
        let reader = tokio::spawn(reader_loop(
            stream,
            address,
            tx,
            settings.reconnect_interval,
            settings.max_frame_len,
        ));

        Ok(Self {
            rx: Mutex::new(rx),
            sequence: AtomicU64::new(0),
            read_timeout: settings.read_timeout,
            reader,
        })
    }

    fn check_tag(tag: &DeliveryTag) -> TransportResult<()> {
        match tag {
            DeliveryTag::Socket { .. } => Ok(()),
            other => Err(TransportError::ForeignTag(other.clone())),
        }
    }
}

impl Drop for PullSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn reader_loop(
    mut stream: TcpStream,
    address: String,
    tx: mpsc::Sender<Vec<u8>>,
    reconnect_interval: Duration,
    max_frame_len: usize,
) {
    loop {
        match read_frame(&mut stream, max_frame_len).await {
            Ok(Some(payload)) => {
                if tx.send(payload).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => tracing::warn!(address = %address, "Publisher closed the connection"),
            Err(e) => tracing::warn!(address = %address, error = %e, "Read from publisher failed"),
        }

        stream = loop {
            tokio::time::sleep(reconnect_interval).await;
            if tx.is_closed() {
                return;
            }
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    tracing::info!(address = %address, "Reconnected to publisher");
                    break stream;
                }
                Err(e) => tracing::debug!(address = %address, error = %e, "Reconnect failed"),
            }
        };
    }
}

#[async_trait]
impl EventSource for PullSocket {
    fn substrate(&self) -> Substrate {
        Substrate::PushPull
    }

    async fn pull(&self) -> TransportResult<Option<MessageEnvelope>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(self.read_timeout, rx.recv()).await {
            Ok(Some(payload)) => {
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(Some(MessageEnvelope::new(
                    DeliveryTag::Socket { sequence },
                    payload,
                )))
            }
            Ok(None) => Err(TransportError::Connection("socket reader stopped".into())),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> TransportResult<()> {
        Self::check_tag(tag)
    }

    async fn nack(&self, tag: &DeliveryTag, disposition: Disposition) -> TransportResult<()> {
        Self::check_tag(tag)?;
        if disposition == Disposition::Redeliver {
            tracing::warn!(tag = %tag, "Push/pull cannot redeliver, message is dropped");
        }
        Ok(())
    }
}

/// Either end of a push/pull pair
#[derive(Clone)]
pub enum SocketEnd {
    Push(Arc<PushSocket>),
    Pull(Arc<PullSocket>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("tcp://127.0.0.1:5557").unwrap(), "127.0.0.1:5557");
        assert_eq!(parse_endpoint("tcp://*:5557").unwrap(), "0.0.0.0:5557");
        assert_eq!(parse_endpoint("tcp://publisher:5557").unwrap(), "publisher:5557");

        assert!(parse_endpoint("ipc:///tmp/feed").is_err());
        assert!(parse_endpoint("tcp://127.0.0.1").is_err());
        assert!(parse_endpoint("tcp://:5557").is_err());
        assert!(parse_endpoint("tcp://host:port").is_err());
    }

    #[tokio::test]
    async fn test_frames_round_trip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[7u8; 100]).await.unwrap();

        let err = read_frame(&mut server, 10).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_peer_set_buffers_until_high_water_mark() {
        let mut peers = PeerSet::new(2);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        peers.dispatch(b"a".to_vec()).unwrap();
        peers.dispatch(b"b".to_vec()).unwrap();
        assert!(peers.dispatch(b"c".to_vec()).is_err());

        let (tx, mut rx) = mpsc::channel(8);
        peers.add_peer(addr, tx);

        assert_eq!(rx.try_recv().unwrap(), b"a");
        assert_eq!(rx.try_recv().unwrap(), b"b");
        assert!(peers.pending.is_empty());
    }

    #[test]
    fn test_peer_set_round_robins_and_prunes_closed_peers() {
        let mut peers = PeerSet::new(4);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        peers.add_peer(addr, tx1);
        peers.add_peer(addr, tx2);

        peers.dispatch(b"1".to_vec()).unwrap();
        peers.dispatch(b"2".to_vec()).unwrap();
        assert_eq!(rx1.try_recv().unwrap(), b"1");

        drop(rx2);
        peers.dispatch(b"3".to_vec()).unwrap();
        assert_eq!(rx1.try_recv().unwrap(), b"3");
        assert_eq!(peers.connected(), 1);
    }

    #[tokio::test]
    async fn test_push_to_pull_over_loopback() {
        let push = PushSocket::bind(&SocketSettings::new("tcp://127.0.0.1:0"))
            .await
            .unwrap();

        let mut settings = SocketSettings::new(format!("tcp://{}", push.local_addr()));
        settings.read_timeout = Duration::from_secs(5);
        let pull = PullSocket::connect(&settings).await.unwrap();

        let receipt = push.send("7", b"hello").await.unwrap();
        assert_eq!(receipt.guarantee, super::super::SendGuarantee::LocalSendOnly);

        let envelope = pull.pull().await.unwrap().unwrap();
        assert_eq!(envelope.payload, b"hello");
        assert_eq!(envelope.delivery_count, None);
        assert!(pull.ack(&envelope.tag).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_flushes_every_sent_message() {
        let push = PushSocket::bind(&SocketSettings::new("tcp://127.0.0.1:0"))
            .await
            .unwrap();

        let mut settings = SocketSettings::new(format!("tcp://{}", push.local_addr()));
        settings.read_timeout = Duration::from_secs(5);
        let pull = PullSocket::connect(&settings).await.unwrap();

        for _ in 0..200 {
            if push.connected_peers() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(push.connected_peers(), 1);

        for i in 0..50u32 {
            push.send("7", format!("star-{}", i).as_bytes()).await.unwrap();
        }
        push.close(Duration::from_secs(5)).await.unwrap();
        drop(push);

        for i in 0..50u32 {
            let envelope = pull.pull().await.unwrap().unwrap();
            assert_eq!(envelope.payload, format!("star-{}", i).into_bytes());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_messages_no_worker_took() {
        let push = PushSocket::bind(&SocketSettings::new("tcp://127.0.0.1:0"))
            .await
            .unwrap();
        push.send("7", b"orphan").await.unwrap();

        let err = push.close(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, TransportError::Publish(_)));
        assert_eq!(push.connected_peers(), 0);
    }

    #[tokio::test]
    async fn test_pull_rejects_wildcard_and_unreachable_endpoints() {
        let err = PullSocket::connect(&SocketSettings::new("tcp://*:5557"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidEndpoint { .. }));

        // Bind then drop to get a port with no listener
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = PullSocket::connect(&SocketSettings::new(format!("tcp://{}", addr)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connection(_)));
    }
}
