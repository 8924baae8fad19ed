//! # Stream Channel Manager
//!
//! Maintains the two WebSocket connections to the middleware:
//! - **to-device**: binary audio frames written to the doorbell speaker
//! - **from-device**: binary audio frames read from the doorbell microphone
//!
//! Each direction holds at most one channel. A channel that is present and
//! still open is handed out again instead of reconnecting; once it has been
//! marked closed it is never written to again and the next connect opens a
//! fresh one.
//!
//! ## Inbound Frames:
//! Every channel runs a reader task. For the from-device direction it
//! publishes each binary frame on a broadcast channel so any number of
//! listeners can follow the microphone. For both directions it marks the
//! channel closed when the middleware closes the socket or the read fails.

use crate::error::{IntercomError, IntercomResult};
use crate::intercom::endpoint::{Endpoint, StreamDirection};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

/// Frames buffered per listener before it starts lagging.
const INBOUND_CAPACITY: usize = 64;

/// One open (or formerly open) WebSocket connection.
pub struct StreamChannel {
    direction: StreamDirection,
    url: String,
    sink: tokio::sync::Mutex<SocketSink>,
    closed: Arc<AtomicBool>,
    inbound: broadcast::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl StreamChannel {
    fn spawn(direction: StreamDirection, url: String, socket: Socket) -> Self {
        let (sink, mut stream) = socket.split();
        let closed = Arc::new(AtomicBool::new(false));
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        let reader_closed = closed.clone();
        let reader_inbound = inbound.clone();
        let reader_url = url.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Binary(bytes)) => {
                        if direction == StreamDirection::FromDevice {
                            // Err only means nobody is listening right now.
                            let _ = reader_inbound.send(bytes);
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(url = %reader_url, ?frame, "Stream channel closed by middleware");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(url = %reader_url, error = %err, "Stream channel read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
        });

        Self {
            direction,
            url,
            sink: tokio::sync::Mutex::new(sink),
            closed,
            inbound,
            reader,
        }
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Follow inbound binary frames. Only the from-device direction
    /// publishes anything.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inbound.subscribe()
    }

    fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        let was_closed = self.mark_closed();
        if !was_closed {
            let mut sink = self.sink.lock().await;
            if let Err(err) = sink.close().await {
                debug!(url = %self.url, error = %err, "Stream channel close handshake failed");
            }
        }
        self.reader.abort();
    }
}

/// Opens, reuses and tears down the two stream channels of one endpoint.
pub struct StreamChannelManager {
    endpoint: Arc<Endpoint>,
    to_device: Mutex<Option<Arc<StreamChannel>>>,
    from_device: Mutex<Option<Arc<StreamChannel>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamChannelManager {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            to_device: Mutex::new(None),
            from_device: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn slot(&self, direction: StreamDirection) -> &Mutex<Option<Arc<StreamChannel>>> {
        match direction {
            StreamDirection::ToDevice => &self.to_device,
            StreamDirection::FromDevice => &self.from_device,
        }
    }

    /// The channel for `direction` if it exists and is still open.
    pub fn open_channel(&self, direction: StreamDirection) -> Option<Arc<StreamChannel>> {
        lock(self.slot(direction))
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    pub fn is_connected(&self, direction: StreamDirection) -> bool {
        self.open_channel(direction).is_some()
    }

    pub async fn connect_to(&self) -> IntercomResult<Arc<StreamChannel>> {
        self.connect(StreamDirection::ToDevice).await
    }

    pub async fn connect_from(&self) -> IntercomResult<Arc<StreamChannel>> {
        self.connect(StreamDirection::FromDevice).await
    }

    async fn connect(&self, direction: StreamDirection) -> IntercomResult<Arc<StreamChannel>> {
        if let Some(channel) = self.open_channel(direction) {
            return Ok(channel);
        }

        // Two callers racing for the same direction must not both connect.
        let _guard = self.connect_lock.lock().await;
        if let Some(channel) = self.open_channel(direction) {
            return Ok(channel);
        }

        let url = self.endpoint.stream_url(direction);
        let timeout = self.endpoint.control_timeout();
        debug!(device = %self.endpoint.id, url = %url, "Opening stream channel");

        let socket = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                return Err(IntercomError::Channel {
                    url,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(IntercomError::Channel {
                    url,
                    reason: format!("connect timed out after {}s", timeout.as_secs()),
                })
            }
        };

        let channel = Arc::new(StreamChannel::spawn(direction, url, socket));
        let stale = lock(self.slot(direction)).replace(channel.clone());
        if let Some(stale) = stale {
            stale.reader.abort();
        }

        info!(device = %self.endpoint.id, direction = %direction, "Stream channel connected");
        Ok(channel)
    }

    /// Write one binary frame.
    ///
    /// Returns false when the channel is already closed or the write fails;
    /// a failed write marks the channel closed.
    pub async fn send_bytes(&self, channel: &StreamChannel, bytes: Vec<u8>) -> bool {
        if !channel.is_open() {
            warn!(device = %self.endpoint.id, direction = %channel.direction, "Stream channel is closed");
            return false;
        }

        let size = bytes.len();
        let mut sink = channel.sink.lock().await;
        match sink.send(Message::Binary(bytes)).await {
            Ok(()) => {
                debug!(device = %self.endpoint.id, bytes = size, "Audio frame sent");
                true
            }
            Err(err) => {
                error!(
                    device = %self.endpoint.id,
                    direction = %channel.direction,
                    error = %err,
                    "Failed to send audio frame"
                );
                channel.mark_closed();
                false
            }
        }
    }

    /// Close one channel. Closing twice is harmless.
    pub async fn close(&self, channel: &Arc<StreamChannel>) {
        {
            let mut slot = lock(self.slot(channel.direction));
            if slot.as_ref().map_or(false, |current| Arc::ptr_eq(current, channel)) {
                slot.take();
            }
        }
        channel.shutdown().await;
        debug!(device = %self.endpoint.id, direction = %channel.direction, "Stream channel closed");
    }

    /// Close both directions.
    pub async fn close_all(&self) {
        for direction in [StreamDirection::ToDevice, StreamDirection::FromDevice] {
            let channel = lock(self.slot(direction)).take();
            if let Some(channel) = channel {
                channel.shutdown().await;
                debug!(device = %self.endpoint.id, direction = %direction, "Stream channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoutesConfig, TimeoutConfig};
    use crate::testing::unreachable_url;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Peer {
        url: String,
        connections: Arc<AtomicUsize>,
        received: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// WebSocket server that records inbound frames, optionally pushes
    /// `emit` every 20ms, or closes right after the handshake.
    async fn peer(emit: Option<Vec<u8>>, close_immediately: bool) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, received) = mpsc::unbounded_channel();

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                let emit = emit.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    if close_immediately {
                        let _ = ws.close(None).await;
                        return;
                    }
                    let (mut sink, mut stream) = ws.split();
                    if let Some(frame) = emit {
                        tokio::spawn(async move {
                            loop {
                                if sink.send(Message::Binary(frame.clone())).await.is_err() {
                                    break;
                                }
                                tokio::time::sleep(Duration::from_millis(20)).await;
                            }
                        });
                    }
                    while let Some(Ok(msg)) = stream.next().await {
                        if let Message::Binary(bytes) = msg {
                            let _ = tx.send(bytes);
                        }
                    }
                });
            }
        });

        Peer {
            url: format!("http://{}", addr),
            connections,
            received,
        }
    }

    fn manager(url: &str) -> StreamChannelManager {
        let timeouts = TimeoutConfig {
            control_secs: 2,
            upload_secs: 2,
        };
        let endpoint = Endpoint::new("front", "Front Door", url, &timeouts, RoutesConfig::default());
        StreamChannelManager::new(Arc::new(endpoint))
    }

    #[tokio::test]
    async fn test_open_channel_is_reused() {
        let peer = peer(None, false).await;
        let manager = manager(&peer.url);

        let first = manager.connect_to().await.unwrap();
        let second = manager.connect_to().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(peer.connections.load(Ordering::SeqCst), 1);
        assert!(first.url().starts_with("ws://127.0.0.1:"));
        assert!(first.url().ends_with("/api/audio/to-device"));
    }

    #[tokio::test]
    async fn test_send_bytes_reaches_peer() {
        let mut peer = peer(None, false).await;
        let manager = manager(&peer.url);

        let channel = manager.connect_to().await.unwrap();
        assert!(manager.send_bytes(&channel, vec![0xff, 0x7f, 0x00]).await);

        let frame = tokio::time::timeout(Duration::from_secs(2), peer.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, vec![0xff, 0x7f, 0x00]);
    }

    #[tokio::test]
    async fn test_closed_channel_is_not_reused() {
        let peer = peer(None, false).await;
        let manager = manager(&peer.url);

        let channel = manager.connect_to().await.unwrap();
        manager.close(&channel).await;
        manager.close(&channel).await;

        assert!(!channel.is_open());
        assert!(!manager.send_bytes(&channel, vec![1]).await);
        assert!(!manager.is_connected(StreamDirection::ToDevice));

        let reopened = manager.connect_to().await.unwrap();
        assert!(!Arc::ptr_eq(&channel, &reopened));
        assert_eq!(peer.connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_from_device_frames_fan_out() {
        let peer = peer(Some(b"mic".to_vec()), false).await;
        let manager = manager(&peer.url);

        let channel = manager.connect_from().await.unwrap();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        let a = tokio::time::timeout(Duration::from_secs(2), first.recv()).await.unwrap().unwrap();
        let b = tokio::time::timeout(Duration::from_secs(2), second.recv()).await.unwrap().unwrap();
        assert_eq!(a, b"mic");
        assert_eq!(b, b"mic");
    }

    #[tokio::test]
    async fn test_remote_close_marks_channel_closed() {
        let peer = peer(None, true).await;
        let manager = manager(&peer.url);

        let channel = manager.connect_from().await.unwrap();
        let mut closed = false;
        for _ in 0..100 {
            if !channel.is_open() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed);
        assert!(!manager.is_connected(StreamDirection::FromDevice));
    }

    #[tokio::test]
    async fn test_close_all_closes_both_directions() {
        let peer = peer(None, false).await;
        let manager = manager(&peer.url);

        let to = manager.connect_to().await.unwrap();
        let from = manager.connect_from().await.unwrap();
        manager.close_all().await;
        manager.close_all().await;

        assert!(!to.is_open());
        assert!(!from.is_open());
        assert_eq!(to.direction(), StreamDirection::ToDevice);
        assert_eq!(from.direction(), StreamDirection::FromDevice);
    }

    #[tokio::test]
    async fn test_unreachable_middleware_is_channel_error() {
        let manager = manager(&unreachable_url());

        match manager.connect_to().await {
            Err(IntercomError::Channel { url, .. }) => assert!(url.starts_with("ws://")),
            Err(other) => panic!("expected channel error, got {other:?}"),
            Ok(_) => panic!("expected channel error"),
        }
    }
}
