use anyhow::bail;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::config::ArqConfig;
use crate::io_buffer::{ArqIoBuffer, Outgoing};
use crate::message::{Answer, FpnnCodec, Message, MessageCodec, Quest};
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SendSocket;

/// the biggest possible UDP payload
const MAX_DATAGRAM_LEN: usize = 65_535;

#[derive(Clone, Copy, Debug, Default)]
pub struct SendOptions {
    /// fire-and-forget: the data is neither acknowledged nor resent
    pub discardable: bool,
    /// the data is dropped rather than sent or resent after this
    pub expires_after: Option<Duration>,
}

struct ClientInner {
    io_buffer: ArqIoBuffer,
    socket: Arc<dyn SendSocket>,
    codec: Arc<dyn MessageCodec>,
    dispatcher: Arc<dyn MessageDispatcher>,

    next_quest_seq: AtomicU32,
    active_close: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ClientInner {
    /// Sends datagrams for as long as the engine has something to send. Only the holder of the
    ///  engine's send token gets an [Outgoing] in the first place.
    async fn send_outgoing(&self, first: Option<Outgoing>) {
        let mut next = first;
        while let Some(outgoing) = next {
            let result = match outgoing.seal() {
                Ok(datagram) => {
                    trace!("sending datagram of {} bytes (encrypted: {})", datagram.len(), outgoing.is_encrypted());
                    self.socket.send_datagram(&datagram).await
                }
                Err(e) => {
                    error!("error encrypting datagram: {}", e);
                    Err(io::Error::other(e.to_string()))
                }
            };
            next = self.io_buffer.send_completed(result, Instant::now());
        }
        self.check_close().await;
    }

    async fn on_datagram(&self, raw: &[u8]) {
        trace!("received datagram of {} bytes", raw.len());
        let received = self.io_buffer.recv_data(raw, Instant::now());

        for answer in received.answers {
            self.dispatcher.on_answer(answer).await;
        }
        for quest in received.quests {
            self.dispatcher.on_quest(quest).await;
        }

        self.send_outgoing(self.io_buffer.send_cached_data(Instant::now())).await;
    }

    async fn on_tick(&self) {
        self.send_outgoing(self.io_buffer.on_tick(Instant::now())).await;
    }

    async fn check_close(&self) {
        if self.closed.load(Ordering::Acquire) || !self.io_buffer.is_require_close(Instant::now()) {
            return;
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let by_error = !self.active_close.load(Ordering::Acquire);
        info!("connection to {:?} closed (by error: {})", self.socket.peer_addr(), by_error);
        self.shutdown.send_replace(true);
        self.dispatcher.on_closed(by_error).await;
    }

    async fn send_encoded(&self, data: Bytes, options: SendOptions) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("connection is closed");
        }
        let now = Instant::now();
        let expires = options.expires_after.map(|d| now + d);
        let first = self.io_buffer.send_data(data, options.discardable, expires, now);
        self.send_outgoing(first).await;
        Ok(())
    }

    async fn tick_loop(inner: Arc<ClientInner>, tick_interval: Duration) {
        let mut shutdown = inner.shutdown.subscribe();
        let mut ticks = interval(tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => inner.on_tick().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("tick loop terminated");
    }

    async fn recv_loop(inner: Arc<ClientInner>, socket: Arc<UdpSocket>) {
        info!("starting receive loop");
        let mut shutdown = inner.shutdown.subscribe();

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let num_read = select! {
                result = socket.recv(&mut buf) => match result {
                    Ok(num_read) => num_read,
                    Err(e) => {
                        inner.io_buffer.recv_failed(&e);
                        inner.check_close().await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            inner.on_datagram(&buf[..num_read])
                .instrument(span)
                .await;
        }
        info!("receive loop terminated");
    }
}

/// A client side ARQ connection over UDP: it owns the engine for a single peer, and drives it
///  from a receive loop and a periodic tick (for resends, heartbeats and timeouts).
///
/// Received messages go to the [MessageDispatcher], answers of a datagram before its quests.
///  The connection closes when the peer closes it, when it becomes invalid or times out, or
///  through [UdpClient::close].
pub struct UdpClient {
    inner: Arc<ClientInner>,
    loop_handles: Vec<JoinHandle<()>>,
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        for handle in &self.loop_handles {
            handle.abort();
        }
    }
}

impl UdpClient {
    pub async fn connect(
        peer_addr: SocketAddr,
        config: Arc<ArqConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<UdpClient> {
        config.validate()?;

        let bind_addr: SocketAddr = if peer_addr.is_ipv6() {
            "[::]:0".parse()?
        }
        else {
            "0.0.0.0:0".parse()?
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(peer_addr).await?;
        info!("connected UDP socket {:?} to {:?}", socket.local_addr()?, peer_addr);

        let codec = Arc::new(FpnnCodec::new(config.max_recv_package_length));
        let mut client = Self::with_socket(config, Arc::new(socket.clone()), codec, dispatcher)?;
        client.loop_handles.push(tokio::spawn(ClientInner::recv_loop(client.inner.clone(), socket)));
        Ok(client)
    }

    /// Creates a client on top of an existing send path. Received datagrams must be passed to
    ///  [UdpClient::receive_datagram].
    pub fn with_socket(
        config: Arc<ArqConfig>,
        socket: Arc<dyn SendSocket>,
        codec: Arc<dyn MessageCodec>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<UdpClient> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            io_buffer: ArqIoBuffer::new(config.clone(), codec.clone(), Instant::now()),
            socket,
            codec,
            dispatcher,
            next_quest_seq: AtomicU32::new(1),
            active_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        });

        let tick_handle = tokio::spawn(ClientInner::tick_loop(inner.clone(), config.tick_interval));
        Ok(UdpClient {
            inner,
            loop_handles: vec![tick_handle],
        })
    }

    pub async fn receive_datagram(&self, raw: &[u8]) {
        if self.is_closed() {
            trace!("connection is closed, dropping received datagram");
            return;
        }
        self.inner.on_datagram(raw).await;
    }

    /// Sends a quest, returning the seq for matching the answer unless it is one-way
    pub async fn send_quest(&self, method: &str, payload: Bytes, one_way: bool, options: SendOptions) -> anyhow::Result<Option<u32>> {
        let seq = if one_way {
            None
        }
        else {
            Some(self.inner.next_quest_seq.fetch_add(1, Ordering::Relaxed))
        };

        let data = self.inner.codec.encode(&Message::Quest(Quest {
            method: method.to_string(),
            seq,
            payload,
        }))?;
        self.inner.send_encoded(data, options).await?;
        Ok(seq)
    }

    pub async fn send_answer(&self, seq: u32, status: u8, payload: Bytes, options: SendOptions) -> anyhow::Result<()> {
        let data = self.inner.codec.encode(&Message::Answer(Answer { seq, status, payload }))?;
        self.inner.send_encoded(data, options).await
    }

    /// sends data that holds one or more already encoded messages
    pub async fn send_data(&self, data: Bytes, options: SendOptions) -> anyhow::Result<()> {
        self.inner.send_encoded(data, options).await
    }

    /// Encrypts the connection with keys agreed on against the peer's public key. See
    ///  [ArqIoBuffer::enable_encryptor_as_initiator].
    pub async fn enable_encryptor(&self, curve: &str, peer_public_key: &[u8], reinforce_package: bool, data_reinforce: Option<bool>) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("connection is closed");
        }
        let first = self.inner.io_buffer.enable_encryptor_as_initiator(curve, peer_public_key, reinforce_package, data_reinforce, Instant::now())?;
        self.inner.send_outgoing(first).await;
        Ok(())
    }

    pub fn keep_alive(&self) {
        self.inner.io_buffer.enable_keep_alive();
    }

    /// `0` restores the configured timeout, a negative value disables it
    pub fn set_untransmitted_seconds(&self, seconds: i64) {
        self.inner.io_buffer.set_untransmitted_seconds(seconds);
    }

    /// Sends a CLOSE signal to the peer and closes the connection once it is out
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.active_close.store(true, Ordering::Release);
        let first = self.inner.io_buffer.mark_active_close_signal(Instant::now());
        self.inner.send_outgoing(first).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.peer_addr()
    }

    pub fn last_active(&self) -> Instant {
        self.inner.io_buffer.last_active()
    }
}
