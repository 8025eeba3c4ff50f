//! MQTT 3.1.1 client protocol engine.
//!
//! A [`Client`] owns one broker connection. A background reader decodes
//! inbound packets and dispatches them either to the pending-acknowledgement
//! queue (replies to requests this client sent) or to the subscription
//! registry (inbound PUBLISH).
//!
//! Session state sits behind a synchronous lock that is never held across an
//! await point. Continuations run under that lock but only return
//! [`Action`]s; sending packets and calling handlers happens after it is
//! released, so handlers may call back into the client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, trace, warn};

use crate::buffer::Buffer;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pending::PendingQueue;
use crate::platform::{BoxStream, Platform, TaskHandle, TimerHandle, TokioPlatform};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use crate::subscriptions::SubscriptionRegistry;
use crate::types::{Handler, Message, QoS};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection. `connect` or `reconnect` may be called.
    Disconnected,
    /// CONNECT sent, waiting for CONNACK.
    Connecting,
    /// CONNACK accepted.
    Connected,
    /// `disconnect` in progress.
    Disconnecting,
    /// Handle released; every operation fails with `AlreadyDisconnected`.
    Closed,
}

/// Called after a fatal connection error. Return true to release the handle.
pub type ErrorHandler = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Called after each accepted CONNACK with the session-present flag.
pub type ConnectedCallback = Arc<dyn Fn(bool) + Send + Sync>;

type Waiter = oneshot::Sender<Result<()>>;

type Continuation = Box<dyn FnOnce(&mut Session, &Packet) -> Vec<Action> + Send>;

/// Work produced under the session lock and performed after releasing it.
pub(crate) enum Action {
    Send(Packet),
    Deliver(Arc<dyn Handler>, Message),
    Connected { session_present: bool },
}

fn complete(waiter: Waiter) -> Continuation {
    Box::new(move |_: &mut Session, _: &Packet| {
        let _ = waiter.send(Ok(()));
        Vec::new()
    })
}

/// Session state shared by the caller and the reader.
pub(crate) struct Session {
    state: State,
    pending: PendingQueue<Continuation>,
    subscriptions: SubscriptionRegistry,
    next_pkid: u16,
    reconnecting: bool,
    clean_session: bool,
    connect_waiter: Option<oneshot::Sender<Result<bool>>>,
}

impl Session {
    fn new(clean_session: bool) -> Self {
        Self {
            state: State::Disconnected,
            pending: PendingQueue::new(),
            subscriptions: SubscriptionRegistry::new(),
            next_pkid: 0,
            reconnecting: false,
            clean_session,
            connect_waiter: None,
        }
    }

    /// Next packet id: non-zero, wrapping.
    fn next_packet_id(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1);
        if self.next_pkid == 0 {
            self.next_pkid = 1;
        }
        self.next_pkid
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            State::Connected => Ok(()),
            State::Closed => Err(Error::AlreadyDisconnected),
            _ => Err(Error::NotConnected),
        }
    }

    fn begin_connect(&mut self) -> Result<()> {
        match self.state {
            State::Disconnected => {
                self.state = State::Connecting;
                Ok(())
            }
            State::Closed => Err(Error::AlreadyDisconnected),
            state => Err(Error::InvalidParameter(format!(
                "cannot connect while {:?}",
                state
            ))),
        }
    }

    fn begin_reconnect(&mut self) -> Result<()> {
        match self.state {
            State::Connected | State::Disconnected => {
                self.state = State::Connecting;
                self.reconnecting = true;
                self.clean_session = false;
                Ok(())
            }
            State::Closed => Err(Error::AlreadyDisconnected),
            state => Err(Error::InvalidParameter(format!(
                "cannot reconnect while {:?}",
                state
            ))),
        }
    }

    /// Returns whether the connection was up.
    fn begin_disconnect(&mut self) -> Result<bool> {
        match self.state {
            State::Closed | State::Disconnecting => Err(Error::AlreadyDisconnected),
            state => {
                self.state = State::Disconnecting;
                Ok(state == State::Connected)
            }
        }
    }

    fn expect_connack(&mut self, waiter: oneshot::Sender<Result<bool>>) -> Result<()> {
        if self.state != State::Connecting {
            return Err(Error::AlreadyDisconnected);
        }
        self.connect_waiter = Some(waiter);
        self.pending.expect(
            PacketType::ConnAck,
            0,
            Box::new(|session: &mut Session, packet: &Packet| match packet {
                Packet::ConnAck(ack) => session.on_connack(*ack),
                _ => Vec::new(),
            }),
        );
        Ok(())
    }

    fn abort_connect(&mut self) {
        self.pending.cancel(PacketType::ConnAck, 0);
        self.connect_waiter = None;
        if self.state == State::Connecting {
            self.state = State::Disconnected;
        }
    }

    fn on_connack(&mut self, ack: ConnAck) -> Vec<Action> {
        let waiter = self.connect_waiter.take();
        if ack.code != ConnectReturnCode::Accepted {
            debug!("Connection refused: {}", ack.code);
            self.state = State::Disconnected;
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(ack.code.into()));
            }
            return Vec::new();
        }

        let mut actions = Vec::new();
        // The broker started a new session: nothing in flight survives.
        let stale = !self.pending.is_empty() || !self.subscriptions.is_empty();
        if !ack.session_present && stale {
            let dropped = self.pending.clear();
            info!(
                "Broker lost the session: dropped {} pending acks, resubscribing {} topics",
                dropped,
                self.subscriptions.len()
            );
            actions = self.resubscribe_all();
        }
        self.reconnecting = false;
        self.state = State::Connected;
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(ack.session_present));
        }
        actions.push(Action::Connected {
            session_present: ack.session_present,
        });
        actions
    }

    fn resubscribe_all(&mut self) -> Vec<Action> {
        let topics: Vec<(String, QoS)> = self
            .subscriptions
            .iter()
            .map(|(topic, sub)| (topic.to_string(), sub.qos))
            .collect();
        topics
            .into_iter()
            .map(|(topic, qos)| Action::Send(self.subscribe_packet(topic, qos, None)))
            .collect()
    }

    /// Marks `topic` pending and registers the SUBACK continuation.
    fn subscribe_packet(&mut self, topic: String, qos: QoS, waiter: Option<Waiter>) -> Packet {
        let pkid = self.next_packet_id();
        self.subscriptions.set_pending(&topic, true);
        let acked = topic.clone();
        self.pending.expect(
            PacketType::SubAck,
            pkid,
            Box::new(move |session: &mut Session, packet: &Packet| {
                session.on_suback(&acked, packet, waiter);
                Vec::new()
            }),
        );
        Packet::Subscribe(Subscribe { pkid, topic, qos })
    }

    fn on_suback(&mut self, topic: &str, packet: &Packet, waiter: Option<Waiter>) {
        let result = match packet {
            Packet::SubAck(SubAck {
                code: SubscribeReturnCode::Success(granted),
                ..
            }) => {
                debug!("Subscribed to {} (granted {:?})", topic, granted);
                self.subscriptions.set_pending(topic, false);
                Ok(())
            }
            _ => {
                warn!("Broker rejected subscription to {}", topic);
                self.subscriptions.remove(topic);
                Err(Error::SubscriptionRejected(topic.to_string()))
            }
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
    }

    /// Registers the acknowledgement chain for an outbound PUBLISH.
    fn expect_publish_ack(&mut self, qos: QoS, pkid: u16, waiter: Waiter) {
        match qos {
            QoS::AtMostOnce => {
                let _ = waiter.send(Ok(()));
            }
            QoS::AtLeastOnce => {
                self.pending.expect(PacketType::PubAck, pkid, complete(waiter));
            }
            QoS::ExactlyOnce => {
                self.pending.expect(
                    PacketType::PubRec,
                    pkid,
                    Box::new(move |session: &mut Session, _: &Packet| {
                        session
                            .pending
                            .expect(PacketType::PubComp, pkid, complete(waiter));
                        vec![Action::Send(Packet::PubRel(pkid))]
                    }),
                );
            }
        }
    }

    fn handle_incoming(&mut self, packet: Packet) -> Result<Vec<Action>> {
        let kind = packet.packet_type();
        match packet {
            Packet::Publish(publish) => Ok(self.receive_publish(publish)),
            Packet::PingResp => Ok(Vec::new()),
            Packet::Disconnect => Err(Error::BrokerDisconnected),
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PingReq => {
                Err(Error::ProtocolViolation(format!(
                    "unexpected {} from broker",
                    kind
                )))
            }
            reply => match self.pending.take(&reply) {
                Some(continuation) => Ok(continuation(self, &reply)),
                None => Err(Error::ProtocolViolation(format!(
                    "unexpected {} (pkid={})",
                    kind,
                    reply.packet_id()
                ))),
            },
        }
    }

    fn receive_publish(&mut self, publish: Publish) -> Vec<Action> {
        let pkid = publish.pkid;
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };
        match message.qos {
            QoS::AtMostOnce => self.deliver(message).into_iter().collect(),
            QoS::AtLeastOnce => {
                let mut actions = vec![Action::Send(Packet::PubAck(pkid))];
                actions.extend(self.deliver(message));
                actions
            }
            QoS::ExactlyOnce => {
                // Delivered on PUBREL. A re-sent PUBLISH replaces the stored one.
                self.pending.expect(
                    PacketType::PubRel,
                    pkid,
                    Box::new(move |session: &mut Session, _: &Packet| {
                        let mut actions: Vec<Action> =
                            session.deliver(message).into_iter().collect();
                        actions.push(Action::Send(Packet::PubComp(pkid)));
                        actions
                    }),
                );
                vec![Action::Send(Packet::PubRec(pkid))]
            }
        }
    }

    fn deliver(&self, message: Message) -> Option<Action> {
        match self.subscriptions.route(&message.topic) {
            Some(handler) => Some(Action::Deliver(handler, message)),
            None => {
                trace!("Dropping message on {} (no active subscription)", message.topic);
                None
            }
        }
    }

    /// Marks the handle closed and hands back everything it owned.
    fn release(&mut self) -> (PendingQueue<Continuation>, SubscriptionRegistry) {
        self.state = State::Closed;
        self.reconnecting = false;
        self.connect_waiter = None;
        (
            std::mem::take(&mut self.pending),
            std::mem::take(&mut self.subscriptions),
        )
    }
}

/// Resolves when the broker acknowledged a request.
///
/// Fails with [`Error::SessionReset`] if the pending entry was discarded by
/// a reconnect that lost the session, or by teardown.
#[must_use = "completions do nothing unless awaited"]
pub struct Completion {
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Completion {
    fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx: Some(rx) }
    }

    fn ready() -> Self {
        Self { rx: None }
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::SessionReset)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Inner {
    config: ClientConfig,
    platform: Arc<dyn Platform>,
    session: Mutex<Session>,
    writer: AsyncMutex<Option<WriteHalf<BoxStream>>>,
    reader: Mutex<Option<TaskHandle>>,
    keepalive: Mutex<Option<TimerHandle>>,
    on_error: Option<ErrorHandler>,
    on_connected: Option<ConnectedCallback>,
}

impl Inner {
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let config = &self.config;
        debug!(
            "Connecting to {}:{} as {} (MQTT 3.1.1)",
            config.host, config.port, config.client_id
        );

        let stream = match self.platform.connect(&config.host, config.port).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail_connect(e).await),
        };
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        let (tx, rx) = oneshot::channel();
        let registered = {
            let mut session = self.session.lock();
            session.expect_connack(tx).map(|()| session.clean_session)
        };
        let clean_session = match registered {
            Ok(clean_session) => clean_session,
            Err(e) => return Err(self.fail_connect(e).await),
        };

        let task = self
            .platform
            .run_task(Self::run_reader(Arc::clone(self), reader).boxed());
        let previous = self.reader.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        if let Err(e) = self.send(&self.connect_packet(clean_session)).await {
            return Err(self.fail_connect(e).await);
        }

        match rx.await {
            Ok(Ok(session_present)) => {
                debug!("Connected successfully, session_present={}", session_present);
                self.start_keepalive();
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail_connect(e).await),
            Err(_) => Err(self.fail_connect(Error::SessionReset).await),
        }
    }

    async fn fail_connect(&self, err: Error) -> Error {
        debug!("Connect failed: {}", err);
        self.session.lock().abort_connect();
        self.close_transport().await;
        err
    }

    fn connect_packet(&self, clean_session: bool) -> Packet {
        let config = &self.config;
        Packet::Connect(Connect {
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive,
            clean_session,
            username: config.username.clone(),
            password: config.password.clone().map(Bytes::from),
            will: config.last_will.clone(),
        })
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let buf = packet.encode()?;
        trace!(
            "Sending {} (pkid={}, {} bytes)",
            packet.packet_type(),
            packet.packet_id(),
            buf.len()
        );
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(Error::NotConnected)?;
        stream
            .write_all(buf.as_slice())
            .await
            .map_err(Error::transport)?;
        stream.flush().await.map_err(Error::transport)
    }

    fn start_keepalive(self: &Arc<Self>) {
        let Some(interval) = self.config.keepalive_interval() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timer = self.platform.create_timer(
            interval,
            Box::new(move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.send(&Packet::PingReq).await {
                        warn!("Keepalive ping failed: {}", e);
                    }
                }
                .boxed()
            }),
        );
        debug!("Started keepalive timer (interval={}s)", interval.as_secs());
        let previous = self.keepalive.lock().replace(timer);
        if let Some(previous) = previous {
            previous.destroy();
        }
    }

    fn stop_keepalive(&self) {
        let timer = self.keepalive.lock().take();
        if let Some(timer) = timer {
            timer.destroy();
        }
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Stops the keepalive timer and the reader, then closes the stream.
    async fn close_transport(&self) {
        self.stop_keepalive();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
            if let Err(e) = reader.join().await {
                warn!("Reader task ended abnormally: {}", e);
            }
        }
        self.close_writer().await;
    }

    async fn run_reader(inner: Arc<Inner>, reader: ReadHalf<BoxStream>) {
        if let Err(e) = inner.read_loop(reader).await {
            inner.on_connection_lost(e).await;
        }
    }

    async fn read_loop(&self, mut reader: ReadHalf<BoxStream>) -> Result<()> {
        let max_packet_size = self.config.max_packet_size;
        // fixed header is at most 5 bytes
        let limit = max_packet_size + 5;
        let mut buf = Buffer::with_capacity(self.config.read_buffer_size.min(limit))?;

        loop {
            loop {
                match Packet::decode(&mut buf, max_packet_size) {
                    Ok(packet) => self.handle_packet(packet).await?,
                    Err(e) if e.is_incomplete() => break,
                    Err(e) => return Err(e),
                }
            }

            buf.compact();
            if buf.unfilled_mut().is_empty() {
                let capacity = buf.capacity();
                if capacity >= limit {
                    return Err(Error::BufferOverflow { size: capacity, limit });
                }
                buf.reserve((capacity * 2).min(limit))?;
            }

            let n = reader
                .read(buf.unfilled_mut())
                .await
                .map_err(Error::transport)?;
            if n == 0 {
                return Err(Error::BrokerDisconnected);
            }
            buf.fill(n);
        }
    }

    async fn handle_packet(&self, packet: Packet) -> Result<()> {
        trace!(
            "Received {} (pkid={})",
            packet.packet_type(),
            packet.packet_id()
        );
        let actions = self.session.lock().handle_incoming(packet)?;
        self.perform(actions).await
    }

    async fn perform(&self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(packet) => self.send(&packet).await?,
                Action::Deliver(handler, message) => handler.handle(&message),
                Action::Connected { session_present } => {
                    if let Some(callback) = &self.on_connected {
                        callback(session_present);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fatal error on the reader.
    ///
    /// While connecting, the error goes to the pending `connect` call. While
    /// connected, the connection is closed and the error handler decides
    /// whether to release the handle, after it has returned.
    ///
    /// The state becomes `Disconnected` only after the old writer is closed.
    async fn on_connection_lost(&self, err: Error) {
        {
            let mut session = self.session.lock();
            match session.state {
                State::Connected => {}
                State::Connecting => {
                    session.pending.cancel(PacketType::ConnAck, 0);
                    if let Some(waiter) = session.connect_waiter.take() {
                        let _ = waiter.send(Err(err));
                    }
                    return;
                }
                _ => {
                    debug!("Reader stopped: {}", err);
                    return;
                }
            }
        }

        warn!("Connection lost: {}", err);
        self.stop_keepalive();
        if matches!(err, Error::ProtocolViolation(_)) {
            if let Err(e) = self.send(&Packet::Disconnect).await {
                debug!("Failed to send DISCONNECT: {}", e);
            }
        }
        self.close_writer().await;
        {
            let mut session = self.session.lock();
            if session.state != State::Connected {
                return;
            }
            session.state = State::Disconnected;
        }

        let release = match &self.on_error {
            Some(handler) => handler(&err),
            None => false,
        };
        if release {
            let released = self.session.lock().release();
            drop(released);
            debug!("Handle released by error handler");
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    platform: Option<Arc<dyn Platform>>,
    on_error: Option<ErrorHandler>,
    on_connected: Option<ConnectedCallback>,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            platform: None,
            on_error: None,
            on_connected: None,
        }
    }

    /// Set the platform. Defaults to [`TokioPlatform`].
    pub fn platform<P: Platform + 'static>(mut self, platform: P) -> Self {
        self.platform = Some(Arc::new(platform));
        self
    }

    /// Set the error handler.
    ///
    /// It runs after a fatal error on an established connection. Returning
    /// true releases the handle; returning false leaves it disconnected and
    /// ready for [`Client::reconnect`].
    pub fn on_error<F: Fn(&Error) -> bool + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set the on_connected callback, fired for every accepted CONNACK.
    pub fn on_connected<F: Fn(bool) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    /// Build the client. No I/O happens until [`Client::connect`].
    pub fn build(self) -> Client {
        let session = Session::new(self.config.clean_session);
        Client {
            inner: Arc::new(Inner {
                config: self.config,
                platform: self.platform.unwrap_or_else(|| Arc::new(TokioPlatform)),
                session: Mutex::new(session),
                writer: AsyncMutex::new(None),
                reader: Mutex::new(None),
                keepalive: Mutex::new(None),
                on_error: self.on_error,
                on_connected: self.on_connected,
            }),
        }
    }
}

/// MQTT 3.1.1 client handle. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a client on the tokio platform.
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder::new(config).build()
    }

    /// Create a client on a custom platform.
    pub fn with_platform<P: Platform + 'static>(config: ClientConfig, platform: P) -> Self {
        ClientBuilder::new(config).platform(platform).build()
    }

    /// Create a builder for a client.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn state(&self) -> State {
        self.inner.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Connect to the broker and wait for CONNACK.
    ///
    /// On failure the handle stays disconnected and may be retried with
    /// [`Client::reconnect`].
    pub async fn connect(&self) -> Result<()> {
        self.inner.config.validate()?;
        self.inner.session.lock().begin_connect()?;
        self.inner.establish().await
    }

    /// Drop the current connection and connect again, resuming the session.
    ///
    /// If the broker reports no session, every pending acknowledgement is
    /// discarded and every registered topic is subscribed again.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.config.validate()?;
        self.inner.session.lock().begin_reconnect()?;
        info!(
            "Reconnecting to {}:{}",
            self.inner.config.host, self.inner.config.port
        );
        self.inner.close_transport().await;
        self.inner.establish().await
    }

    /// Subscribe to `topic` and wait for SUBACK.
    ///
    /// Messages on `topic` reach `handler` only after the broker accepted
    /// the subscription.
    pub async fn subscribe<H: Handler + 'static>(
        &self,
        topic: &str,
        qos: QoS,
        handler: H,
    ) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::InvalidParameter("empty topic filter".into()));
        }
        let (tx, rx) = oneshot::channel();
        let packet = {
            let mut session = self.inner.session.lock();
            session.ensure_connected()?;
            session.subscriptions.add(topic, qos, Arc::new(handler));
            session.subscribe_packet(topic.to_string(), qos, Some(tx))
        };
        debug!("Subscribing to {} with pkid={}", topic, packet.packet_id());
        if let Err(e) = self.inner.send(&packet).await {
            let mut session = self.inner.session.lock();
            session.pending.cancel(PacketType::SubAck, packet.packet_id());
            session.subscriptions.remove(topic);
            return Err(e);
        }
        Completion::new(rx).await
    }

    /// Unsubscribe from `topic` and wait for UNSUBACK.
    ///
    /// The handler stops receiving messages immediately.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let packet = {
            let mut session = self.inner.session.lock();
            session.ensure_connected()?;
            session.subscriptions.remove(topic);
            let pkid = session.next_packet_id();
            session
                .pending
                .expect(PacketType::UnsubAck, pkid, complete(tx));
            Packet::Unsubscribe(Unsubscribe {
                pkid,
                topic: topic.to_string(),
            })
        };
        debug!("Unsubscribing from {} with pkid={}", topic, packet.packet_id());
        if let Err(e) = self.inner.send(&packet).await {
            self.inner
                .session
                .lock()
                .pending
                .cancel(PacketType::UnsubAck, packet.packet_id());
            return Err(e);
        }
        Completion::new(rx).await
    }

    /// Publish a message and wait until its QoS handshake completes.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> Result<()> {
        self.start_publish(Message::new(topic, payload).with_qos(qos))
            .await?
            .await
    }

    /// Publish a retained message and wait until its QoS handshake completes.
    pub async fn publish_retained(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<()> {
        let message = Message::new(topic, payload)
            .with_qos(qos)
            .with_retain(true);
        self.start_publish(message).await?.await
    }

    /// Write a PUBLISH and return a completion for its acknowledgement.
    ///
    /// QoS 0 completes immediately, QoS 1 on PUBACK and QoS 2 on PUBCOMP.
    pub async fn start_publish(&self, message: Message) -> Result<Completion> {
        if message.topic.is_empty() {
            return Err(Error::InvalidParameter("empty topic".into()));
        }
        let (tx, rx) = oneshot::channel();
        let packet = {
            let mut session = self.inner.session.lock();
            session.ensure_connected()?;
            let pkid = match message.qos {
                QoS::AtMostOnce => 0,
                _ => session.next_packet_id(),
            };
            session.expect_publish_ack(message.qos, pkid, tx);
            Packet::Publish(Publish {
                topic: message.topic,
                payload: message.payload,
                qos: message.qos,
                retain: message.retain,
                dup: false,
                pkid,
            })
        };

        if let Err(e) = self.inner.send(&packet).await {
            let expected = match &packet {
                Packet::Publish(p) if p.qos == QoS::AtLeastOnce => Some(PacketType::PubAck),
                Packet::Publish(p) if p.qos == QoS::ExactlyOnce => Some(PacketType::PubRec),
                _ => None,
            };
            if let Some(kind) = expected {
                self.inner
                    .session
                    .lock()
                    .pending
                    .cancel(kind, packet.packet_id());
            }
            return Err(e);
        }
        Ok(Completion::new(rx))
    }

    /// Send DISCONNECT, stop the reader and release the handle.
    ///
    /// Calling it again returns [`Error::AlreadyDisconnected`].
    pub async fn disconnect(&self) -> Result<()> {
        let was_connected = self.inner.session.lock().begin_disconnect()?;
        debug!("Disconnecting");
        if was_connected {
            if let Err(e) = self.inner.send(&Packet::Disconnect).await {
                debug!("Failed to send DISCONNECT: {}", e);
            }
        }
        self.inner.close_transport().await;
        let released = self.inner.session.lock().release();
        drop(released);
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sent(actions: &[Action]) -> Vec<Packet> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(packet) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[Action]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Deliver(_, message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn suback(pkid: u16, qos: QoS) -> Packet {
        Packet::SubAck(SubAck {
            pkid,
            code: SubscribeReturnCode::Success(qos),
        })
    }

    fn publish(topic: &str, qos: QoS, pkid: u16) -> Packet {
        let mut publish = Publish::new(topic, "data", qos);
        publish.pkid = pkid;
        Packet::Publish(publish)
    }

    fn connected() -> Session {
        let mut session = Session::new(true);
        session.state = State::Connected;
        session
    }

    fn subscribe(session: &mut Session, topic: &str) -> (u16, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        session.subscriptions.add(
            topic,
            QoS::AtLeastOnce,
            Arc::new(move |_: &Message| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let packet = session.subscribe_packet(topic.to_string(), QoS::AtLeastOnce, None);
        (packet.packet_id(), count)
    }

    #[test]
    fn test_completion_polling() {
        use tokio_test::{assert_pending, assert_ready, task};

        let mut ready = task::spawn(Completion::ready());
        assert!(assert_ready!(ready.poll()).is_ok());

        let (tx, rx) = oneshot::channel();
        let mut acked = task::spawn(Completion::new(rx));
        assert_pending!(acked.poll());
        let _ = tx.send(Ok(()));
        assert!(acked.is_woken());
        assert!(assert_ready!(acked.poll()).is_ok());

        let (tx, rx) = oneshot::channel::<Result<()>>();
        let mut discarded = task::spawn(Completion::new(rx));
        drop(tx);
        assert!(matches!(
            assert_ready!(discarded.poll()),
            Err(Error::SessionReset)
        ));
    }

    #[test]
    fn test_packet_id_skips_zero() {
        let mut session = Session::new(true);
        assert_eq!(session.next_packet_id(), 1);
        session.next_pkid = u16::MAX - 1;
        assert_eq!(session.next_packet_id(), u16::MAX);
        assert_eq!(session.next_packet_id(), 1);
    }

    #[test]
    fn test_pending_subscription_not_delivered() {
        let mut session = connected();
        let (pkid, _) = subscribe(&mut session, "a/b");

        let actions = session
            .handle_incoming(publish("a/b", QoS::AtMostOnce, 0))
            .unwrap();
        assert!(delivered(&actions).is_empty());

        session.handle_incoming(suback(pkid, QoS::AtLeastOnce)).unwrap();
        let actions = session
            .handle_incoming(publish("a/b", QoS::AtMostOnce, 0))
            .unwrap();
        let messages = delivered(&actions);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "a/b");
    }

    #[test]
    fn test_suback_fires_once() {
        let mut session = connected();
        let (pkid, _) = subscribe(&mut session, "t");

        assert!(session.handle_incoming(suback(pkid, QoS::AtLeastOnce)).is_ok());
        assert!(matches!(
            session.handle_incoming(suback(pkid, QoS::AtLeastOnce)),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_suback_failure_removes_subscription() {
        let mut session = connected();
        let (pkid, _) = subscribe(&mut session, "t");
        let packet = Packet::SubAck(SubAck {
            pkid,
            code: SubscribeReturnCode::Failure,
        });
        session.handle_incoming(packet).unwrap();
        assert!(session.subscriptions.get("t").is_none());
    }

    #[test]
    fn test_inbound_qos1_acks_then_delivers() {
        let mut session = connected();
        let (pkid, _) = subscribe(&mut session, "t");
        session.handle_incoming(suback(pkid, QoS::AtLeastOnce)).unwrap();

        let actions = session
            .handle_incoming(publish("t", QoS::AtLeastOnce, 42))
            .unwrap();
        assert!(matches!(actions[0], Action::Send(Packet::PubAck(42))));
        assert!(matches!(actions[1], Action::Deliver(..)));
    }

    #[test]
    fn test_inbound_qos2_delivers_on_pubrel() {
        let mut session = connected();
        let (pkid, _) = subscribe(&mut session, "t");
        session.handle_incoming(suback(pkid, QoS::AtLeastOnce)).unwrap();

        let actions = session
            .handle_incoming(publish("t", QoS::ExactlyOnce, 9))
            .unwrap();
        assert_eq!(sent(&actions), vec![Packet::PubRec(9)]);
        assert!(delivered(&actions).is_empty());

        // duplicate before PUBREL is not delivered twice
        session
            .handle_incoming(publish("t", QoS::ExactlyOnce, 9))
            .unwrap();

        let actions = session.handle_incoming(Packet::PubRel(9)).unwrap();
        assert!(matches!(actions[0], Action::Deliver(..)));
        assert_eq!(sent(&actions), vec![Packet::PubComp(9)]);

        assert!(session.handle_incoming(Packet::PubRel(9)).is_err());
    }

    #[test]
    fn test_outbound_qos2_chain() {
        let mut session = connected();
        let (tx, mut rx) = oneshot::channel();
        session.expect_publish_ack(QoS::ExactlyOnce, 5, tx);

        assert!(session.handle_incoming(Packet::PubAck(5)).is_err());

        let actions = session.handle_incoming(Packet::PubRec(5)).unwrap();
        assert_eq!(sent(&actions), vec![Packet::PubRel(5)]);
        assert!(rx.try_recv().is_err());

        session.handle_incoming(Packet::PubComp(5)).unwrap();
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_unexpected_server_packets() {
        let mut session = connected();
        for packet in [
            Packet::PingReq,
            Packet::Unsubscribe(Unsubscribe {
                pkid: 1,
                topic: "t".into(),
            }),
            Packet::PubAck(77),
        ] {
            assert!(matches!(
                session.handle_incoming(packet),
                Err(Error::ProtocolViolation(_))
            ));
        }
        assert!(session.handle_incoming(Packet::PingResp).unwrap().is_empty());
    }

    #[test]
    fn test_unexpected_connack() {
        let mut session = connected();
        let connack = Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        });
        assert!(matches!(
            session.handle_incoming(connack),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_connack_refused() {
        let mut session = Session::new(true);
        session.begin_connect().unwrap();
        let (tx, mut rx) = oneshot::channel();
        session.expect_connack(tx).unwrap();

        let actions = session
            .handle_incoming(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::BadUsernamePassword,
            }))
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(session.state, State::Disconnected);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_reconnect_without_session_resubscribes() {
        let mut session = connected();
        let (a, _) = subscribe(&mut session, "a");
        let (b, _) = subscribe(&mut session, "b");
        session.handle_incoming(suback(a, QoS::AtLeastOnce)).unwrap();
        session.handle_incoming(suback(b, QoS::AtLeastOnce)).unwrap();

        let (tx, mut stale) = oneshot::channel();
        session.expect_publish_ack(QoS::AtLeastOnce, 50, tx);

        session.begin_reconnect().unwrap();
        assert!(!session.clean_session);
        let (tx, mut rx) = oneshot::channel();
        session.expect_connack(tx).unwrap();

        let actions = session
            .handle_incoming(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }))
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Ok(false))));
        assert_eq!(session.state, State::Connected);
        assert!(!session.reconnecting);

        let mut topics: Vec<String> = sent(&actions)
            .into_iter()
            .map(|packet| match packet {
                Packet::Subscribe(s) => s.topic,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["a", "b"]);
        assert!(session.subscriptions.get("a").unwrap().pending);

        // stale continuation was discarded
        assert!(stale.try_recv().is_err());
        assert!(session.handle_incoming(Packet::PubAck(50)).is_err());
    }

    #[test]
    fn test_connect_after_loss_resubscribes() {
        let mut session = connected();
        let (pkid, _) = subscribe(&mut session, "a");
        session.handle_incoming(suback(pkid, QoS::AtLeastOnce)).unwrap();
        let (tx, mut stale) = oneshot::channel();
        session.expect_publish_ack(QoS::AtLeastOnce, 8, tx);

        session.state = State::Disconnected;
        session.begin_connect().unwrap();
        assert!(!session.reconnecting);
        let (waiter, _connack) = oneshot::channel();
        session.expect_connack(waiter).unwrap();
        let actions = session
            .handle_incoming(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }))
            .unwrap();

        assert!(matches!(&sent(&actions)[..], [Packet::Subscribe(s)] if s.topic == "a"));
        assert!(session.subscriptions.get("a").unwrap().pending);
        assert!(stale.try_recv().is_err());
        assert_eq!(session.pending.len(), 1);
        assert!(session.handle_incoming(Packet::PubAck(8)).is_err());
    }

    #[test]
    fn test_reconnect_with_session_keeps_pending() {
        let mut session = connected();
        let (tx, mut rx) = oneshot::channel();
        session.expect_publish_ack(QoS::AtLeastOnce, 3, tx);

        session.begin_reconnect().unwrap();
        let (waiter, _connack) = oneshot::channel();
        session.expect_connack(waiter).unwrap();
        let actions = session
            .handle_incoming(Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::Accepted,
            }))
            .unwrap();
        assert!(sent(&actions).is_empty());

        session.handle_incoming(Packet::PubAck(3)).unwrap();
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_disconnect_twice() {
        let mut session = connected();
        assert!(session.begin_disconnect().unwrap());
        let _ = session.release();
        assert_eq!(session.state, State::Closed);
        assert!(matches!(
            session.begin_disconnect(),
            Err(Error::AlreadyDisconnected)
        ));
        assert!(matches!(
            session.ensure_connected(),
            Err(Error::AlreadyDisconnected)
        ));
    }
}
