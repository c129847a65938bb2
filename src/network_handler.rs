use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;
use crate::buffers::pooled_buf::PooledBuf;
use crate::buffers::Pools;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::control_messages::{HeartbeatTimestamp, OrderedEnvelopeHeader, ReliableAck};
use crate::message::{DeliveryClass, Message};
use crate::message_dispatcher::{ConnectCallback, DisconnectCallback, DispatchMode, MessageCallback, MessageDispatcher};
use crate::packet_header::{PacketHeader, PacketKind};
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::Outbox;

/// The NetworkHandler owns the table of connections, decodes received datagrams and routes them
///  to the protocol's built-in handlers or to application callbacks. It is also the application's
///  API for sending messages.
///
/// `S` is the application's per-connection state, created by the connect callback.
pub struct NetworkHandler<S> {
    config: Arc<TransportConfig>,
    pools: Arc<Pools>,
    /// heartbeat timestamps are relative to this
    epoch: Instant,
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection<S>>>>,
    server: RwLock<Option<ConnectionId>>,
    dispatcher: MessageDispatcher<S>,
    outbox: Outbox,
}

impl<S: Send + Sync + 'static> NetworkHandler<S> {
    pub fn new(config: TransportConfig, mode: DispatchMode) -> anyhow::Result<Arc<NetworkHandler<S>>> {
        config.validate()?;
        let pools = Pools::new(&config);

        Ok(Arc::new(NetworkHandler {
            config: Arc::new(config),
            pools,
            epoch: Instant::now(),
            connections: Default::default(),
            server: Default::default(),
            dispatcher: MessageDispatcher::new(mode),
            outbox: Default::default(),
        }))
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn register_callback(&self, message_type: i32, callback: impl Fn(&Message, &Arc<Connection<S>>) + Send + Sync + 'static) -> anyhow::Result<()> {
        let callback: MessageCallback<S> = Arc::new(callback);
        self.dispatcher.register_callback(message_type, callback)
    }

    pub fn register_connect_callback(&self, callback: impl Fn(&Arc<Connection<S>>) -> S + Send + Sync + 'static) {
        let callback: ConnectCallback<S> = Arc::new(callback);
        self.dispatcher.register_connect_callback(callback);
    }

    pub fn register_disconnect_callback(&self, callback: impl Fn(&Arc<Connection<S>>) + Send + Sync + 'static) {
        let callback: DisconnectCallback<S> = Arc::new(callback);
        self.dispatcher.register_disconnect_callback(callback);
    }

    /// In pumped mode, call the callbacks for all application messages received since the
    ///  previous call
    pub fn fire_callbacks(&self) {
        self.dispatcher.fire_callbacks();
    }

    pub fn connection(&self, addr: SocketAddr) -> Option<Arc<Connection<S>>> {
        self.connection_by_id(ConnectionId::for_addr(addr))
    }

    pub fn connection_by_id(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        self.connections.read().unwrap()
            .get(&id)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection<S>>> {
        self.connections.read().unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// the connection to the first target a client was set up with
    pub fn server_connection(&self) -> Option<Arc<Connection<S>>> {
        let id = (*self.server.read().unwrap())?;
        self.connection_by_id(id)
    }

    /// Register a connection to a peer that was not heard from yet, i.e. a server a client
    ///  contacts. The first target becomes the server for `send_to_server()`.
    pub(crate) fn add_target(&self, addr: SocketAddr, now: Instant) -> Arc<Connection<S>> {
        let connection = self.get_or_create_connection(addr, now);

        let mut server = self.server.write().unwrap();
        if server.is_none() {
            *server = Some(connection.id());
        }
        connection
    }

    fn get_or_create_connection(&self, addr: SocketAddr, now: Instant) -> Arc<Connection<S>> {
        let id = ConnectionId::for_addr(addr);
        if let Some(connection) = self.connection_by_id(id) {
            return connection;
        }

        match self.connections.write().unwrap().entry(id) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                debug!("new connection {} for {:?}", id, addr);
                let connection = Connection::new(addr, ConnectionState::Connecting, self.config.clone(), self.pools.clone(), now);
                e.insert(Arc::new(connection)).clone()
            }
        }
    }

    /// Create a message with a payload of `size` bytes from the pool, to be filled through
    ///  `payload_mut()`
    pub fn create_message(&self, message_type: i32, size: usize, delivery: DeliveryClass) -> anyhow::Result<Message> {
        Message::new(&self.pools.buffers, message_type, size, delivery)
    }

    fn check_sendable(&self, message: &Message) -> anyhow::Result<()> {
        if !message.delivery().is_reliable() && message.wire_len() > self.config.max_datagram_size {
            bail!("{:?} message of {} bytes does not fit into a single datagram of {} bytes - use a reliable delivery class for big messages",
                message.delivery(), message.wire_len(), self.config.max_datagram_size);
        }
        Ok(())
    }

    pub fn send(&self, message: Message, connection: &Arc<Connection<S>>) -> anyhow::Result<()> {
        self.check_sendable(&message)?;
        self.enqueue(Arc::new(message), connection);
        self.outbox.wake();
        Ok(())
    }

    /// Send to the server a client was set up for. The message is dropped if there is none.
    pub fn send_to_server(&self, message: Message) -> anyhow::Result<()> {
        match self.server_connection() {
            Some(connection) => self.send(message, &connection),
            None => {
                debug!("no server connection - dropping {:?}", message);
                Ok(())
            }
        }
    }

    /// Send a message to every connection. The message is shared between the connections' send
    ///  queues, and dropped if there are no connections.
    pub fn broadcast(&self, message: Message) -> anyhow::Result<()> {
        self.check_sendable(&message)?;

        let message = Arc::new(message);
        for connection in self.connections() {
            self.enqueue(message.clone(), &connection);
        }
        self.outbox.wake();
        Ok(())
    }

    fn enqueue(&self, message: Arc<Message>, connection: &Arc<Connection<S>>) {
        if connection.state() == ConnectionState::Disconnected {
            debug!("connection to {:?} is disconnected - dropping {:?}", connection.remote_addr(), message);
            return;
        }
        connection.enqueue(message);
    }

    /// Handle a datagram received from `from`. Malformed datagrams are dropped.
    pub fn handle_raw(&self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received datagram of {} bytes from {:?}", datagram.len(), from);

        let (header, payload) = match PacketHeader::parse_datagram(datagram) {
            Ok(x) => x,
            Err(e) => {
                trace!("dropping malformed datagram from {:?}: {}", from, e);
                return;
            }
        };

        let connection = self.get_or_create_connection(from, now);
        if connection.on_receive(now) {
            self.dispatcher.notify_connect(&connection);
        }

        match header.kind {
            PacketKind::Application(_) => self.deliver_datagram(&connection, header.kind, payload, DeliveryClass::UnorderedUnreliable),
            PacketKind::Ping => self.on_ping(&connection, payload),
            PacketKind::Pong => self.on_pong(&connection, payload, now),
            PacketKind::OrderedEnvelope => self.on_ordered_envelope(&connection, payload),
            PacketKind::ReliableFragment => self.on_reliable_fragment(&connection, payload),
            PacketKind::ReliableAck => self.on_reliable_ack(&connection, payload),
        }
    }

    fn deliver_datagram(&self, connection: &Arc<Connection<S>>, kind: PacketKind, payload: &[u8], delivery: DeliveryClass) {
        let mut message = match Message::with_kind(&self.pools.buffers, kind, payload.len(), delivery) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping message from {:?}: {}", connection.remote_addr(), e);
                return;
            }
        };
        message.payload_mut().copy_from_slice(payload);
        self.dispatcher.dispatch(message, connection);
    }

    fn send_control(&self, connection: &Connection<S>, kind: PacketKind, size: usize, f: impl FnOnce(&mut PooledBuf)) {
        match Message::control(&self.pools.buffers, kind, size, f) {
            Ok(message) => self.outbox.push(connection.id(), connection.remote_addr(), message),
            Err(e) => warn!("failed to create {:?} message: {}", kind, e),
        }
    }

    fn on_ping(&self, connection: &Connection<S>, payload: &[u8]) {
        let Ok(timestamp) = HeartbeatTimestamp::deser(payload) else {
            trace!("dropping malformed ping from {:?}", connection.remote_addr());
            return;
        };
        self.send_control(connection, PacketKind::Pong, HeartbeatTimestamp::SERIALIZED_LEN, |buf| timestamp.ser(buf));
    }

    fn on_pong(&self, connection: &Connection<S>, payload: &[u8], now: Instant) {
        let Ok(timestamp) = HeartbeatTimestamp::deser(payload) else {
            trace!("dropping malformed pong from {:?}", connection.remote_addr());
            return;
        };

        match self.epoch.checked_add(Duration::from_micros(timestamp.micros)) {
            Some(sent_at) if sent_at <= now => connection.record_latency(now - sent_at),
            _ => debug!("pong from {:?} echoes a timestamp from the future - ignoring", connection.remote_addr()),
        }
    }

    fn on_ordered_envelope(&self, connection: &Arc<Connection<S>>, payload: &[u8]) {
        let (envelope, inner) = match OrderedEnvelopeHeader::deser(payload) {
            Ok(x) => x,
            Err(e) => {
                trace!("dropping malformed ordered envelope: {}", e);
                return;
            }
        };
        let (inner_header, inner_payload) = match PacketHeader::parse_datagram(inner) {
            Ok(x) => x,
            Err(e) => {
                trace!("dropping ordered envelope with malformed content: {}", e);
                return;
            }
        };
        if !inner_header.kind.is_application() {
            trace!("dropping ordered envelope with content of type {:?}", inner_header.kind);
            return;
        }

        if !connection.accept_ordered(envelope.sequence) {
            trace!("dropping ordered message {} that is not newer than the last one", envelope.sequence);
            return;
        }
        self.deliver_datagram(connection, inner_header.kind, inner_payload, DeliveryClass::OrderedUnreliable);
    }

    fn on_reliable_fragment(&self, connection: &Arc<Connection<S>>, payload: &[u8]) {
        if connection.state() == ConnectionState::Disconnected {
            trace!("dropping reliable fragment for disconnected {:?}", connection.remote_addr());
            return;
        }
        let Some(outcome) = connection.reliable().handle_fragment(payload) else {
            return;
        };

        let ack = outcome.ack;
        self.send_control(connection, PacketKind::ReliableAck, ReliableAck::SERIALIZED_LEN, |buf| ack.ser(buf));

        for message in outcome.delivered {
            self.dispatcher.dispatch(message, connection);
        }
    }

    fn on_reliable_ack(&self, connection: &Connection<S>, payload: &[u8]) {
        if connection.state() == ConnectionState::Disconnected {
            return;
        }
        match ReliableAck::deser(payload) {
            Ok(ack) => {
                if !connection.reliable().handle_ack(&ack) {
                    trace!("ACK for {} part {} had no effect", ack.send_id, ack.part_id);
                }
            }
            Err(e) => trace!("dropping malformed ACK: {}", e),
        }
    }

    pub(crate) fn heartbeat_timestamp(&self, now: Instant) -> HeartbeatTimestamp {
        HeartbeatTimestamp {
            micros: now.saturating_duration_since(self.epoch).as_micros().prechecked_cast(),
        }
    }

    pub(crate) fn ping(&self, connection: &Connection<S>, now: Instant) {
        let timestamp = self.heartbeat_timestamp(now);
        self.send_control(connection, PacketKind::Ping, HeartbeatTimestamp::SERIALIZED_LEN, |buf| timestamp.ser(buf));
    }

    /// Periodic maintenance, called by the send loop after each pass: ping connections, adjust
    ///  their speed, produce reliable fragments, and drop connections that timed out.
    pub fn heartbeat_tick(&self, now: Instant) {
        let mut timed_out = Vec::new();

        for connection in self.connections() {
            if connection.is_timed_out(now) {
                timed_out.push(connection);
                continue;
            }
            if connection.ping_due(now) {
                self.ping(&connection, now);
            }
            if let Err(e) = connection.service(now) {
                warn!("error servicing reliable messages for {:?}: {}", connection.remote_addr(), e);
            }
        }

        for connection in timed_out {
            self.drop_connection(&connection);
        }
    }

    fn drop_connection(&self, connection: &Arc<Connection<S>>) {
        let removed = self.connections.write().unwrap()
            .remove(&connection.id());
        if removed.is_none() {
            return;
        }

        debug!("connection to {:?} timed out", connection.remote_addr());
        if connection.disconnect() {
            self.dispatcher.notify_disconnect(connection);
        }
        connection.teardown();
        self.outbox.purge(connection.id());
    }

    /// Drop all connections without notifying the application, e.g. on shutdown
    pub(crate) fn clear(&self) {
        let connections = std::mem::take(&mut *self.connections.write().unwrap());
        for connection in connections.values() {
            connection.disconnect();
            connection.teardown();
        }
        drop(self.outbox.drain());
    }
}
