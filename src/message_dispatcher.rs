use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::connection::Connection;
use crate::message::Message;

pub type MessageCallback<S> = Arc<dyn Fn(&Message, &Arc<Connection<S>>) + Send + Sync>;
/// called for the first datagram received on a connection, returns the application's state for it
pub type ConnectCallback<S> = Arc<dyn Fn(&Arc<Connection<S>>) -> S + Send + Sync>;
pub type DisconnectCallback<S> = Arc<dyn Fn(&Arc<Connection<S>>) + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchMode {
    /// application callbacks are called on the receive loop
    Immediate,
    /// application messages are queued until the application calls `fire_callbacks()`
    Pumped,
}

/// Routes received application messages to the callbacks registered for their type.
///
/// Callbacks are cloned out of their lock before they are called, so a callback may register
///  other callbacks.
pub struct MessageDispatcher<S> {
    mode: DispatchMode,
    callbacks: RwLock<FxHashMap<i32, MessageCallback<S>>>,
    connect_callback: RwLock<Option<ConnectCallback<S>>>,
    disconnect_callback: RwLock<Option<DisconnectCallback<S>>>,
    pumped: Mutex<VecDeque<(Message, Arc<Connection<S>>)>>,
}

impl<S: Send + Sync + 'static> MessageDispatcher<S> {
    pub fn new(mode: DispatchMode) -> MessageDispatcher<S> {
        MessageDispatcher {
            mode,
            callbacks: Default::default(),
            connect_callback: Default::default(),
            disconnect_callback: Default::default(),
            pumped: Default::default(),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Register the callback for an application message type, replacing a previously registered
    ///  one. Negative types are reserved for the protocol.
    pub fn register_callback(&self, message_type: i32, callback: MessageCallback<S>) -> anyhow::Result<()> {
        if message_type < 0 {
            bail!("message type {} is reserved for the protocol", message_type);
        }
        self.callbacks.write().unwrap()
            .insert(message_type, callback);
        Ok(())
    }

    pub fn register_connect_callback(&self, callback: ConnectCallback<S>) {
        *self.connect_callback.write().unwrap() = Some(callback);
    }

    pub fn register_disconnect_callback(&self, callback: DisconnectCallback<S>) {
        *self.disconnect_callback.write().unwrap() = Some(callback);
    }

    /// Returns `true` if there is a connect callback and it was called
    pub fn notify_connect(&self, connection: &Arc<Connection<S>>) -> bool {
        let callback = self.connect_callback.read().unwrap().clone();
        match callback {
            Some(callback) => connection.on_connected(callback(connection)),
            None => false,
        }
    }

    pub fn notify_disconnect(&self, connection: &Arc<Connection<S>>) {
        let callback = self.disconnect_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(connection);
        }
    }

    pub fn dispatch(&self, message: Message, connection: &Arc<Connection<S>>) {
        match self.mode {
            DispatchMode::Immediate => self.call(&message, connection),
            DispatchMode::Pumped => {
                self.pumped.lock().unwrap()
                    .push_back((message, connection.clone()));
            }
        }
    }

    /// Call the callbacks for all queued messages on the caller's thread. This does nothing in
    ///  immediate mode.
    pub fn fire_callbacks(&self) {
        let messages = std::mem::take(&mut *self.pumped.lock().unwrap());
        for (message, connection) in messages {
            self.call(&message, &connection);
        }
    }

    pub fn num_pumped(&self) -> usize {
        self.pumped.lock().unwrap().len()
    }

    fn call(&self, message: &Message, connection: &Arc<Connection<S>>) {
        let callback = self.callbacks.read().unwrap()
            .get(&message.message_type())
            .cloned();

        match callback {
            Some(callback) => callback(message, connection),
            None => trace!("no callback registered for message type {} - dropping", message.message_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use crate::buffers::Pools;
    use crate::config::TransportConfig;
    use crate::connection::ConnectionState;
    use crate::message::DeliveryClass;
    use super::*;

    fn setup() -> (Arc<Pools>, Arc<Connection<u32>>) {
        let config = Arc::new(TransportConfig::default());
        let pools = Pools::new(&config);
        let connection = Connection::new(SocketAddr::from(([127, 0, 0, 1], 1)), ConnectionState::Active, config, pools.clone(), Instant::now());
        (pools, Arc::new(connection))
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> MessageCallback<u32> {
        let counter = counter.clone();
        Arc::new(move |msg: &Message, _: &Arc<Connection<u32>>| {
            counter.fetch_add(msg.len(), Ordering::SeqCst);
        })
    }

    #[test]
    fn test_reserved_type_rejected() {
        let dispatcher = MessageDispatcher::<u32>::new(DispatchMode::Immediate);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(dispatcher.register_callback(-1, counting_callback(&counter)).is_err());
        assert!(dispatcher.register_callback(0, counting_callback(&counter)).is_ok());
    }

    #[test]
    fn test_immediate() {
        let (pools, connection) = setup();
        let dispatcher = MessageDispatcher::new(DispatchMode::Immediate);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register_callback(3, counting_callback(&counter)).unwrap();

        dispatcher.dispatch(Message::new(&pools.buffers, 3, 5, DeliveryClass::UnorderedUnreliable).unwrap(), &connection);
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        // no callback for this type
        dispatcher.dispatch(Message::new(&pools.buffers, 4, 5, DeliveryClass::UnorderedUnreliable).unwrap(), &connection);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pools.buffers.in_use_count(2048), 0);
    }

    #[test]
    fn test_pumped() {
        let (pools, connection) = setup();
        let dispatcher = MessageDispatcher::new(DispatchMode::Pumped);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register_callback(3, counting_callback(&counter)).unwrap();

        for len in [1, 2] {
            dispatcher.dispatch(Message::new(&pools.buffers, 3, len, DeliveryClass::UnorderedUnreliable).unwrap(), &connection);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.num_pumped(), 2);

        dispatcher.fire_callbacks();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.num_pumped(), 0);
        assert_eq!(pools.buffers.in_use_count(2048), 0);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (_, connection) = setup();
        let dispatcher = MessageDispatcher::new(DispatchMode::Immediate);
        assert!(!dispatcher.notify_connect(&connection));

        dispatcher.register_connect_callback(Arc::new(|_: &Arc<Connection<u32>>| 42u32));
        assert!(dispatcher.notify_connect(&connection));
        assert_eq!(connection.user_state(), Some(&42));

        let disconnected = Arc::new(AtomicUsize::new(0));
        let d = disconnected.clone();
        dispatcher.register_disconnect_callback(Arc::new(move |c: &Arc<Connection<u32>>| {
            d.fetch_add(*c.user_state().unwrap() as usize, Ordering::SeqCst);
        }));
        dispatcher.notify_disconnect(&connection);
        assert_eq!(disconnected.load(Ordering::SeqCst), 42);
    }
}
