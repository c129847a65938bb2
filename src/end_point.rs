use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use anyhow::bail;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use crate::buffers::pooled_buf::PooledBuf;
use crate::connection::Connection;
use crate::message::DeliveryClass;
use crate::network_handler::NetworkHandler;
use crate::send_pipeline::{SendPipeline, SendSocket};

/// EndPoint is where all other parts of the protocol come together: it owns the UDP socket and
///  runs the two loops that move datagrams between the socket and the [NetworkHandler].
///
/// * The receive loop reads datagrams into a single reusable buffer and hands them to the
///    network handler
/// * The send loop drains the high priority queue and then each connection's send queue,
///    followed by the network handler's heartbeat tick
///
/// Both loops wait with bounded timeouts, so heartbeats happen at a steady pace and a shutdown
///  is noticed promptly.
pub struct EndPoint<S> {
    handler: Arc<NetworkHandler<S>>,
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + Sync + 'static> EndPoint<S> {
    pub async fn setup_server(bind_addr: SocketAddr, handler: Arc<NetworkHandler<S>>) -> anyhow::Result<EndPoint<S>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound server socket to {:?}", UdpSocket::local_addr(&socket)?);
        Self::start(socket, handler)
    }

    /// Set up a client that contacts `targets`. The socket is bound to an ephemeral port of the
    ///  first target's address family, and every target is registered as a connection that is
    ///  waiting for the peer's first response.
    pub async fn setup_client(targets: &[SocketAddr], handler: Arc<NetworkHandler<S>>) -> anyhow::Result<EndPoint<S>> {
        let Some(first) = targets.first() else {
            bail!("a client needs at least one target");
        };

        let bind_addr = if first.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound client socket to {:?}", UdpSocket::local_addr(&socket)?);

        let now = Instant::now();
        for target in targets {
            let connection = handler.add_target(*target, now);
            debug!("contacting {:?}", target);
            for _ in 0..handler.config().initial_contact_count {
                handler.ping(&connection, now);
            }
        }

        Self::start(socket, handler)
    }

    fn start(socket: Arc<UdpSocket>, handler: Arc<NetworkHandler<S>>) -> anyhow::Result<EndPoint<S>> {
        let local_addr = UdpSocket::local_addr(&socket)?;
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let send_buf = handler.pools().buffers.acquire(handler.config().max_datagram_size)?;
        let receive_buf = handler.pools().buffers.acquire(handler.config().max_datagram_size)?;

        let send_socket: Arc<dyn SendSocket> = Arc::new(socket.clone());
        let send_loop = SendLoop {
            handler: handler.clone(),
            pipeline: SendPipeline::new(send_socket, send_buf),
        };
        let send_task = tokio::spawn(send_loop.run(shutdown_flag.clone()));

        let receive_loop = ReceiveLoop {
            handler: handler.clone(),
            socket,
            buf: receive_buf,
        };
        let receive_task = tokio::spawn(receive_loop.run(shutdown_flag.clone(), send_task));

        Ok(EndPoint {
            handler,
            local_addr,
            shutdown_flag,
            receive_task: Mutex::new(Some(receive_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handler(&self) -> &Arc<NetworkHandler<S>> {
        &self.handler
    }

    /// the connection to the first target a client was set up with
    pub fn server_connection(&self) -> Option<Arc<Connection<S>>> {
        self.handler.server_connection()
    }

    /// Stop both loops and release the socket. Connections are dropped without calling the
    ///  disconnect callback.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down end point {:?}", self.local_addr);
        self.shutdown_flag.store(true, Ordering::Release);
        self.handler.outbox().wake();

        let receive_task = self.receive_task.lock().unwrap().take();
        if let Some(receive_task) = receive_task {
            receive_task.await?;
        }
        self.handler.clear();
        Ok(())
    }
}

struct ReceiveLoop<S> {
    handler: Arc<NetworkHandler<S>>,
    socket: Arc<UdpSocket>,
    buf: PooledBuf,
}

impl<S: Send + Sync + 'static> ReceiveLoop<S> {
    async fn run(mut self, shutdown_flag: Arc<AtomicBool>, send_task: JoinHandle<()>) {
        info!("starting receive loop");
        let poll_interval = self.handler.config().receive_poll_interval;

        while !shutdown_flag.load(Ordering::Acquire) {
            self.buf.maximize_len();
            let (num_read, from) = match timeout(poll_interval, self.socket.recv_from(self.buf.as_mut())).await {
                Err(_) => continue,
                Ok(Ok(x)) => x,
                Ok(Err(e)) => {
                    // e.g. ICMP 'port unreachable' surfacing as a connection reset on some platforms.
                    //  There is no peer address here: the peer's connection is marked through its
                    //  failed sends instead.
                    debug!("socket error: {}", e);
                    continue;
                }
            };
            self.buf.set_len(num_read);
            self.handler.handle_raw(self.buf.as_ref(), from, Instant::now());
        }

        if let Err(e) = send_task.await {
            error!("send loop terminated abnormally: {}", e);
        }
        info!("receive loop stopped");
    }
}

struct SendLoop<S> {
    handler: Arc<NetworkHandler<S>>,
    pipeline: SendPipeline,
}

impl<S: Send + Sync + 'static> SendLoop<S> {
    async fn run(mut self, shutdown_flag: Arc<AtomicBool>) {
        info!("starting send loop on {:?}", self.pipeline.local_addr());
        let send_interval = self.handler.config().send_interval;

        while !shutdown_flag.load(Ordering::Acquire) {
            let _ = timeout(send_interval, self.handler.outbox().wait()).await;
            self.run_once(Instant::now()).await;
        }
        info!("send loop stopped");
    }

    async fn run_once(&mut self, now: Instant) {
        for entry in self.handler.outbox().drain() {
            let result = self.pipeline.send_message(entry.to, &entry.message, None).await;
            if let Some(connection) = self.handler.connection_by_id(entry.connection) {
                Self::on_send_result(&connection, result, now);
            }
        }

        for connection in self.handler.connections() {
            self.drain_connection(&connection, now).await;
        }

        self.handler.heartbeat_tick(now);
    }

    async fn drain_connection(&mut self, connection: &Arc<Connection<S>>, now: Instant) {
        while let Some(message) = connection.next_to_send(now) {
            if message.delivery().is_reliable() {
                if let Err(e) = connection.reliable().queue(message) {
                    warn!("dropping reliable message for {:?}: {}", connection.remote_addr(), e);
                }
                continue;
            }

            let sequence = if message.delivery() == DeliveryClass::OrderedUnreliable {
                Some(connection.next_ordered_sequence())
            }
            else {
                None
            };
            let result = self.pipeline.send_message(connection.remote_addr(), &message, sequence).await;
            Self::on_send_result(connection, result, now);
        }
    }

    fn on_send_result(connection: &Connection<S>, result: std::io::Result<usize>, now: Instant) {
        match result {
            Ok(num_sent) => {
                trace!("sent {} bytes to {:?}", num_sent, connection.remote_addr());
                connection.on_sent(num_sent);
            }
            Err(e) => {
                debug!("error sending to {:?}: {}", connection.remote_addr(), e);
                connection.on_send_error(now);
            }
        }
    }
}
