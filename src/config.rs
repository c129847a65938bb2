use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;

pub struct TransportConfig {
    /// The buffer size classes of the pool, in ascending order. Every buffer the transport
    ///  allocates (datagram buffers, message payloads, reassembly buffers for reliable messages)
    ///  comes from the smallest class that can hold it, so the biggest class is also the upper
    ///  bound for the size of a single message.
    ///
    /// Classes are fixed at startup, there is no resizing.
    pub pool_size_classes: Vec<usize>,

    /// This is the biggest datagram (including the 12 byte header) the transport sends or
    ///  receives. Unreliable messages must fit into a single datagram, reliable messages are
    ///  split into chunks that do.
    pub max_datagram_size: usize,

    /// Size of a reliable message chunk on the wire. The first chunk of each message carries the
    ///  4 byte application message type, so its usable payload is 4 bytes less.
    pub chunk_size: usize,

    pub min_speed: u64,
    pub max_speed: u64,
    /// maximum number of bytes that can be sent in a burst
    pub token_bucket_max: u64,
    /// upper bound for the additive increase of `speed` per rate control interval
    pub speed_growth_per_rtt: u64,
    /// accumulated retransmitted bytes that trigger halving the speed
    pub loss_halving_threshold: u64,

    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
    /// After a socket error for a connection, the connection is dropped if nothing is received
    ///  from the peer for this long. Receiving anything clears the error state.
    pub error_timeout: Duration,

    /// Unacknowledged chunks are re-sent after `resend_latency_factor` times the average latency
    pub resend_latency_factor: f64,
    /// Lower bound for the latency when deriving intervals from it, i.e. the resend timeout and
    ///  the rate control interval
    pub min_latency: Duration,

    /// The reliable message handler stops producing chunks while a connection has at least this
    ///  many bytes queued for sending.
    pub reliable_queue_limit: usize,
    /// How far ahead of the last received message id a reliable message id may be to be accepted
    pub reliable_receive_window: u32,

    pub receive_poll_interval: Duration,
    pub send_interval: Duration,

    /// Number of times the initial contact datagram is sent to each target on client setup
    pub initial_contact_count: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            pool_size_classes: vec![2048, 64 * 1024, 1024 * 1024, 8 * 1024 * 1024],
            max_datagram_size: 2048,
            chunk_size: 500,
            min_speed: 64 * 1024,
            max_speed: 20 * 1024 * 1024,
            token_bucket_max: 1024 * 1024,
            speed_growth_per_rtt: 5000,
            loss_halving_threshold: 64 * 1024,
            heartbeat_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(20),
            error_timeout: Duration::from_secs(5),
            resend_latency_factor: 1.5,
            min_latency: Duration::from_millis(10),
            reliable_queue_limit: 64 * 1024,
            reliable_receive_window: 65536,
            receive_poll_interval: Duration::from_millis(10),
            send_interval: Duration::from_millis(10),
            initial_contact_count: 4,
        }
    }
}

impl TransportConfig {
    /// the largest message payload a buffer can be pooled for
    pub fn max_message_size(&self) -> usize {
        self.pool_size_classes.last().copied().unwrap_or(0)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size_classes.is_empty() {
            bail!("at least one pool size class is required");
        }
        if self.pool_size_classes.windows(2).any(|w| w[0] >= w[1]) {
            bail!("pool size classes must be strictly ascending: {:?}", self.pool_size_classes);
        }
        if self.pool_size_classes[0] < self.max_datagram_size {
            bail!("the smallest pool size class ({}) must hold a full datagram ({} bytes)", self.pool_size_classes[0], self.max_datagram_size);
        }
        if self.chunk_size <= 4 {
            bail!("chunk size must be bigger than the 4 byte message type header");
        }
        // fragment = datagram header + fragment header + chunk
        if 2 * PacketHeader::SERIALIZED_LEN + self.chunk_size > self.max_datagram_size {
            bail!("a chunk of {} bytes does not fit into a datagram of {} bytes", self.chunk_size, self.max_datagram_size);
        }
        if self.max_message_size() > i32::MAX as usize {
            bail!("the biggest pool size class exceeds the maximum message size of the wire format");
        }
        if self.min_speed == 0 || self.min_speed > self.max_speed {
            bail!("invalid speed range {}..{}", self.min_speed, self.max_speed);
        }
        if self.token_bucket_max < self.max_datagram_size as u64 {
            bail!("the token bucket must hold at least one full datagram");
        }
        if self.reliable_receive_window == 0 || self.reliable_receive_window > i32::MAX as u32 / 4 {
            bail!("reliable receive window must be in 1..{}", i32::MAX / 4);
        }
        if self.resend_latency_factor < 1.0 {
            bail!("resending before a round trip has passed is not supported");
        }
        Ok(())
    }
}
