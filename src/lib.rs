//! A message transport on top of UDP, designed for applications (e.g. games) that exchange a
//!  mix of frequent small messages and occasional big ones between a server and its clients.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving typed *messages*, i.e. a message type (i32) plus a
//!    payload of defined length
//! * Each message is sent with one of four delivery classes:
//!   * *unordered unreliable*: a single datagram, may be lost or reordered
//!   * *ordered unreliable*: a single datagram wrapped in an envelope with a sequence number.
//!      Messages that arrive after a newer one are dropped
//!   * *unordered reliable*: split into chunks that are acknowledged and retransmitted until
//!      they arrive, delivered once complete
//!   * *ordered reliable*: like unordered reliable, but delivered strictly in send order
//! * There is no handshake: a connection comes into existence with the first datagram
//!    exchanged, and it is dropped after a configurable time without incoming traffic
//! * Liveness and round trip times are tracked with a ping / pong heartbeat
//! * The send rate is controlled per connection: it grows while the network keeps up, and
//!    it is halved when many bytes need retransmission. A token bucket enforces the rate
//! * Buffers and tracking records are pooled to avoid allocations on the hot paths
//!
//! ## Wire format
//!
//! Every datagram starts with the same 12 byte header, all numbers in network byte order:
//!
//! ```ascii
//!  0: magic 'DARK' (4 bytes)
//!  4: message type (i32) - negative values are reserved for the protocol
//!  8: payload length (i32)
//! 12: payload
//! ```
//!
//! Bytes after the payload are ignored. The reserved message types are:
//!
//! ```ascii
//! -1 ping:              heartbeat timestamp (u64 micros)
//! -2 pong:              the ping's timestamp, echoed
//! -3 ordered envelope:  sequence number (i32), followed by a complete inner datagram
//! -4 reliable fragment: send id (i32, negative for ordered), part id (i32),
//!                        total message length (i32), chunk data
//! -5 reliable ACK:      send id (i32), part id (i32)
//! ```
//!
//! Reliable messages are chunked as the byte stream `message type ++ payload`, 500 bytes per
//!  chunk by default.
//!
//! ## Threading
//!
//! An [end_point::EndPoint] runs two tokio tasks: a receive loop that passes incoming datagrams
//!  to the [network_handler::NetworkHandler], and a send loop that drains the high priority
//!  queue (heartbeats, ACKs) and the connections' send queues before doing the handler's
//!  periodic maintenance. Application callbacks run on the receive loop, or on the application's
//!  thread if the handler was created in pumped mode.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod control_messages;
pub mod end_point;
pub mod message;
pub mod message_dispatcher;
pub mod network_handler;
pub mod packet_header;
pub mod rate_control;
pub mod receive_tracking;
pub mod reliable_handler;
pub mod rolling_data;
pub mod safe_converter;
pub mod send_pipeline;
pub mod send_tracking;
pub mod sequence;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
