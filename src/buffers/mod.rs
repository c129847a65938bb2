use std::sync::Arc;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::recycler::Recycler;
use crate::config::TransportConfig;
use crate::receive_tracking::ReceiveTracking;
use crate::send_tracking::SendTracking;

pub mod buffer_pool;
pub mod pooled_buf;
pub mod recycler;

/// All pools of an end point. They are created from configuration at setup and shared by
///  everything that belongs to the end point.
pub struct Pools {
    pub buffers: Arc<BufferPool>,
    pub send_tracking: Recycler<SendTracking>,
    pub receive_tracking: Recycler<ReceiveTracking>,
}

impl Pools {
    pub fn new(config: &TransportConfig) -> Arc<Pools> {
        Arc::new(Pools {
            buffers: BufferPool::new(&config.pool_size_classes),
            send_tracking: Recycler::default(),
            receive_tracking: Recycler::default(),
        })
    }
}
