use std::sync::{Arc, Mutex};
use anyhow::bail;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};
use crate::buffers::pooled_buf::PooledBuf;

struct SizeClass {
    size: usize,
    free: Vec<(u64, Vec<u8>)>,
    in_use: FxHashSet<u64>,
}

struct PoolState {
    classes: Vec<SizeClass>,
    next_id: u64,
}

/// A pool of fixed-size byte buffers, organized in size classes that are fixed at construction.
///  Every buffer is either free or in use, and the pool tracks which.
///
/// Buffers are handed out as [PooledBuf] and return to the pool when they are dropped.
pub struct BufferPool {
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(size_classes: &[usize]) -> Arc<BufferPool> {
        let mut sizes = size_classes.to_vec();
        sizes.sort_unstable();
        sizes.dedup();

        Arc::new(BufferPool {
            state: Mutex::new(PoolState {
                classes: sizes.into_iter()
                    .map(|size| SizeClass { size, free: Vec::new(), in_use: FxHashSet::default() })
                    .collect(),
                next_id: 0,
            }),
        })
    }

    pub fn size_classes(&self) -> Vec<usize> {
        let state = self.state.lock().unwrap();
        state.classes.iter().map(|c| c.size).collect()
    }

    /// Returns a buffer with a logical length of `size` from the smallest size class that can hold
    ///  it. The buffer's content is undefined: callers are expected to overwrite it or `clear()` it.
    pub fn acquire(self: &Arc<Self>, size: usize) -> anyhow::Result<PooledBuf> {
        if size == 0 {
            bail!("zero-size buffers are not pooled");
        }

        // the lock is not held while allocating
        let (id, class_size, pooled) = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let id = state.next_id;

            let Some(class) = state.classes.iter_mut().find(|c| c.size >= size) else {
                bail!("no pool size class for a buffer of {} bytes", size);
            };

            match class.free.pop() {
                Some((id, buf)) => {
                    class.in_use.insert(id);
                    (id, class.size, Some(buf))
                }
                None => {
                    class.in_use.insert(id);
                    state.next_id += 1;
                    (id, class.size, None)
                }
            }
        };

        let buf = match pooled {
            Some(buf) => {
                trace!("returning buffer of size class {} from pool", class_size);
                buf
            }
            None => {
                debug!("no free buffer of size class {} in pool: allocating", class_size);
                vec![0u8; class_size]
            }
        };
        Ok(PooledBuf::new(id, buf, size, self.clone()))
    }

    /// Explicitly return a buffer to the pool. This is equivalent to dropping it, except that it
    ///  panics if the buffer was handed out by a different pool.
    pub fn release(self: &Arc<Self>, buf: PooledBuf) {
        assert!(Arc::ptr_eq(buf.pool(), self), "buffer {} is not tracked by this pool", buf.id());
        drop(buf);
    }

    pub(crate) fn give_back(&self, id: u64, buf: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        let class = state.classes.iter_mut()
            .find(|c| c.size == buf.len())
            .unwrap_or_else(|| panic!("this is a bug: returned buffer of {} bytes matches no size class", buf.len()));

        if !class.in_use.remove(&id) {
            panic!("this is a bug: buffer {} is released but was not in use", id);
        }
        class.free.push((id, buf));
    }

    fn with_class<T>(&self, class_size: usize, f: impl FnOnce(&mut SizeClass) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        match state.classes.iter_mut().find(|c| c.size == class_size) {
            Some(class) => f(class),
            None => panic!("{} is not a registered size class", class_size),
        }
    }

    pub fn free_count(&self, class_size: usize) -> usize {
        self.with_class(class_size, |c| c.free.len())
    }

    pub fn in_use_count(&self, class_size: usize) -> usize {
        self.with_class(class_size, |c| c.in_use.len())
    }

    pub fn total_count(&self, class_size: usize) -> usize {
        self.with_class(class_size, |c| c.free.len() + c.in_use.len())
    }

    /// Discard free buffers of a size class down to `leave` if at least `trigger` buffers are
    ///  free. Buffers in use are not affected.
    pub fn trim(&self, class_size: usize, leave: usize, trigger: usize) {
        let discarded = self.with_class(class_size, |c| {
            if c.free.len() >= trigger && c.free.len() > leave {
                c.free.split_off(leave)
            }
            else {
                Vec::new()
            }
        });

        if !discarded.is_empty() {
            debug!("discarding {} free buffers of size class {}", discarded.len(), class_size);
        }
    }

    pub fn trim_all(&self, leave: usize, trigger: usize) {
        for class_size in self.size_classes() {
            self.trim(class_size, leave, trigger);
        }
    }
}
