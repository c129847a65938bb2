use std::sync::Mutex;
use tracing::trace;

/// Records that are kept in a [Recycler] between uses. `reset()` must bring a record back into
///  the state of a freshly created one, but it should keep allocated capacity for reuse.
pub trait Recyclable: Default + Send {
    fn reset(&mut self);
}

struct RecyclerState<T> {
    free: Vec<T>,
    in_use: usize,
}

/// Pool for tracking records. Unlike buffers, records have no identity: `release()` only checks
///  that there is a record in use at all.
pub struct Recycler<T: Recyclable> {
    state: Mutex<RecyclerState<T>>,
}

impl<T: Recyclable> Default for Recycler<T> {
    fn default() -> Self {
        Recycler {
            state: Mutex::new(RecyclerState { free: Vec::new(), in_use: 0 }),
        }
    }
}

impl<T: Recyclable> Recycler<T> {
    pub fn acquire(&self) -> T {
        let pooled = {
            let mut state = self.state.lock().unwrap();
            state.in_use += 1;
            state.free.pop()
        };

        match pooled {
            Some(t) => t,
            None => {
                trace!("no free record in recycler: creating new one");
                T::default()
            }
        }
    }

    pub fn release(&self, mut t: T) {
        t.reset();

        let mut state = self.state.lock().unwrap();
        assert!(state.in_use > 0, "this is a bug: releasing a record that was never acquired");
        state.in_use -= 1;
        state.free.push(t);
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().unwrap().in_use
    }
}
