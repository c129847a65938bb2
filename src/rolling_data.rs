use std::time::Duration;

/// The most recent `N` latency samples with a running sum, so the average is available in O(1).
///  Once `N` samples are collected, each new sample overwrites the oldest one.
pub struct RollingLatency<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: u128,
    latest: Option<Duration>,
}

impl<const N: usize> Default for RollingLatency<N> {
    fn default() -> Self {
        RollingLatency {
            buf: BufferImpl::new(),
            cached_sum: 0,
            latest: None,
        }
    }
}

impl<const N: usize> RollingLatency<N> {
    pub fn add_sample(&mut self, latency: Duration) {
        let micros = latency.as_micros();
        if let Some(evicted) = self.buf.add_value(micros) {
            self.cached_sum -= evicted;
        }
        self.cached_sum += micros;
        self.latest = Some(latency);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    /// the most recently added sample, or zero if there is none
    pub fn latest(&self) -> Duration {
        self.latest.unwrap_or(Duration::ZERO)
    }

    /// the mean of the samples in the buffer, or zero if there is none
    pub fn mean(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        let micros = self.cached_sum / self.buf.len() as u128;
        Duration::from_micros(micros.try_into().unwrap_or(u64::MAX))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

enum BufferImpl<const N: usize> {
    Growing(Vec<u128>),
    Ring {
        buf: Vec<u128>,
        next: usize,
    },
}
impl <const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(Vec::with_capacity(N))
    }

    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: u128) -> Option<u128> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_empty() {
        let data = RollingLatency::<3>::default();
        assert_eq!(data.mean(), Duration::ZERO);
        assert_eq!(data.latest(), Duration::ZERO);
    }

    #[test]
    fn test_growing() {
        let mut data = RollingLatency::<3>::default();
        data.add_sample(ms(10));
        data.add_sample(ms(20));
        assert_eq!(data.len(), 2);
        assert_eq!(data.mean(), ms(15));
        assert_eq!(data.latest(), ms(20));
    }

    #[test]
    fn test_overwrites_oldest() {
        let mut data = RollingLatency::<3>::default();
        for millis in [10, 20, 30, 40, 50] {
            data.add_sample(ms(millis));
        }
        assert_eq!(data.len(), 3);
        assert_eq!(data.mean(), ms(40));
        assert_eq!(data.latest(), ms(50));

        data.clear();
        assert!(data.is_empty());
    }
}
