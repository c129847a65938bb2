use std::time::{Duration, Instant};
use tracing::debug;
use crate::config::TransportConfig;

/// Congestion state of a single connection: the allowed send speed, and a token bucket that is
///  refilled at that speed and gates sending.
///
/// The speed grows additively by what was actually sent (bounded per update interval), is reduced
///  by retransmitted bytes at each update, and is halved when retransmissions pile up.
pub struct RateController {
    speed: u64,
    min_speed: u64,
    max_speed: u64,
    speed_growth: u64,
    loss_halving_threshold: u64,

    tokens: f64,
    token_bucket_max: f64,
    last_refill: Instant,

    last_update: Instant,
    sent_since_update: u64,
    loss_since_update: u64,
    accumulated_loss: u64,
}

impl RateController {
    pub fn new(config: &TransportConfig, now: Instant) -> RateController {
        RateController {
            speed: config.min_speed,
            min_speed: config.min_speed,
            max_speed: config.max_speed,
            speed_growth: config.speed_growth_per_rtt,
            loss_halving_threshold: config.loss_halving_threshold,
            tokens: config.token_bucket_max as f64,
            token_bucket_max: config.token_bucket_max as f64,
            last_refill: now,
            last_update: now,
            sent_since_update: 0,
            loss_since_update: 0,
            accumulated_loss: 0,
        }
    }

    /// bytes per second
    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn available_tokens(&self) -> u64 {
        self.tokens as u64
    }

    fn clamp(&mut self) {
        self.speed = self.speed.clamp(self.min_speed, self.max_speed);
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.speed as f64)
            .min(self.token_bucket_max);
    }

    /// Refill the bucket, and then take `bytes` tokens from it if there are enough
    pub fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let bytes = bytes as f64;
        if bytes <= self.tokens {
            self.tokens -= bytes;
            true
        }
        else {
            false
        }
    }

    /// to be called for every datagram that is put on the wire
    pub fn on_sent(&mut self, bytes: usize) {
        self.sent_since_update = self.sent_since_update.saturating_add(bytes as u64);
    }

    /// to be called when a reliable chunk is sent again because it was not acknowledged in time
    pub fn on_retransmit(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        self.loss_since_update = self.loss_since_update.saturating_add(bytes);
        self.accumulated_loss = self.accumulated_loss.saturating_add(bytes);

        if self.accumulated_loss > self.loss_halving_threshold {
            self.accumulated_loss = 0;
            self.speed /= 2;
            self.clamp();
            debug!("retransmissions exceeded {} bytes: reducing speed to {} bytes/s", self.loss_halving_threshold, self.speed);
        }
    }

    /// Adjust the speed once per `interval` (i.e. the connection's latency): reduce it by the
    ///  bytes lost since the last update, increase it by what was sent (up to the configured
    ///  growth).
    pub fn update(&mut self, now: Instant, interval: Duration) {
        if now.saturating_duration_since(self.last_update) < interval {
            return;
        }
        self.last_update = now;

        let growth = self.speed_growth.min(self.sent_since_update);
        self.speed = self.speed.saturating_sub(self.loss_since_update).saturating_add(growth);
        self.clamp();

        self.loss_since_update = 0;
        self.sent_since_update = 0;
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            min_speed: 1000,
            max_speed: 100_000,
            token_bucket_max: 10_000,
            speed_growth_per_rtt: 500,
            loss_halving_threshold: 4000,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_starts_at_min_speed_with_full_bucket() {
        let rc = RateController::new(&config(), Instant::now());
        assert_eq!(rc.speed(), 1000);
        assert_eq!(rc.available_tokens(), 10_000);
    }

    #[test]
    fn test_token_bucket() {
        let now = Instant::now();
        let mut rc = RateController::new(&config(), now);

        assert!(rc.try_consume(6000, now));
        assert!(!rc.try_consume(6000, now));
        assert_eq!(rc.available_tokens(), 4000);

        // 1000 bytes/s for 2 seconds
        assert!(rc.try_consume(6000, now + Duration::from_secs(2)));
        assert_eq!(rc.available_tokens(), 0);

        // capped
        rc.refill(now + Duration::from_secs(1000));
        assert_eq!(rc.available_tokens(), 10_000);
    }

    #[test]
    fn test_update_once_per_interval() {
        let now = Instant::now();
        let mut rc = RateController::new(&config(), now);

        rc.on_sent(10_000);
        rc.update(now + Duration::from_millis(5), Duration::from_millis(10));
        assert_eq!(rc.speed(), 1000);

        rc.update(now + Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(rc.speed(), 1500);

        // counters were reset
        rc.update(now + Duration::from_millis(20), Duration::from_millis(10));
        assert_eq!(rc.speed(), 1500);

        rc.on_sent(200);
        rc.update(now + Duration::from_millis(30), Duration::from_millis(10));
        assert_eq!(rc.speed(), 1700);
    }

    #[test]
    fn test_loss_reduces_speed() {
        let now = Instant::now();
        let mut rc = RateController::new(&config(), now);
        for i in 1..=200 {
            rc.on_sent(500);
            rc.update(now + Duration::from_millis(10 * i), Duration::from_millis(10));
        }
        assert_eq!(rc.speed(), 100_000);

        rc.on_retransmit(3000);
        rc.update(now + Duration::from_secs(10), Duration::from_millis(10));
        assert_eq!(rc.speed(), 97_000);
    }

    #[test]
    fn test_halving_on_accumulated_loss() {
        let now = Instant::now();
        let mut rc = RateController::new(&config(), now);
        for i in 1..=100 {
            rc.on_sent(500);
            rc.update(now + Duration::from_millis(10 * i), Duration::from_millis(10));
        }
        assert_eq!(rc.speed(), 51_000);

        rc.on_retransmit(4000);
        assert_eq!(rc.speed(), 51_000);
        rc.on_retransmit(1);
        assert_eq!(rc.speed(), 25_500);

        // the accumulated counter was reset
        rc.on_retransmit(4000);
        assert_eq!(rc.speed(), 25_500);
    }

    #[test]
    fn test_speed_stays_in_bounds() {
        let config = config();
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let mut now = Instant::now();
            let mut rc = RateController::new(&config, now);

            for _ in 0..1000 {
                match rng.gen_range(0..4) {
                    0 => rc.on_sent(rng.gen_range(0..100_000)),
                    1 => rc.on_retransmit(rng.gen_range(0..100_000)),
                    2 => { rc.try_consume(rng.gen_range(0..20_000), now); },
                    _ => {
                        now += Duration::from_millis(rng.gen_range(0..50));
                        rc.update(now, Duration::from_millis(rng.gen_range(10..30)));
                    }
                }
                assert!(rc.speed() >= config.min_speed);
                assert!(rc.speed() <= config.max_speed);
            }
        }
    }
}
