use std::time::{Duration, Instant};

/// Retransmission timer with multiplicative backoff. The first check after
/// a reset always fires.
#[derive(Clone, Debug)]
pub struct RetryTimer {
    period: Duration,
    multiplier: f64,
    current: Duration,
    base: Option<Instant>,
}

impl RetryTimer {
    pub fn new(period: Duration, multiplier: f64) -> Self {
        Self {
            period,
            multiplier,
            current: period,
            base: None,
        }
    }

    pub fn check(&mut self, now: Instant) -> bool {
        match self.base {
            None => {
                self.base = Some(now);
                true
            }
            Some(base) if now >= base + self.current => {
                self.base = Some(now);
                self.current = self.current.mul_f64(self.multiplier);
                true
            }
            Some(_) => false,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.period;
        self.base = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff() {
        let start = Instant::now();
        let ms = |v: u64| start + Duration::from_millis(v);
        let mut timer = RetryTimer::new(Duration::from_millis(100), 2.0);
        assert!(timer.check(start));
        assert!(!timer.check(ms(99)));
        assert!(timer.check(ms(100)));
        assert!(!timer.check(ms(299)));
        assert!(timer.check(ms(300)));
        timer.reset();
        assert!(timer.check(ms(301)));
        assert!(timer.check(ms(401)));
    }
}
