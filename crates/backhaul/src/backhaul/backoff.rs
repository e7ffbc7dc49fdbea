use std::time::Duration;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// How long to wait before the next attempt of something that keeps failing.
///
/// The default is a constant 1s delay with no attempt limit, which is what the
/// allocation handshake and local reconnects have always done. A persistently
/// unreachable control endpoint is then polled once a second forever; operators
/// who want that bounded can switch to `Exponential` and/or set `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    Constant {
        delay: Duration,
        max_attempts: Option<u32>,
    },
    Exponential {
        initial: Duration,
        max: Duration,
        max_attempts: Option<u32>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Constant {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::Constant {
                delay,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|m| attempt > m) {
                    return None;
                }
                Some(*delay)
            }
            RetryPolicy::Exponential {
                initial,
                max,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|m| attempt > m) {
                    return None;
                }
                let shift = attempt.saturating_sub(1).min(31);
                let d = initial.saturating_mul(1u32 << shift);
                Some(d.min(*max))
            }
        }
    }
}
