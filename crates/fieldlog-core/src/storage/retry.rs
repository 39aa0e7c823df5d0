use core::fmt::Display;

use embassy_time::Duration;
use log::warn;

/// Errors that know whether repeating the operation can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Something that can pause between attempts.
pub trait Backoff {
    fn backoff(&mut self, delay: Duration) -> impl Future<Output = ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u8,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u8, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

/// Run `op` up to `policy.attempts` times (at least once), pausing between attempts.
///
/// `op` receives the context and the zero-based attempt number. Stops early on success
/// or on an error that is not retryable; the last error is returned otherwise.
pub async fn with_retry<C, T, E>(
    ctx: &mut C,
    policy: RetryPolicy,
    mut op: impl AsyncFnMut(&mut C, u8) -> Result<T, E>,
) -> Result<T, E>
where
    C: Backoff,
    E: Retryable + Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(&mut *ctx, attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                warn!("Attempt {}/{} failed: {}", attempt + 1, attempts, e);
                ctx.backoff(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
