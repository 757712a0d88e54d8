/// Milliseconds on the monotonic device clock.
pub type Millis = u64;

/// Monotonic millisecond clock used for all interval arithmetic.
pub trait Clock {
    fn now_ms(&self) -> Millis;
    fn sleep_ms(&self, ms: Millis);
}

/// Time elapsed from `since` to `now`, zero if the clock reads earlier.
#[inline(always)]
pub fn elapsed(now: Millis, since: Millis) -> Millis {
    now.saturating_sub(since)
}

/// True when `interval` has passed since `last`, or when nothing happened yet.
#[inline(always)]
pub fn is_due(now: Millis, last: Option<Millis>, interval: Millis) -> bool {
    match last {
        Some(at) => elapsed(now, at) >= interval,
        None => true,
    }
}

/// Polls `ready` every `poll_every` ms until it yields a value or `timeout` ms
/// have elapsed. Returns `None` on timeout.
pub fn wait_until<C, T, F>(clock: &C, timeout: Millis, poll_every: Millis, mut ready: F) -> Option<T>
where
    C: Clock + ?Sized,
    F: FnMut() -> Option<T>,
{
    let started = clock.now_ms();
    loop {
        if let Some(value) = ready() {
            return Some(value);
        }
        let waited = elapsed(clock.now_ms(), started);
        if waited >= timeout {
            return None;
        }
        clock.sleep_ms(poll_every.max(1).min(timeout - waited));
    }
}
