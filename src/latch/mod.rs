//! One-shot coordination signal shared by producers and drainers
//!
//! A sealable latch is a rendezvous between a producer that enqueues work
//! and anything draining the same queue, in this process or another one:
//!
//! ```text
//!   Scanner                         QueueDrainer
//!   ───────                         ────────────
//!   put(doc) ──► queue ◄── poll() ── empty?
//!   signal() ─────────────────────► wait() returns, poll again
//!   ...
//!   seal()   ─────────────────────► wait() returns; queue empty + sealed = done
//! ```
//!
//! `signal()` is a pulse, not a counter: it releases every current waiter
//! and lets the next `wait()` return immediately, once. `seal()` opens the
//! latch for good.

mod local;
mod redis_latch;

pub use local::LocalLatch;
pub use redis_latch::{RedisLatch, RedisLatchConfig};

use crate::error::LatchError;
use std::time::Duration;

/// Contract shared by local and distributed latches
pub trait SealableLatch: Send + Sync {
    /// Release current waiters and let the next `wait` return immediately
    fn signal(&self) -> Result<(), LatchError>;

    /// Block until signalled or sealed
    ///
    /// Fails with [`LatchError::Sealed`] if the latch was already sealed when
    /// the call was made.
    fn wait(&self) -> Result<(), LatchError>;

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    ///
    /// Returns `Ok(false)` if the timeout elapsed with no signal.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool, LatchError>;

    /// Permanently open the latch, releasing all present and future waiters
    fn seal(&self) -> Result<(), LatchError>;

    /// Whether [`seal`](Self::seal) has been called
    fn is_sealed(&self) -> Result<bool, LatchError>;
}
