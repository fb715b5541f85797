//! Redis-backed sealable latch for producers and drainers in different processes
//!
//! Uses two keys and one pub/sub channel:
//! - `<name>:pulse` - set by `signal`, consumed (GETDEL) by the next waiter
//! - `<name>:sealed` - set once by `seal`
//! - `<name>:events` - pub/sub channel that wakes subscribed waiters
//!
//! Waiters subscribe before checking the keys so a signal published between
//! the check and the subscription cannot be lost.

use super::SealableLatch;
use crate::error::LatchError;
use parking_lot::Mutex;
use redis::{Client, Commands, Connection};
use std::time::{Duration, Instant};
use tracing::trace;

/// Configuration for a Redis latch
#[derive(Debug, Clone)]
pub struct RedisLatchConfig {
    /// Redis connection URL
    pub url: String,
    /// Latch name, used as the key prefix
    pub name: String,
}

impl Default for RedisLatchConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            name: "docsweep:latch".to_string(),
        }
    }
}

/// Sealable latch shared across processes through Redis
pub struct RedisLatch {
    client: Client,
    /// Command connection; subscriptions get their own connection
    connection: Mutex<Connection>,
    pulse_key: String,
    sealed_key: String,
    channel: String,
}

impl RedisLatch {
    pub fn new(config: RedisLatchConfig) -> Result<Self, LatchError> {
        let client = Client::open(config.url.as_str())?;
        let connection = client.get_connection()?;

        Ok(Self {
            client,
            connection: Mutex::new(connection),
            pulse_key: format!("{}:pulse", config.name),
            sealed_key: format!("{}:sealed", config.name),
            channel: format!("{}:events", config.name),
        })
    }

    /// Remove the latch keys (test and cleanup tooling)
    pub fn delete(&self) -> Result<(), LatchError> {
        let mut conn = self.connection.lock();
        conn.del::<_, ()>(&[self.pulse_key.as_str(), self.sealed_key.as_str()])?;
        Ok(())
    }

    fn take_pulse(&self) -> Result<bool, LatchError> {
        let mut conn = self.connection.lock();
        let pulse: Option<String> = redis::cmd("GETDEL").arg(&self.pulse_key).query(&mut *conn)?;
        Ok(pulse.is_some())
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool, LatchError> {
        if self.is_sealed()? {
            return Err(LatchError::Sealed);
        }

        let mut sub_conn = self.client.get_connection()?;
        let mut pubsub = sub_conn.as_pubsub();
        pubsub.subscribe(&self.channel)?;

        // Re-check now that nothing published can slip past us
        if self.is_sealed()? || self.take_pulse()? {
            return Ok(true);
        }

        loop {
            let read_timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    Some(remaining)
                }
                None => None,
            };
            pubsub.set_read_timeout(read_timeout)?;

            match pubsub.get_message() {
                Ok(msg) => {
                    trace!(channel = %msg.get_channel_name(), "Latch event received");
                    if self.is_sealed()? {
                        return Ok(true);
                    }
                    // Another waiter may have consumed the pulse; that still
                    // counts as a release for everyone woken by it
                    let _ = self.take_pulse()?;
                    return Ok(true);
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl SealableLatch for RedisLatch {
    fn signal(&self) -> Result<(), LatchError> {
        let mut conn = self.connection.lock();
        conn.set::<_, _, ()>(&self.pulse_key, 1)?;
        conn.publish::<_, _, ()>(&self.channel, "signal")?;
        Ok(())
    }

    fn wait(&self) -> Result<(), LatchError> {
        self.wait_until(None).map(|_| ())
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool, LatchError> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn seal(&self) -> Result<(), LatchError> {
        let mut conn = self.connection.lock();
        conn.set::<_, _, ()>(&self.sealed_key, 1)?;
        conn.publish::<_, _, ()>(&self.channel, "sealed")?;
        Ok(())
    }

    fn is_sealed(&self) -> Result<bool, LatchError> {
        let mut conn = self.connection.lock();
        Ok(conn.exists(&self.sealed_key)?)
    }
}
