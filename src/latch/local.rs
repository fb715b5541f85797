//! In-process sealable latch built on a mutex/condvar pair

use super::SealableLatch;
use crate::error::LatchError;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LatchState {
    /// A pulse nobody has consumed yet
    signalled: bool,
    sealed: bool,
    /// Bumped on every signal so sleeping waiters can tell a pulse happened
    generation: u64,
}

/// Sealable latch for producers and consumers in the same process
#[derive(Debug, Default)]
pub struct LocalLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl LocalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool, LatchError> {
        let mut state = self.state.lock();

        if state.sealed {
            return Err(LatchError::Sealed);
        }

        if state.signalled {
            state.signalled = false;
            return Ok(true);
        }

        let generation = state.generation;
        while state.generation == generation && !state.sealed {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && state.generation == generation
                        && !state.sealed
                    {
                        return Ok(false);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }

        if !state.sealed {
            state.signalled = false;
        }
        Ok(true)
    }
}

impl SealableLatch for LocalLatch {
    fn signal(&self) -> Result<(), LatchError> {
        let mut state = self.state.lock();
        state.signalled = true;
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
        Ok(())
    }

    fn wait(&self) -> Result<(), LatchError> {
        self.wait_until(None).map(|_| ())
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool, LatchError> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn seal(&self) -> Result<(), LatchError> {
        let mut state = self.state.lock();
        state.sealed = true;
        self.cond.notify_all();
        Ok(())
    }

    fn is_sealed(&self) -> Result<bool, LatchError> {
        Ok(self.state.lock().sealed)
    }
}
