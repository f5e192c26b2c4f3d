//! Reader/writer latch protecting a frame's contents.
//!
//! Latches are recursive per thread. Once a thread holds a latch in
//! exclusive mode every further acquisition by that thread counts as
//! exclusive, whatever mode it asks for. A thread holding the latch shared may
//! upgrade to exclusive only while it is the sole holder; otherwise the
//! upgrade would wait on the thread itself and fails with
//! [`BufcoreError::AlreadyInUse`].

use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BufcoreError, Result};

/// Latch mode requested or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LatchMode {
    /// Not latched.
    #[default]
    None,
    /// Shared (read) mode.
    Shared,
    /// Exclusive (write) mode.
    Exclusive,
}

impl std::fmt::Display for LatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatchMode::None => write!(f, "NL"),
            LatchMode::Shared => write!(f, "SH"),
            LatchMode::Exclusive => write!(f, "EX"),
        }
    }
}

/// How long an acquisition may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail at once if the latch is not available.
    Immediate,
    /// Block until the latch is granted.
    Forever,
    /// Block for at most the given duration.
    After(Duration),
}

impl Timeout {
    /// Returns true for [`Timeout::Immediate`].
    #[must_use]
    pub fn is_immediate(self) -> bool {
        self == Timeout::Immediate
    }
}

#[derive(Debug, Default)]
struct LatchState {
    mode: LatchMode,
    /// Holding threads with their recursion counts.
    holders: Vec<(ThreadId, u32)>,
    total: u32,
}

impl LatchState {
    fn my_slot(&self, me: ThreadId) -> Option<usize> {
        self.holders.iter().position(|(t, _)| *t == me)
    }

    fn grantable(&self, mode: LatchMode) -> bool {
        match mode {
            LatchMode::None => true,
            LatchMode::Shared => self.mode != LatchMode::Exclusive,
            LatchMode::Exclusive => self.total == 0,
        }
    }

    fn grant(&mut self, me: ThreadId, mode: LatchMode) {
        self.holders.push((me, 1));
        self.total += 1;
        self.mode = mode;
    }
}

/// Recursive reader/writer latch with bounded-wait acquisition.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    released: Condvar,
}

impl Latch {
    /// Creates an unheld latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the latch in `mode`, blocking at most as `timeout` allows.
    ///
    /// Acquiring in [`LatchMode::None`] is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::Timeout`] if the latch was not granted in time,
    /// or [`BufcoreError::AlreadyInUse`] if this thread holds the latch shared
    /// alongside other holders and asked for exclusive.
    pub fn acquire(&self, mode: LatchMode, timeout: Timeout) -> Result<()> {
        if mode == LatchMode::None {
            return Ok(());
        }
        let me = std::thread::current().id();
        let mut state = self.state.lock();

        if let Some(slot) = state.my_slot(me) {
            if mode == LatchMode::Exclusive && state.mode == LatchMode::Shared {
                if state.holders.len() > 1 {
                    return Err(BufcoreError::AlreadyInUse);
                }
                state.mode = LatchMode::Exclusive;
            }
            state.holders[slot].1 += 1;
            state.total += 1;
            return Ok(());
        }

        let deadline = match timeout {
            Timeout::After(d) => Some(Instant::now() + d),
            _ => None,
        };
        while !state.grantable(mode) {
            match (timeout, deadline) {
                (Timeout::Immediate, _) => return Err(BufcoreError::Timeout),
                (_, Some(deadline)) => {
                    if self.released.wait_until(&mut state, deadline).timed_out()
                        && !state.grantable(mode)
                    {
                        return Err(BufcoreError::Timeout);
                    }
                }
                (_, None) => self.released.wait(&mut state),
            }
        }
        state.grant(me, mode);
        Ok(())
    }

    /// Upgrades a shared hold to exclusive if that needs no waiting.
    ///
    /// Returns true if the calling thread now holds the latch exclusively.
    /// The hold count is not changed.
    pub fn try_upgrade(&self) -> bool {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.my_slot(me).is_none() {
            return false;
        }
        match state.mode {
            LatchMode::Exclusive => true,
            LatchMode::Shared if state.holders.len() == 1 => {
                state.mode = LatchMode::Exclusive;
                true
            }
            _ => false,
        }
    }

    /// Turns the calling thread's exclusive hold into a shared one.
    pub fn downgrade(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.mode == LatchMode::Exclusive && state.my_slot(me).is_some() {
            state.mode = LatchMode::Shared;
            self.released.notify_all();
        } else {
            debug_assert!(false, "downgrade of a latch not held exclusively");
            tracing::warn!("downgrade of a latch not held exclusively by this thread");
        }
    }

    /// Releases one hold and returns how many holds this thread has left.
    pub fn release(&self) -> u32 {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        let Some(slot) = state.my_slot(me) else {
            debug_assert!(false, "release of a latch not held by this thread");
            tracing::warn!("release of a latch not held by this thread");
            return 0;
        };
        state.holders[slot].1 -= 1;
        state.total -= 1;
        let remaining = state.holders[slot].1;
        if remaining == 0 {
            state.holders.swap_remove(slot);
        }
        if state.total == 0 {
            state.mode = LatchMode::None;
        }
        if remaining == 0 {
            self.released.notify_all();
        }
        remaining
    }

    /// Number of holds the calling thread has on this latch.
    #[must_use]
    pub fn held_by_me(&self) -> u32 {
        let me = std::thread::current().id();
        let state = self.state.lock();
        state.my_slot(me).map_or(0, |slot| state.holders[slot].1)
    }

    /// Returns true if the calling thread holds the latch exclusively.
    #[must_use]
    pub fn is_mine(&self) -> bool {
        let me = std::thread::current().id();
        let state = self.state.lock();
        state.mode == LatchMode::Exclusive && state.my_slot(me).is_some()
    }

    /// Current mode of the latch.
    #[must_use]
    pub fn mode(&self) -> LatchMode {
        self.state.lock().mode
    }

    /// Returns true if any thread holds the latch.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.state.lock().total > 0
    }

    /// Number of distinct holding threads.
    #[must_use]
    pub fn num_holders(&self) -> usize {
        self.state.lock().holders.len()
    }
}
