//! A waitable boolean.
//!
//! [Flag] pairs one boolean with five condition variables (rise, fall,
//! change, touch and wave) that all share a single mutex, so that a
//! mutation and the notifications it causes happen atomically.
//!
//! Waits come in two flavours:
//! - level-sensitive ([Flag::wait_up], [Flag::wait_down]) return at once if
//!   the flag already has the requested value;
//! - edge-sensitive ([Flag::wait_rise], [Flag::wait_fall],
//!   [Flag::wait_change], [Flag::wait_touch], [Flag::wait_wave]) always
//!   block until the next qualifying event.
//!
//! Setting the flag to the value it already has is a *wave*: nothing
//! changes, but touch and wave waiters are still woken. [Flag::touch] is a
//! wave on its own.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why a wait on a [Flag] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
}

impl WaitOutcome {
    pub fn is_satisfied(self) -> bool {
        self == WaitOutcome::Satisfied
    }
}

#[derive(Debug, Default)]
struct FlagState {
    up: bool,
    rises: u64,
    falls: u64,
    touches: u64,
    waves: u64,
}

impl FlagState {
    fn changes(&self) -> u64 {
        self.rises + self.falls
    }
}

#[derive(Debug, Default)]
pub struct Flag {
    state: Mutex<FlagState>,
    rise: Condvar,
    fall: Condvar,
    change: Condvar,
    touch: Condvar,
    wave: Condvar,
}

impl Flag {
    pub fn new(up: bool) -> Self {
        Self {
            state: Mutex::new(FlagState {
                up,
                ..FlagState::default()
            }),
            ..Self::default()
        }
    }

    pub fn is_up(&self) -> bool {
        self.lock().up
    }

    pub fn is_down(&self) -> bool {
        !self.is_up()
    }

    /// Sets the flag, returning the previous value.
    pub fn raise(&self) -> bool {
        self.update(|_| true)
    }

    /// Clears the flag, returning the previous value.
    pub fn lower(&self) -> bool {
        self.update(|_| false)
    }

    /// Inverts the flag, returning the previous value. Always a change.
    pub fn toggle(&self) -> bool {
        self.update(|up| !up)
    }

    /// Wakes touch and wave waiters without changing the value.
    pub fn touch(&self) {
        let mut state = self.lock();
        self.wave_locked(&mut state);
    }

    /// Blocks until the flag is up. Returns at once if it already is.
    pub fn wait_up(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_until(&self.rise, timeout, |state| state.up)
    }

    /// Blocks until the flag is down. Returns at once if it already is.
    pub fn wait_down(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_until(&self.fall, timeout, |state| !state.up)
    }

    /// Blocks until the next transition from down to up.
    pub fn wait_rise(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_next(&self.rise, timeout, |state| state.rises)
    }

    /// Blocks until the next transition from up to down.
    pub fn wait_fall(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_next(&self.fall, timeout, |state| state.falls)
    }

    /// Blocks until the next transition in either direction.
    pub fn wait_change(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_next(&self.change, timeout, FlagState::changes)
    }

    /// Blocks until the next mutation call of any kind, changing or not.
    pub fn wait_touch(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_next(&self.touch, timeout, |state| state.touches)
    }

    /// Blocks until the next mutation call that leaves the value unchanged.
    pub fn wait_wave(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_next(&self.wave, timeout, |state| state.waves)
    }

    fn lock(&self) -> MutexGuard<'_, FlagState> {
        self.state.lock()
    }

    fn update(&self, next: impl FnOnce(bool) -> bool) -> bool {
        let mut state = self.lock();
        let prev = state.up;
        let up = next(prev);
        if up == prev {
            self.wave_locked(&mut state);
            return prev;
        }

        state.up = up;
        if up {
            state.rises += 1;
            self.rise.notify_all();
        } else {
            state.falls += 1;
            self.fall.notify_all();
        }
        self.change.notify_all();
        state.touches += 1;
        self.touch.notify_all();
        prev
    }

    fn wave_locked(&self, state: &mut FlagState) {
        state.waves += 1;
        self.wave.notify_all();
        state.touches += 1;
        self.touch.notify_all();
    }

    fn wait_next(
        &self,
        cond: &Condvar,
        timeout: Option<Duration>,
        counter: impl Fn(&FlagState) -> u64,
    ) -> WaitOutcome {
        let state = self.lock();
        let start = counter(&state);
        self.block(state, cond, timeout, |state| counter(state) != start)
    }

    fn wait_until(
        &self,
        cond: &Condvar,
        timeout: Option<Duration>,
        done: impl Fn(&FlagState) -> bool,
    ) -> WaitOutcome {
        let state = self.lock();
        self.block(state, cond, timeout, done)
    }

    fn block(
        &self,
        mut state: MutexGuard<'_, FlagState>,
        cond: &Condvar,
        timeout: Option<Duration>,
        done: impl Fn(&FlagState) -> bool,
    ) -> WaitOutcome {
        // A timeout too large to represent is the same as no timeout.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            if done(&state) {
                return WaitOutcome::Satisfied;
            }
            match deadline {
                None => cond.wait(&mut state),
                Some(deadline) => {
                    if cond.wait_until(&mut state, deadline).timed_out() {
                        return if done(&state) {
                            WaitOutcome::Satisfied
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
            }
        }
    }
}
