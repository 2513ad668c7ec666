//! # Completion Signalling
//!
//! Bridges blocking facade calls to the network task. The caller claims a
//! slot, ships its [`Token`] inside the request, and awaits the slot's
//! signal; the network task resolves the token once the operation settles.
//!
//! Tokens are generation-checked: a slot released (including by a cancelled
//! caller dropping its [`Claim`]) bumps the generation, so a late resolution
//! against a recycled slot is silently ignored instead of waking the wrong
//! caller.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;

use crate::error::ClientError;

/// Identifies one claimed slot of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Token {
    index: usize,
    generation: u16,
}

#[derive(Clone, Copy)]
struct SlotState {
    generation: u16,
    busy: bool,
}

/// Fixed pool of completion slots shared between the facade and the network
/// task.
pub(crate) struct CompletionPool<const N: usize> {
    states: Mutex<CriticalSectionRawMutex, RefCell<[SlotState; N]>>,
    signals: [Signal<CriticalSectionRawMutex, Result<(), ClientError>>; N],
}

impl<const N: usize> CompletionPool<N> {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(RefCell::new(
                [SlotState {
                    generation: 0,
                    busy: false,
                }; N],
            )),
            signals: core::array::from_fn(|_| Signal::new()),
        }
    }

    /// Claims a free slot, or `None` when all are in use.
    pub fn claim(&self) -> Option<Claim<'_, N>> {
        let token = self.states.lock(|states| {
            let mut states = states.borrow_mut();
            let (index, state) = states.iter_mut().enumerate().find(|(_, s)| !s.busy)?;
            state.busy = true;
            Some(Token {
                index,
                generation: state.generation,
            })
        })?;
        self.signals[token.index].reset();
        Some(Claim { pool: self, token })
    }

    /// Resolves the operation behind `token`. A stale token is a no-op.
    pub fn resolve(&self, token: Token, result: Result<(), ClientError>) {
        let live = self.states.lock(|states| {
            let state = states.borrow()[token.index];
            state.busy && state.generation == token.generation
        });
        if live {
            self.signals[token.index].signal(result);
        }
    }

    fn release(&self, token: Token) {
        self.states.lock(|states| {
            let mut states = states.borrow_mut();
            let state = &mut states[token.index];
            if state.busy && state.generation == token.generation {
                state.busy = false;
                state.generation = state.generation.wrapping_add(1);
                self.signals[token.index].reset();
            }
        });
    }
}

/// A claimed completion slot. Dropping it releases the slot, so a caller that
/// gives up waiting cannot leak it.
pub(crate) struct Claim<'a, const N: usize> {
    pool: &'a CompletionPool<N>,
    token: Token,
}

impl<const N: usize> Claim<'_, N> {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Waits for the network task to resolve this slot.
    pub async fn wait(self) -> Result<(), ClientError> {
        self.pool.signals[self.token.index].wait().await
    }
}

impl<const N: usize> Drop for Claim<'_, N> {
    fn drop(&mut self) {
        self.pool.release(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn resolve_wakes_waiter() {
        let pool: CompletionPool<2> = CompletionPool::new();
        let claim = pool.claim().unwrap();
        pool.resolve(claim.token(), Ok(()));
        assert_eq!(block_on(claim.wait()), Ok(()));
    }

    #[test]
    fn resolve_carries_error() {
        let pool: CompletionPool<2> = CompletionPool::new();
        let claim = pool.claim().unwrap();
        pool.resolve(claim.token(), Err(ClientError::ConnectionLost));
        assert_eq!(block_on(claim.wait()), Err(ClientError::ConnectionLost));
    }

    #[test]
    fn pool_is_bounded_and_slots_recycle() {
        let pool: CompletionPool<2> = CompletionPool::new();
        let a = pool.claim().unwrap();
        let _b = pool.claim().unwrap();
        assert!(pool.claim().is_none());

        drop(a);
        assert!(pool.claim().is_some());
    }

    #[test]
    fn stale_token_does_not_signal_new_claimant() {
        let pool: CompletionPool<1> = CompletionPool::new();
        let old = pool.claim().unwrap();
        let stale = old.token();
        drop(old);

        let fresh = pool.claim().unwrap();
        pool.resolve(stale, Ok(()));
        assert!(!pool.signals[0].signaled());

        pool.resolve(fresh.token(), Ok(()));
        assert_eq!(block_on(fresh.wait()), Ok(()));
    }

    #[test]
    fn late_resolution_after_drop_is_ignored() {
        let pool: CompletionPool<1> = CompletionPool::new();
        let claim = pool.claim().unwrap();
        let token = claim.token();
        drop(claim);
        // Must not panic or leave a stray signal behind.
        pool.resolve(token, Ok(()));
        assert!(!pool.signals[0].signaled());
    }
}
