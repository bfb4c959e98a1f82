//! Parallel barrier: fan out a fixed set of independent send/recv actions,
//! run them concurrently, and join them. See spec §4.4.
//!
//! Used wherever the protocol needs a party to both send to and receive from
//! the same peer in one logical round (e.g. `reveal_to` targeting P2, or the
//! `(d_i, e_i)` exchange in `product`) — doing those two actions sequentially
//! deadlocks, because the peer mirrors the same pattern (spec §9, "Fan-out
//! concurrency"). Built on `crossbeam::scope`, replacing the teacher's
//! `threading.Thread`-per-branch original (`FastRTAS.Utils.parallel`).

use crate::error::RtasError;

/// Run the same action, fanned out over distinct argument tuples, and join
/// all branches. Returns the batch of errors from any failing branches;
/// an empty vec means every branch succeeded.
///
/// This is the *only* fan-out shape the barrier exposes for "apply this
/// action to each of several peers" (e.g. send-to-P0-and-send-to-P1): the
/// original Python's `parallel` also accepted a list of distinct actions,
/// but one revision of that code path built `Thread`s without ever calling
/// `.start()` on them — see spec §9. `run_many` below is the fix: it spawns
/// and joins unconditionally, regardless of whether the actions are a single
/// closure reused across arguments or several distinct closures.
pub fn run<A, F>(action: F, args: Vec<A>) -> Vec<RtasError>
where
    A: Send,
    F: Fn(A) -> Result<(), RtasError> + Sync,
{
    crossbeam::scope(|scope| {
        let handles: Vec<_> = args
            .into_iter()
            .map(|arg| scope.spawn(|_| action(arg)))
            .collect();

        handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(RtasError::Handshake("barrier branch panicked".into())),
            })
            .collect()
    })
    .expect("barrier scope itself panicked")
}

/// Run several distinct, independent actions concurrently and join all of
/// them. Every action is spawned before any is joined — unlike the buggy
/// original, there is no code path that constructs an action without running
/// it.
pub fn run_many<F>(actions: Vec<F>) -> Vec<RtasError>
where
    F: FnOnce() -> Result<(), RtasError> + Send,
{
    crossbeam::scope(|scope| {
        let handles: Vec<_> = actions.into_iter().map(|action| scope.spawn(|_| action())).collect();

        handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(RtasError::Handshake("barrier branch panicked".into())),
            })
            .collect()
    })
    .expect("barrier scope itself panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_executes_every_branch() {
        let counter = AtomicUsize::new(0);
        let errs = run(
            |n: usize| {
                counter.fetch_add(n, Ordering::SeqCst);
                Ok(())
            },
            vec![1, 2, 3],
        );
        assert!(errs.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn run_collects_all_errors() {
        let errs = run(
            |n: usize| {
                if n % 2 == 0 {
                    Err(RtasError::Protocol(format!("bad {n}")))
                } else {
                    Ok(())
                }
            },
            vec![1, 2, 3, 4],
        );
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn run_many_spawns_every_distinct_action() {
        let a = AtomicUsize::new(0);
        let b = AtomicUsize::new(0);
        let errs = run_many(vec![
            || {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            || {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ]);
        assert!(errs.is_empty());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }
}
