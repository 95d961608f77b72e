// rust/trainer-core/src/bridge/local.rs

//! In-process bridge connecting two parties that share an address space.
//!
//! Used for single-host runs and for exercising the full two-party protocol
//! in tests. It enforces the same contract a networked bridge must honor:
//! one connect per side, matching barrier ids, delivery keyed by
//! `(iteration, name)`, and a terminated peer failing anything still waiting
//! on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::Bridge;
use crate::error::{Result, TrainerError};
use crate::tensor::{DType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Start(u64),
    Commit(u64),
}

impl fmt::Display for Arrival {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arrival::Start(i) => write!(f, "start({i})"),
            Arrival::Commit(i) => write!(f, "commit({i})"),
        }
    }
}

#[derive(Default)]
struct LinkState {
    connected: [bool; 2],
    terminated: [bool; 2],
    /// Iteration each side is currently inside (between start and commit).
    current: [Option<u64>; 2],
    /// Values waiting for side `i` to receive them.
    mailboxes: [HashMap<(u64, String), Value>; 2],
    barrier: [Option<Arrival>; 2],
    generation: u64,
    broken: Option<String>,
}

#[derive(Default)]
struct Link {
    state: Mutex<LinkState>,
    changed: Notify,
}

/// One endpoint of an in-process bridge pair.
#[derive(Clone)]
pub struct LocalBridge {
    side: usize,
    link: Arc<Link>,
}

impl fmt::Debug for LocalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBridge").field("side", &self.side).finish()
    }
}

impl LocalBridge {
    /// Creates two connected endpoints, conventionally (leader, follower).
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Link::default());
        (
            Self {
                side: 0,
                link: link.clone(),
            },
            Self { side: 1, link },
        )
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, LinkState>> {
        self.link
            .state
            .lock()
            .map_err(|_| TrainerError::bridge(operation, "link state poisoned"))
    }

    fn ensure_open(&self, state: &LinkState, operation: &'static str) -> Result<()> {
        if state.terminated[self.side] {
            return Err(TrainerError::bridge(operation, "session already terminated"));
        }
        if !state.connected[self.side] {
            return Err(TrainerError::bridge(operation, "session not connected"));
        }
        if let Some(reason) = &state.broken {
            return Err(TrainerError::bridge(operation, reason.clone()));
        }
        Ok(())
    }

    fn current_iteration(&self, state: &LinkState, operation: &'static str) -> Result<u64> {
        state.current[self.side]
            .ok_or_else(|| TrainerError::bridge(operation, "no iteration in progress"))
    }

    /// Re-evaluates `check` every time the link state changes until it
    /// yields a result.
    async fn wait_until<T, F>(&self, operation: &'static str, mut check: F) -> Result<T>
    where
        F: FnMut(&mut LinkState) -> Option<Result<T>> + Send,
    {
        loop {
            let notified = self.link.changed.notified();
            {
                let mut state = self.lock(operation)?;
                if let Some(outcome) = check(&mut state) {
                    return outcome;
                }
            }
            notified.await;
        }
    }

    /// Records this side's arrival at a barrier. Returns the generation to
    /// wait on, or `None` if the peer was already waiting.
    fn arrive(
        &self,
        state: &mut LinkState,
        operation: &'static str,
        arrival: Arrival,
    ) -> Result<Option<u64>> {
        let peer = self.peer();
        match state.barrier[peer] {
            Some(theirs) if theirs != arrival => {
                let reason = format!("{arrival} does not match peer {theirs}");
                state.broken = Some(reason.clone());
                self.link.changed.notify_waiters();
                Err(TrainerError::bridge(operation, reason))
            }
            Some(_) => {
                state.barrier[peer] = None;
                state.generation += 1;
                self.link.changed.notify_waiters();
                Ok(None)
            }
            None => {
                state.barrier[self.side] = Some(arrival);
                Ok(Some(state.generation))
            }
        }
    }

    async fn barrier(&self, operation: &'static str, arrival: Arrival) -> Result<()> {
        let waiting_on = {
            let mut state = self.lock(operation)?;
            self.ensure_open(&state, operation)?;
            if state.terminated[self.peer()] {
                return Err(TrainerError::bridge(operation, "peer terminated the session"));
            }
            self.arrive(&mut state, operation, arrival)?
        };

        let Some(generation) = waiting_on else {
            return Ok(());
        };

        let peer = self.peer();
        self.wait_until(operation, |state| {
            if state.generation != generation {
                Some(Ok(()))
            } else if let Some(reason) = &state.broken {
                Some(Err(TrainerError::bridge(operation, reason.clone())))
            } else if state.terminated[peer] {
                Some(Err(TrainerError::bridge(
                    operation,
                    "peer terminated the session",
                )))
            } else {
                None
            }
        })
        .await
    }
}

#[async_trait]
impl Bridge for LocalBridge {
    async fn connect(&self) -> Result<()> {
        {
            let mut state = self.lock("connect")?;
            if state.terminated[self.side] {
                return Err(TrainerError::bridge("connect", "session already terminated"));
            }
            if state.connected[self.side] {
                return Err(TrainerError::bridge("connect", "already connected"));
            }
            state.connected[self.side] = true;
        }
        self.link.changed.notify_waiters();

        let peer = self.peer();
        self.wait_until("connect", |state| {
            if state.connected[peer] {
                Some(Ok(()))
            } else if state.terminated[peer] {
                Some(Err(TrainerError::bridge(
                    "connect",
                    "peer terminated the session",
                )))
            } else {
                None
            }
        })
        .await
    }

    async fn start(&self, iteration: u64) -> Result<()> {
        {
            let state = self.lock("start")?;
            if let Some(open) = state.current[self.side] {
                return Err(TrainerError::bridge(
                    "start",
                    format!("iteration {open} was not committed"),
                ));
            }
        }

        self.barrier("start", Arrival::Start(iteration)).await?;
        self.lock("start")?.current[self.side] = Some(iteration);
        Ok(())
    }

    async fn send(&self, name: &str, value: Value) -> Result<()> {
        {
            let mut state = self.lock("send")?;
            self.ensure_open(&state, "send")?;
            let iteration = self.current_iteration(&state, "send")?;
            let peer = self.peer();
            if state.terminated[peer] {
                return Err(TrainerError::bridge("send", "peer terminated the session"));
            }

            let key = (iteration, name.to_string());
            if state.mailboxes[peer].contains_key(&key) {
                return Err(TrainerError::bridge(
                    "send",
                    format!("'{name}' already sent in iteration {iteration}"),
                ));
            }
            state.mailboxes[peer].insert(key, value);
        }
        self.link.changed.notify_waiters();
        Ok(())
    }

    async fn receive(&self, name: &str, dtype: DType) -> Result<Value> {
        let key = {
            let state = self.lock("receive")?;
            self.ensure_open(&state, "receive")?;
            (self.current_iteration(&state, "receive")?, name.to_string())
        };

        let (side, peer) = (self.side, self.peer());
        self.wait_until("receive", |state| {
            if let Some(value) = state.mailboxes[side].remove(&key) {
                if value.dtype() != dtype {
                    return Some(Err(TrainerError::bridge(
                        "receive",
                        format!("'{name}' carries {}, expected {dtype}", value.dtype()),
                    )));
                }
                return Some(Ok(value));
            }
            if let Some(reason) = &state.broken {
                return Some(Err(TrainerError::bridge("receive", reason.clone())));
            }
            if state.terminated[peer] {
                return Some(Err(TrainerError::bridge(
                    "receive",
                    "peer terminated the session",
                )));
            }
            None
        })
        .await
    }

    async fn commit(&self) -> Result<()> {
        let iteration = {
            let state = self.lock("commit")?;
            self.current_iteration(&state, "commit")?
        };

        self.barrier("commit", Arrival::Commit(iteration)).await?;
        let mut state = self.lock("commit")?;
        state.current[self.side] = None;
        // Both sides are past `iteration`; nothing older can still be received.
        state.mailboxes[self.side].retain(|(sent_in, _), _| *sent_in > iteration);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        {
            let mut state = self.lock("terminate")?;
            if state.terminated[self.side] {
                return Err(TrainerError::bridge("terminate", "already terminated"));
            }
            state.terminated[self.side] = true;
            state.current[self.side] = None;
        }
        self.link.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn connected_pair() -> (LocalBridge, LocalBridge) {
        let (leader, follower) = LocalBridge::pair();
        let (a, b) = tokio::join!(leader.connect(), follower.connect());
        a.unwrap();
        b.unwrap();
        (leader, follower)
    }

    #[tokio::test]
    async fn test_commit_drops_unreceived_values() {
        let (leader, follower) = connected_pair().await;

        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();
        leader.send("unused", Value::scalar_f32(1.0)).await.unwrap();
        assert_eq!(follower.link.state.lock().unwrap().mailboxes[1].len(), 1);

        let (a, b) = tokio::join!(leader.commit(), follower.commit());
        a.unwrap();
        b.unwrap();
        assert!(follower.link.state.lock().unwrap().mailboxes[1].is_empty());
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (leader, _follower) = connected_pair().await;
        let err = leader.connect().await.unwrap_err();
        assert!(err.to_string().contains("already connected"));
    }

    #[tokio::test]
    async fn test_exchange_within_iteration() {
        let (leader, follower) = connected_pair().await;

        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();

        leader.send("act1", Value::f32_vec(vec![1.0, 2.0])).await.unwrap();
        let got = follower.receive("act1", DType::Float32).await.unwrap();
        assert_eq!(got.as_f32().unwrap(), &[1.0, 2.0]);

        let (a, b) = tokio::join!(leader.commit(), follower.commit());
        a.unwrap();
        b.unwrap();
    }

    #[tokio::test]
    async fn test_receive_waits_for_send() {
        let (leader, follower) = connected_pair().await;
        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();

        let recv = follower.receive("late", DType::Int64);
        let send = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            leader.send("late", Value::i64_vec(vec![9])).await
        };
        let (got, sent) = tokio::join!(recv, send);
        sent.unwrap();
        assert_eq!(got.unwrap().as_i64().unwrap(), &[9]);
    }

    #[tokio::test]
    async fn test_mismatched_iteration_ids_fail_both_sides() {
        let (leader, follower) = connected_pair().await;
        let (a, b) = tokio::join!(leader.start(0), follower.start(1));
        assert!(a.is_err());
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn test_values_are_scoped_to_their_iteration() {
        let (leader, follower) = connected_pair().await;

        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();
        leader.send("x", Value::scalar_f32(1.0)).await.unwrap();
        let (a, b) = tokio::join!(leader.commit(), follower.commit());
        a.unwrap();
        b.unwrap();

        let (a, b) = tokio::join!(leader.start(1), follower.start(1));
        a.unwrap();
        b.unwrap();
        let waited =
            tokio::time::timeout(Duration::from_millis(50), follower.receive("x", DType::Float32))
                .await;
        assert!(waited.is_err(), "iteration 0 value must not satisfy iteration 1");
    }

    #[tokio::test]
    async fn test_peer_termination_wakes_blocked_receive() {
        let (leader, follower) = connected_pair().await;
        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();

        let recv = leader.receive("act1_grad", DType::Float32);
        let term = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            follower.terminate().await
        };
        let (got, terminated) = tokio::join!(recv, term);
        terminated.unwrap();
        assert!(got.unwrap_err().to_string().contains("peer terminated"));
    }

    #[tokio::test]
    async fn test_dtype_mismatch_on_receive() {
        let (leader, follower) = connected_pair().await;
        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();

        leader.send("ids", Value::i64_vec(vec![1])).await.unwrap();
        assert!(follower.receive("ids", DType::Float32).await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_commit() {
        let (leader, follower) = connected_pair().await;
        let (a, b) = tokio::join!(leader.start(0), follower.start(0));
        a.unwrap();
        b.unwrap();

        let err = leader.start(1).await.unwrap_err();
        assert!(err.to_string().contains("not committed"));
    }

    #[tokio::test]
    async fn test_terminate_once() {
        let (leader, _follower) = LocalBridge::pair();
        leader.terminate().await.unwrap();
        assert!(leader.terminate().await.is_err());
        assert!(leader.connect().await.is_err());
    }
}
