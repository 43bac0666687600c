//! Cross-shard fiber dispatch. A fiber here is any task on a shard's
//! single-threaded runtime: it runs until it suspends at an `.await`
//! point, and the only way it may touch another shard's state is to
//! package the work as a closure and submit it to that shard's hop queue.
//! The owning shard drains its queue one closure at a time, so every
//! closure runs with exclusive access to the shard state, and the sender
//! suspends until the reply comes back — handing control across the
//! thread boundary and resuming with the other side's result.

use tokio::sync::{mpsc, oneshot};

type BoxedHop<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// A single shard's side of the hop queue: owns the receiving end and is
/// drained by that shard's own event loop, one closure at a time, so every
/// closure runs with exclusive access to the shard state `S`.
pub struct HopQueue<S> {
    rx: mpsc::UnboundedReceiver<BoxedHop<S>>,
}

/// A cloneable handle other shards use to submit a hop onto this queue.
pub struct HopSender<S> {
    tx: mpsc::UnboundedSender<BoxedHop<S>>,
}

impl<S> Clone for HopSender<S> {
    fn clone(&self) -> Self {
        HopSender {
            tx: self.tx.clone(),
        }
    }
}

/// The hop queue was dropped (its shard shut down) before a submitted
/// closure could run.
#[derive(Debug, thiserror::Error)]
#[error("hop target shard is no longer running")]
pub struct HopError;

impl<S> HopQueue<S> {
    pub fn new() -> (HopQueue<S>, HopSender<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HopQueue { rx }, HopSender { tx })
    }

    /// Run every closure currently queued, in submission order, each with
    /// exclusive access to `state`. Returns the number of closures run.
    /// Intended to be called once per tick of the owning shard's event loop.
    pub fn drain(&mut self, state: &mut S) -> usize {
        let mut ran = 0;
        while let Ok(hop) = self.rx.try_recv() {
            hop(state);
            ran += 1;
        }
        ran
    }

    /// Wait for and run the next queued closure, suspending until one
    /// arrives or the queue is closed (all senders dropped).
    pub async fn recv_one(&mut self, state: &mut S) -> bool {
        match self.rx.recv().await {
            Some(hop) => {
                hop(state);
                true
            }
            None => false,
        }
    }
}

impl<S> HopSender<S> {
    /// Submit a closure to run on the owning shard and await its result.
    /// This is the building block for cross-shard work: a fiber on shard A
    /// calls `hop.call(|state| ...)` to touch shard B's state without ever
    /// holding a reference across threads.
    pub async fn call<F, R>(&self, f: F) -> Result<R, HopError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
        S: 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let hop: BoxedHop<S> = Box::new(move |state| {
            // The receiver may have been dropped if the caller gave up
            // waiting; sending into a closed oneshot is a harmless no-op.
            let _ = reply_tx.send(f(state));
        });
        self.tx.send(hop).map_err(|_| HopError)?;
        reply_rx.await.map_err(|_| HopError)
    }

    /// Submit a closure without waiting for a result, used for fire-and-
    /// forget notifications (e.g. waking a shard to re-check its expire
    /// heap after a cross-shard write touched a key with a TTL).
    pub fn notify<F>(&self, f: F) -> Result<(), HopError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx.send(Box::new(f)).map_err(|_| HopError)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn call_runs_on_owning_side_and_returns_result() {
        let (mut queue, sender) = HopQueue::<i64>::new();
        let mut state = 10i64;

        let recv_task = tokio::spawn(async move {
            queue.recv_one(&mut state).await;
            state
        });

        let got = sender.call(|state| {
            *state += 5;
            *state
        }).await.unwrap();
        assert_eq!(got, 15);

        let final_state = recv_task.await.unwrap();
        assert_eq!(final_state, 15);
    }

    #[tokio::test]
    async fn call_errors_once_queue_is_dropped() {
        let (queue, sender) = HopQueue::<i64>::new();
        drop(queue);

        let err = sender.call(|state: &mut i64| *state).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn drain_runs_all_pending_hops_in_order() {
        let (mut queue, sender) = HopQueue::<Vec<i32>>::new();
        let mut state = Vec::new();

        sender.notify(|s| s.push(1)).unwrap();
        sender.notify(|s| s.push(2)).unwrap();
        sender.notify(|s| s.push(3)).unwrap();
        // Unbounded sends are synchronous, so the items are already
        // visible to try_recv.
        let ran = queue.drain(&mut state);

        assert_eq!(ran, 3);
        assert_eq!(state, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn notify_defers_until_the_owner_drains() {
        let (mut queue, sender) = HopQueue::<u32>::new();
        let mut state = 0u32;

        sender.notify(|s| *s += 1).unwrap();
        assert_eq!(state, 0, "nothing runs until the owning side drains");
        queue.drain(&mut state);
        assert_eq!(state, 1);
    }
}
