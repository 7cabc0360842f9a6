//! Keyed, cancellable timers that report back into the session loop.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A timer went off. One-shot timers carry the generation they were armed
/// with so a superseded firing can be recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired<K> {
    pub key: K,
    generation: Option<u64>,
}

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TaskScheduler<K> {
    tx: mpsc::UnboundedSender<TimerFired<K>>,
    pending: HashMap<K, Pending>,
    periodic: Vec<JoinHandle<()>>,
    next_generation: u64,
}

impl<K> TaskScheduler<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<TimerFired<K>>) -> Self {
        Self {
            tx,
            pending: HashMap::new(),
            periodic: Vec::new(),
            next_generation: 0,
        }
    }

    /// Fires `key` after `delay`, replacing a pending timer with the same key.
    pub fn schedule(&mut self, key: K, delay: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            generation: Some(generation),
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        });
        if let Some(previous) = self.pending.insert(key, Pending { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Like [`schedule`](Self::schedule) but keeps an already pending timer.
    pub fn schedule_if_idle(&mut self, key: K, delay: Duration) -> bool {
        if self.pending.contains_key(&key) {
            return false;
        }
        self.schedule(key, delay);
        true
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        self.pending.retain(|key, pending| {
            if predicate(key) {
                pending.handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Fires `key` every `period`, first after one full period.
    pub fn every(&mut self, key: K, period: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fired = TimerFired {
                    key: key.clone(),
                    generation: None,
                };
                if tx.send(fired).is_err() {
                    break;
                }
            }
        });
        self.periodic.push(handle);
    }

    /// Accepts a firing; false when the timer was re-armed or cancelled
    /// after this firing was queued.
    pub fn accept(&mut self, fired: &TimerFired<K>) -> bool {
        let Some(generation) = fired.generation else {
            return true;
        };
        match self.pending.get(&fired.key) {
            Some(pending) if pending.generation == generation => {
                self.pending.remove(&fired.key);
                true
            }
            _ => false,
        }
    }
}

impl<K> TaskScheduler<K> {
    /// Aborts every timer, periodic ones included.
    pub fn shutdown(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.handle.abort();
        }
        for handle in self.periodic.drain(..) {
            handle.abort();
        }
    }
}

impl<K> Drop for TaskScheduler<K> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rescheduling_debounces_and_stale_firings_are_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TaskScheduler::new(tx);

        timers.schedule("renegotiate", Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(300)).await;
        timers.schedule("renegotiate", Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert!(timers.accept(&fired));
        assert!(!timers.is_pending(&"renegotiate"));
        assert!(!timers.accept(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_and_periodic_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TaskScheduler::new(tx);
        timers.schedule("retry", Duration::from_millis(100));
        assert!(timers.cancel(&"retry"));
        timers.every("heartbeat", Duration::from_secs(20));

        tokio::time::sleep(Duration::from_secs(41)).await;
        let mut beats = 0;
        while let Ok(fired) = rx.try_recv() {
            assert_eq!(fired.key, "heartbeat");
            assert!(timers.accept(&fired));
            beats += 1;
        }
        assert_eq!(beats, 2);

        timers.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
