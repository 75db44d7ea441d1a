//! Single-consumer work queue with a delay-alarm service (§4.5).
//!
//! Every mutating controller operation funnels through a `Dispatcher`.
//! Items posted from a single thread are processed in posting order;
//! items posted from different threads carry no mutual ordering
//! guarantee. The dispatcher never executes two operations in parallel —
//! it hands them, one at a time, to whichever task drains its output
//! channel, mirroring the single spawned task that drains the crossroads
//! message stream in the teacher's `Event::handle_connection`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// Stable handle to a delayed operation. Cancelling one that has not yet
/// fired prevents it from ever being posted; a fired-but-not-yet-dequeued
/// operation is allowed to run.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct AlarmId(u64);

enum Control<T> {
    Immediate(T),
    Schedule { id: AlarmId, deadline: Instant, item: T },
    Cancel(AlarmId),
}

/// A year out: used as the sleep deadline when no alarm is pending, so the
/// worker loop has a single unconditional `select!` branch.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 3600)
}

/// Handle used to post work; the matching consumer half is the
/// `mpsc::UnboundedReceiver<T>` returned by [`Dispatcher::new`].
pub struct Dispatcher<T> {
    tx: mpsc::UnboundedSender<Control<T>>,
    next_id: Arc<AtomicU64>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Creates a dispatcher and spawns its worker task. The returned
    /// receiver yields operations in the order they become due: immediate
    /// operations in posting order, delayed operations no earlier than
    /// their deadline.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, mut in_rx) = mpsc::unbounded_channel::<Control<T>>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<T>();

        tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
            let mut pending: HashMap<u64, T> = HashMap::new();
            let mut cancelled: HashSet<u64> = HashSet::new();

            loop {
                let deadline = heap.peek().map(|Reverse((d, _))| *d).unwrap_or_else(far_future);

                tokio::select! {
                    biased;

                    msg = in_rx.recv() => {
                        match msg {
                            Some(Control::Immediate(item)) => {
                                if out_tx.send(item).is_err() {
                                    break;
                                }
                            }
                            Some(Control::Schedule { id, deadline, item }) => {
                                pending.insert(id.0, item);
                                heap.push(Reverse((deadline, id.0)));
                            }
                            Some(Control::Cancel(id)) => {
                                cancelled.insert(id.0);
                                pending.remove(&id.0);
                            }
                            None => break,
                        }
                    }

                    _ = sleep_until(deadline) => {
                        let now = Instant::now();
                        while let Some(Reverse((d, id))) = heap.peek().copied() {
                            if d > now {
                                break;
                            }
                            heap.pop();
                            if cancelled.remove(&id) {
                                continue;
                            }
                            if let Some(item) = pending.remove(&id) {
                                if out_tx.send(item).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        (Self { tx, next_id: Arc::new(AtomicU64::new(1)) }, out_rx)
    }

    /// Posts an immediate operation.
    pub fn post(&self, item: T) {
        let _ = self.tx.send(Control::Immediate(item));
    }

    /// Schedules `item` to be posted at `deadline`, returning a handle
    /// that can cancel it before it fires.
    pub fn post_delayed(&self, item: T, deadline: Instant) -> AlarmId {
        let id = AlarmId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(Control::Schedule { id, deadline, item });
        id
    }

    /// Schedules `item` to fire after `delay`.
    pub fn post_after(&self, item: T, delay: Duration) -> AlarmId {
        self.post_delayed(item, Instant::now() + delay)
    }

    /// Cancels a delayed operation if it has not yet fired.
    pub fn cancel(&self, id: AlarmId) {
        let _ = self.tx.send(Control::Cancel(id));
    }
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), next_id: self.next_id.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn immediate_ops_preserve_posting_order() {
        let (disp, mut out) = Dispatcher::<u32>::new();
        disp.post(1);
        disp.post(2);
        disp.post(3);
        assert_eq!(out.recv().await, Some(1));
        assert_eq!(out.recv().await, Some(2));
        assert_eq!(out.recv().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_op_fires_no_earlier_than_deadline() {
        let (disp, mut out) = Dispatcher::<&'static str>::new();
        disp.post_after("late", Duration::from_millis(50));
        disp.post("early");
        assert_eq!(out.recv().await, Some("early"));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(out.recv().await, Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_alarm_never_fires() {
        let (disp, mut out) = Dispatcher::<&'static str>::new();
        let id = disp.post_after("ghost", Duration::from_millis(10));
        disp.cancel(id);
        disp.post_after("real", Duration::from_millis(20));
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(out.recv().await, Some("real"));
    }
}
