use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::util::callback::invoke_guarded;


/// Returned by a time trigger to decide whether it stays scheduled
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TriggerControl {
    Continue,
    Stop,
}

impl From<bool> for TriggerControl {
    fn from(value: bool) -> Self {
        if value {
            TriggerControl::Continue
        }
        else {
            TriggerControl::Stop
        }
    }
}

type TimeCallback = Box<dyn FnMut() -> TriggerControl + Send>;

struct TimeTrigger {
    interval: Duration,
    callback: TimeCallback,
}

/// Runs any number of periodic callbacks on a single background task.
///
/// A new trigger is invoked right away, and then repeatedly until it returns
///  [TriggerControl::Stop] (or panics). The start of an invocation is at least `interval` after the
///  start of the previous invocation of the same trigger. Triggers share the task, so a slow
///  callback delays all others.
pub struct TimeTriggerScheduler {
    trigger_sender: mpsc::UnboundedSender<TimeTrigger>,
    num_active: Arc<AtomicUsize>,
    cancel_sender: broadcast::Sender<()>,
}

impl TimeTriggerScheduler {
    pub fn new() -> TimeTriggerScheduler {
        let (trigger_sender, trigger_receiver) = mpsc::unbounded_channel();
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);
        let num_active = Arc::new(AtomicUsize::new(0));

        tokio::spawn(scheduler_loop(trigger_receiver, num_active.clone(), cancel_receiver));

        TimeTriggerScheduler {
            trigger_sender,
            num_active,
            cancel_sender,
        }
    }

    pub fn add<F>(&self, interval: Duration, callback: F)
    where F: FnMut() -> TriggerControl + Send + 'static
    {
        self.num_active.fetch_add(1, Ordering::AcqRel);

        let trigger = TimeTrigger {
            interval,
            callback: Box::new(callback),
        };
        if self.trigger_sender.send(trigger).is_err() {
            self.num_active.fetch_sub(1, Ordering::AcqRel);
            debug!("time trigger scheduler terminated, discarding new trigger");
        }
    }

    /// the number of triggers that were added and did not stop yet
    pub fn num_active(&self) -> usize {
        self.num_active.load(Ordering::Acquire)
    }
}

/// NB: spawns the scheduler task, so this must be called inside a tokio runtime
impl Default for TimeTriggerScheduler {
    fn default() -> Self {
        TimeTriggerScheduler::new()
    }
}

impl Drop for TimeTriggerScheduler {
    fn drop(&mut self) {
        if self.cancel_sender.send(()).is_err() {
            trace!("time trigger scheduler had terminated already");
        }
    }
}

#[tracing::instrument(name = "time_trigger_scheduler", skip_all)]
async fn scheduler_loop(
    mut trigger_receiver: mpsc::UnboundedReceiver<TimeTrigger>,
    num_active: Arc<AtomicUsize>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    let mut triggers: FxHashMap<u64, TimeTrigger> = FxHashMap::default();
    let mut schedule: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut next_id = 0u64;

    loop {
        let next_due = schedule.peek().map(|Reverse((due, _))| *due);
        let sleep = async move {
            match next_due {
                Some(due) => sleep_until(due).await,
                None => std::future::pending().await,
            }
        };

        select! {
            trigger = trigger_receiver.recv() => {
                match trigger {
                    Some(trigger) => {
                        let id = next_id;
                        next_id += 1;
                        trace!(id, "scheduling time trigger with interval {:?}", trigger.interval);
                        triggers.insert(id, trigger);
                        schedule.push(Reverse((Instant::now(), id)));
                    }
                    None => break,
                }
            }
            _ = sleep => {
                let Some(Reverse((_, id))) = schedule.pop() else {
                    continue;
                };
                let Some(trigger) = triggers.get_mut(&id) else {
                    continue;
                };

                let start = Instant::now();
                match invoke_guarded("time trigger", &mut trigger.callback) {
                    Some(TriggerControl::Continue) => {
                        schedule.push(Reverse((start + trigger.interval, id)));
                    }
                    Some(TriggerControl::Stop) | None => {
                        trace!(id, "retiring time trigger");
                        num_active.fetch_sub(1, Ordering::AcqRel);
                        triggers.remove(&id);
                    }
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }

    debug!("time trigger scheduler terminated with {} active triggers", triggers.len());
}

/// Runs a periodic callback in the calling task, returning once it answers [TriggerControl::Stop]
///  or panics. The same timing rules apply as for [TimeTriggerScheduler].
pub async fn run_time_trigger<F>(interval: Duration, mut callback: F)
where F: FnMut() -> TriggerControl
{
    loop {
        let start = Instant::now();
        match invoke_guarded("time trigger", &mut callback) {
            Some(TriggerControl::Continue) => sleep_until(start + interval).await,
            Some(TriggerControl::Stop) | None => return,
        }
    }
}
