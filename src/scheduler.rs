//! The zone scheduler.
//!
//! A single driver task owns an earliest-deadline-first queue of (zone,
//! wakeup) entries.  Zones whose wakeup has passed are handed to a
//! fixed-size worker pool; a per-zone mutex guarantees that no zone is ever
//! ticked by two workers at once.  The scheduler itself never stops: a
//! failing zone is re-queued with exponential back-off up to a ceiling.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use warden_store::{Backend, RowId};

use crate::datetime::UnixTime;
use crate::db::zone::Zone;
use crate::enforcer;
use crate::error::Error;
use crate::factory::KeyFactory;

//----------- Options ----------------------------------------------------------

/// Tuning knobs of the scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// How many zones may tick concurrently.
    pub workers: usize,

    /// The first back-off applied to a failing zone.
    pub backoff_base: Duration,

    /// The largest back-off ever applied.
    pub backoff_ceiling: Duration,

    /// The soft deadline for one zone tick.
    pub tick_deadline: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base: Duration::from_secs(60),
            backoff_ceiling: Duration::from_secs(3600),
            tick_deadline: Duration::from_secs(30),
        }
    }
}

//----------- Scheduler --------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    when: UnixTime,
    zone: RowId,

    /// The back-off applied if this tick fails, in seconds.
    backoff: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.zone).cmp(&(other.when, other.zone))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The scheduler; shared between the driver and the command surface.
pub struct Scheduler {
    store: Arc<dyn Backend>,
    factory: Arc<KeyFactory>,
    options: SchedulerOptions,
    queue: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
    zone_locks: Mutex<foldhash::HashMap<RowId, Arc<tokio::sync::Mutex<()>>>>,
    workers: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Backend>,
        factory: Arc<KeyFactory>,
        options: SchedulerOptions,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(options.workers.max(1)));
        Arc::new(Self {
            store,
            factory,
            options,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            zone_locks: Mutex::new(Default::default()),
            workers,
        })
    }

    /// Queue every stored zone at its recorded wakeup.
    pub fn load_zones(&self) -> Result<usize, Error> {
        let txn = self.store.begin()?;
        let zones = Zone::list(&*txn)?;
        let count = zones.len();
        for zone in &zones {
            if let Some(when) = zone.next_change {
                self.insert(zone.id, when, 0);
            }
        }
        log::info!("Scheduler loaded {count} zones");
        Ok(count)
    }

    /// Queue a zone for a given moment.
    pub fn insert(&self, zone: RowId, when: UnixTime, backoff: u64) {
        self.queue
            .lock()
            .expect("scheduler lock is never poisoned")
            .push(Reverse(Entry {
                when,
                zone,
                backoff,
            }));
        self.notify.notify_one();
    }

    /// Queue a zone for immediate attention.
    pub fn kick(&self, zone: RowId) {
        self.insert(zone, UnixTime::from_secs(0), 0);
    }

    /// Drive the queue forever.
    pub async fn run(self: Arc<Self>) {
        loop {
            let now = UnixTime::now();
            let mut next_due = None;

            // Dispatch everything that is due.
            loop {
                let entry = {
                    let mut queue = self
                        .queue
                        .lock()
                        .expect("scheduler lock is never poisoned");
                    match queue.peek() {
                        Some(Reverse(entry)) if entry.when <= now => {
                            queue.pop().map(|Reverse(e)| e)
                        }
                        Some(Reverse(entry)) => {
                            next_due = Some(entry.when);
                            None
                        }
                        None => None,
                    }
                };
                match entry {
                    Some(entry) => {
                        tokio::spawn(self.clone().run_zone(entry));
                    }
                    None => break,
                }
            }

            // Sleep until the earliest queued wakeup, or until something
            // new is inserted.
            let sleep_for = match next_due {
                Some(due) => {
                    let delta = due.as_secs().saturating_sub(now.as_secs());
                    Duration::from_secs(delta.clamp(1, 3600) as u64)
                }
                None => Duration::from_secs(3600),
            };
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn run_zone(self: Arc<Self>, entry: Entry) {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .expect("the worker semaphore is never closed");
        let lock = self.lock_for(entry.zone);
        let _guard = lock.lock().await;

        let store = self.store.clone();
        let factory = self.factory.clone();
        let zone = entry.zone;
        let now = UnixTime::now();
        let deadline = std::time::Instant::now() + self.options.tick_deadline;

        let result = tokio::task::spawn_blocking(move || {
            enforcer::tick(&*store, &factory, zone, now, Some(deadline))
        })
        .await;
        drop(permit);

        match result {
            Ok(Ok(outcome)) => {
                log::debug!(
                    "Zone {zone} ticked: status {}, next wakeup {}",
                    outcome.status,
                    outcome.next
                );
                if outcome.next != UnixTime::FAR_FUTURE {
                    self.insert(zone, outcome.next, 0);
                }
            }
            Ok(Err(err)) => {
                if let Error::Configuration(msg) = &err {
                    // Broken data will not fix itself; keep the zone out of
                    // the queue until an operator intervenes.
                    log::error!("Zone {zone} is misconfigured and unscheduled: {msg}");
                    return;
                }
                let backoff = next_backoff(&self.options, entry.backoff);
                log::warn!("Zone {zone} tick failed ({err}); retrying in {backoff}s");
                self.insert(zone, now + Duration::from_secs(backoff), backoff);
            }
            Err(err) => {
                let backoff = next_backoff(&self.options, entry.backoff);
                log::error!("Zone {zone} tick panicked ({err}); retrying in {backoff}s");
                self.insert(zone, now + Duration::from_secs(backoff), backoff);
            }
        }
    }

    fn lock_for(&self, zone: RowId) -> Arc<tokio::sync::Mutex<()>> {
        self.zone_locks
            .lock()
            .expect("scheduler lock is never poisoned")
            .entry(zone)
            .or_default()
            .clone()
    }
}

fn next_backoff(options: &SchedulerOptions, previous: u64) -> u64 {
    let base = options.backoff_base.as_secs().max(1);
    let ceiling = options.backoff_ceiling.as_secs().max(base);
    if previous == 0 {
        base
    } else {
        (previous * 2).min(ceiling)
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_the_ceiling() {
        let options = SchedulerOptions {
            backoff_base: Duration::from_secs(60),
            backoff_ceiling: Duration::from_secs(300),
            ..Default::default()
        };
        let mut backoff = 0;
        let mut seen = Vec::new();
        for _ in 0..5 {
            backoff = next_backoff(&options, backoff);
            seen.push(backoff);
        }
        assert_eq!(seen, vec![60, 120, 240, 300, 300]);
    }

    #[test]
    fn queue_orders_by_deadline() {
        let a = Entry {
            when: UnixTime::from_secs(10),
            zone: RowId::from_raw(1),
            backoff: 0,
        };
        let b = Entry {
            when: UnixTime::from_secs(5),
            zone: RowId::from_raw(2),
            backoff: 0,
        };
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(a));
        heap.push(Reverse(b.clone()));
        assert_eq!(heap.pop(), Some(Reverse(b)));
    }
}
