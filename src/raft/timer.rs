use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerName {
    Election,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub name: TimerName,
    pub generation: u64,
}

struct Entry {
    generation: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

/// Named timers delivering ticks into an event channel.
///
/// At most one timer per name is live. Scheduling a name replaces the
/// previous timer, and every tick carries the generation it was armed with so
/// a tick queued before a cancel can be told apart from a live one.
pub struct Timers<E> {
    events: UnboundedSender<E>,
    wrap: fn(TimerTick) -> E,
    active: HashMap<TimerName, Entry>,
    next_generation: u64,
}

impl<E: Send + 'static> Timers<E> {
    pub fn new(events: UnboundedSender<E>, wrap: fn(TimerTick) -> E) -> Self {
        Self {
            events,
            wrap,
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arms a single-shot timer.
    pub fn schedule(&mut self, name: TimerName, delay: Duration) {
        self.cancel(name);
        let tick = self.next_tick(name);
        let events = self.events.clone();
        let wrap = self.wrap;

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(wrap(tick));
        });

        debug!("Scheduled {name:?} timer in {delay:?}");
        self.active.insert(
            name,
            Entry {
                generation: tick.generation,
                repeating: false,
                handle,
            },
        );
    }

    /// Arms a repeating timer whose first tick comes one period from now.
    pub fn schedule_every(&mut self, name: TimerName, period: Duration) {
        self.cancel(name);
        let tick = self.next_tick(name);
        let events = self.events.clone();
        let wrap = self.wrap;

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if events.send(wrap(tick)).is_err() {
                    break;
                }
            }
        });

        debug!("Scheduled {name:?} timer every {period:?}");
        self.active.insert(
            name,
            Entry {
                generation: tick.generation,
                repeating: true,
                handle,
            },
        );
    }

    pub fn cancel(&mut self, name: TimerName) -> bool {
        match self.active.remove(&name) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for (_, entry) in self.active.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_active(&self, name: TimerName) -> bool {
        self.active.contains_key(&name)
    }

    /// Returns true when `tick` comes from the live timer of its name.
    /// A single-shot timer is retired by its accepted tick.
    pub fn accept(&mut self, tick: TimerTick) -> bool {
        let live = match self.active.get(&tick.name) {
            Some(entry) => entry.generation == tick.generation,
            None => false,
        };
        if live && !self.active[&tick.name].repeating {
            self.active.remove(&tick.name);
        }
        live
    }

    fn next_tick(&mut self, name: TimerName) -> TimerTick {
        self.next_generation += 1;
        TimerTick {
            name,
            generation: self.next_generation,
        }
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, entry) in self.active.drain() {
            entry.handle.abort();
        }
    }
}

/// Uniformly random election timeout in `[min_ms, max_ms]`.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let (low, high) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(low..=high))
}
