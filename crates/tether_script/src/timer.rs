//! Timeouts and intervals
//!
//! Sleeps run on the scheduler's clock thread and only hold the runtime
//! weakly. When one expires it queues a task; the drive loop then looks the
//! timer up again, runs the callback and applies the after-hook (remove a
//! timeout, re-arm an interval). A timer cleared in between is simply not
//! found.

use crate::error::{Error, Result};
use crate::runtime::{Runtime, RuntimeInner};
use crate::scheduler::Task;
use crate::value::Value;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Script-visible timer id, always positive.
pub type TimerId = i32;

struct TimerCallback {
    func: Value,
    args: Vec<Value>,
}

struct TimerEntry {
    /// Distinguishes a re-used id from the timer a sleep was armed for.
    serial: u64,
    period: Option<Duration>,
    callback: Arc<TimerCallback>,
    sleeper: Option<JoinHandle<()>>,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        if let Some(sleeper) = self.sleeper.take() {
            sleeper.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct TimerTable {
    entries: Mutex<HashMap<TimerId, TimerEntry>>,
    serials: AtomicU64,
}

impl TimerTable {
    pub(crate) fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drops every timer, aborting outstanding sleeps.
    pub(crate) fn clear_all(&self) -> usize {
        let drained: Vec<TimerEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        drained.len()
    }

    fn insert(&self, period: Option<Duration>, callback: TimerCallback) -> (TimerId, u64) {
        let serial = self.serials.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: TimerId = rng.gen_range(1..=i32::MAX);
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            id,
            TimerEntry {
                serial,
                period,
                callback: Arc::new(callback),
                sleeper: None,
            },
        );
        (id, serial)
    }

    fn lookup(&self, id: TimerId, serial: u64) -> Option<(Arc<TimerCallback>, Option<Duration>)> {
        self.lock()
            .get(&id)
            .filter(|entry| entry.serial == serial)
            .map(|entry| (Arc::clone(&entry.callback), entry.period))
    }

    /// Attaches a sleep to a live timer. Returns false if it was cleared.
    fn arm(&self, id: TimerId, serial: u64, sleeper: JoinHandle<()>) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) if entry.serial == serial => {
                entry.sleeper = Some(sleeper);
                true
            }
            _ => {
                sleeper.abort();
                false
            }
        }
    }

    fn remove(&self, id: TimerId) -> Option<TimerEntry> {
        self.lock().remove(&id)
    }

    fn remove_fired(&self, id: TimerId, serial: u64) -> Option<TimerEntry> {
        let mut entries = self.lock();
        if entries.get(&id).is_some_and(|entry| entry.serial == serial) {
            entries.remove(&id)
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TimerId, TimerEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Converts a script delay in milliseconds. Negative and NaN delays fire
/// immediately.
pub(crate) fn millis(ms: f64) -> Duration {
    let ms = if ms.is_nan() { 0.0 } else { ms.max(0.0) };
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
}

impl Runtime {
    /// Calls `func` once with `args` after `delay`, from the drive loop.
    ///
    /// The callback and its arguments keep the runtime alive until the timer
    /// fires or is cleared.
    pub fn set_timeout(&self, func: &Value, delay: Duration, args: Vec<Value>) -> Result<TimerId> {
        self.set_timer(func, delay, None, args)
    }

    /// Calls `func` every `period` until cleared.
    pub fn set_interval(&self, func: &Value, period: Duration, args: Vec<Value>) -> Result<TimerId> {
        self.set_timer(func, period, Some(period), args)
    }

    /// Cancels a timer. Unknown or already cleared ids are ignored.
    pub fn clear_timer(&self, id: TimerId) -> Result<()> {
        let _engine = self.check_owner()?;
        let Some(entry) = self.inner().timers.remove(id) else {
            return Ok(());
        };
        drop(entry);
        tracing::trace!(id, "timer cleared");
        // Wake the loop so it re-evaluates whether any timer is left.
        match self.submit(Box::new(|| Ok(()))) {
            Ok(()) | Err(Error::QueueFull) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Cancels every outstanding timer.
    pub fn clear_timers(&self) -> Result<()> {
        let _engine = self.check_owner()?;
        let cleared = self.inner().timers.clear_all();
        if cleared > 0 {
            tracing::debug!(cleared, "timers cleared");
        }
        Ok(())
    }

    /// Outstanding timeouts and intervals.
    pub fn pending_timers(&self) -> usize {
        self.inner().timers.len()
    }

    fn set_timer(
        &self,
        func: &Value,
        delay: Duration,
        period: Option<Duration>,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        let _engine = self.check_owner()?;
        if !func.realm().runtime().same(self) {
            return Err(Error::ForeignRuntime);
        }
        if args.iter().any(|arg| !arg.realm().runtime().same(self)) {
            return Err(Error::ForeignRuntime);
        }
        let callback = TimerCallback {
            func: func.clone(),
            args,
        };
        let (id, serial) = self.inner().timers.insert(period, callback);
        self.arm_timer(id, serial, delay);
        tracing::trace!(id, ?delay, repeating = period.is_some(), "timer armed");
        Ok(id)
    }

    fn arm_timer(&self, id: TimerId, serial: u64, delay: Duration) {
        let weak = Arc::downgrade(&self.0);
        let task: Task = Box::new(move || fire(weak, id, serial));
        let sleeper = self.inner().scheduler.schedule(delay, task);
        self.inner().timers.arm(id, serial, sleeper);
    }

    /// One-shot timers go away; intervals re-arm if still registered.
    fn after_timer(&self, id: TimerId, serial: u64, period: Option<Duration>) {
        match period {
            None => drop(self.inner().timers.remove_fired(id, serial)),
            Some(period) => self.arm_timer(id, serial, period),
        }
    }
}

fn fire(runtime: Weak<RuntimeInner>, id: TimerId, serial: u64) -> Result<()> {
    let Some(inner) = runtime.upgrade() else {
        return Ok(());
    };
    let runtime = Runtime(inner);
    let Some((callback, period)) = runtime.inner().timers.lookup(id, serial) else {
        return Ok(());
    };
    tracing::trace!(id, "timer fired");
    let result = callback.func.call_now(None, &callback.args);
    drop(callback);
    runtime.after_timer(id, serial, period);
    result.map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalOptions;
    use tether_core::CancelToken;

    #[test]
    fn millis_clamps() {
        assert_eq!(millis(-5.0), Duration::ZERO);
        assert_eq!(millis(f64::NAN), Duration::ZERO);
        assert_eq!(millis(250.0), Duration::from_millis(250));
        assert_eq!(millis(f64::INFINITY), Duration::MAX);
    }

    #[test]
    fn shorter_timeout_fires_first() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let record = realm
            .eval(
                "globalThis.order = []; (tag) => order.push(tag)",
                EvalOptions::default(),
            )
            .unwrap();

        let slow = realm.new_string("slow").unwrap();
        let fast = realm.new_string("fast").unwrap();
        runtime
            .set_timeout(&record, Duration::from_millis(10), vec![slow])
            .unwrap();
        runtime
            .set_timeout(&record, Duration::from_millis(5), vec![fast])
            .unwrap();
        assert!(runtime.has_async_tasks().unwrap());

        runtime.run_event_loop(&CancelToken::new(), false).unwrap();

        let order = realm.eval("order.join(',')", EvalOptions::default()).unwrap();
        assert_eq!(order.display().unwrap(), "fast,slow");
        assert_eq!(runtime.pending_timers(), 0);
    }

    #[test]
    fn clearing_twice_is_a_noop() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let func = realm
            .eval("globalThis.hits = 0; () => hits++", EvalOptions::default())
            .unwrap();
        let id = runtime
            .set_timeout(&func, Duration::from_millis(5), Vec::new())
            .unwrap();

        runtime.clear_timer(id).unwrap();
        runtime.clear_timer(id).unwrap();
        assert_eq!(runtime.pending_timers(), 0);

        runtime.run_event_loop(&CancelToken::new(), false).unwrap();
        let hits = realm.eval("hits", EvalOptions::default()).unwrap();
        assert_eq!(hits.to_int().unwrap(), 0);
    }

    #[test]
    fn interval_repeats_until_cleared() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let tick = realm
            .eval("globalThis.ticks = 0; () => ++ticks", EvalOptions::default())
            .unwrap();
        let id = runtime
            .set_interval(&tick, Duration::from_millis(2), Vec::new())
            .unwrap();

        let stopper = {
            let runtime = runtime.clone();
            realm
                .new_function(move |_: &crate::realm::Realm, _: Value| -> Result<()> {
                    runtime.clear_timer(id)
                })
                .unwrap()
        };
        runtime
            .set_timeout(&stopper, Duration::from_millis(30), Vec::new())
            .unwrap();

        runtime.run_event_loop(&CancelToken::new(), false).unwrap();
        let ticks = realm.eval("ticks", EvalOptions::default()).unwrap();
        assert!(ticks.to_int().unwrap() >= 3);
        assert_eq!(runtime.pending_timers(), 0);
    }

    #[test]
    fn callback_error_stops_loop() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let boom = realm
            .eval("() => { throw new RangeError('late') }", EvalOptions::default())
            .unwrap();
        runtime
            .set_timeout(&boom, Duration::from_millis(1), Vec::new())
            .unwrap();
        let err = runtime.run_event_loop(&CancelToken::new(), false).unwrap_err();
        assert_eq!(err.to_string(), "RangeError: late");
        assert_eq!(runtime.pending_timers(), 0);
    }
}
