//! The drive loop
//!
//! Only the thread inside [`Runtime::run_event_loop`] (or, outside the loop,
//! the last thread that drove it) touches the engine. Each pass drains the
//! task queue, runs one pending engine job and flushes deferred releases.

use crate::error::{Error, Result};
use crate::realm::Realm;
use crate::runtime::Runtime;
use crate::sys::{self, qjs};
use tether_core::{CancelCause, CancelToken};

/// Tasks run between two cancellation checks while draining the queue.
pub const CANCEL_CHECK_INTERVAL: usize = 64;

impl Runtime {
    /// Drives queued tasks, engine jobs and timers on the calling thread.
    ///
    /// The calling thread becomes the runtime's owner. With `wait_forever`
    /// unset the loop returns once it is idle and no timer is outstanding;
    /// otherwise it waits for more work until `cancel` fires. The first
    /// error raised by a task or job ends the loop.
    pub fn run_event_loop(&self, cancel: &CancelToken, wait_forever: bool) -> Result<()> {
        let guard = self.inner().affinity.claim()?;
        if guard.moved() {
            unsafe { qjs::JS_UpdateStackTop(self.raw()) };
            tracing::debug!(thread = ?std::thread::current().id(), "runtime moved to a new thread");
        }
        tracing::debug!(wait_forever, "event loop started");
        let result = self.drive(cancel, wait_forever);
        match &result {
            Ok(()) => tracing::debug!("event loop idle"),
            Err(err) => tracing::debug!(error = %err, "event loop stopped"),
        }
        result
    }

    fn drive(&self, cancel: &CancelToken, wait_forever: bool) -> Result<()> {
        let inner = self.inner();
        loop {
            check_cancelled(cancel)?;
            let ran_tasks = self.drain_tasks(cancel)?;
            let ran_job = self.run_pending_job()?;
            inner.flush_releases();

            if ran_tasks > 0 || ran_job {
                continue;
            }
            if !wait_forever && !inner.timers.has_pending() {
                return Ok(());
            }
            match inner.scheduler.wait_next(cancel)? {
                Some(task) => task()?,
                None => return Err(cancelled(cancel)),
            }
        }
    }

    /// Runs whatever is queued, bounded by the queue capacity so that
    /// self-resubmitting tasks cannot starve engine jobs.
    fn drain_tasks(&self, cancel: &CancelToken) -> Result<usize> {
        let budget = self.config().task_queue_capacity;
        let mut ran = 0;
        while ran < budget {
            if ran > 0 && ran % CANCEL_CHECK_INTERVAL == 0 {
                check_cancelled(cancel)?;
            }
            let Some(task) = self.inner().scheduler.try_next() else {
                break;
            };
            task()?;
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, "drained tasks");
        }
        Ok(ran)
    }

    /// Runs one queued promise job. Returns false when none was pending.
    fn run_pending_job(&self) -> Result<bool> {
        let mut ctx: *mut qjs::JSContext = std::ptr::null_mut();
        let code = unsafe { qjs::JS_ExecutePendingJob(self.raw(), &mut ctx) };
        if code >= 0 {
            return Ok(code > 0);
        }
        if ctx.is_null() {
            return Err(Error::Engine("pending job failed without a context"));
        }
        match unsafe { Realm::from_raw_context(ctx) } {
            Some(realm) => Err(realm.take_exception()),
            None => {
                unsafe {
                    let exception = qjs::JS_GetException(ctx);
                    sys::free(ctx, exception);
                }
                Err(Error::RealmReleased)
            }
        }
    }
}

fn check_cancelled(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(cancelled(cancel))
    } else {
        Ok(())
    }
}

fn cancelled(cancel: &CancelToken) -> Error {
    Error::Cancelled(cancel.cause().unwrap_or(CancelCause::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::eval::EvalOptions;
    use crate::realm::RealmOption;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn eval_int(realm: &Realm, source: &str) -> i32 {
        realm
            .eval(source, EvalOptions::default())
            .unwrap()
            .to_int()
            .unwrap()
    }

    #[test]
    fn promise_jobs_run_until_idle() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        realm
            .eval(
                "globalThis.steps = 0; Promise.resolve().then(() => steps++).then(() => steps++)",
                EvalOptions::default(),
            )
            .unwrap();
        assert!(runtime.has_async_tasks().unwrap());
        runtime.run_event_loop(&CancelToken::new(), false).unwrap();
        assert_eq!(eval_int(&realm, "steps"), 2);
        assert!(!runtime.has_async_tasks().unwrap());
    }

    #[test]
    fn producers_block_while_queue_is_full() {
        let config = RuntimeConfig::new().with_task_queue_capacity(4);
        let runtime = Runtime::builder().config(config).build().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let bump = realm
            .eval("globalThis.calls = 0; () => ++calls", EvalOptions::default())
            .unwrap();

        let submitted = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        let producer = {
            let submitted = Arc::clone(&submitted);
            let token = token.clone();
            std::thread::spawn(move || {
                let pending: Vec<_> = (0..10)
                    .map(|_| {
                        let result = bump.call_async(None, ()).unwrap();
                        submitted.fetch_add(1, Ordering::SeqCst);
                        result
                    })
                    .collect();
                let succeeded = pending.into_iter().map(|r| r.wait()).filter(|r| r.is_ok()).count();
                token.cancel();
                succeeded
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(submitted.load(Ordering::SeqCst), 4);
        assert_eq!(runtime.queued_tasks(), 4);

        let err = runtime.run_event_loop(&token, true).unwrap_err();
        assert!(matches!(err, Error::Cancelled(CancelCause::Cancelled)));
        assert_eq!(producer.join().unwrap(), 10);
        assert_eq!(eval_int(&realm, "calls"), 10);
    }

    #[test]
    fn cancellation_skips_queued_work() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let bump = realm
            .eval("globalThis.calls = 0; () => ++calls", EvalOptions::default())
            .unwrap();
        let pending: Vec<_> = (0..3).map(|_| bump.call_async(None, ()).unwrap()).collect();

        let token = CancelToken::new();
        token.cancel_with(CancelCause::Reason("shutting down".into()));
        let err = runtime.run_event_loop(&token, false).unwrap_err();
        assert_eq!(err.to_string(), "event loop cancelled: shutting down");
        assert_eq!(eval_int(&realm, "calls"), 0);

        runtime.run_event_loop(&CancelToken::new(), false).unwrap();
        assert_eq!(eval_int(&realm, "calls"), 3);
        let results: Vec<i32> = pending
            .into_iter()
            .map(|mut result| result.try_take().unwrap().unwrap().to_int().unwrap())
            .collect();
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[test]
    fn owner_calls_run_inline_and_others_queue() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let add = realm.eval("(a, b) => a + b", EvalOptions::default()).unwrap();

        assert_eq!(add.call(None, (1, 2)).unwrap().to_int().unwrap(), 3);
        assert_eq!(runtime.queued_tasks(), 0);

        let token = CancelToken::new();
        let caller = {
            let add = add.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                let outcome = add.call(None, (20, 22)).map(|value| value.is_number());
                token.cancel();
                outcome
            })
        };
        let err = runtime.run_event_loop(&token, true).unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(caller.join().unwrap().unwrap());
    }

    #[test]
    fn nested_drive_is_refused() {
        let runtime = Runtime::new().unwrap();
        let nested = runtime.clone();
        runtime
            .submit(Box::new(move || {
                let err = nested.run_event_loop(&CancelToken::new(), false).unwrap_err();
                assert!(matches!(err, Error::LoopBusy));
                Ok(())
            }))
            .unwrap();
        runtime.run_event_loop(&CancelToken::new(), false).unwrap();
    }

    #[test]
    fn task_errors_stop_the_loop() {
        let runtime = Runtime::new().unwrap();
        let ran_after = Arc::new(AtomicUsize::new(0));
        runtime.submit(Box::new(|| Err(Error::internal("task failed")))).unwrap();
        let counter = Arc::clone(&ran_after);
        runtime
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        let err = runtime.run_event_loop(&CancelToken::new(), false).unwrap_err();
        assert_eq!(err.to_string(), "task failed");
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn driving_from_another_thread_moves_ownership() {
        let runtime = Runtime::new().unwrap();
        let remote = runtime.clone();
        let value = std::thread::spawn(move || {
            remote.run_event_loop(&CancelToken::new(), false).unwrap();
            assert!(remote.is_owner_thread());
            let realm = remote.new_realm([]).unwrap();
            eval_int(&realm, "6 * 7")
        })
        .join()
        .unwrap();

        assert_eq!(value, 42);
        assert!(!runtime.is_owner_thread());
        assert!(matches!(runtime.new_realm([]), Err(Error::ForeignThread)));
    }

    #[test]
    fn ownership_stays_while_owner_is_in_the_engine() {
        let runtime = Runtime::new().unwrap();
        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));

        let blocking = {
            let entered = Arc::clone(&entered);
            let resume = Arc::clone(&resume);
            RealmOption::new(move |realm| {
                let entered = Arc::clone(&entered);
                let resume = Arc::clone(&resume);
                let block = realm.new_function(move |_: &Realm, _: Value| {
                    entered.wait();
                    resume.wait();
                })?;
                realm.global_object()?.set("block", block)
            })
        };
        let realm = runtime.new_realm([blocking]).unwrap();

        let other = {
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                entered.wait();
                let drove = runtime.run_event_loop(&CancelToken::new(), false);
                let created = runtime.new_realm([]).map(drop);
                resume.wait();
                (drove, created)
            })
        };

        let value = realm
            .eval("block(); [1, 2, 3].map(x => x * 2).join()", EvalOptions::default())
            .unwrap();
        assert_eq!(value.display().unwrap(), "2,4,6");

        let (drove, created) = other.join().unwrap();
        assert!(matches!(drove, Err(Error::EngineBusy)));
        assert!(matches!(created, Err(Error::ForeignThread)));
        assert!(runtime.is_owner_thread());
    }

    #[test]
    fn async_callers_do_not_block_the_executor() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let double = realm.eval("x => x * 2", EvalOptions::default()).unwrap();
        let token = CancelToken::new();

        let worker = {
            let token = token.clone();
            std::thread::spawn(move || {
                let executor = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let outcome = executor.block_on(async {
                    let queued = double.call_async(None, (4,))?.await?;
                    let awaited = double.queue_call(None, (5,)).await?;
                    let blocking = double.call(None, (6,));
                    Ok::<_, Error>((queued.is_int(), awaited.is_int(), blocking))
                });
                token.cancel();
                outcome
            })
        };

        let err = runtime.run_event_loop(&token, true).unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        let (queued, awaited, blocking) = worker.join().unwrap().unwrap();
        assert!(queued && awaited);
        assert!(matches!(blocking, Err(Error::AsyncContext)));
    }

    #[test]
    fn idle_wait_works_inside_an_async_runtime() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([]).unwrap();
        let bump = realm
            .eval("globalThis.fired = 0; () => ++fired", EvalOptions::default())
            .unwrap();
        runtime
            .set_timeout(&bump, Duration::from_millis(5), Vec::new())
            .unwrap();

        let executor = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        executor
            .block_on(async { runtime.run_event_loop(&CancelToken::new(), false) })
            .unwrap();
        assert_eq!(eval_int(&realm, "fired"), 1);
    }
}
