//! Runtime lifecycle
//!
//! A [`Runtime`] owns one engine runtime together with everything that must
//! die with it: the task queue, the timer table, pending deferred releases
//! and the module hooks it installed. Realms and values keep it alive
//! through strong references, so the engine runtime is freed strictly after
//! every context and value created from it.

use crate::alloc::MALLOC_FUNCTIONS;
use crate::class;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pins::Pins;
use crate::realm::{Realm, RealmOption};
use crate::release::{Release, ReleaseQueue};
use crate::scheduler::Scheduler;
use crate::sys::{qjs, RawRuntime};
use crate::timer::TimerTable;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_core::{EngineGuard, HandleId, ThreadAffinity};

/// Shared handle to an engine runtime.
#[derive(Clone)]
pub struct Runtime(pub(crate) Arc<RuntimeInner>);

pub(crate) struct RuntimeInner {
    raw: RawRuntime,
    config: RuntimeConfig,
    pins: Arc<Pins>,
    pub(crate) affinity: ThreadAffinity,
    pub(crate) scheduler: Scheduler,
    pub(crate) timers: TimerTable,
    releases: ReleaseQueue,
    finalizing: AtomicUsize,
    realm_defaults: Vec<RealmOption>,
    vm_names: AtomicUsize,
    pub(crate) module_hooks: Mutex<Option<HandleId>>,
}

/// Configures and creates a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    realm_defaults: Vec<RealmOption>,
    pins: Option<Arc<Pins>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Applied to every realm of the runtime, before per-realm options.
    pub fn realm_option(mut self, option: RealmOption) -> Self {
        self.realm_defaults.push(option);
        self
    }

    /// Uses an existing set of registries instead of a fresh one.
    pub fn pins(mut self, pins: Arc<Pins>) -> Self {
        self.pins = Some(pins);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        config.validate()?;
        let scheduler = Scheduler::new(&config)?;

        let rt = unsafe {
            if config.custom_allocator {
                qjs::JS_NewRuntime2(&MALLOC_FUNCTIONS, std::ptr::null_mut())
            } else {
                qjs::JS_NewRuntime()
            }
        };
        let rt = NonNull::new(rt).ok_or(Error::Engine("runtime allocation failed"))?;

        unsafe {
            if let Some(limit) = config.memory_limit {
                qjs::JS_SetMemoryLimit(rt.as_ptr(), limit as _);
            }
            if let Some(threshold) = config.gc_threshold {
                qjs::JS_SetGCThreshold(rt.as_ptr(), threshold as _);
            }
            if let Some(size) = config.max_stack_size {
                qjs::JS_SetMaxStackSize(rt.as_ptr(), size as _);
            }
            if !class::register(rt.as_ptr()) {
                qjs::JS_FreeRuntime(rt.as_ptr());
                return Err(Error::Engine("class registration failed"));
            }
        }

        let inner = Arc::new(RuntimeInner {
            raw: RawRuntime(rt),
            config,
            pins: self.pins.unwrap_or_default(),
            affinity: ThreadAffinity::new(),
            scheduler,
            timers: TimerTable::default(),
            releases: ReleaseQueue::default(),
            finalizing: AtomicUsize::new(0),
            realm_defaults: self.realm_defaults,
            vm_names: AtomicUsize::new(0),
            module_hooks: Mutex::new(None),
        });
        unsafe {
            qjs::JS_SetRuntimeOpaque(rt.as_ptr(), Arc::as_ptr(&inner) as *mut c_void);
        }
        tracing::debug!(config = ?inner.config, "runtime created");
        Ok(Runtime(inner))
    }
}

impl Runtime {
    /// Runtime with default configuration and no realm defaults.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Creates a realm, applying the runtime's default options first and
    /// then `options` in order.
    pub fn new_realm(&self, options: impl IntoIterator<Item = RealmOption>) -> Result<Realm> {
        let realm = {
            let _engine = self.check_owner()?;
            Realm::create(self)?
        };
        for option in self.0.realm_defaults.iter() {
            option.apply(&realm)?;
        }
        for option in options {
            option.apply(&realm)?;
        }
        Ok(realm)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    pub fn pins(&self) -> &Arc<Pins> {
        &self.0.pins
    }

    /// True when both handles refer to the same engine runtime.
    pub fn same(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_owner_thread(&self) -> bool {
        self.0.affinity.is_owner()
    }

    /// Runs the engine's cycle collector.
    pub fn run_gc(&self) -> Result<()> {
        let _engine = self.check_owner()?;
        unsafe { qjs::JS_RunGC(self.0.raw.as_ptr()) };
        self.0.flush_releases();
        Ok(())
    }

    /// True while engine jobs are queued or timers are outstanding.
    pub fn has_async_tasks(&self) -> Result<bool> {
        let _engine = self.check_owner()?;
        let jobs = unsafe { qjs::JS_IsJobPending(self.0.raw.as_ptr()) } != 0;
        Ok(jobs || self.0.timers.has_pending())
    }

    /// Engine references queued for release by the owner thread.
    pub fn pending_releases(&self) -> usize {
        self.0.releases.len()
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.0
    }

    pub(crate) fn raw(&self) -> *mut qjs::JSRuntime {
        self.0.raw.as_ptr()
    }

    /// Enters the engine on the owner thread. Ownership cannot move to
    /// another thread while the returned guard is alive.
    pub(crate) fn check_owner(&self) -> Result<EngineGuard<'_>> {
        Ok(self.0.affinity.enter()?)
    }

    /// Generated script name for evaluations without an explicit filename.
    pub(crate) fn next_vm_name(&self) -> String {
        let n = self.0.vm_names.fetch_add(1, Ordering::Relaxed) + 1;
        format!("VM:{n}")
    }
}

impl RuntimeInner {
    /// # Safety
    /// `rt` must be a runtime created by [`RuntimeBuilder::build`] whose
    /// `RuntimeInner` is still alive.
    pub(crate) unsafe fn from_raw<'a>(rt: *mut qjs::JSRuntime) -> &'a RuntimeInner {
        &*(qjs::JS_GetRuntimeOpaque(rt) as *const RuntimeInner)
    }

    pub(crate) fn pins(&self) -> &Pins {
        &self.pins
    }

    /// Marks the current thread as running inside an engine finalizer until
    /// the returned scope is dropped.
    pub(crate) fn enter_finalizer(&self) -> FinalizerScope<'_> {
        self.finalizing.fetch_add(1, Ordering::AcqRel);
        FinalizerScope { runtime: self }
    }

    /// Releases `release` now if possible, otherwise queues it. Anything
    /// already queued goes first.
    pub(crate) fn release(&self, release: Release) {
        if self.finalizing.load(Ordering::Acquire) == 0 {
            if let Ok(_engine) = self.affinity.enter() {
                self.flush_releases();
                unsafe { release.perform() };
                return;
            }
        }
        self.releases.push(release);
    }

    /// Collection pass: performs every queued release in FIFO order.
    pub(crate) fn flush_releases(&self) -> usize {
        let mut released = 0;
        loop {
            let batch = self.releases.take_all();
            if batch.is_empty() {
                break;
            }
            released += batch.len();
            for release in batch {
                unsafe { release.perform() };
            }
        }
        if released > 0 {
            tracing::trace!(released, "flushed deferred releases");
        }
        released
    }
}

pub(crate) struct FinalizerScope<'a> {
    runtime: &'a RuntimeInner,
}

impl Drop for FinalizerScope<'_> {
    fn drop(&mut self) {
        self.runtime.finalizing.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        // Last handle: no other thread can reach the engine any more.
        self.timers.clear_all();
        let rt = self.raw.as_ptr();
        unsafe {
            if !self.affinity.is_owner() {
                qjs::JS_UpdateStackTop(rt);
            }
            qjs::JS_SetModuleLoaderFunc(rt, None, None, std::ptr::null_mut());
        }
        let hooks = self
            .module_hooks
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(id) = hooks {
            self.pins.modules.unpin(id);
        }

        self.flush_releases();
        unsafe { qjs::JS_FreeRuntime(rt) };

        let leftover = self.releases.take_all();
        if !leftover.is_empty() {
            tracing::warn!(
                count = leftover.len(),
                "engine references released during runtime teardown were dropped"
            );
            std::mem::forget(leftover);
        }
        self.scheduler.shutdown();
        tracing::debug!("runtime released");
    }
}
