//! Registries of host closures pinned into the engine
//!
//! A `Pins` set is created explicitly and handed to a runtime (a fresh set
//! per runtime unless one is injected through the builder). Several runtimes
//! may share one set; ids are random so they never clash.

use crate::error::Result;
use crate::module::ModuleHooks;
use crate::realm::Realm;
use crate::value::Value;
use std::sync::{Arc, Mutex};
use tether_core::HandleRegistry;

/// Type-erased host function as seen by the engine call trap.
pub(crate) type HostCallable = Arc<dyn Fn(&Realm, Value, &[Value]) -> Result<Value> + Send + Sync>;

/// One-shot callback run when a finalizer object is collected.
pub(crate) struct Finalizer(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl Finalizer {
    pub(crate) fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Self(Mutex::new(Some(Box::new(f))))
    }

    pub(crate) fn run(self) {
        let f = self.0.into_inner().unwrap_or_else(|p| p.into_inner());
        if let Some(f) = f {
            f();
        }
    }
}

pub struct Pins {
    pub(crate) functions: HandleRegistry<HostCallable>,
    pub(crate) finalizers: HandleRegistry<Finalizer>,
    pub(crate) modules: HandleRegistry<Arc<ModuleHooks>>,
}

impl Pins {
    pub fn new() -> Self {
        Self {
            functions: HandleRegistry::new("functions"),
            finalizers: HandleRegistry::new("finalizers"),
            modules: HandleRegistry::new("modules"),
        }
    }

    /// Host functions currently reachable from engine objects.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Finalizer objects not yet collected.
    pub fn finalizer_count(&self) -> usize {
        self.finalizers.len()
    }

    /// Installed module normalizer/loader pairs.
    pub fn module_hook_count(&self) -> usize {
        self.modules.len()
    }
}

impl Default for Pins {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pins")
            .field("functions", &self.functions.len())
            .field("finalizers", &self.finalizers.len())
            .field("modules", &self.modules.len())
            .finish()
    }
}
