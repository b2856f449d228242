//! Module resolution hooks
//!
//! The engine has one normalize slot and one load slot per runtime. Both are
//! pointed at fixed trampolines whose opaque pointer is a registry id; the
//! id resolves to the user's pair of callbacks. Both callbacks are required.

use crate::error::{Error, Result};
use crate::realm::Realm;
use crate::runtime::Runtime;
use crate::sys::{self, qjs, ThrowKind};
use crate::tag::Tag;
use crate::value::Value;
use std::ffi::{c_char, c_void};
use std::ptr;
use std::sync::Arc;
use tether_core::HandleId;

type NormalizeFn = Arc<dyn Fn(&Realm, &str, &str) -> Result<String> + Send + Sync>;
type LoadFn = Arc<dyn Fn(&Realm, &str) -> Result<Value> + Send + Sync>;

/// A normalizer and loader pinned together.
pub(crate) struct ModuleHooks {
    normalize: NormalizeFn,
    load: LoadFn,
}

/// Callbacks resolving `import` specifiers.
///
/// The normalizer maps `(base, specifier)` to a module name; the loader
/// turns a module name into a module compiled with
/// [`Realm::compile_module`].
#[derive(Default, Clone)]
pub struct ModuleLoader {
    normalize: Option<NormalizeFn>,
    load: Option<LoadFn>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize<F>(mut self, f: F) -> Self
    where
        F: Fn(&Realm, &str, &str) -> Result<String> + Send + Sync + 'static,
    {
        self.normalize = Some(Arc::new(f));
        self
    }

    pub fn load<F>(mut self, f: F) -> Self
    where
        F: Fn(&Realm, &str) -> Result<Value> + Send + Sync + 'static,
    {
        self.load = Some(Arc::new(f));
        self
    }

    pub fn is_complete(&self) -> bool {
        self.normalize.is_some() && self.load.is_some()
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("normalize", &self.normalize.is_some())
            .field("load", &self.load.is_some())
            .finish()
    }
}

impl Runtime {
    /// Installs `loader`, replacing any previous one.
    ///
    /// Returns false, with the engine hooks detached, unless both callbacks
    /// are present.
    pub fn set_module_loader(&self, loader: ModuleLoader) -> Result<bool> {
        let _engine = self.check_owner()?;
        let rt = self.raw();
        unsafe { qjs::JS_SetModuleLoaderFunc(rt, None, None, ptr::null_mut()) };

        let mut slot = self
            .inner()
            .module_hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.take() {
            self.pins().modules.unpin(previous);
        }

        let (normalize, load) = match (loader.normalize, loader.load) {
            (Some(normalize), Some(load)) => (normalize, load),
            (None, None) => {
                tracing::debug!("module loader removed");
                return Ok(false);
            }
            (normalize, _) => {
                tracing::warn!(
                    has_normalize = normalize.is_some(),
                    "module loader needs both a normalizer and a loader; hooks left detached"
                );
                return Ok(false);
            }
        };

        let id = self.pins().modules.pin(Arc::new(ModuleHooks { normalize, load }));
        unsafe {
            qjs::JS_SetModuleLoaderFunc(
                rt,
                Some(normalize_trampoline),
                Some(load_trampoline),
                id.get() as *mut c_void,
            );
        }
        *slot = Some(id);
        tracing::debug!("module loader installed");
        Ok(true)
    }
}

unsafe fn hooks_for(ctx: *mut qjs::JSContext, opaque: *mut c_void) -> Option<(Realm, Arc<ModuleHooks>)> {
    let realm = Realm::from_raw_context(ctx)?;
    let hooks = HandleId::from_raw(opaque as usize)
        .and_then(|id| realm.runtime().pins().modules.lookup(id))?;
    Some((realm, hooks))
}

unsafe extern "C" fn normalize_trampoline(
    ctx: *mut qjs::JSContext,
    base: *const c_char,
    name: *const c_char,
    opaque: *mut c_void,
) -> *mut c_char {
    let Some((realm, hooks)) = hooks_for(ctx, opaque) else {
        sys::throw_typed(ctx, ThrowKind::Internal, "module hooks are not registered");
        return ptr::null_mut();
    };
    let base = sys::cstr_arg(base);
    let name = sys::cstr_arg(name);
    match (hooks.normalize)(&realm, base, name) {
        Ok(resolved) => {
            tracing::trace!(base, name, %resolved, "module normalized");
            sys::engine_strdup(ctx, &resolved)
        }
        Err(err) => {
            realm.throw(err);
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn load_trampoline(
    ctx: *mut qjs::JSContext,
    name: *const c_char,
    opaque: *mut c_void,
) -> *mut qjs::JSModuleDef {
    let Some((realm, hooks)) = hooks_for(ctx, opaque) else {
        sys::throw_typed(ctx, ThrowKind::Internal, "module hooks are not registered");
        return ptr::null_mut();
    };
    let name = sys::cstr_arg(name);
    match (hooks.load)(&realm, name) {
        Ok(module) if !module.realm().runtime().same(realm.runtime()) => {
            realm.throw(Error::ForeignRuntime);
            ptr::null_mut()
        }
        Ok(module) if module.tag() == Tag::Module => {
            tracing::trace!(name, "module loaded");
            sys::ptr(module.raw()) as *mut qjs::JSModuleDef
        }
        Ok(other) => {
            realm.throw(Error::type_error(format!(
                "module loader returned {} instead of a compiled module for '{name}'",
                other.tag()
            )));
            ptr::null_mut()
        }
        Err(err) => {
            realm.throw(err);
            ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalOptions;
    use tether_core::CancelToken;

    fn library_loader() -> ModuleLoader {
        ModuleLoader::new()
            .normalize(|_, _base, name| Ok(name.trim_start_matches("./").to_string()))
            .load(|realm, name| match name {
                "math" => realm.compile_module(name, "export const double = x => x * 2;"),
                "number" => realm.eval("42", EvalOptions::default()),
                _ => Err(Error::reference(format!("no module named {name}"))),
            })
    }

    #[test]
    fn imports_resolve_through_both_hooks() {
        let runtime = Runtime::new().unwrap();
        assert!(runtime.set_module_loader(library_loader()).unwrap());
        assert_eq!(runtime.pins().module_hook_count(), 1);

        let realm = runtime.new_realm([]).unwrap();
        realm
            .eval_module(
                "import { double } from './math'; globalThis.out = double(21);",
                EvalOptions::default(),
            )
            .unwrap();
        runtime.run_event_loop(&CancelToken::new(), false).unwrap();
        let out = realm.global_object().unwrap().get("out").unwrap();
        assert_eq!(out.to_int().unwrap(), 42);
    }

    #[test]
    fn loader_errors_reach_the_importer() {
        let runtime = Runtime::new().unwrap();
        runtime.set_module_loader(library_loader()).unwrap();
        let realm = runtime.new_realm([]).unwrap();

        let err = realm
            .eval_module("import './missing';", EvalOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("no module named missing"), "{err}");

        let err = realm
            .eval_module("import './number';", EvalOptions::default())
            .unwrap_err();
        assert!(err.to_string().starts_with("TypeError"), "{err}");
    }

    #[test]
    fn one_sided_loaders_are_refused() {
        let runtime = Runtime::new().unwrap();
        assert!(runtime.set_module_loader(library_loader()).unwrap());

        let half = ModuleLoader::new().normalize(|_, _, name| Ok(name.to_string()));
        assert!(!half.is_complete());
        assert!(!runtime.set_module_loader(half).unwrap());
        assert_eq!(runtime.pins().module_hook_count(), 0);

        let realm = runtime.new_realm([]).unwrap();
        assert!(realm
            .eval_module("import './math';", EvalOptions::default())
            .is_err());
    }

    #[test]
    fn replacing_keeps_one_registration() {
        let runtime = Runtime::new().unwrap();
        runtime.set_module_loader(library_loader()).unwrap();
        runtime.set_module_loader(library_loader()).unwrap();
        assert_eq!(runtime.pins().module_hook_count(), 1);
        assert!(!runtime.set_module_loader(ModuleLoader::new()).unwrap());
        assert_eq!(runtime.pins().module_hook_count(), 0);
    }

    #[test]
    fn modules_from_other_runtimes_are_refused() {
        let elsewhere = Runtime::new().unwrap().new_realm([]).unwrap();
        let loader = ModuleLoader::new()
            .normalize(|_, _, name| Ok(name.to_string()))
            .load(move |_, name| elsewhere.compile_module(name, "export const x = 1;"));
        let runtime = Runtime::new().unwrap();
        runtime.set_module_loader(loader).unwrap();

        let realm = runtime.new_realm([]).unwrap();
        let err = realm
            .eval_module("import 'lib';", EvalOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("different runtime"), "{err}");
    }

    #[test]
    fn teardown_unpins_hooks() {
        let pins = Arc::new(crate::pins::Pins::new());
        let runtime = Runtime::builder().pins(Arc::clone(&pins)).build().unwrap();
        runtime.set_module_loader(library_loader()).unwrap();
        assert_eq!(pins.module_hook_count(), 1);
        drop(runtime);
        assert_eq!(pins.module_hook_count(), 0);
    }
}
