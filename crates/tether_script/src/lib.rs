//! Tether Script
//!
//! Safe bridge over an embedded QuickJS engine.
//!
//! ## Architecture
//!
//! - **Lifecycle:** `Runtime` → `Realm` → `Value`, each wrapper holding its
//!   parent, so engine objects are released strictly before what owns them
//! - **Pins:** host closures live in id-keyed registries; engine objects only
//!   carry the id
//! - **Drive loop:** one owner thread runs all engine work; other threads
//!   submit tasks over a bounded queue and get an `AsyncResult` back
//!
//! ```no_run
//! use tether_script::{intrinsic, CancelToken, EvalOptions, Runtime};
//!
//! # fn main() -> tether_script::Result<()> {
//! let runtime = Runtime::builder()
//!     .realm_option(intrinsic::console())
//!     .realm_option(intrinsic::timers())
//!     .build()?;
//! let realm = runtime.new_realm([])?;
//! realm.eval("setTimeout(() => console.log('tick'), 10)", EvalOptions::default())?;
//! runtime.run_event_loop(&CancelToken::new(), false)?;
//! # Ok(())
//! # }
//! ```

mod alloc;
mod atom;
mod class;
pub mod config;
mod convert;
pub mod error;
mod eval;
mod event_loop;
mod function;
pub mod intrinsic;
mod module;
mod pins;
mod property;
mod realm;
mod release;
mod runtime;
mod scheduler;
mod sys;
mod tag;
mod timer;
mod value;

pub use atom::Atom;
pub use config::RuntimeConfig;
pub use convert::{FromJs, Func, Function, HostValue, IntoArgs, IntoJs, Literal};
pub use error::{Error, Result, ScriptError};
pub use eval::EvalOptions;
pub use event_loop::CANCEL_CHECK_INTERVAL;
pub use function::{HostFunction, IntoReturn, Positional, Rest, Signature, Variadic};
pub use module::ModuleLoader;
pub use pins::Pins;
pub use property::PropertyDescriptor;
pub use realm::{Realm, RealmOption};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::AsyncResult;
pub use tag::Tag;
pub use timer::TimerId;
pub use value::Value;

pub use tether_core::{CancelCause, CancelToken};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn wrappers_are_thread_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Runtime>();
        assert_send_sync::<Realm>();
        assert_send_sync::<Value>();
        assert_send_sync::<Atom>();
        assert_send_sync::<Pins>();
        assert_send_sync::<Error>();
    }

    #[test]
    fn host_and_script_cooperate() -> anyhow::Result<()> {
        let runtime = Runtime::builder()
            .realm_option(intrinsic::timers())
            .realm_option(RealmOption::new(|realm| {
                let double = realm.new_function(|_: &Realm, _: Value, n: i32| n * 2)?;
                realm.global_object()?.set("double", double)
            }))
            .build()?;
        let realm = runtime.new_realm([])?;
        realm.eval(
            "globalThis.result = new Promise(r => setTimeout(() => r(double(21)), 1));",
            EvalOptions::default(),
        )?;
        runtime.run_event_loop(&CancelToken::new(), false)?;

        let settled = realm.eval(
            "let out; result.then(v => { out = v }); out",
            EvalOptions::default(),
        )?;
        assert!(settled.is_undefined());
        runtime.run_event_loop(&CancelToken::new(), false)?;
        let out = realm.eval("out", EvalOptions::default())?;
        assert_eq!(out.to_int()?, 42);
        Ok(())
    }

    #[test]
    fn shared_pins_across_runtimes() -> anyhow::Result<()> {
        let pins = Arc::new(Pins::new());
        let a = Runtime::builder().pins(Arc::clone(&pins)).build()?;
        let b = Runtime::builder().pins(Arc::clone(&pins)).build()?;

        let fa = a.new_realm([])?.new_function(|_: &Realm, _: Value| 1)?;
        let fb = b.new_realm([])?.new_function(|_: &Realm, _: Value| 2)?;
        assert_eq!(pins.function_count(), 2);
        assert_eq!(fa.call(None, ())?.to_int()?, 1);
        assert_eq!(fb.call(None, ())?.to_int()?, 2);

        drop(fa);
        a.run_gc()?;
        assert_eq!(pins.function_count(), 1);
        Ok(())
    }

    #[test]
    fn worker_thread_calls_into_script() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let realm = runtime.new_realm([])?;
        let greet = realm.eval("name => `hello ${name}`", EvalOptions::default())?;
        let token = CancelToken::new();

        let worker = {
            let token = token.clone();
            std::thread::spawn(move || {
                let pending = greet.call_async(None, ("worker",));
                let reply = pending.and_then(AsyncResult::wait).map(|v| v.is_string());
                token.cancel_with(CancelCause::Reason("worker done".into()));
                reply
            })
        };

        let stopped = runtime.run_event_loop(&token, true);
        assert!(matches!(stopped, Err(Error::Cancelled(CancelCause::Reason(_)))));
        assert!(worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))??);
        runtime.run_gc()?;
        assert_eq!(runtime.pending_releases(), 0);
        Ok(())
    }
}
