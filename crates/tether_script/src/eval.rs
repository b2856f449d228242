//! Script evaluation, compilation and binary loading
//!
//! Scripts evaluated without an explicit filename are named `VM:<n>` with a
//! per-runtime counter, so stack traces stay distinguishable.

use crate::error::Result;
use crate::realm::Realm;
use crate::runtime::Runtime;
use crate::sys::{self, qjs};
use crate::value::Value;
use std::ffi::{c_int, CString};

/// Flags for a single evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalOptions {
    filename: Option<String>,
    module: bool,
    strict: bool,
    strip: bool,
    backtrace_barrier: bool,
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    /// Evaluate as an ES module instead of a global script.
    pub fn module(mut self) -> Self {
        self.module = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Drop source and debug information from the compiled code.
    pub fn strip(mut self) -> Self {
        self.strip = true;
        self
    }

    /// Hide frames above this evaluation from stack traces.
    pub fn backtrace_barrier(mut self) -> Self {
        self.backtrace_barrier = true;
        self
    }

    pub(crate) fn flags(&self) -> c_int {
        let mut flags = if self.module {
            sys::EVAL_TYPE_MODULE
        } else {
            sys::EVAL_TYPE_GLOBAL
        };
        if self.strict {
            flags |= sys::EVAL_FLAG_STRICT;
        }
        if self.strip {
            flags |= sys::EVAL_FLAG_STRIP;
        }
        if self.backtrace_barrier {
            flags |= sys::EVAL_FLAG_BACKTRACE_BARRIER;
        }
        flags
    }
}

impl Realm {
    fn eval_with(&self, source: &str, options: &EvalOptions, extra: c_int) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let filename = match &options.filename {
            Some(name) => name.clone(),
            None => self.runtime().next_vm_name(),
        };
        let input = CString::new(source)?;
        let filename = CString::new(filename)?;
        self.resolve(unsafe {
            qjs::JS_Eval(
                ctx,
                input.as_ptr(),
                source.len() as _,
                filename.as_ptr(),
                options.flags() | extra,
            )
        })
    }

    pub fn eval(&self, source: &str, options: EvalOptions) -> Result<Value> {
        self.eval_with(source, &options, 0)
    }

    pub fn eval_module(&self, source: &str, options: EvalOptions) -> Result<Value> {
        self.eval_with(source, &options.module(), 0)
    }

    /// Compiles `source` without running it. The result is a function or
    /// module value that [`Value::to_bytes`] can serialize.
    pub fn compile(&self, source: &str, options: EvalOptions) -> Result<Value> {
        self.eval_with(source, &options, sys::EVAL_FLAG_COMPILE_ONLY)
    }

    /// Compiles an ES module named `name`, as expected from a module loader.
    pub fn compile_module(&self, name: &str, source: &str) -> Result<Value> {
        let options = EvalOptions::new().filename(name).module();
        self.eval_with(source, &options, sys::EVAL_FLAG_COMPILE_ONLY)
    }

    /// Loads and runs code previously produced by [`Runtime::compile`].
    pub fn eval_binary(&self, bytes: &[u8]) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let compiled = self.load_value(bytes)?;
        // The engine consumes the function reference; `compiled` keeps ours.
        self.resolve(unsafe { qjs::JS_EvalFunction(ctx, sys::dup(compiled.raw())) })
    }

    fn install_exports(&self) -> Result<Value> {
        let exports = self.new_object()?;
        self.global_object()?.set("exports", &exports)?;
        Ok(exports)
    }
}

impl Runtime {
    /// Compiles `source` in a scratch realm and serializes the bytecode.
    pub fn compile(&self, source: &str, options: EvalOptions) -> Result<Vec<u8>> {
        let realm = self.new_realm([])?;
        realm.compile(source, options)?.to_bytes()
    }

    pub fn compile_module(&self, source: &str, options: EvalOptions) -> Result<Vec<u8>> {
        self.compile(source, options.module())
    }

    /// Parses JSON text in a fresh realm.
    pub fn parse_json(&self, text: &str) -> Result<Value> {
        self.new_realm([])?.parse_json(text)
    }

    /// Runs a CommonJS-style script in a fresh realm with a global `exports`
    /// object and returns that object.
    pub fn eval_node_module(&self, source: &str, options: EvalOptions) -> Result<Value> {
        let realm = self.new_realm([])?;
        let exports = realm.install_exports()?;
        realm.eval(source, options)?;
        Ok(exports)
    }

    /// Compiled counterpart of [`Runtime::eval_node_module`].
    pub fn eval_binary_node_module(&self, bytes: &[u8]) -> Result<Value> {
        let realm = self.new_realm([])?;
        let exports = realm.install_exports()?;
        realm.eval_binary(bytes)?;
        Ok(exports)
    }
}
