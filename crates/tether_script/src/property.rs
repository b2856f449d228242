//! Property descriptors for `define_property`

use crate::sys;
use crate::value::Value;
use std::ffi::c_int;

/// Attributes of a property definition. Only attributes that were set are
/// sent to the engine; the rest keep their current (or default) state.
#[derive(Clone, Default, Debug)]
pub struct PropertyDescriptor {
    flags: c_int,
    value: Option<Value>,
    getter: Option<Value>,
    setter: Option<Value>,
}

impl PropertyDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn attribute(mut self, has: c_int, bit: c_int, enabled: bool) -> Self {
        self.flags |= has;
        if enabled {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
        self
    }

    pub fn configurable(self, enabled: bool) -> Self {
        self.attribute(sys::PROP_HAS_CONFIGURABLE, sys::PROP_CONFIGURABLE, enabled)
    }

    pub fn writable(self, enabled: bool) -> Self {
        self.attribute(sys::PROP_HAS_WRITABLE, sys::PROP_WRITABLE, enabled)
    }

    pub fn enumerable(self, enabled: bool) -> Self {
        self.attribute(sys::PROP_HAS_ENUMERABLE, sys::PROP_ENUMERABLE, enabled)
    }

    pub fn value(mut self, value: Value) -> Self {
        self.flags |= sys::PROP_HAS_VALUE;
        self.value = Some(value);
        self
    }

    pub fn getter(mut self, getter: Value) -> Self {
        self.flags |= sys::PROP_HAS_GET;
        self.getter = Some(getter);
        self
    }

    pub fn setter(mut self, setter: Value) -> Self {
        self.flags |= sys::PROP_HAS_SET;
        self.setter = Some(setter);
        self
    }

    /// Raise a `TypeError` instead of returning false when the definition
    /// is rejected.
    pub fn throw_on_failure(mut self) -> Self {
        self.flags |= sys::PROP_THROW;
        self
    }

    /// Bypass exotic behaviour (proxies, arrays) of the target object.
    pub fn no_exotic(mut self) -> Self {
        self.flags |= sys::PROP_NO_EXOTIC;
        self
    }

    pub(crate) fn flags(&self) -> c_int {
        self.flags
    }

    pub(crate) fn value_ref(&self) -> &Option<Value> {
        &self.value
    }

    pub(crate) fn getter_ref(&self) -> &Option<Value> {
        &self.getter
    }

    pub(crate) fn setter_ref(&self) -> &Option<Value> {
        &self.setter
    }
}
