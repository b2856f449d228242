//! Engine value tags

use crate::sys;
use std::fmt;

/// Type discriminator of an engine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    BigInt,
    Symbol,
    String,
    Module,
    FunctionBytecode,
    Object,
    Int,
    Bool,
    Null,
    Undefined,
    Uninitialized,
    CatchOffset,
    Exception,
    Float64,
    /// A tag this build does not know about (big decimal/float builds).
    Other(i32),
}

impl Tag {
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            sys::TAG_BIG_INT => Tag::BigInt,
            sys::TAG_SYMBOL => Tag::Symbol,
            sys::TAG_STRING => Tag::String,
            sys::TAG_MODULE => Tag::Module,
            sys::TAG_FUNCTION_BYTECODE => Tag::FunctionBytecode,
            sys::TAG_OBJECT => Tag::Object,
            sys::TAG_INT => Tag::Int,
            sys::TAG_BOOL => Tag::Bool,
            sys::TAG_NULL => Tag::Null,
            sys::TAG_UNDEFINED => Tag::Undefined,
            sys::TAG_UNINITIALIZED => Tag::Uninitialized,
            sys::TAG_CATCH_OFFSET => Tag::CatchOffset,
            sys::TAG_EXCEPTION => Tag::Exception,
            sys::TAG_FLOAT64 => Tag::Float64,
            other => Tag::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::BigInt => "bigint",
            Tag::Symbol => "symbol",
            Tag::String => "string",
            Tag::Module => "module",
            Tag::FunctionBytecode => "functionbytecode",
            Tag::Object => "object",
            Tag::Int => "int",
            Tag::Bool => "boolean",
            Tag::Null => "null",
            Tag::Undefined => "undefined",
            Tag::Uninitialized => "uninitialized",
            Tag::CatchOffset => "offset",
            Tag::Exception => "exception",
            Tag::Float64 => "float64",
            Tag::Other(_) => "unknown",
        }
    }

    pub fn is_number(self) -> bool {
        matches!(self, Tag::Int | Tag::Float64)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Other(raw) => write!(f, "unknown({raw})"),
            tag => f.write_str(tag.name()),
        }
    }
}
