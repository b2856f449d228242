//! Typed host functions
//!
//! Any closure of the form `Fn(&Realm, Value, A1, .., An) -> R` (up to eight
//! typed parameters) or `Fn(&Realm, Value, A1, .., An, Rest<T>) -> R` can be
//! exposed to scripts. The leading realm and `this` value are always
//! passed; the typed parameters are decoded with [`FromJs`]; a trailing
//! [`Rest`] collects any remaining arguments. Shapes outside this
//! convention do not implement [`HostFunction`] and are rejected at compile
//! time.

use crate::convert::{FromJs, IntoJs};
use crate::error::{Error, Result};
use crate::pins::HostCallable;
use crate::realm::Realm;
use crate::sys;
use crate::value::Value;
use std::borrow::Cow;
use std::ffi::{c_int, c_void};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

/// Trailing variadic parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Rest<T>(pub Vec<T>);

impl<T> Rest<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for Rest<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

/// Parameter layout of a host function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Cow<'static, str>>,
    pub variadic: Option<Cow<'static, str>>,
}

impl Signature {
    /// Arguments a script must supply.
    pub fn required(&self) -> usize {
        self.params.len()
    }
}

/// Values a host function may return. `Result::Err` is thrown into the
/// engine; `None` and `()` become `undefined`.
pub trait IntoReturn {
    fn into_return(self, realm: &Realm) -> Result<Value>;
}

macro_rules! return_via_into_js {
    ($($ty:ty),*) => {
        $(
            impl IntoReturn for $ty {
                fn into_return(self, realm: &Realm) -> Result<Value> {
                    self.into_js(realm)
                }
            }
        )*
    };
}

return_via_into_js!(
    (),
    Value,
    crate::convert::Function,
    crate::convert::HostValue,
    String,
    &'static str,
    bool,
    i32,
    u32,
    i64,
    usize,
    f32,
    f64,
    serde_json::Value
);

impl<T: IntoJs> IntoReturn for Option<T> {
    fn into_return(self, realm: &Realm) -> Result<Value> {
        self.into_js(realm)
    }
}

impl<T: IntoJs> IntoReturn for Vec<T> {
    fn into_return(self, realm: &Realm) -> Result<Value> {
        self.into_js(realm)
    }
}

impl<T, E> IntoReturn for std::result::Result<T, E>
where
    T: IntoReturn,
    E: Into<Error>,
{
    fn into_return(self, realm: &Realm) -> Result<Value> {
        self.map_err(Into::into)?.into_return(realm)
    }
}

/// Marker for closures without a variadic tail.
pub struct Positional<T>(PhantomData<T>);

/// Marker for closures ending in [`Rest`].
pub struct Variadic<T>(PhantomData<T>);

pub trait HostFunction<Marker>: Send + Sync + 'static {
    fn signature() -> Signature;

    fn invoke(&self, realm: &Realm, this: Value, args: &[Value]) -> Result<Value>;
}

fn check_arity(required: usize, args: &[Value]) -> Result<()> {
    if args.len() < required {
        return Err(Error::NotEnoughParameters {
            required,
            actual: args.len(),
        });
    }
    Ok(())
}

/// Decodes the argument at `index`, reporting mismatches by 1-based position.
fn decode<T: FromJs>(args: &[Value], index: usize) -> Result<T> {
    T::from_js(&args[index]).map_err(|err| match err {
        Error::InvalidType { .. } => Error::InvalidParameterType {
            index: index + 1,
            type_name: T::type_name().into_owned(),
        },
        other => other,
    })
}

macro_rules! host_function {
    ($($ty:ident $var:ident),*) => {
        impl<Func, Ret, $($ty,)*> HostFunction<Positional<(Ret, $($ty,)*)>> for Func
        where
            Func: Fn(&Realm, Value, $($ty),*) -> Ret + Send + Sync + 'static,
            Ret: IntoReturn,
            $($ty: FromJs,)*
        {
            fn signature() -> Signature {
                Signature {
                    params: vec![$($ty::type_name()),*],
                    variadic: None,
                }
            }

            #[allow(unused_mut, unused_variables, unused_assignments)]
            fn invoke(&self, realm: &Realm, this: Value, args: &[Value]) -> Result<Value> {
                let required = 0usize $(+ { let _ = stringify!($var); 1 })*;
                check_arity(required, args)?;
                let mut index = 0usize;
                $(
                    let $var = decode::<$ty>(args, index)?;
                    index += 1;
                )*
                (self)(realm, this, $($var),*).into_return(realm)
            }
        }

        impl<Func, Ret, Tail, $($ty,)*> HostFunction<Variadic<(Ret, $($ty,)* Tail)>> for Func
        where
            Func: Fn(&Realm, Value, $($ty,)* Rest<Tail>) -> Ret + Send + Sync + 'static,
            Ret: IntoReturn,
            Tail: FromJs,
            $($ty: FromJs,)*
        {
            fn signature() -> Signature {
                Signature {
                    params: vec![$($ty::type_name()),*],
                    variadic: Some(Tail::type_name()),
                }
            }

            #[allow(unused_mut)]
            fn invoke(&self, realm: &Realm, this: Value, args: &[Value]) -> Result<Value> {
                let required = 0usize $(+ { let _ = stringify!($var); 1 })*;
                check_arity(required, args)?;
                let mut index = 0usize;
                $(
                    let $var = decode::<$ty>(args, index)?;
                    index += 1;
                )*
                let rest = (index..args.len())
                    .map(|n| decode::<Tail>(args, n))
                    .collect::<Result<Vec<_>>>()?;
                (self)(realm, this, $($var,)* Rest(rest)).into_return(realm)
            }
        }
    };
}

host_function!();
host_function!(A a);
host_function!(A a, B b);
host_function!(A a, B b, C c);
host_function!(A a, B b, C c, D d);
host_function!(A a, B b, C c, D d, E e);
host_function!(A a, B b, C c, D d, E e, F f);
host_function!(A a, B b, C c, D d, E e, F f, G g);
host_function!(A a, B b, C c, D d, E e, F f, G g, H h);

impl Realm {
    /// Exposes a typed host closure as an engine function.
    ///
    /// The closure stays pinned until the engine collects the function
    /// object. It should not hold strong references to values of this
    /// runtime, or the runtime can never be released.
    pub fn new_function<F, M>(&self, f: F) -> Result<Value>
    where
        F: HostFunction<M>,
    {
        let signature = F::signature();
        tracing::trace!(?signature, "registering host function");
        let callable: HostCallable = Arc::new(move |realm: &Realm, this: Value, args: &[Value]| {
            f.invoke(realm, this, args)
        });
        self.new_callable(callable)
    }

    pub(crate) fn new_callable(&self, callable: HostCallable) -> Result<Value> {
        let entered = self.enter()?;
        let ctx = entered.ctx();
        let pins = self.runtime().pins();
        let id = pins.functions.pin(callable);
        let obj = unsafe { sys::qjs::JS_NewObjectClass(ctx, crate::class::function_class() as c_int) };
        if sys::is_exception(obj) {
            pins.functions.unpin(id);
            return Err(self.take_exception());
        }
        unsafe { sys::qjs::JS_SetOpaque(obj, id.get() as *mut c_void) };
        Ok(Value::owned(self, obj))
    }
}
