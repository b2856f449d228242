//! Host <-> engine value conversion
//!
//! [`IntoJs`] turns host values into engine values; [`FromJs`] decodes engine
//! values into typed host parameters. Both are closed over the shapes listed
//! here plus any user type that implements the trait itself.

use crate::error::{Error, Result};
use crate::eval::EvalOptions;
use crate::function::HostFunction;
use crate::realm::Realm;
use crate::tag::Tag;
use crate::value::Value;
use std::borrow::Cow;
use std::marker::PhantomData;
use std::ops::Deref;

/// Primitive host view of an engine value.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nothing,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(String),
}

// ========================================================================
// Host -> engine
// ========================================================================

pub trait IntoJs {
    fn into_js(self, realm: &Realm) -> Result<Value>;
}

impl IntoJs for Value {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.check_runtime(&self)?;
        Ok(self)
    }
}

impl IntoJs for &Value {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.check_runtime(self)?;
        Ok(self.clone())
    }
}

impl IntoJs for () {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(realm.undefined())
    }
}

impl IntoJs for bool {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(realm.new_bool(self))
    }
}

impl IntoJs for i32 {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(realm.new_int(self))
    }
}

impl IntoJs for u32 {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        (self as i64).into_js(realm)
    }
}

impl IntoJs for i64 {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(match i32::try_from(self) {
            Ok(n) => realm.new_int(n),
            Err(_) => realm.new_float(self as f64),
        })
    }
}

impl IntoJs for usize {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(match i32::try_from(self) {
            Ok(n) => realm.new_int(n),
            Err(_) => realm.new_float(self as f64),
        })
    }
}

impl IntoJs for f64 {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(realm.new_float(self))
    }
}

impl IntoJs for f32 {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        Ok(realm.new_float(self as f64))
    }
}

impl IntoJs for &str {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.new_string(self)
    }
}

impl IntoJs for String {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.new_string(&self)
    }
}

impl IntoJs for &String {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.new_string(self)
    }
}

impl<T: IntoJs> IntoJs for Option<T> {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        match self {
            Some(value) => value.into_js(realm),
            None => Ok(realm.undefined()),
        }
    }
}

impl<T: IntoJs> IntoJs for Vec<T> {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        let array = realm.new_array()?;
        for (n, item) in self.into_iter().enumerate() {
            array.set_index(n as u32, item)?;
        }
        Ok(array)
    }
}

/// Host errors become engine `Error` objects; script errors hand back the
/// value that was thrown.
impl IntoJs for Error {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        match self {
            Error::Script(e) => Ok(e.value().clone()),
            other => realm.new_error(&other.to_string()),
        }
    }
}

impl IntoJs for serde_json::Value {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.parse_json(&serde_json::to_string(&self)?)
    }
}

impl IntoJs for HostValue {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        match self {
            HostValue::Nothing => Ok(realm.undefined()),
            HostValue::Bool(b) => Ok(realm.new_bool(b)),
            HostValue::Int(n) => Ok(realm.new_int(n)),
            HostValue::Float(d) => Ok(realm.new_float(d)),
            HostValue::String(s) => realm.new_string(&s),
        }
    }
}

/// Script source evaluated in the target realm to produce the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal(pub String);

impl IntoJs for Literal {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.eval(&self.0, EvalOptions::default())
    }
}

/// A host closure to be exposed as an engine function.
pub struct Func<F, M> {
    f: F,
    marker: PhantomData<fn() -> M>,
}

impl<F, M> Func<F, M>
where
    F: HostFunction<M>,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            marker: PhantomData,
        }
    }
}

impl<F, M> IntoJs for Func<F, M>
where
    F: HostFunction<M>,
{
    fn into_js(self, realm: &Realm) -> Result<Value> {
        realm.new_function(self.f)
    }
}

/// Argument lists accepted by calls.
pub trait IntoArgs {
    fn into_args(self, realm: &Realm) -> Result<Vec<Value>>;
}

impl<T: IntoJs> IntoArgs for Vec<T> {
    fn into_args(self, realm: &Realm) -> Result<Vec<Value>> {
        self.into_iter().map(|item| item.into_js(realm)).collect()
    }
}

macro_rules! tuple_args {
    ($($ty:ident $var:ident),*) => {
        impl<$($ty: IntoJs),*> IntoArgs for ($($ty,)*) {
            #[allow(unused_variables)]
            fn into_args(self, realm: &Realm) -> Result<Vec<Value>> {
                let ($($var,)*) = self;
                Ok(vec![$($var.into_js(realm)?),*])
            }
        }
    };
}

tuple_args!();
tuple_args!(A a);
tuple_args!(A a, B b);
tuple_args!(A a, B b, C c);
tuple_args!(A a, B b, C c, D d);
tuple_args!(A a, B b, C c, D d, E e);
tuple_args!(A a, B b, C c, D d, E e, F f);
tuple_args!(A a, B b, C c, D d, E e, F f, G g);
tuple_args!(A a, B b, C c, D d, E e, F f, G g, H h);

// ========================================================================
// Engine -> host
// ========================================================================

pub trait FromJs: Sized {
    /// Name reported in type mismatch errors.
    fn type_name() -> Cow<'static, str>;

    fn from_js(value: &Value) -> Result<Self>;
}

pub(crate) fn mismatch<T: FromJs>() -> Error {
    Error::InvalidType {
        type_name: T::type_name().into_owned(),
    }
}

impl FromJs for Value {
    fn type_name() -> Cow<'static, str> {
        "value".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromJs for String {
    fn type_name() -> Cow<'static, str> {
        "string".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if !value.is_string() {
            return Err(mismatch::<Self>());
        }
        value.display()
    }
}

impl FromJs for bool {
    fn type_name() -> Cow<'static, str> {
        "boolean".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if !value.is_bool() {
            return Err(mismatch::<Self>());
        }
        value.to_bool()
    }
}

impl FromJs for i32 {
    fn type_name() -> Cow<'static, str> {
        "int32".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if !value.is_number() {
            return Err(mismatch::<Self>());
        }
        value.to_int()
    }
}

impl FromJs for i64 {
    fn type_name() -> Cow<'static, str> {
        "int64".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if !value.is_number() {
            return Err(mismatch::<Self>());
        }
        value.to_int64()
    }
}

impl FromJs for f64 {
    fn type_name() -> Cow<'static, str> {
        "float64".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if !value.is_number() {
            return Err(mismatch::<Self>());
        }
        value.to_float()
    }
}

impl<T: FromJs> FromJs for Option<T> {
    fn type_name() -> Cow<'static, str> {
        T::type_name()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if value.is_undefined() || value.is_null() {
            Ok(None)
        } else {
            T::from_js(value).map(Some)
        }
    }
}

impl<T: FromJs> FromJs for Vec<T> {
    fn type_name() -> Cow<'static, str> {
        format!("{}[]", T::type_name()).into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if !value.try_is_array()? {
            return Err(mismatch::<Self>());
        }
        let len = value.get("length")?.to_int()?.max(0) as u32;
        (0..len)
            .map(|n| T::from_js(&value.index(n)?))
            .collect::<Result<_>>()
            .map_err(|err| match err {
                Error::InvalidType { .. } => mismatch::<Self>(),
                other => other,
            })
    }
}

impl FromJs for serde_json::Value {
    fn type_name() -> Cow<'static, str> {
        "json".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        value.to_json()
    }
}

/// An engine value known to be callable.
#[derive(Clone, Debug)]
pub struct Function(Value);

impl Function {
    pub fn new(value: Value) -> Result<Self> {
        Self::from_js(&value)
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Deref for Function {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl FromJs for Function {
    fn type_name() -> Cow<'static, str> {
        "function".into()
    }

    fn from_js(value: &Value) -> Result<Self> {
        if value.tag() != Tag::Object || !value.is_function() {
            return Err(mismatch::<Self>());
        }
        Ok(Function(value.clone()))
    }
}

impl IntoJs for Function {
    fn into_js(self, realm: &Realm) -> Result<Value> {
        self.0.into_js(realm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn realm() -> Realm {
        Runtime::new().unwrap().new_realm([]).unwrap()
    }

    fn eval(realm: &Realm, source: &str) -> Value {
        realm.eval(source, EvalOptions::default()).unwrap()
    }

    #[test]
    fn host_values_into_engine() {
        let realm = realm();
        assert!(realm.convert(()).unwrap().is_undefined());
        assert!(realm.convert(None::<i32>).unwrap().is_undefined());
        assert!(realm.convert(i64::MAX).unwrap().is_float());
        assert!(realm.convert(5u32).unwrap().is_int());

        let list = realm.convert(vec!["a", "b"]).unwrap();
        assert!(list.is_array());
        assert_eq!(Vec::<String>::from_js(&list).unwrap(), vec!["a", "b"]);

        let json = realm.convert(serde_json::json!({ "k": [1, 2] })).unwrap();
        assert_eq!(json.get("k").unwrap().index(1).unwrap().to_int().unwrap(), 2);

        let literal = realm.convert(Literal("({ ready: true })".into())).unwrap();
        assert!(literal.get("ready").unwrap().to_bool().unwrap());

        let error = realm.convert(Error::host(std::fmt::Error)).unwrap();
        assert!(error.is_error());
    }

    #[test]
    fn decoding_checks_tags() {
        let realm = realm();
        let text = eval(&realm, "'12'");
        assert!(matches!(
            i32::from_js(&text),
            Err(Error::InvalidType { type_name }) if type_name == "int32"
        ));
        assert_eq!(String::from_js(&text).unwrap(), "12");
        assert_eq!(f64::from_js(&eval(&realm, "1.25")).unwrap(), 1.25);
        assert_eq!(Option::<bool>::from_js(&eval(&realm, "null")).unwrap(), None);

        let err = Vec::<i32>::from_js(&eval(&realm, "({ length: 1 })")).unwrap_err();
        assert!(matches!(err, Error::InvalidType { type_name } if type_name == "int32[]"));

        let err = Vec::<i32>::from_js(&eval(&realm, "[1, 'x']")).unwrap_err();
        assert!(matches!(err, Error::InvalidType { type_name } if type_name == "int32[]"));

        assert!(Function::from_js(&eval(&realm, "Math.max")).is_ok());
        assert!(Function::from_js(&eval(&realm, "({})")).is_err());
    }

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl FromJs for Point {
        fn type_name() -> Cow<'static, str> {
            "Point".into()
        }

        fn from_js(value: &Value) -> Result<Self> {
            if !value.is_object() {
                return Err(mismatch::<Self>());
            }
            Ok(Point {
                x: i32::from_js(&value.get("x")?)?,
                y: i32::from_js(&value.get("y")?)?,
            })
        }
    }

    #[test]
    fn custom_decoders() {
        let realm = realm();
        let point = Point::from_js(&eval(&realm, "({ x: 1, y: 2 })")).unwrap();
        assert_eq!(point, Point { x: 1, y: 2 });
        let points = Vec::<Point>::from_js(&eval(&realm, "[{ x: 3, y: 4 }]")).unwrap();
        assert_eq!(points, vec![Point { x: 3, y: 4 }]);
    }
}
