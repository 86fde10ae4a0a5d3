use std::fmt::{self, Debug, Display, Formatter};

use crate::gc::{Handle, ObjBody, ObjType, RawObj};

use super::error::{ErrorKind, Result};
use super::fiber::Fiber;
use super::range::Range;
use super::str::Str;

#[cfg(not(feature = "nan-boxed"))]
mod tagged;
#[cfg(not(feature = "nan-boxed"))]
pub use tagged::Value;

#[cfg(feature = "nan-boxed")]
mod boxed;
#[cfg(feature = "nan-boxed")]
pub use boxed::Value;

impl Value {
    /// Only `false` and `null` are falsey.
    pub fn is_falsey(self) -> bool {
        self.is_false() || self.is_null()
    }

    /// The object type when this value is a heap object.
    pub fn obj_type(self) -> Option<ObjType> {
        self.try_obj().map(|obj| obj.ty())
    }

    /// Checked downcast to a typed object handle.
    pub fn as_obj_of<T: ObjBody>(self) -> Option<Handle<T>> {
        self.try_obj()?.cast::<T>()
    }

    pub fn is_obj_of(self, ty: ObjType) -> bool {
        self.obj_type() == Some(ty)
    }

    /// The user-facing name of this value's type, for diagnostics.
    pub fn type_name(self) -> &'static str {
        if self.is_num() {
            return "Num";
        }
        if self.is_bool() {
            return "Bool";
        }
        if self.is_null() {
            return "Null";
        }
        if self.is_undefined() {
            return "Undefined";
        }

        match self.try_obj() {
            Some(obj) => obj.ty().name(),
            None => unreachable!(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NULL
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        if value {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::num(value)
    }
}

impl<T: ObjBody> From<Handle<T>> for Value {
    fn from(handle: Handle<T>) -> Self {
        Value::obj(handle.erase())
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_num() {
            return write!(f, "Num({})", self.as_num());
        }
        if self.is_undefined() {
            return write!(f, "Undefined");
        }
        if self.is_null() {
            return write!(f, "Null");
        }
        if self.is_bool() {
            return write!(f, "Bool({})", self.as_bool());
        }

        match self.try_obj() {
            Some(obj) => write!(f, "{obj:?}"),
            None => unreachable!(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_num() {
            return write!(f, "{}", super::str::format_num(self.as_num()));
        }
        if self.is_null() {
            return write!(f, "null");
        }
        if self.is_bool() {
            return write!(f, "{}", self.as_bool());
        }
        if self.is_undefined() {
            return write!(f, "undefined");
        }

        match self.as_obj_of::<Str>() {
            Some(string) => write!(f, "{}", string.as_str()),
            None => write!(f, "<{}>", self.type_name()),
        }
    }
}

/// Identity equality; see `Value::same`.
pub fn values_same(a: Value, b: Value) -> bool {
    a.same(b)
}

/// Identity equality with a structural fallback for the immutable types:
/// strings compare by length, hash and bytes; ranges by their triple.
pub fn values_equal(a: Value, b: Value) -> bool {
    if values_same(a, b) {
        return true;
    }

    // From here on, only two heap objects of the same type can be equal.
    let (Some(a), Some(b)) = (a.try_obj(), b.try_obj()) else {
        return false;
    };

    if a.ty() != b.ty() {
        return false;
    }

    match a.ty() {
        ObjType::Str => {
            let a = a.cast::<Str>().unwrap();
            let b = b.cast::<Str>().unwrap();

            a.len() == b.len() && a.hash() == b.hash() && a.as_bytes() == b.as_bytes()
        }
        ObjType::Range => {
            let a = a.cast::<Range>().unwrap();
            let b = b.cast::<Range>().unwrap();

            a.from == b.from && a.to == b.to && a.is_inclusive == b.is_inclusive
        }
        _ => false,
    }
}

/// Hashes the raw bits of [num].
fn hash_num(num: f64) -> u32 {
    let bits = num.to_bits();

    (bits as u32) ^ ((bits >> 32) as u32)
}

fn hash_obj(obj: RawObj) -> Result<u32> {
    match obj.ty() {
        // Classes just use their name.
        ObjType::Str => Ok(obj.cast::<Str>().unwrap().hash()),
        ObjType::Class => Ok(obj.cast::<super::class::Class>().unwrap().name.hash()),
        ObjType::Range => {
            let range = obj.cast::<Range>().unwrap();

            Ok(hash_num(range.from) ^ hash_num(range.to))
        }
        ObjType::Fiber => Ok(obj.cast::<Fiber>().unwrap().id as u32),
        ty => Err(ErrorKind::UnhashableValue(ty).into()),
    }
}

/// Hashes [value], which must be one of the immutable types: null, bool, num,
/// string, range, class, or a fiber (by id).
pub fn hash_value(value: Value) -> Result<u32> {
    if value.is_num() {
        return Ok(hash_num(value.as_num()));
    }

    if let Some(obj) = value.try_obj() {
        return hash_obj(obj);
    }

    if value.is_false() {
        Ok(0)
    } else if value.is_null() {
        Ok(1)
    } else {
        debug_assert!(value.is_true(), "undefined is not hashable");
        Ok(2)
    }
}

#[cfg(test)]
mod tests {
    use crate::gc::Heap;

    use super::*;

    fn test_heap() -> Heap {
        Heap::new(1024 * 1024, 1024, 150)
    }

    #[test]
    fn test_singletons() {
        assert!(Value::NULL.is_null());
        assert!(Value::UNDEFINED.is_undefined());
        assert!(Value::TRUE.is_true() && Value::TRUE.is_bool());
        assert!(Value::FALSE.is_false() && Value::FALSE.is_bool());
        assert!(!Value::NULL.is_bool());
        assert!(!Value::TRUE.is_num());
    }

    #[test]
    fn test_numbers() {
        let value = Value::num(3.5);

        assert!(value.is_num());
        assert_eq!(value.as_num(), 3.5);

        let nan = Value::num(f64::NAN);

        assert!(nan.is_num());
        assert!(nan.as_num().is_nan());

        assert!(Value::num(f64::INFINITY).is_num());
        assert!(Value::num(-0.0).is_num());
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::FALSE.is_falsey());
        assert!(Value::NULL.is_falsey());
        assert!(!Value::TRUE.is_falsey());
        assert!(!Value::num(0.0).is_falsey());
        assert!(!Value::num(f64::NAN).is_falsey());
    }

    #[test]
    fn test_values_same() {
        assert!(values_same(Value::NULL, Value::NULL));
        assert!(values_same(Value::TRUE, Value::TRUE));
        assert!(!values_same(Value::TRUE, Value::FALSE));
        assert!(!values_same(Value::NULL, Value::FALSE));
        assert!(values_same(Value::num(1.5), Value::num(1.5)));
        assert!(!values_same(Value::num(1.5), Value::num(2.5)));

        // IEEE-754: NaN is not the same as NaN, in either representation.
        assert!(!values_same(Value::num(f64::NAN), Value::num(f64::NAN)));

        // Zero compares equal to negative zero.
        assert!(values_same(Value::num(0.0), Value::num(-0.0)));
    }

    #[test]
    fn test_object_identity_and_structural_equality() {
        let mut heap = test_heap();

        let a = heap.alloc(Str::new("greeting"), None).unwrap();
        let b = heap.alloc(Str::new("greeting"), None).unwrap();
        let c = heap.alloc(Str::new("other"), None).unwrap();

        assert!(values_same(a.into(), a.into()));
        assert!(!values_same(a.into(), b.into()));

        assert!(values_equal(a.into(), b.into()));
        assert!(!values_equal(a.into(), c.into()));
    }

    #[test]
    fn test_range_equality() {
        let mut heap = test_heap();

        let a = heap.alloc(Range::new(1.0, 5.0, true), None).unwrap();
        let b = heap.alloc(Range::new(1.0, 5.0, true), None).unwrap();
        let c = heap.alloc(Range::new(1.0, 5.0, false), None).unwrap();

        assert!(values_equal(a.into(), b.into()));
        assert!(!values_equal(a.into(), c.into()));
    }

    #[test]
    fn test_hashes() {
        assert_eq!(hash_value(Value::FALSE).unwrap(), 0);
        assert_eq!(hash_value(Value::NULL).unwrap(), 1);
        assert_eq!(hash_value(Value::TRUE).unwrap(), 2);

        // A number hashes the XOR of its bit pattern halves.
        let bits = 2.5f64.to_bits();
        let expected = (bits as u32) ^ ((bits >> 32) as u32);

        assert_eq!(hash_value(Value::num(2.5)).unwrap(), expected);
    }

    #[test]
    fn test_equal_strings_hash_alike() {
        let mut heap = test_heap();

        let a = heap.alloc(Str::new("symbol"), None).unwrap();
        let b = heap.alloc(Str::new("symbol"), None).unwrap();

        assert_eq!(
            hash_value(a.into()).unwrap(),
            hash_value(b.into()).unwrap()
        );
    }

    #[test]
    fn test_unhashable() {
        let mut heap = test_heap();
        let list = heap.alloc(crate::runtime::list::List::default(), None).unwrap();

        let err = hash_value(list.into()).unwrap_err();

        assert_eq!(err.kind, ErrorKind::UnhashableValue(ObjType::List));
    }
}
