//! Tagged runtime value.
//!
//! Non-collectable variants (nil, booleans, integers, floats) live inline.
//! Collectable variants carry a typed handle into the heap arenas.

use crate::func::{LuaClosure, NativeClosure};
use crate::gc::GcIdx;
use crate::object::{GcRef, Userdata};
use crate::state::LuaThread;
use crate::string::{StringId, StringInterner};
use crate::table::Table;
use std::fmt;

/// A runtime value.
#[derive(Clone, Copy, Default)]
pub enum TValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
    Table(GcIdx<Table>),
    LuaFn(GcIdx<LuaClosure>),
    Native(GcIdx<NativeClosure>),
    Userdata(GcIdx<Userdata>),
    Thread(GcIdx<LuaThread>),
}

impl TValue {
    #[inline]
    pub fn nil() -> Self {
        TValue::Nil
    }

    #[inline]
    pub fn from_bool(b: bool) -> Self {
        TValue::Bool(b)
    }

    #[inline]
    pub fn from_integer(i: i64) -> Self {
        TValue::Int(i)
    }

    #[inline]
    pub fn from_float(f: f64) -> Self {
        TValue::Float(f)
    }

    #[inline]
    pub fn from_string_id(id: StringId) -> Self {
        TValue::Str(id)
    }

    #[inline]
    pub fn from_table(idx: GcIdx<Table>) -> Self {
        TValue::Table(idx)
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, TValue::Nil)
    }

    /// `nil` and `false` are falsy; everything else (including 0) is truthy.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        matches!(self, TValue::Nil | TValue::Bool(false))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            TValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            TValue::Int(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        match *self {
            TValue::Str(id) => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table_idx(&self) -> Option<GcIdx<Table>> {
        match *self {
            TValue::Table(idx) => Some(idx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_thread_idx(&self) -> Option<GcIdx<LuaThread>> {
        match *self {
            TValue::Thread(idx) => Some(idx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_userdata_idx(&self) -> Option<GcIdx<Userdata>> {
        match *self {
            TValue::Userdata(idx) => Some(idx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_lua_closure(&self) -> Option<GcIdx<LuaClosure>> {
        match *self {
            TValue::LuaFn(idx) => Some(idx),
            _ => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, TValue::LuaFn(_) | TValue::Native(_))
    }

    /// The heap object behind this value, if it is collectable.
    #[inline]
    pub fn gc_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::Str(id) => Some(GcRef::String(id)),
            TValue::Table(i) => Some(GcRef::Table(i)),
            TValue::LuaFn(i) => Some(GcRef::LuaClosure(i)),
            TValue::Native(i) => Some(GcRef::Native(i)),
            TValue::Userdata(i) => Some(GcRef::Userdata(i)),
            TValue::Thread(i) => Some(GcRef::Thread(i)),
            _ => None,
        }
    }

    #[inline]
    pub fn is_collectable(&self) -> bool {
        self.gc_ref().is_some()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TValue::Nil => "nil",
            TValue::Bool(_) => "boolean",
            TValue::Int(_) | TValue::Float(_) => "number",
            TValue::Str(_) => "string",
            TValue::Table(_) => "table",
            TValue::LuaFn(_) | TValue::Native(_) => "function",
            TValue::Userdata(_) => "userdata",
            TValue::Thread(_) => "thread",
        }
    }

    /// Primitive equality: numbers by value, long strings by content,
    /// everything else by identity.
    pub fn raw_equals(&self, other: &TValue, strings: &StringInterner) -> bool {
        match (*self, *other) {
            (TValue::Str(a), TValue::Str(b)) => a == b || strings.long_eq(a, b),
            _ => self == other,
        }
    }
}

/// Convert a float to an integer if it has an exact integral value.
pub fn float_to_integer(f: f64) -> Option<i64> {
    // 2^63 is exactly representable; the range is half-open on top.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if f.floor() == f && (-LIMIT..LIMIT).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

/// Identity equality; integers and floats compare by mathematical value.
/// Long strings with equal content but different allocations are unequal here.
impl PartialEq for TValue {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (TValue::Nil, TValue::Nil) => true,
            (TValue::Bool(a), TValue::Bool(b)) => a == b,
            (TValue::Int(a), TValue::Int(b)) => a == b,
            (TValue::Float(a), TValue::Float(b)) => a == b,
            (TValue::Int(i), TValue::Float(f)) | (TValue::Float(f), TValue::Int(i)) => {
                float_to_integer(f) == Some(i)
            }
            (TValue::Str(a), TValue::Str(b)) => a == b,
            (TValue::Table(a), TValue::Table(b)) => a == b,
            (TValue::LuaFn(a), TValue::LuaFn(b)) => a == b,
            (TValue::Native(a), TValue::Native(b)) => a == b,
            (TValue::Userdata(a), TValue::Userdata(b)) => a == b,
            (TValue::Thread(a), TValue::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TValue::Nil => write!(f, "nil"),
            TValue::Bool(b) => write!(f, "{b}"),
            TValue::Int(i) => write!(f, "{i}"),
            TValue::Float(n) => write!(f, "{n:?}"),
            TValue::Str(id) => write!(f, "string({})", id.0),
            TValue::Table(i) => write!(f, "table({})", i.0),
            TValue::LuaFn(i) => write!(f, "function({})", i.0),
            TValue::Native(i) => write!(f, "native({})", i.0),
            TValue::Userdata(i) => write!(f, "userdata({})", i.0),
            TValue::Thread(i) => write!(f, "thread({})", i.0),
        }
    }
}
