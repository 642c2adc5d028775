//! GC object references, userdata and tag-method names.

use crate::func::{LuaClosure, NativeClosure};
use crate::gc::GcIdx;
use crate::state::LuaThread;
use crate::string::StringId;
use crate::table::Table;
use crate::value::TValue;

/// The type of a GC-managed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcObjectType {
    String,
    Table,
    LuaClosure,
    NativeClosure,
    Userdata,
    Thread,
}

impl GcObjectType {
    pub fn name(self) -> &'static str {
        match self {
            GcObjectType::String => "string",
            GcObjectType::Table => "table",
            GcObjectType::LuaClosure | GcObjectType::NativeClosure => "function",
            GcObjectType::Userdata => "userdata",
            GcObjectType::Thread => "thread",
        }
    }
}

/// An untyped handle to any collectable object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcRef {
    String(StringId),
    Table(GcIdx<Table>),
    LuaClosure(GcIdx<LuaClosure>),
    Native(GcIdx<NativeClosure>),
    Userdata(GcIdx<Userdata>),
    Thread(GcIdx<LuaThread>),
}

impl GcRef {
    pub fn obj_type(self) -> GcObjectType {
        match self {
            GcRef::String(_) => GcObjectType::String,
            GcRef::Table(_) => GcObjectType::Table,
            GcRef::LuaClosure(_) => GcObjectType::LuaClosure,
            GcRef::Native(_) => GcObjectType::NativeClosure,
            GcRef::Userdata(_) => GcObjectType::Userdata,
            GcRef::Thread(_) => GcObjectType::Thread,
        }
    }

    pub fn to_value(self) -> TValue {
        match self {
            GcRef::String(id) => TValue::Str(id),
            GcRef::Table(i) => TValue::Table(i),
            GcRef::LuaClosure(i) => TValue::LuaFn(i),
            GcRef::Native(i) => TValue::Native(i),
            GcRef::Userdata(i) => TValue::Userdata(i),
            GcRef::Thread(i) => TValue::Thread(i),
        }
    }

    /// A stable per-object number, used where the object's address would
    /// be hashed.
    pub fn identity(self) -> u64 {
        let (tag, idx) = match self {
            GcRef::String(id) => (0u64, id.0),
            GcRef::Table(i) => (1, i.0),
            GcRef::LuaClosure(i) => (2, i.0),
            GcRef::Native(i) => (3, i.0),
            GcRef::Userdata(i) => (4, i.0),
            GcRef::Thread(i) => (5, i.0),
        };
        (tag << 32) | idx as u64
    }
}

/// A block of host memory with an optional metatable and one user value.
#[derive(Debug)]
pub struct Userdata {
    pub data: Box<[u8]>,
    pub metatable: Option<GcIdx<Table>>,
    pub user_value: TValue,
}

impl Userdata {
    pub fn new(size: usize) -> Self {
        Userdata {
            data: vec![0u8; size].into_boxed_slice(),
            metatable: None,
            user_value: TValue::Nil,
        }
    }
}

/// Tag methods consulted by the runtime core. The first six are "fast":
/// their absence is cached in each table's flags byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TagMethod {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
    Call,
}

impl TagMethod {
    pub const ALL: [TagMethod; 7] = [
        TagMethod::Index,
        TagMethod::NewIndex,
        TagMethod::Gc,
        TagMethod::Mode,
        TagMethod::Len,
        TagMethod::Eq,
        TagMethod::Call,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TagMethod::Index => "__index",
            TagMethod::NewIndex => "__newindex",
            TagMethod::Gc => "__gc",
            TagMethod::Mode => "__mode",
            TagMethod::Len => "__len",
            TagMethod::Eq => "__eq",
            TagMethod::Call => "__call",
        }
    }

    #[inline]
    pub fn is_fast(self) -> bool {
        self as u8 <= TagMethod::Eq as u8
    }

    /// Bit in a table's flags byte.
    #[inline]
    pub fn flag(self) -> u8 {
        1 << (self as u8)
    }
}

/// Get the type name for a value.
pub fn lua_type_name(val: TValue) -> &'static str {
    val.type_name()
}
