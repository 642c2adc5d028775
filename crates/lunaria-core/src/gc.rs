//! GC heap with arena-based allocation and typed indices.
//!
//! Every collectable object lives in a typed arena slot next to its
//! [`GcHeader`]. Headers carry the object's color and its intrusive links
//! into one of the global object lists; the links are handles, never pointers.

use crate::func::{LuaClosure, NativeClosure, UpValPool};
use crate::object::{GcRef, Userdata};
use crate::state::LuaThread;
use crate::table::Table;
use std::marker::PhantomData;

/// A typed index into an arena in the GcHeap.
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> GcIdx<T> {
    #[inline]
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> std::fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcIdx({})", self.0)
    }
}

/// Tri-color mark. There are two whites: the collector flips which one is
/// "current" at the end of each atomic phase, so the other white means dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    White0,
    White1,
    Gray,
    Black,
}

impl Color {
    #[inline]
    pub fn is_white(self) -> bool {
        matches!(self, Color::White0 | Color::White1)
    }

    #[inline]
    pub fn other_white(self) -> Color {
        match self {
            Color::White0 => Color::White1,
            _ => Color::White0,
        }
    }
}

/// The disjoint object lists owned by the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcList {
    /// Ordinary objects.
    AllGc,
    /// Objects with a finalizer that are still reachable (or unvisited).
    FinObj,
    /// Unreachable objects whose finalizer has not run yet.
    ToBeFnz,
    /// Objects that are never collected.
    Fixed,
}

/// Per-object collector bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct GcHeader {
    pub color: Color,
    /// Object is registered for finalization (lives in `FinObj` or `ToBeFnz`).
    pub finalize: bool,
    pub list: Option<GcList>,
    pub prev: Option<GcRef>,
    pub next: Option<GcRef>,
}

impl GcHeader {
    pub fn new(color: Color) -> Self {
        GcHeader {
            color,
            finalize: false,
            list: None,
            prev: None,
            next: None,
        }
    }
}

struct Slot<T> {
    header: GcHeader,
    value: Option<T>,
}

/// Slab of objects of one type, with a free list of reusable slots.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, value: T, color: Color) -> u32 {
        self.live += 1;
        let slot = Slot {
            header: GcHeader::new(color),
            value: Some(value),
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = slot;
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(slot);
            idx
        }
    }

    pub fn free(&mut self, idx: u32) -> Option<T> {
        let slot = self.slots.get_mut(idx as usize)?;
        let value = slot.value.take()?;
        slot.header = GcHeader::new(Color::White0);
        self.free.push(idx);
        self.live -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize).and_then(|s| s.value.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.slots.get_mut(idx as usize).and_then(|s| s.value.as_mut())
    }

    #[inline]
    pub fn header(&self, idx: u32) -> &GcHeader {
        &self.slots[idx as usize].header
    }

    #[inline]
    pub fn header_mut(&mut self, idx: u32) -> &mut GcHeader {
        &mut self.slots[idx as usize].header
    }

    pub fn is_live(&self, idx: u32) -> bool {
        self.get(idx).is_some()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Indices of all live slots, in slot order.
    pub fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, _)| i as u32)
    }
}

/// Typed arenas for every collectable object type except strings,
/// which live in the [`StringInterner`](crate::string::StringInterner).
#[derive(Default)]
pub struct GcHeap {
    pub tables: Arena<Table>,
    pub lua_closures: Arena<LuaClosure>,
    pub natives: Arena<NativeClosure>,
    pub userdata: Arena<Userdata>,
    pub threads: Arena<LuaThread>,
    /// Upvalues are reference counted, not collected.
    pub upvals: UpValPool,
}

impl GcHeap {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables.get(idx.0).expect("table was freed")
    }

    #[inline]
    pub fn table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables.get_mut(idx.0).expect("table was freed")
    }

    #[inline]
    pub fn closure(&self, idx: GcIdx<LuaClosure>) -> &LuaClosure {
        self.lua_closures.get(idx.0).expect("closure was freed")
    }

    #[inline]
    pub fn closure_mut(&mut self, idx: GcIdx<LuaClosure>) -> &mut LuaClosure {
        self.lua_closures.get_mut(idx.0).expect("closure was freed")
    }

    #[inline]
    pub fn native(&self, idx: GcIdx<NativeClosure>) -> &NativeClosure {
        self.natives.get(idx.0).expect("native closure was freed")
    }

    #[inline]
    pub fn native_mut(&mut self, idx: GcIdx<NativeClosure>) -> &mut NativeClosure {
        self.natives.get_mut(idx.0).expect("native closure was freed")
    }

    #[inline]
    pub fn udata(&self, idx: GcIdx<Userdata>) -> &Userdata {
        self.userdata.get(idx.0).expect("userdata was freed")
    }

    #[inline]
    pub fn udata_mut(&mut self, idx: GcIdx<Userdata>) -> &mut Userdata {
        self.userdata.get_mut(idx.0).expect("userdata was freed")
    }

    #[inline]
    pub fn thread(&self, idx: GcIdx<LuaThread>) -> &LuaThread {
        self.threads.get(idx.0).expect("thread was freed")
    }

    #[inline]
    pub fn thread_mut(&mut self, idx: GcIdx<LuaThread>) -> &mut LuaThread {
        self.threads.get_mut(idx.0).expect("thread was freed")
    }
}
