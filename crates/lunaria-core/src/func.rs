//! Closures and upvalues.
//!
//! An upvalue is either open, naming a live slot of a thread's stack by
//! index, or closed, holding its own copy of the value. Open upvalues of a
//! thread form a singly linked list sorted by slot, highest first. Upvalues
//! are reference counted by the closures that use them and are not GC objects.

use crate::error::LuaError;
use crate::gc::GcIdx;
use crate::object::GcRef;
use crate::state::{GlobalState, LuaThread};
use crate::value::TValue;

/// Index of a host function registered with the embedding layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeFnId(pub u32);

/// Index of a host continuation function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContinuationId(pub u32);

#[derive(Clone, Copy, Debug)]
pub enum UpValLocation {
    Open {
        thread: GcIdx<LuaThread>,
        slot: usize,
        /// Next open upvalue of the same thread (lower slot).
        next: Option<GcIdx<UpVal>>,
        /// Reached by a closure during propagation; its value must be
        /// re-marked in the atomic phase.
        touched: bool,
    },
    Closed(TValue),
}

#[derive(Clone, Copy, Debug)]
pub struct UpVal {
    pub refcount: u32,
    pub location: UpValLocation,
}

impl UpVal {
    pub fn is_open(&self) -> bool {
        matches!(self.location, UpValLocation::Open { .. })
    }

    pub const SIZE: usize = std::mem::size_of::<UpVal>();
}

/// Storage for upvalues with a free list.
#[derive(Default)]
pub struct UpValPool {
    slots: Vec<Option<UpVal>>,
    free: Vec<u32>,
}

impl UpValPool {
    pub fn alloc(&mut self, uv: UpVal) -> GcIdx<UpVal> {
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = Some(uv);
            GcIdx::new(i)
        } else {
            self.slots.push(Some(uv));
            GcIdx::new(self.slots.len() as u32 - 1)
        }
    }

    pub fn free(&mut self, idx: GcIdx<UpVal>) {
        if self.slots[idx.0 as usize].take().is_some() {
            self.free.push(idx.0);
        }
    }

    #[inline]
    pub fn get(&self, idx: GcIdx<UpVal>) -> &UpVal {
        self.slots[idx.0 as usize].as_ref().expect("upvalue was freed")
    }

    #[inline]
    pub fn get_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        self.slots[idx.0 as usize].as_mut().expect("upvalue was freed")
    }

    pub fn is_live(&self, idx: GcIdx<UpVal>) -> bool {
        matches!(self.slots.get(idx.0 as usize), Some(Some(_)))
    }

    /// Number of live upvalues.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A scripted closure (function prototype + captured upvalues).
#[derive(Debug)]
pub struct LuaClosure {
    /// Index of the prototype in the host's proto store.
    pub proto_idx: usize,
    pub upvalues: Vec<Option<GcIdx<UpVal>>>,
}

impl LuaClosure {
    pub fn mem_size(nupvals: usize) -> usize {
        std::mem::size_of::<LuaClosure>() + nupvals * std::mem::size_of::<Option<GcIdx<UpVal>>>()
    }
}

/// A host function with its own upvalue values.
#[derive(Debug)]
pub struct NativeClosure {
    pub func: NativeFnId,
    pub name: &'static str,
    pub upvalues: Vec<TValue>,
}

impl NativeClosure {
    pub fn mem_size(nupvals: usize) -> usize {
        std::mem::size_of::<NativeClosure>() + nupvals * std::mem::size_of::<TValue>()
    }
}

impl GlobalState {
    pub fn new_lua_closure(&mut self, proto_idx: usize, nupvals: usize) -> Result<GcIdx<LuaClosure>, LuaError> {
        let size = LuaClosure::mem_size(nupvals);
        self.reserve(size)?;
        let cl = LuaClosure {
            proto_idx,
            upvalues: vec![None; nupvals],
        };
        let idx = GcIdx::new(self.heap.lua_closures.alloc(cl, self.gc.current_white));
        self.link_new(GcRef::LuaClosure(idx), size);
        Ok(idx)
    }

    pub fn new_native_closure(
        &mut self,
        func: NativeFnId,
        name: &'static str,
        upvalues: Vec<TValue>,
    ) -> Result<GcIdx<NativeClosure>, LuaError> {
        let size = NativeClosure::mem_size(upvalues.len());
        self.reserve(size)?;
        let cl = NativeClosure {
            func,
            name,
            upvalues,
        };
        let idx = GcIdx::new(self.heap.natives.alloc(cl, self.gc.current_white));
        self.link_new(GcRef::Native(idx), size);
        Ok(idx)
    }

    fn alloc_upval(&mut self, uv: UpVal) -> Result<GcIdx<UpVal>, LuaError> {
        self.reserve(UpVal::SIZE)?;
        self.gc.account_alloc(UpVal::SIZE);
        Ok(self.heap.upvals.alloc(uv))
    }

    fn free_upval(&mut self, uv: GcIdx<UpVal>) {
        self.heap.upvals.free(uv);
        self.gc.account_free(UpVal::SIZE);
    }

    /// Give every missing upvalue of `cl` a fresh closed cell holding nil.
    pub fn init_closed_upvals(&mut self, cl: GcIdx<LuaClosure>) -> Result<(), LuaError> {
        for i in 0..self.heap.closure(cl).upvalues.len() {
            if self.heap.closure(cl).upvalues[i].is_none() {
                let uv = self.alloc_upval(UpVal {
                    refcount: 1,
                    location: UpValLocation::Closed(TValue::Nil),
                })?;
                self.heap.closure_mut(cl).upvalues[i] = Some(uv);
            }
        }
        Ok(())
    }

    /// Find the open upvalue for `level` in `thread`, creating it if needed.
    pub fn find_upval(&mut self, thread: GcIdx<LuaThread>, level: usize) -> Result<GcIdx<UpVal>, LuaError> {
        let mut prev: Option<GcIdx<UpVal>> = None;
        let mut cur = self.heap.thread(thread).open_upval;
        while let Some(uv) = cur {
            let UpValLocation::Open { slot, next, .. } = self.heap.upvals.get(uv).location else {
                break;
            };
            if slot < level {
                break;
            }
            if slot == level {
                return Ok(uv);
            }
            prev = Some(uv);
            cur = next;
        }
        let uv = self.alloc_upval(UpVal {
            refcount: 0,
            location: UpValLocation::Open {
                thread,
                slot: level,
                next: cur,
                touched: true,
            },
        })?;
        match prev {
            None => self.heap.thread_mut(thread).open_upval = Some(uv),
            Some(p) => {
                if let UpValLocation::Open { next, .. } = &mut self.heap.upvals.get_mut(p).location {
                    *next = Some(uv);
                }
            }
        }
        self.twups.insert(thread);
        Ok(uv)
    }

    /// Capture stack slot `level` of `thread` as upvalue `i` of `cl`.
    pub fn capture_upval(
        &mut self,
        cl: GcIdx<LuaClosure>,
        i: usize,
        thread: GcIdx<LuaThread>,
        level: usize,
    ) -> Result<(), LuaError> {
        let uv = self.find_upval(thread, level)?;
        self.heap.upvals.get_mut(uv).refcount += 1;
        let old = self.heap.closure_mut(cl).upvalues[i].replace(uv);
        if let Some(old) = old {
            self.upval_dec(old);
        }
        Ok(())
    }

    /// Close every open upvalue of `thread` at or above stack slot `level`.
    pub fn close_upvals(&mut self, thread: GcIdx<LuaThread>, level: usize) {
        while let Some(uv) = self.heap.thread(thread).open_upval {
            let u = *self.heap.upvals.get(uv);
            let UpValLocation::Open { slot, next, .. } = u.location else {
                break;
            };
            if slot < level {
                break;
            }
            self.heap.thread_mut(thread).open_upval = next;
            if u.refcount == 0 {
                self.free_upval(uv);
            } else {
                let v = self.heap.thread(thread).stack[slot];
                self.heap.upvals.get_mut(uv).location = UpValLocation::Closed(v);
                self.upval_barrier(v);
            }
        }
    }

    /// Drop one reference; a closed upvalue with no users is freed.
    pub fn upval_dec(&mut self, uv: GcIdx<UpVal>) {
        let u = self.heap.upvals.get_mut(uv);
        debug_assert!(u.refcount > 0);
        u.refcount -= 1;
        if u.refcount == 0 && !u.is_open() {
            self.free_upval(uv);
        }
    }

    pub fn upval_get(&self, uv: GcIdx<UpVal>) -> TValue {
        match self.heap.upvals.get(uv).location {
            UpValLocation::Open { thread, slot, .. } => self.heap.thread(thread).stack[slot],
            UpValLocation::Closed(v) => v,
        }
    }

    /// Write through an upvalue. Stores into open upvalues need no barrier
    /// because threads are never black.
    pub fn upval_set(&mut self, uv: GcIdx<UpVal>, v: TValue) {
        match &mut self.heap.upvals.get_mut(uv).location {
            UpValLocation::Open { thread, slot, .. } => {
                let (thread, slot) = (*thread, *slot);
                self.heap.thread_mut(thread).stack[slot] = v;
            }
            UpValLocation::Closed(cell) => {
                *cell = v;
                self.upval_barrier(v);
            }
        }
    }

    /// Value of upvalue `i` of a closure, if it has one.
    pub fn closure_upval(&self, cl: GcIdx<LuaClosure>, i: usize) -> Option<TValue> {
        let uv = (*self.heap.closure(cl).upvalues.get(i)?)?;
        Some(self.upval_get(uv))
    }

    pub fn set_closure_upval(&mut self, cl: GcIdx<LuaClosure>, i: usize, v: TValue) -> bool {
        match self.heap.closure(cl).upvalues.get(i).copied().flatten() {
            Some(uv) => {
                self.upval_set(uv, v);
                true
            }
            None => false,
        }
    }

    /// Make upvalue `n1` of `f1` refer to upvalue `n2` of `f2`.
    pub fn upvalue_join(&mut self, f1: GcIdx<LuaClosure>, n1: usize, f2: GcIdx<LuaClosure>, n2: usize) {
        let target = self.heap.closure(f2).upvalues[n2];
        let old = std::mem::replace(&mut self.heap.closure_mut(f1).upvalues[n1], target);
        if let Some(old) = old {
            self.upval_dec(old);
        }
        if let Some(uv) = target {
            let u = self.heap.upvals.get_mut(uv);
            u.refcount += 1;
            if let UpValLocation::Open { touched, .. } = &mut u.location {
                *touched = true;
            }
            let v = self.upval_get(uv);
            if !self.heap.upvals.get(uv).is_open() {
                self.upval_barrier(v);
            }
        }
    }

    /// Identity of an upvalue cell, for comparing sharing between closures.
    pub fn upvalue_id(&self, cl: GcIdx<LuaClosure>, n: usize) -> Option<GcIdx<UpVal>> {
        self.heap.closure(cl).upvalues.get(n).copied().flatten()
    }
}
