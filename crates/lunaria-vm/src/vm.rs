//! The embedding surface: a value stack addressed by indices relative to
//! the running frame, in the manner of a native function API.
//!
//! Positive indices count from the first argument of the current frame
//! (1-based); negative indices count down from the top. [`REGISTRY_INDEX`]
//! names the registry and [`upvalue_index`] the upvalues of the running
//! native closure.

use lunaria_core::callinfo::MULTRET;
use lunaria_core::collector::{check_gc, free_all_objects};
use lunaria_core::config::RuntimeConfig;
use lunaria_core::error::{LuaError, ThreadStatus};
use lunaria_core::func::{ContinuationId, LuaClosure, NativeFnId, UpVal};
use lunaria_core::gc::GcIdx;
use lunaria_core::object::{lua_type_name, GcRef, Userdata};
use lunaria_core::state::{GlobalState, LuaThread};
use lunaria_core::value::{float_to_integer, TValue};

/// Pseudo-index of the registry.
pub const REGISTRY_INDEX: i32 = -1_000_000 - 1000;

/// Pseudo-index of upvalue `i` (1-based) of the running native closure.
pub const fn upvalue_index(i: i32) -> i32 {
    REGISTRY_INDEX - i
}

/// A host function. Arguments are the frame's stack values; it returns how
/// many values on top of the stack are its results.
pub type NativeFn = fn(&mut Vm) -> Result<usize, LuaError>;

/// Continuation of a host frame interrupted by a yield or an error
/// inside a yieldable protected call.
pub type KFunction = fn(&mut Vm, ThreadStatus, isize) -> Result<usize, LuaError>;

/// Runs the scripted closure of the current frame and returns its result
/// count, like a [`NativeFn`]. After a yield the executor is entered again
/// for an interrupted frame and continues from [`Vm::frame_pc`].
pub type Executor = fn(&mut Vm, GcIdx<LuaClosure>) -> Result<usize, LuaError>;

/// Resolved location of an API index.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ApiSlot {
    Stack(usize),
    Registry,
    Upvalue(usize),
    /// An acceptable index past the top.
    None,
}

/// One runtime instance.
pub struct Vm {
    pub g: Box<GlobalState>,
    pub(crate) natives: Vec<NativeFn>,
    pub(crate) continuations: Vec<KFunction>,
    pub(crate) executor: Option<Executor>,
}

impl Vm {
    pub fn new(config: RuntimeConfig) -> Result<Self, LuaError> {
        let g = GlobalState::new(config)?;
        Ok(Vm {
            g,
            natives: Vec::new(),
            continuations: Vec::new(),
            executor: None,
        })
    }

    pub fn register_native(&mut self, f: NativeFn) -> NativeFnId {
        self.natives.push(f);
        NativeFnId(self.natives.len() as u32 - 1)
    }

    pub fn register_continuation(&mut self, k: KFunction) -> ContinuationId {
        self.continuations.push(k);
        ContinuationId(self.continuations.len() as u32 - 1)
    }

    /// Install the executor for scripted closures.
    pub fn set_executor(&mut self, exec: Executor) {
        self.executor = Some(exec);
    }

    // ---- Running thread ----

    #[inline]
    pub fn running(&self) -> GcIdx<LuaThread> {
        self.g.running
    }

    #[inline]
    pub(crate) fn thread(&self) -> &LuaThread {
        self.g.heap.thread(self.g.running)
    }

    #[inline]
    pub(crate) fn thread_mut(&mut self) -> &mut LuaThread {
        let th = self.g.running;
        self.g.heap.thread_mut(th)
    }

    /// Absolute slot of the current frame's function.
    #[inline]
    pub(crate) fn frame_func(&self) -> usize {
        self.thread().ci().func
    }

    #[inline]
    pub(crate) fn top_slot(&self) -> usize {
        self.thread().top
    }

    pub(crate) fn slot_of(&self, idx: i32) -> ApiSlot {
        let t = self.thread();
        let func = t.ci().func;
        if idx > 0 {
            let slot = func + idx as usize;
            if slot < t.top {
                ApiSlot::Stack(slot)
            } else {
                ApiSlot::None
            }
        } else if idx > REGISTRY_INDEX {
            debug_assert!(idx != 0 && (-idx) as usize <= t.top - (func + 1), "invalid index {idx}");
            ApiSlot::Stack(t.top - (-idx) as usize)
        } else if idx == REGISTRY_INDEX {
            ApiSlot::Registry
        } else {
            ApiSlot::Upvalue((REGISTRY_INDEX - idx) as usize)
        }
    }

    /// Stack slot of a valid, non-pseudo index.
    pub(crate) fn stack_slot(&self, idx: i32) -> Result<usize, LuaError> {
        match self.slot_of(idx) {
            ApiSlot::Stack(s) => Ok(s),
            _ => Err(LuaError::Runtime(format!("invalid stack index {idx}"))),
        }
    }

    /// Value at `idx`; nil for an acceptable index with no value.
    pub fn value_at(&self, idx: i32) -> TValue {
        match self.slot_of(idx) {
            ApiSlot::Stack(s) => self.thread().stack[s],
            ApiSlot::Registry => TValue::Table(self.g.registry),
            ApiSlot::Upvalue(n) => match self.thread().stack[self.frame_func()] {
                TValue::Native(c) => self.g.heap.native(c).upvalues.get(n - 1).copied().unwrap_or_default(),
                _ => TValue::Nil,
            },
            ApiSlot::None => TValue::Nil,
        }
    }

    fn set_value_at(&mut self, idx: i32, v: TValue) -> Result<(), LuaError> {
        match self.slot_of(idx) {
            ApiSlot::Stack(s) => {
                self.thread_mut().stack[s] = v;
                Ok(())
            }
            ApiSlot::Upvalue(n) => match self.thread().stack[self.frame_func()] {
                TValue::Native(c) if n >= 1 && n <= self.g.heap.native(c).upvalues.len() => {
                    self.g.heap.native_mut(c).upvalues[n - 1] = v;
                    self.g.barrier(GcRef::Native(c), v);
                    Ok(())
                }
                _ => Err(LuaError::Runtime(format!("invalid upvalue index {n}"))),
            },
            ApiSlot::Registry | ApiSlot::None => Err(LuaError::Runtime(format!("invalid stack index {idx}"))),
        }
    }

    /// Saved program counter of the current frame.
    pub fn frame_pc(&self) -> usize {
        self.thread().ci().saved_pc
    }

    pub fn set_frame_pc(&mut self, pc: usize) {
        self.thread_mut().ci_mut().saved_pc = pc;
    }

    /// Active frames of the running thread, the base frame included.
    pub fn call_depth(&self) -> usize {
        self.thread().frames.depth()
    }

    // ---- Basic stack manipulation ----

    /// Convert a relative index into one that stays valid as the stack changes.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            (self.top_slot() - self.frame_func()) as i32 + idx
        }
    }

    /// Number of values in the current frame.
    pub fn get_top(&self) -> usize {
        self.top_slot() - (self.frame_func() + 1)
    }

    /// Set the top to `idx`, filling new slots with nil. Negative indices
    /// count from the current top.
    pub fn set_top(&mut self, idx: i32) {
        let func = self.frame_func();
        let t = self.thread_mut();
        if idx >= 0 {
            let new_top = func + 1 + idx as usize;
            debug_assert!(new_top <= t.stack_last(), "new top too large");
            for slot in t.top..new_top {
                t.stack[slot] = TValue::Nil;
            }
            t.top = new_top;
        } else {
            debug_assert!((-(idx + 1)) as usize <= t.top - (func + 1), "invalid new top");
            t.top = (t.top as i64 + idx as i64 + 1) as usize;
        }
    }

    pub fn pop(&mut self, n: usize) {
        self.set_top(-(n as i32) - 1);
    }

    /// Make room for `n` more values, growing the stack if needed.
    pub fn check_stack(&mut self, n: usize) -> Result<(), LuaError> {
        let th = self.g.running;
        self.g.check_stack(th, n)?;
        let t = self.thread_mut();
        let want = t.top + n;
        let ci = t.ci_mut();
        if ci.top < want {
            ci.top = want;
        }
        Ok(())
    }

    #[inline]
    pub fn push(&mut self, v: TValue) {
        let t = self.thread_mut();
        debug_assert!(t.top < t.ci().top, "stack overflow (missing check_stack)");
        let top = t.top;
        t.stack[top] = v;
        t.top += 1;
    }

    pub fn push_nil(&mut self) {
        self.push(TValue::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push(TValue::Bool(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.push(TValue::Int(i));
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(TValue::Float(n));
    }

    pub fn push_string(&mut self, s: &str) -> Result<(), LuaError> {
        let id = self.g.new_str(s)?;
        self.push(TValue::Str(id));
        check_gc(self)
    }

    pub fn push_bytes(&mut self, b: &[u8]) -> Result<(), LuaError> {
        let id = self.g.new_string(b)?;
        self.push(TValue::Str(id));
        check_gc(self)
    }

    /// Push a string from a literal, going through the literal cache.
    pub fn push_literal(&mut self, s: &'static str) -> Result<(), LuaError> {
        let id = self.g.new_literal(s)?;
        self.push(TValue::Str(id));
        check_gc(self)
    }

    pub fn push_value(&mut self, idx: i32) {
        let v = self.value_at(idx);
        self.push(v);
    }

    /// Move the top value into position `idx`, shifting the values above up.
    pub fn insert(&mut self, idx: i32) -> Result<(), LuaError> {
        self.rotate(idx, 1)
    }

    pub fn remove(&mut self, idx: i32) -> Result<(), LuaError> {
        self.rotate(idx, -1)?;
        self.pop(1);
        Ok(())
    }

    /// Rotate the values from `idx` to the top by `n` positions toward the top.
    pub fn rotate(&mut self, idx: i32, n: i32) -> Result<(), LuaError> {
        let start = self.stack_slot(idx)?;
        let t = self.thread_mut();
        let seg = &mut t.stack[start..t.top];
        let len = seg.len();
        if len == 0 {
            return Ok(());
        }
        let shift = n.unsigned_abs() as usize % len;
        if n >= 0 {
            seg.rotate_right(shift);
        } else {
            seg.rotate_left(shift);
        }
        Ok(())
    }

    /// Pop the top value into position `idx`.
    pub fn replace(&mut self, idx: i32) -> Result<(), LuaError> {
        let v = self.value_at(-1);
        self.set_value_at(idx, v)?;
        self.pop(1);
        Ok(())
    }

    pub fn copy(&mut self, from: i32, to: i32) -> Result<(), LuaError> {
        let v = self.value_at(from);
        self.set_value_at(to, v)
    }

    // ---- Access ----

    /// Type name of the value at `idx`, "no value" past the top.
    pub fn type_name(&self, idx: i32) -> &'static str {
        match self.slot_of(idx) {
            ApiSlot::None => "no value",
            _ => lua_type_name(self.value_at(idx)),
        }
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        self.value_at(idx).is_nil()
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).is_truthy()
    }

    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        match self.value_at(idx) {
            TValue::Int(i) => Some(i),
            TValue::Float(f) => float_to_integer(f),
            _ => None,
        }
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        match self.value_at(idx) {
            TValue::Int(i) => Some(i as f64),
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Contents of a string value, lossily decoded.
    pub fn to_str(&self, idx: i32) -> Option<String> {
        match self.value_at(idx) {
            TValue::Str(id) => Some(self.g.string_lossy(id)),
            _ => None,
        }
    }

    pub fn to_thread(&self, idx: i32) -> Option<GcIdx<LuaThread>> {
        self.value_at(idx).as_thread_idx()
    }

    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        self.value_at(a).raw_equals(&self.value_at(b), &self.g.strings)
    }

    /// Raw length: bytes of a string, border of a table, bytes of a userdata.
    pub fn raw_len(&self, idx: i32) -> u64 {
        match self.value_at(idx) {
            TValue::Str(id) => self.g.strings.get(id).len() as u64,
            TValue::Table(t) => self.g.table_len(t),
            TValue::Userdata(u) => self.g.heap.udata(u).data.len() as u64,
            _ => 0,
        }
    }

    // ---- Tables ----

    fn table_at(&self, idx: i32) -> Result<GcIdx<lunaria_core::table::Table>, LuaError> {
        self.value_at(idx).as_table_idx().ok_or_else(|| {
            LuaError::Runtime(format!("table expected, got {}", self.type_name(idx)))
        })
    }

    pub fn create_table(&mut self, narray: usize, nhash: usize) -> Result<(), LuaError> {
        let t = self.g.new_table(narray, nhash)?;
        self.push(TValue::Table(t));
        check_gc(self)
    }

    /// Replace the key on top with `t[key]`, without metamethods.
    pub fn raw_get(&mut self, idx: i32) -> Result<TValue, LuaError> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-1);
        let v = self.g.table_get(t, key);
        self.pop(1);
        self.push(v);
        Ok(v)
    }

    pub fn raw_get_i(&mut self, idx: i32, n: i64) -> Result<TValue, LuaError> {
        let t = self.table_at(idx)?;
        let v = self.g.table_get_int(t, n);
        self.push(v);
        Ok(v)
    }

    pub fn raw_get_field(&mut self, idx: i32, k: &str) -> Result<TValue, LuaError> {
        let t = self.table_at(idx)?;
        let v = self.g.table_get_str(t, k);
        self.push(v);
        Ok(v)
    }

    /// `t[key] = value` with key and value on top; pops both.
    pub fn raw_set(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-2);
        let v = self.value_at(-1);
        self.g.table_set(t, key, v)?;
        self.pop(2);
        Ok(())
    }

    pub fn raw_set_i(&mut self, idx: i32, n: i64) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let v = self.value_at(-1);
        self.g.table_set_int(t, n, v)?;
        self.pop(1);
        Ok(())
    }

    pub fn raw_set_field(&mut self, idx: i32, k: &str) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let v = self.value_at(-1);
        self.g.table_set_str(t, k, v)?;
        self.pop(1);
        Ok(())
    }

    /// Pop a key and push the next key-value pair of the table at `idx`.
    /// Returns false, pushing nothing, at the end of the traversal.
    pub fn next(&mut self, idx: i32) -> Result<bool, LuaError> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-1);
        let entry = self.g.table_next(t, key)?;
        self.pop(1);
        match entry {
            Some((k, v)) => {
                self.push(k);
                self.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_global(&mut self, name: &str) -> Result<TValue, LuaError> {
        let v = self.g.table_get_str(self.g.globals(), name);
        self.push(v);
        Ok(v)
    }

    /// Pop a value into global `name`.
    pub fn set_global(&mut self, name: &str) -> Result<(), LuaError> {
        let v = self.value_at(-1);
        let globals = self.g.globals();
        self.g.table_set_str(globals, name, v)?;
        self.pop(1);
        Ok(())
    }

    // ---- Metatables ----

    /// Push the metatable of the value at `idx`, if it has one.
    pub fn get_metatable(&mut self, idx: i32) -> bool {
        match self.g.get_metatable(&self.value_at(idx)) {
            Some(mt) => {
                self.push(TValue::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`.
    pub fn set_metatable(&mut self, idx: i32) -> Result<(), LuaError> {
        let mt = match self.value_at(-1) {
            TValue::Nil => None,
            TValue::Table(t) => Some(t),
            other => {
                return Err(LuaError::Runtime(format!(
                    "metatable must be a table or nil, got {}",
                    other.type_name()
                )))
            }
        };
        let obj = self.value_at(idx);
        self.g.set_metatable(obj, mt);
        self.pop(1);
        Ok(())
    }

    // ---- Userdata ----

    pub fn new_userdata(&mut self, size: usize) -> Result<GcIdx<Userdata>, LuaError> {
        let u = self.g.new_userdata(size)?;
        self.push(TValue::Userdata(u));
        check_gc(self)?;
        Ok(u)
    }

    pub fn userdata_bytes(&mut self, idx: i32) -> Option<&mut [u8]> {
        let u = self.value_at(idx).as_userdata_idx()?;
        Some(&mut self.g.heap.udata_mut(u).data)
    }

    /// Pop a value into the user value of the userdata at `idx`.
    pub fn set_user_value(&mut self, idx: i32) -> Result<(), LuaError> {
        let u = self
            .value_at(idx)
            .as_userdata_idx()
            .ok_or_else(|| LuaError::Runtime("userdata expected".into()))?;
        let v = self.value_at(-1);
        self.g.set_user_value(u, v);
        self.pop(1);
        Ok(())
    }

    pub fn get_user_value(&mut self, idx: i32) -> TValue {
        let v = match self.value_at(idx) {
            TValue::Userdata(u) => self.g.heap.udata(u).user_value,
            _ => TValue::Nil,
        };
        self.push(v);
        v
    }

    // ---- Closures and upvalues ----

    /// Pop `nup` values and push a native closure holding them as upvalues.
    pub fn push_native(&mut self, f: NativeFnId, name: &'static str, nup: usize) -> Result<(), LuaError> {
        let top = self.top_slot();
        let upvalues = self.thread().stack[top - nup..top].to_vec();
        let c = self.g.new_native_closure(f, name, upvalues)?;
        self.pop(nup);
        self.push(TValue::Native(c));
        check_gc(self)
    }

    /// Push a scripted closure for prototype `proto_idx` whose upvalues are
    /// fresh closed cells holding nil.
    pub fn push_lua_closure(&mut self, proto_idx: usize, nup: usize) -> Result<GcIdx<LuaClosure>, LuaError> {
        let cl = self.g.new_lua_closure(proto_idx, nup)?;
        self.push(TValue::LuaFn(cl));
        self.g.init_closed_upvals(cl)?;
        check_gc(self)?;
        Ok(cl)
    }

    /// Make upvalue `n` (1-based) of the closure at `funcidx` capture the
    /// stack slot at `local`, sharing the cell with other captures of it.
    pub fn capture_local(&mut self, funcidx: i32, n: usize, local: i32) -> Result<(), LuaError> {
        let cl = match self.value_at(funcidx) {
            TValue::LuaFn(cl) => cl,
            _ => return Err(LuaError::Runtime("scripted closure expected".into())),
        };
        let slot = self.stack_slot(local)?;
        let th = self.g.running;
        self.g.capture_upval(cl, n - 1, th, slot)
    }

    /// Close the open upvalues at or above stack index `idx`.
    pub fn close_upvalues(&mut self, idx: i32) -> Result<(), LuaError> {
        let slot = self.stack_slot(idx)?;
        let th = self.g.running;
        self.g.close_upvals(th, slot);
        Ok(())
    }

    /// Push upvalue `n` (1-based) of the closure at `funcidx`.
    pub fn get_upvalue(&mut self, funcidx: i32, n: usize) -> Option<TValue> {
        let v = match self.value_at(funcidx) {
            TValue::LuaFn(cl) => self.g.closure_upval(cl, n.checked_sub(1)?)?,
            TValue::Native(c) => *self.g.heap.native(c).upvalues.get(n.checked_sub(1)?)?,
            _ => return None,
        };
        self.push(v);
        Some(v)
    }

    /// Pop a value into upvalue `n` of the closure at `funcidx`.
    pub fn set_upvalue(&mut self, funcidx: i32, n: usize) -> bool {
        let v = self.value_at(-1);
        let Some(i) = n.checked_sub(1) else { return false };
        let done = match self.value_at(funcidx) {
            TValue::LuaFn(cl) => self.g.set_closure_upval(cl, i, v),
            TValue::Native(c) if i < self.g.heap.native(c).upvalues.len() => {
                self.g.heap.native_mut(c).upvalues[i] = v;
                self.g.barrier(GcRef::Native(c), v);
                true
            }
            _ => false,
        };
        if done {
            self.pop(1);
        }
        done
    }

    /// Identity of the cell behind upvalue `n` of the scripted closure at `funcidx`.
    pub fn upvalue_id(&self, funcidx: i32, n: usize) -> Option<GcIdx<UpVal>> {
        let cl = self.value_at(funcidx);
        self.g.upvalue_id(cl.as_lua_closure()?, n.checked_sub(1)?)
    }

    /// Make upvalue `n1` of closure `f1` refer to upvalue `n2` of closure `f2`.
    pub fn upvalue_join(&mut self, f1: i32, n1: usize, f2: i32, n2: usize) -> Result<(), LuaError> {
        let (Some(c1), Some(c2)) = (self.value_at(f1).as_lua_closure(), self.value_at(f2).as_lua_closure()) else {
            return Err(LuaError::Runtime("scripted closures expected".into()));
        };
        self.g.upvalue_join(c1, n1 - 1, c2, n2 - 1);
        Ok(())
    }

    // ---- Errors ----

    /// Pop the top value as an error object.
    pub fn error(&mut self) -> LuaError {
        let v = self.value_at(-1);
        self.pop(1);
        LuaError::Value(v)
    }

    /// Results wanted by a call: all of them, or exactly `n`.
    pub(crate) fn wanted(nresults: i32) -> Option<usize> {
        (nresults != MULTRET).then_some(nresults as usize)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let main = self.g.main_thread;
        self.g.running = main;
        let t = self.g.heap.thread_mut(main);
        let base = t.frames.base();
        t.frames.set_current(base);
        t.n_ccalls = 0;
        free_all_objects(self);
    }
}
