//! Execution state: threads with their stacks and frames, and the global
//! state shared by every thread of one runtime instance.

use crate::callinfo::{CallInfo, CallStack, FrameId};
use crate::collector::GcState;
use crate::config::RuntimeConfig;
use crate::error::{LuaError, ThreadStatus};
use crate::func::UpVal;
use crate::gc::{GcHeap, GcIdx};
use crate::object::{GcRef, TagMethod, Userdata};
use crate::string::{lua_hash, StringId, StringInterner};
use crate::table::{normalize_key, Table, MAXASIZE, MAXHBITS};
use crate::value::TValue;
use indexmap::IndexSet;

/// Slots guaranteed free to a host function on entry.
pub const LUA_MINSTACK: usize = 20;
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;
/// Slots kept past `stack_last` for metamethod calls and error handling.
pub const EXTRA_STACK: usize = 5;
/// Slots granted on top of the maximum while a stack overflow is handled.
pub const ERROR_STACK_EXTRA: usize = 200;

/// Registry slot holding the main thread.
pub const RIDX_MAINTHREAD: i64 = 1;
/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 2;

/// Number of basic types, each with a metatable slot in the global state.
pub const NUM_TYPES: usize = 9;

/// Index of the basic type of `v`, used for per-type metatables.
pub fn type_tag(v: &TValue) -> usize {
    match v {
        TValue::Nil => 0,
        TValue::Bool(_) => 1,
        TValue::Int(_) | TValue::Float(_) => 3,
        TValue::Str(_) => 4,
        TValue::Table(_) => 5,
        TValue::LuaFn(_) | TValue::Native(_) => 6,
        TValue::Userdata(_) => 7,
        TValue::Thread(_) => 8,
    }
}

/// A thread of execution: a value stack, its frames and its open upvalues.
#[derive(Debug)]
pub struct LuaThread {
    pub stack: Vec<TValue>,
    /// First free slot.
    pub top: usize,
    pub frames: CallStack,
    pub status: ThreadStatus,
    /// Open upvalues, highest slot first.
    pub open_upval: Option<GcIdx<UpVal>>,
    /// Nested host calls.
    pub n_ccalls: u16,
    /// Non-yieldable calls in the stack.
    pub nny: u16,
    /// Stack slot of the current error handler, 0 for none.
    pub errfunc: usize,
}

impl Default for LuaThread {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaThread {
    pub fn new() -> Self {
        LuaThread {
            stack: vec![TValue::Nil; BASIC_STACK_SIZE + EXTRA_STACK],
            // slot 0 is the entry "function" of the base frame
            top: 1,
            frames: CallStack::new(0, 1 + LUA_MINSTACK),
            status: ThreadStatus::Ok,
            open_upval: None,
            n_ccalls: 0,
            nny: 1,
            errfunc: 0,
        }
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Last usable slot; the ones after it are the extra reserve.
    #[inline]
    pub fn stack_last(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    #[inline]
    pub fn ci(&self) -> &CallInfo {
        self.frames.ci()
    }

    #[inline]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        self.frames.ci_mut()
    }

    pub fn is_yieldable(&self) -> bool {
        self.nny == 0
    }

    /// Accounted size: the thread itself, its stack and its frame nodes.
    pub fn mem_size(&self) -> usize {
        Self::base_size()
            + self.stack.len() * std::mem::size_of::<TValue>()
            + self.frames.len() * std::mem::size_of::<CallInfo>()
    }

    fn base_size() -> usize {
        std::mem::size_of::<LuaThread>()
    }

    /// Number of slots reachable from the current top or any active frame.
    pub fn stack_in_use(&self) -> usize {
        let lim = self.frames.active().map(|ci| ci.top).fold(self.top, usize::max);
        lim + 1
    }
}

/// State shared by all threads of a runtime: the heap, the string table,
/// the collector and the registry.
pub struct GlobalState {
    pub heap: GcHeap,
    pub strings: StringInterner,
    pub gc: GcState,
    pub registry: GcIdx<Table>,
    pub main_thread: GcIdx<LuaThread>,
    /// Thread currently running; it is marked in every atomic phase.
    pub running: GcIdx<LuaThread>,
    /// Metatables for basic types other than tables and userdata.
    pub type_metatables: [Option<GcIdx<Table>>; NUM_TYPES],
    /// Interned tag-method names, indexed by [`TagMethod`].
    pub tm_names: [StringId; TagMethod::ALL.len()],
    /// Preallocated message for memory errors.
    pub mem_err_msg: StringId,
    /// Threads that may have open upvalues.
    pub twups: IndexSet<GcIdx<LuaThread>>,
    pub config: RuntimeConfig,
}

impl GlobalState {
    /// Build a runtime: main thread, registry, string table, fixed strings.
    pub fn new(config: RuntimeConfig) -> Result<Box<GlobalState>, LuaError> {
        let gc = GcState::new(&config);
        let mut heap = GcHeap::new();
        let main = GcIdx::new(heap.threads.alloc(LuaThread::new(), gc.current_white));
        let registry = GcIdx::new(heap.tables.alloc(Table::new(2, 0), gc.current_white));
        let seed = config.seed.unwrap_or_else(make_seed);
        let mut g = Box::new(GlobalState {
            heap,
            strings: StringInterner::new(seed),
            gc,
            registry,
            main_thread: main,
            running: main,
            type_metatables: [None; NUM_TYPES],
            tm_names: [StringId(0); TagMethod::ALL.len()],
            mem_err_msg: StringId(0),
            twups: IndexSet::new(),
            config,
        });
        g.gc.set_total(std::mem::size_of::<GlobalState>() + g.heap.thread(main).mem_size());
        let reg_size = g.heap.table(registry).mem_size();
        g.reserve(reg_size)?;
        g.link_new(GcRef::Table(registry), reg_size);

        g.resize_string_table(g.config.string_table_size())?;
        let msg = g.new_string(b"not enough memory")?;
        g.fix_object(GcRef::String(msg));
        g.mem_err_msg = msg;
        g.strings.init_cache(msg);
        for tm in TagMethod::ALL {
            let name = g.new_str(tm.name())?;
            g.fix_object(GcRef::String(name));
            g.tm_names[tm as usize] = name;
        }

        let globals = g.new_table(0, 0)?;
        g.table_set_int(registry, RIDX_MAINTHREAD, TValue::Thread(main))?;
        g.table_set_int(registry, RIDX_GLOBALS, TValue::Table(globals))?;

        g.gc.complete = true;
        g.gc.running = true;
        tracing::debug!(seed, bytes = g.gc.total_bytes(), "runtime state created");
        Ok(g)
    }

    /// Current accounted heap size in bytes.
    pub fn total_bytes(&self) -> usize {
        self.gc.total_bytes()
    }

    // ---- Threads ----

    /// Create a new thread sharing this global state. The caller must anchor it.
    pub fn new_thread(&mut self) -> Result<GcIdx<LuaThread>, LuaError> {
        let th = LuaThread::new();
        let size = th.mem_size();
        self.reserve(size)?;
        let idx = GcIdx::new(self.heap.threads.alloc(th, self.gc.current_white));
        self.link_new(GcRef::Thread(idx), size);
        Ok(idx)
    }

    #[inline]
    pub fn thread_stack_set(&mut self, th: GcIdx<LuaThread>, slot: usize, v: TValue) {
        self.heap.thread_mut(th).stack[slot] = v;
    }

    /// Ensure `n` free slots above the top of `th`.
    pub fn check_stack(&mut self, th: GcIdx<LuaThread>, n: usize) -> Result<(), LuaError> {
        let t = self.heap.thread(th);
        if t.stack_last().saturating_sub(t.top) <= n {
            self.grow_stack(th, n)?;
        }
        Ok(())
    }

    /// Grow the stack of `th` to fit `n` more slots, doubling when possible.
    pub fn grow_stack(&mut self, th: GcIdx<LuaThread>, n: usize) -> Result<(), LuaError> {
        let max = self.config.max_stack;
        let (size, top) = {
            let t = self.heap.thread(th);
            (t.stack_size(), t.top)
        };
        if size > max {
            // already using the error reserve
            return Err(LuaError::ErrorInHandler);
        }
        let needed = top + n + EXTRA_STACK;
        let newsize = (2 * size).min(max).max(needed);
        if newsize > max {
            self.realloc_stack(th, max + ERROR_STACK_EXTRA)?;
            tracing::debug!(thread = th.0, "stack overflow");
            return Err(LuaError::StackOverflow);
        }
        self.realloc_stack(th, newsize)
    }

    /// Resize the stack of `th` to exactly `newsize` slots.
    pub fn realloc_stack(&mut self, th: GcIdx<LuaThread>, newsize: usize) -> Result<(), LuaError> {
        let slot = std::mem::size_of::<TValue>();
        let old = self.heap.thread(th).stack_size();
        if newsize <= old {
            self.truncate_stack(th, newsize);
            return Ok(());
        }
        self.reserve((newsize - old) * slot)?;
        self.gc.account_alloc((newsize - old) * slot);
        self.heap.thread_mut(th).stack.resize(newsize, TValue::Nil);
        Ok(())
    }

    /// Cut the stack of `th` down to `newsize` slots. Never allocates.
    pub fn truncate_stack(&mut self, th: GcIdx<LuaThread>, newsize: usize) {
        let t = self.heap.thread_mut(th);
        let old = t.stack_size();
        debug_assert!(newsize <= old);
        t.stack.truncate(newsize);
        t.stack.shrink_to_fit();
        self.gc.account_free((old - newsize) * std::mem::size_of::<TValue>());
    }

    /// Give back stack slots and frame nodes a thread no longer needs.
    pub fn shrink_stack(&mut self, th: GcIdx<LuaThread>) {
        let max = self.config.max_stack;
        let (inuse, size) = {
            let t = self.heap.thread(th);
            (t.stack_in_use(), t.stack_size())
        };
        let goodsize = (inuse + inuse / 8 + 2 * EXTRA_STACK).min(max);
        let freed = if size > max {
            // the frame list grew while handling an overflow
            self.heap.thread_mut(th).frames.free_unused()
        } else {
            self.heap.thread_mut(th).frames.shrink()
        };
        self.gc.account_free(freed * std::mem::size_of::<CallInfo>());
        if inuse <= max.saturating_sub(EXTRA_STACK) && goodsize < size {
            self.truncate_stack(th, goodsize);
        }
    }

    /// Enter a new frame in `th`, reusing a cached node when there is one.
    pub fn next_frame(&mut self, th: GcIdx<LuaThread>) -> Result<FrameId, LuaError> {
        if self.heap.thread(th).frames.peek_next().is_none() {
            let size = std::mem::size_of::<CallInfo>();
            self.reserve(size)?;
            self.gc.account_alloc(size);
            self.heap.thread_mut(th).frames.extend();
        }
        Ok(self.heap.thread_mut(th).frames.push())
    }

    /// Free every cached frame node above the current frame of `th`.
    pub fn free_frames(&mut self, th: GcIdx<LuaThread>) {
        let freed = self.heap.thread_mut(th).frames.free_unused();
        self.gc.account_free(freed * std::mem::size_of::<CallInfo>());
    }

    // ---- Tables ----

    pub fn new_table(&mut self, narray: usize, nhash: usize) -> Result<GcIdx<Table>, LuaError> {
        self.reserve(table_size_estimate(narray, nhash)?)?;
        let table = Table::with_sizes(narray, nhash)?;
        let size = table.mem_size();
        let idx = GcIdx::new(self.heap.tables.alloc(table, self.gc.current_white));
        self.link_new(GcRef::Table(idx), size);
        Ok(idx)
    }

    #[inline]
    pub fn table_get(&self, t: GcIdx<Table>, key: TValue) -> TValue {
        self.heap.table(t).get(key, &self.strings)
    }

    #[inline]
    pub fn table_get_int(&self, t: GcIdx<Table>, key: i64) -> TValue {
        self.heap.table(t).get_int(key)
    }

    /// Get by string key. A key that was never interned cannot be present.
    pub fn table_get_str(&self, t: GcIdx<Table>, key: &str) -> TValue {
        let bytes = key.as_bytes();
        let hash = lua_hash(bytes, self.strings.seed());
        if bytes.len() > crate::string::MAX_SHORT_LEN {
            return self.heap.table(t).get_long_str(bytes, hash, &self.strings);
        }
        match self.strings.find_short(bytes, hash) {
            Some(id) => self.table_get(t, TValue::Str(id)),
            None => TValue::Nil,
        }
    }

    /// Raw set with rehash, memory accounting and the backward barrier.
    pub fn table_set(&mut self, t: GcIdx<Table>, key: TValue, val: TValue) -> Result<(), LuaError> {
        let key = normalize_key(key)?;
        if !self.heap.table_mut(t).try_set(key, val, &self.strings) {
            // the key and value may be reachable from nowhere else while the
            // resize allocates
            let mark = self.anchor(&[TValue::Table(t), key, val]);
            let resized = loop {
                let (na, nh) = self.heap.table(t).rehash_sizes(&key);
                if let Err(e) = self.resize_table(t, na, nh) {
                    break Err(e);
                }
                if self.heap.table_mut(t).try_set(key, val, &self.strings) {
                    break Ok(());
                }
            };
            self.release_anchors(mark);
            resized?;
        }
        self.heap.table_mut(t).invalidate_tm_cache();
        self.barrier_back(t, key);
        self.barrier_back(t, val);
        Ok(())
    }

    pub fn table_set_int(&mut self, t: GcIdx<Table>, key: i64, val: TValue) -> Result<(), LuaError> {
        self.table_set(t, TValue::Int(key), val)
    }

    pub fn table_set_str(&mut self, t: GcIdx<Table>, key: &str, val: TValue) -> Result<(), LuaError> {
        let k = self.new_str(key)?;
        self.table_set(t, TValue::Str(k), val)
    }

    /// Resize both parts of `t`, accounting the difference.
    pub fn resize_table(&mut self, t: GcIdx<Table>, narray: usize, nhash: usize) -> Result<(), LuaError> {
        let old = self.heap.table(t).mem_size();
        let estimate = table_size_estimate(narray, nhash)?;
        if estimate > old {
            self.reserve(estimate - old)?;
        }
        self.heap.table_mut(t).resize(narray, nhash, &self.strings)?;
        let new = self.heap.table(t).mem_size();
        if new >= old {
            self.gc.account_alloc(new - old);
        } else {
            self.gc.account_free(old - new);
        }
        Ok(())
    }

    pub fn table_len(&self, t: GcIdx<Table>) -> u64 {
        self.heap.table(t).length()
    }

    pub fn table_next(&self, t: GcIdx<Table>, key: TValue) -> Result<Option<(TValue, TValue)>, LuaError> {
        self.heap.table(t).next(key, &self.strings)
    }

    // ---- Metatables and tag methods ----

    pub fn get_metatable(&self, v: &TValue) -> Option<GcIdx<Table>> {
        match *v {
            TValue::Table(t) => self.heap.table(t).metatable,
            TValue::Userdata(u) => self.heap.udata(u).metatable,
            ref other => self.type_metatables[type_tag(other)],
        }
    }

    /// Set the metatable of a value. Tables and userdata carry their own;
    /// every other type shares one per type.
    pub fn set_metatable(&mut self, obj: TValue, mt: Option<GcIdx<Table>>) {
        match obj {
            TValue::Table(t) => {
                self.heap.table_mut(t).metatable = mt;
                if let Some(mt) = mt {
                    self.barrier(GcRef::Table(t), TValue::Table(mt));
                    self.check_finalizer(GcRef::Table(t), Some(mt));
                }
            }
            TValue::Userdata(u) => {
                self.heap.udata_mut(u).metatable = mt;
                if let Some(mt) = mt {
                    self.barrier(GcRef::Userdata(u), TValue::Table(mt));
                    self.check_finalizer(GcRef::Userdata(u), Some(mt));
                }
            }
            other => self.type_metatables[type_tag(&other)] = mt,
        }
    }

    /// Look up a tag method in `mt`, caching its absence for fast events.
    pub fn fast_tm(&mut self, mt: Option<GcIdx<Table>>, tm: TagMethod) -> Option<TValue> {
        let mt = mt?;
        if self.heap.table(mt).tm_known_absent(tm) {
            return None;
        }
        let v = self.table_get(mt, TValue::Str(self.tm_names[tm as usize]));
        if v.is_nil() {
            self.heap.table_mut(mt).cache_tm_absent(tm);
            None
        } else {
            Some(v)
        }
    }

    /// Tag method `tm` of an arbitrary value, nil if absent.
    pub fn tm_by_obj(&self, v: &TValue, tm: TagMethod) -> TValue {
        match self.get_metatable(v) {
            Some(mt) => self.table_get(mt, TValue::Str(self.tm_names[tm as usize])),
            None => TValue::Nil,
        }
    }

    // ---- Userdata ----

    pub fn new_userdata(&mut self, size: usize) -> Result<GcIdx<Userdata>, LuaError> {
        let bytes = std::mem::size_of::<Userdata>() + size;
        self.reserve(bytes)?;
        let idx = GcIdx::new(self.heap.userdata.alloc(Userdata::new(size), self.gc.current_white));
        self.link_new(GcRef::Userdata(idx), bytes);
        Ok(idx)
    }

    pub fn set_user_value(&mut self, u: GcIdx<Userdata>, v: TValue) {
        self.heap.udata_mut(u).user_value = v;
        self.barrier(GcRef::Userdata(u), v);
    }

    // ---- Registry ----

    pub fn globals(&self) -> GcIdx<Table> {
        match self.table_get_int(self.registry, RIDX_GLOBALS) {
            TValue::Table(t) => t,
            _ => unreachable!("registry lost its globals table"),
        }
    }
}

/// Accounted size of a table with the given part sizes, checked against
/// the part limits before anything is allocated.
fn table_size_estimate(narray: usize, nhash: usize) -> Result<usize, LuaError> {
    if narray as u64 > MAXASIZE || nhash > 1 << MAXHBITS {
        return Err(LuaError::TableOverflow);
    }
    let nodes = if nhash == 0 { 0 } else { nhash.next_power_of_two() };
    Ok(Table::mem_size_for(narray, nodes))
}

/// Seed derived from the clock and a few addresses.
fn make_seed() -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let local = 0u8;
    let mut buf = [0u8; 24];
    buf[..8].copy_from_slice(&nanos.to_le_bytes());
    buf[8..16].copy_from_slice(&(&local as *const u8 as usize as u64).to_le_bytes());
    buf[16..].copy_from_slice(&(make_seed as fn() -> u32 as usize as u64).to_le_bytes());
    lua_hash(&buf, nanos as u32)
}
