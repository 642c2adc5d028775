//! Incremental tri-color mark & sweep collector.
//!
//! Objects start white. Marking turns reachable objects gray and then black;
//! the atomic phase finishes marking, clears weak tables, separates objects
//! that need finalization and flips the current white. Sweeping then frees
//! every object still carrying the old white and repaints survivors with the
//! new one. Work is paid in small steps proportional to allocation.
//!
//! Between the start of marking and the end of the atomic phase no black
//! object refers to a white one. Mutations that could break that go through
//! [`GlobalState::barrier`], [`GlobalState::barrier_back`] or
//! [`GlobalState::upval_barrier`].

use crate::config::RuntimeConfig;
use crate::error::{LuaError, ThreadStatus};
use crate::func::{LuaClosure, NativeClosure, UpValLocation};
use crate::gc::{Color, GcHeader, GcIdx, GcList};
use crate::object::{GcRef, TagMethod, Userdata};
use crate::state::{GlobalState, LuaThread};
use crate::string::{StringId, TString};
use crate::table::Table;
use crate::value::TValue;

/// Work units of a basic step.
pub const GCSTEPSIZE: i64 = 100 * 24;
/// Cost of sweeping one object.
pub const GCSWEEPCOST: usize = 7;
/// Objects swept per step.
pub const GCSWEEPMAX: usize = (GCSTEPSIZE as usize / GCSWEEPCOST) / 4;
/// Cost of running one finalizer.
pub const GCFINALIZECOST: usize = GCSWEEPCOST;
/// Divisor turning debt into work for the step multiplier.
pub const STEPMULADJ: i64 = 200;
/// Divisor of the estimate for the pause.
pub const PAUSEADJ: i64 = 100;
/// Lowest accepted step multiplier.
pub const MIN_STEPMUL: u32 = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcPhase {
    Propagate,
    Atomic,
    SweepAllGc,
    SweepFinObj,
    SweepToBeFnz,
    SweepEnd,
    CallFin,
    Pause,
    /// Only observable while the atomic step itself runs.
    InsideAtomic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcKind {
    Normal,
    /// Forced by an allocation failure: no finalizers, no resizing.
    Emergency,
}

/// Head, tail and length of one intrusive object list.
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjList {
    pub head: Option<GcRef>,
    pub tail: Option<GcRef>,
    pub len: usize,
}

#[derive(Clone, Copy, Debug)]
enum WeakList {
    Weak,
    AllWeak,
    Ephemeron,
}

/// Collector bookkeeping. Lives inside [`GlobalState`].
#[derive(Debug)]
pub struct GcState {
    pub phase: GcPhase,
    pub kind: GcKind,
    pub current_white: Color,
    /// Incremental steps are enabled.
    pub running: bool,
    /// The state is fully built, so emergency collections may run.
    pub complete: bool,
    /// Bytes allocated minus the debt; the real total is `total + debt`.
    total: i64,
    /// Bytes allocated and not yet paid for with collector work.
    debt: i64,
    /// Estimate of live bytes, updated while sweeping.
    estimate: i64,
    mem_trav: usize,
    pub pause: u32,
    pub stepmul: u32,
    /// Finalizers to run in the next step.
    pub finnum: u32,
    pub memory_limit: Option<usize>,
    allgc: ObjList,
    finobj: ObjList,
    tobefnz: ObjList,
    fixed: ObjList,
    /// Next object to sweep in the list being swept.
    sweep_cursor: Option<GcRef>,
    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    weak: Vec<GcIdx<Table>>,
    allweak: Vec<GcIdx<Table>>,
    ephemeron: Vec<GcIdx<Table>>,
    /// Values held only by a core routine that may allocate.
    anchors: Vec<TValue>,
    swept_bytes: usize,
    last_swept_bytes: usize,
    cycles: u64,
}

impl GcState {
    pub fn new(config: &RuntimeConfig) -> Self {
        GcState {
            phase: GcPhase::Pause,
            kind: GcKind::Normal,
            current_white: Color::White0,
            running: false,
            complete: false,
            total: 0,
            debt: 0,
            estimate: 0,
            mem_trav: 0,
            pause: config.gc_pause,
            stepmul: config.gc_stepmul.max(MIN_STEPMUL),
            finnum: 0,
            memory_limit: config.memory_limit,
            allgc: ObjList::default(),
            finobj: ObjList::default(),
            tobefnz: ObjList::default(),
            fixed: ObjList::default(),
            sweep_cursor: None,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            allweak: Vec::new(),
            ephemeron: Vec::new(),
            anchors: Vec::new(),
            swept_bytes: 0,
            last_swept_bytes: 0,
            cycles: 0,
        }
    }

    /// Total accounted bytes.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        (self.total + self.debt).max(0) as usize
    }

    pub(crate) fn set_total(&mut self, bytes: usize) {
        self.total = bytes as i64;
        self.debt = 0;
    }

    #[inline]
    pub fn debt(&self) -> i64 {
        self.debt
    }

    /// Change the debt keeping the total unchanged.
    pub fn set_debt(&mut self, debt: i64) {
        let tb = self.total + self.debt;
        let debt = debt.max(tb - i64::MAX);
        self.total = tb - debt;
        self.debt = debt;
    }

    #[inline]
    pub fn account_alloc(&mut self, bytes: usize) {
        self.debt += bytes as i64;
    }

    #[inline]
    pub fn account_free(&mut self, bytes: usize) {
        self.debt -= bytes as i64;
    }

    pub fn estimate(&self) -> usize {
        self.estimate.max(0) as usize
    }

    /// Marking is in progress: black objects must not point to white ones.
    #[inline]
    pub fn keep_invariant(&self) -> bool {
        matches!(self.phase, GcPhase::Propagate | GcPhase::Atomic)
    }

    #[inline]
    pub fn is_sweep_phase(&self) -> bool {
        matches!(
            self.phase,
            GcPhase::SweepAllGc | GcPhase::SweepFinObj | GcPhase::SweepToBeFnz | GcPhase::SweepEnd
        )
    }

    pub fn list(&self, l: GcList) -> &ObjList {
        match l {
            GcList::AllGc => &self.allgc,
            GcList::FinObj => &self.finobj,
            GcList::ToBeFnz => &self.tobefnz,
            GcList::Fixed => &self.fixed,
        }
    }

    fn list_mut(&mut self, l: GcList) -> &mut ObjList {
        match l {
            GcList::AllGc => &mut self.allgc,
            GcList::FinObj => &mut self.finobj,
            GcList::ToBeFnz => &mut self.tobefnz,
            GcList::Fixed => &mut self.fixed,
        }
    }

    fn weak_list_mut(&mut self, w: WeakList) -> &mut Vec<GcIdx<Table>> {
        match w {
            WeakList::Weak => &mut self.weak,
            WeakList::AllWeak => &mut self.allweak,
            WeakList::Ephemeron => &mut self.ephemeron,
        }
    }

    pub fn has_pending_finalizers(&self) -> bool {
        self.tobefnz.head.is_some()
    }

    /// Bytes freed by the sweep of the last finished cycle.
    pub fn last_swept_bytes(&self) -> usize {
        self.last_swept_bytes
    }

    /// Number of finished cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Debt converted to work units.
    fn scaled_debt(&self) -> i64 {
        if self.debt <= 0 {
            return 0;
        }
        let debt = self.debt / STEPMULADJ + 1;
        let stepmul = self.stepmul as i64;
        if debt < i64::MAX / stepmul {
            debt * stepmul
        } else {
            i64::MAX
        }
    }

    /// Set the debt so the next cycle starts once memory reaches
    /// `estimate * pause / 100`.
    pub fn set_pause(&mut self) {
        let estimate = (self.estimate / PAUSEADJ).max(1);
        let pause = self.pause as i64;
        let threshold = if pause < i64::MAX / estimate {
            estimate * pause
        } else {
            i64::MAX
        };
        let debt = (self.total + self.debt) - threshold;
        self.set_debt(debt);
    }
}

/// The embedding layer seen by the collector: access to the global state
/// and a way to run finalizers.
pub trait GcDriver {
    fn global(&mut self) -> &mut GlobalState;

    /// Call finalizer `f` with `obj` as its only argument, in protected mode.
    fn call_finalizer(&mut self, f: TValue, obj: TValue) -> Result<(), LuaError>;
}

/// A bare state has no way to call functions.
impl GcDriver for GlobalState {
    fn global(&mut self) -> &mut GlobalState {
        self
    }

    fn call_finalizer(&mut self, _f: TValue, _obj: TValue) -> Result<(), LuaError> {
        Err(LuaError::Runtime("no host to run finalizers".into()))
    }
}

impl GlobalState {
    // ---- Headers and lists ----

    pub fn header(&self, r: GcRef) -> &GcHeader {
        match r {
            GcRef::String(id) => self.strings.header(id),
            GcRef::Table(i) => self.heap.tables.header(i.0),
            GcRef::LuaClosure(i) => self.heap.lua_closures.header(i.0),
            GcRef::Native(i) => self.heap.natives.header(i.0),
            GcRef::Userdata(i) => self.heap.userdata.header(i.0),
            GcRef::Thread(i) => self.heap.threads.header(i.0),
        }
    }

    fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r {
            GcRef::String(id) => self.strings.header_mut(id),
            GcRef::Table(i) => self.heap.tables.header_mut(i.0),
            GcRef::LuaClosure(i) => self.heap.lua_closures.header_mut(i.0),
            GcRef::Native(i) => self.heap.natives.header_mut(i.0),
            GcRef::Userdata(i) => self.heap.userdata.header_mut(i.0),
            GcRef::Thread(i) => self.heap.threads.header_mut(i.0),
        }
    }

    #[inline]
    pub fn color(&self, r: GcRef) -> Color {
        self.header(r).color
    }

    #[inline]
    fn set_color(&mut self, r: GcRef, c: Color) {
        self.header_mut(r).color = c;
    }

    /// Object is live from the collector's point of view.
    pub fn is_live(&self, r: GcRef) -> bool {
        let alive = match r {
            GcRef::String(id) => self.strings.is_live(id),
            GcRef::Table(i) => self.heap.tables.is_live(i.0),
            GcRef::LuaClosure(i) => self.heap.lua_closures.is_live(i.0),
            GcRef::Native(i) => self.heap.natives.is_live(i.0),
            GcRef::Userdata(i) => self.heap.userdata.is_live(i.0),
            GcRef::Thread(i) => self.heap.threads.is_live(i.0),
        };
        alive && self.color(r) != self.gc.current_white.other_white()
    }

    fn value_is_white(&self, v: &TValue) -> bool {
        v.gc_ref().is_some_and(|r| self.color(r).is_white())
    }

    fn link_front(&mut self, r: GcRef, l: GcList) {
        let old = self.gc.list(l).head;
        {
            let h = self.header_mut(r);
            h.list = Some(l);
            h.prev = None;
            h.next = old;
        }
        match old {
            Some(o) => self.header_mut(o).prev = Some(r),
            None => self.gc.list_mut(l).tail = Some(r),
        }
        let list = self.gc.list_mut(l);
        list.head = Some(r);
        list.len += 1;
    }

    fn link_back(&mut self, r: GcRef, l: GcList) {
        let old = self.gc.list(l).tail;
        {
            let h = self.header_mut(r);
            h.list = Some(l);
            h.prev = old;
            h.next = None;
        }
        match old {
            Some(o) => self.header_mut(o).next = Some(r),
            None => self.gc.list_mut(l).head = Some(r),
        }
        let list = self.gc.list_mut(l);
        list.tail = Some(r);
        list.len += 1;
    }

    /// Remove an object from whatever list holds it.
    pub fn unlink_object(&mut self, r: GcRef) {
        let h = *self.header(r);
        let Some(l) = h.list else { return };
        if self.gc.sweep_cursor == Some(r) {
            self.gc.sweep_cursor = h.next;
        }
        match h.prev {
            Some(p) => self.header_mut(p).next = h.next,
            None => self.gc.list_mut(l).head = h.next,
        }
        match h.next {
            Some(n) => self.header_mut(n).prev = h.prev,
            None => self.gc.list_mut(l).tail = h.prev,
        }
        let hm = self.header_mut(r);
        hm.list = None;
        hm.prev = None;
        hm.next = None;
        self.gc.list_mut(l).len -= 1;
    }

    /// Account a freshly allocated object and put it on the main list.
    pub fn link_new(&mut self, r: GcRef, size: usize) {
        self.gc.account_alloc(size);
        self.link_front(r, GcList::AllGc);
    }

    /// Move the newest object to the list of objects never collected.
    pub fn fix_object(&mut self, r: GcRef) {
        debug_assert_eq!(self.gc.allgc.head, Some(r));
        self.unlink_object(r);
        // gray forever: never marked again, never swept
        self.set_color(r, Color::Gray);
        self.link_front(r, GcList::Fixed);
    }

    /// Objects of one list, head first.
    pub fn list_objects(&self, l: GcList) -> Vec<GcRef> {
        let mut out = Vec::with_capacity(self.gc.list(l).len);
        let mut cur = self.gc.list(l).head;
        while let Some(r) = cur {
            out.push(r);
            cur = self.header(r).next;
        }
        out
    }

    // ---- Allocation ----

    /// Make room for `bytes` more bytes under the memory limit, running an
    /// emergency collection if needed.
    pub fn reserve(&mut self, bytes: usize) -> Result<(), LuaError> {
        let Some(limit) = self.gc.memory_limit else {
            return Ok(());
        };
        if self.gc.total_bytes().saturating_add(bytes) <= limit {
            return Ok(());
        }
        if self.gc.complete && self.gc.kind != GcKind::Emergency {
            tracing::debug!(requested = bytes, limit, "memory limit reached, running emergency collection");
            if let Err(e) = full_gc(self, true) {
                tracing::warn!(error = %e, "emergency collection failed");
            }
            if self.gc.total_bytes().saturating_add(bytes) <= limit {
                return Ok(());
            }
        }
        tracing::warn!(requested = bytes, limit, total = self.gc.total_bytes(), "allocation refused");
        Err(LuaError::Memory)
    }

    /// Keep `vals` alive across an allocation made by a core routine.
    pub fn anchor(&mut self, vals: &[TValue]) -> usize {
        let mark = self.gc.anchors.len();
        self.gc.anchors.extend_from_slice(vals);
        mark
    }

    pub fn release_anchors(&mut self, mark: usize) {
        self.gc.anchors.truncate(mark);
    }

    // ---- Barriers ----

    /// Forward barrier: black `obj` now refers to `v`.
    pub fn barrier(&mut self, obj: GcRef, v: TValue) {
        let Some(vr) = v.gc_ref() else { return };
        if self.color(obj) != Color::Black || !self.color(vr).is_white() {
            return;
        }
        if self.gc.keep_invariant() {
            self.really_mark(vr);
        } else {
            debug_assert!(self.gc.is_sweep_phase());
            // sweeping: make the holder white so no more barriers fire on it
            let white = self.gc.current_white;
            self.set_color(obj, white);
        }
    }

    /// Backward barrier: black table `t` now refers to `v`, so `t` is
    /// traversed again in the atomic phase.
    pub fn barrier_back(&mut self, t: GcIdx<Table>, v: TValue) {
        let Some(vr) = v.gc_ref() else { return };
        let r = GcRef::Table(t);
        if self.color(r) == Color::Black && self.color(vr).is_white() {
            self.set_color(r, Color::Gray);
            self.gc.grayagain.push(r);
        }
    }

    /// A closed upvalue now holds `v`.
    pub fn upval_barrier(&mut self, v: TValue) {
        if let Some(r) = v.gc_ref() {
            if self.gc.keep_invariant() {
                self.mark_object(r);
            }
        }
    }

    // ---- Marking ----

    #[inline]
    fn mark_value(&mut self, v: TValue) {
        if let Some(r) = v.gc_ref() {
            self.mark_object(r);
        }
    }

    #[inline]
    pub fn mark_object(&mut self, r: GcRef) {
        if self.color(r).is_white() {
            self.really_mark(r);
        }
    }

    fn really_mark(&mut self, r: GcRef) {
        match r {
            GcRef::String(id) => {
                self.strings.header_mut(id).color = Color::Black;
                self.gc.mem_trav += TString::mem_size(self.strings.get(id).len());
            }
            GcRef::Userdata(u) => {
                self.heap.userdata.header_mut(u.0).color = Color::Black;
                let ud = self.heap.udata(u);
                let (mt, uv) = (ud.metatable, ud.user_value);
                self.gc.mem_trav += std::mem::size_of::<Userdata>() + ud.data.len();
                if let Some(mt) = mt {
                    self.mark_object(GcRef::Table(mt));
                }
                self.mark_value(uv);
            }
            _ => {
                self.set_color(r, Color::Gray);
                self.gc.gray.push(r);
            }
        }
    }

    fn mark_type_metatables(&mut self) {
        for mt in self.type_metatables.into_iter().flatten() {
            self.mark_object(GcRef::Table(mt));
        }
    }

    fn mark_anchors(&mut self) {
        for i in 0..self.gc.anchors.len() {
            let v = self.gc.anchors[i];
            self.mark_value(v);
        }
    }

    /// Mark objects waiting for their finalizer, left from an earlier cycle.
    fn mark_being_fnz(&mut self) {
        let mut cur = self.gc.tobefnz.head;
        while let Some(r) = cur {
            cur = self.header(r).next;
            self.mark_object(r);
        }
    }

    fn restart_collection(&mut self) {
        self.gc.gray.clear();
        self.gc.grayagain.clear();
        self.gc.weak.clear();
        self.gc.allweak.clear();
        self.gc.ephemeron.clear();
        self.gc.swept_bytes = 0;
        self.mark_object(GcRef::Thread(self.main_thread));
        self.mark_object(GcRef::Table(self.registry));
        self.mark_type_metatables();
        self.mark_anchors();
        self.mark_being_fnz();
    }

    /// Turn one gray object black, graying what it refers to.
    fn propagate_mark(&mut self) {
        let Some(r) = self.gc.gray.pop() else { return };
        debug_assert_eq!(self.color(r), Color::Gray);
        self.set_color(r, Color::Black);
        let size = match r {
            GcRef::Table(t) => self.traverse_table(t),
            GcRef::LuaClosure(c) => self.traverse_lua_closure(c),
            GcRef::Native(c) => self.traverse_native(c),
            GcRef::Thread(th) => {
                // threads stay gray and are traversed again in the atomic phase
                self.set_color(r, Color::Gray);
                self.gc.grayagain.push(r);
                self.traverse_thread(th)
            }
            GcRef::String(_) | GcRef::Userdata(_) => 0,
        };
        self.gc.mem_trav += size;
    }

    fn propagate_all(&mut self) {
        while !self.gc.gray.is_empty() {
            self.propagate_mark();
        }
    }

    fn traverse_table(&mut self, t: GcIdx<Table>) -> usize {
        let mt = self.heap.table(t).metatable;
        if let Some(mt) = mt {
            self.mark_object(GcRef::Table(mt));
        }
        let (weak_keys, weak_values) = match self.fast_tm(mt, TagMethod::Mode) {
            Some(TValue::Str(mode)) => {
                let b = self.strings.get_bytes(mode);
                (b.contains(&b'k'), b.contains(&b'v'))
            }
            _ => (false, false),
        };
        if weak_keys || weak_values {
            self.set_color(GcRef::Table(t), Color::Gray);
            if !weak_keys {
                self.traverse_weak_value(t);
            } else if !weak_values {
                self.traverse_ephemeron(t);
            } else {
                // nothing to traverse now
                self.gc.allweak.push(t);
            }
        } else {
            self.traverse_strong_table(t);
        }
        self.heap.table(t).mem_size()
    }

    /// An entry with a nil value whose key is about to die keeps the key only
    /// as a traversal marker.
    fn remove_entry(&mut self, t: GcIdx<Table>, i: usize) {
        let n = self.heap.table(t).nodes()[i];
        if !n.dead_key && self.value_is_white(&n.key) {
            self.heap.table_mut(t).nodes_mut()[i].dead_key = true;
        }
    }

    /// Whether a weak reference to `v` must be dropped. Strings are values,
    /// not objects, for weak tables: they are marked and kept.
    fn is_cleared(&mut self, v: TValue) -> bool {
        match v {
            TValue::Str(id) => {
                self.mark_object(GcRef::String(id));
                false
            }
            other => self.value_is_white(&other),
        }
    }

    fn traverse_strong_table(&mut self, t: GcIdx<Table>) {
        for i in 0..self.heap.table(t).array_len() {
            let v = self.heap.table(t).array()[i];
            self.mark_value(v);
        }
        for i in 0..self.heap.table(t).node_len() {
            let n = self.heap.table(t).nodes()[i];
            if n.val.is_nil() {
                self.remove_entry(t, i);
            } else {
                self.mark_value(n.key);
                self.mark_value(n.val);
            }
        }
    }

    fn traverse_weak_value(&mut self, t: GcIdx<Table>) {
        // an array part may hold white values; not worth checking now
        let mut has_clears = self.heap.table(t).array_len() > 0;
        for i in 0..self.heap.table(t).node_len() {
            let n = self.heap.table(t).nodes()[i];
            if n.val.is_nil() {
                self.remove_entry(t, i);
            } else {
                self.mark_value(n.key);
                if !has_clears && self.is_cleared(n.val) {
                    has_clears = true;
                }
            }
        }
        if self.gc.phase == GcPhase::Propagate {
            self.gc.grayagain.push(GcRef::Table(t));
        } else if has_clears {
            self.gc.weak.push(t);
        }
    }

    /// Traverse a weak-key table: values are marked only for marked keys.
    /// Returns whether anything was marked.
    fn traverse_ephemeron(&mut self, t: GcIdx<Table>) -> bool {
        let mut marked = false;
        let mut has_clears = false;
        let mut white_white = false;
        for i in 0..self.heap.table(t).array_len() {
            let v = self.heap.table(t).array()[i];
            if self.value_is_white(&v) {
                marked = true;
                self.mark_value(v);
            }
        }
        for i in 0..self.heap.table(t).node_len() {
            let n = self.heap.table(t).nodes()[i];
            if n.val.is_nil() {
                self.remove_entry(t, i);
            } else if self.is_cleared(n.key) {
                has_clears = true;
                if self.value_is_white(&n.val) {
                    white_white = true;
                }
            } else if self.value_is_white(&n.val) {
                marked = true;
                self.mark_value(n.val);
            }
        }
        if self.gc.phase == GcPhase::Propagate {
            self.gc.grayagain.push(GcRef::Table(t));
        } else if white_white {
            self.gc.ephemeron.push(t);
        } else if has_clears {
            self.gc.allweak.push(t);
        }
        marked
    }

    fn traverse_lua_closure(&mut self, c: GcIdx<LuaClosure>) -> usize {
        let inside_atomic = self.gc.phase == GcPhase::InsideAtomic;
        let n = self.heap.closure(c).upvalues.len();
        for i in 0..n {
            let Some(uv) = self.heap.closure(c).upvalues[i] else { continue };
            if !inside_atomic {
                if let UpValLocation::Open { touched, .. } = &mut self.heap.upvals.get_mut(uv).location {
                    // the value is on a stack; remark it later if the thread dies
                    *touched = true;
                    continue;
                }
            }
            let v = self.upval_get(uv);
            self.mark_value(v);
        }
        LuaClosure::mem_size(n)
    }

    fn traverse_native(&mut self, c: GcIdx<NativeClosure>) -> usize {
        let n = self.heap.native(c).upvalues.len();
        for i in 0..n {
            let v = self.heap.native(c).upvalues[i];
            self.mark_value(v);
        }
        NativeClosure::mem_size(n)
    }

    fn traverse_thread(&mut self, th: GcIdx<LuaThread>) -> usize {
        let top = self.heap.thread(th).top;
        for i in 0..top {
            let v = self.heap.thread(th).stack[i];
            self.mark_value(v);
        }
        if self.gc.phase == GcPhase::InsideAtomic {
            let t = self.heap.thread_mut(th);
            for slot in &mut t.stack[top..] {
                *slot = TValue::Nil;
            }
            if t.open_upval.is_some() {
                self.twups.insert(th);
            }
        } else if self.gc.kind != GcKind::Emergency {
            self.shrink_stack(th);
        }
        self.heap.thread(th).mem_size()
    }

    /// Mark the values of touched open upvalues of threads that were not
    /// marked, and drop such threads from the list of threads with upvalues.
    fn remark_upvals(&mut self) {
        let mut i = 0;
        while i < self.twups.len() {
            let th = self.twups[i];
            let marked = self.heap.threads.header(th.0).color == Color::Gray;
            if marked && self.heap.thread(th).open_upval.is_some() {
                i += 1;
                continue;
            }
            self.twups.swap_remove_index(i);
            let mut cur = self.heap.thread(th).open_upval;
            while let Some(uv) = cur {
                let UpValLocation::Open { next, touched, slot, .. } = self.heap.upvals.get(uv).location else {
                    break;
                };
                if touched {
                    if let UpValLocation::Open { touched, .. } = &mut self.heap.upvals.get_mut(uv).location {
                        *touched = false;
                    }
                    let v = self.heap.thread(th).stack[slot];
                    self.mark_value(v);
                }
                cur = next;
            }
        }
    }

    fn converge_ephemerons(&mut self) {
        loop {
            let list = std::mem::take(&mut self.gc.ephemeron);
            let mut changed = false;
            for t in list {
                if self.traverse_ephemeron(t) {
                    self.propagate_all();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    // ---- Weak tables ----

    /// Drop entries with collected keys from every table of `which`.
    fn clear_keys(&mut self, which: WeakList) {
        let list = std::mem::take(self.gc.weak_list_mut(which));
        for &t in &list {
            for i in 0..self.heap.table(t).node_len() {
                let n = self.heap.table(t).nodes()[i];
                if !n.val.is_nil() && self.is_cleared(n.key) {
                    self.heap.table_mut(t).nodes_mut()[i].val = TValue::Nil;
                    self.remove_entry(t, i);
                }
            }
        }
        *self.gc.weak_list_mut(which) = list;
    }

    /// Drop entries with collected values from the tables of `which`
    /// starting at position `from`.
    fn clear_values(&mut self, which: WeakList, from: usize) {
        let list = std::mem::take(self.gc.weak_list_mut(which));
        for &t in list.iter().skip(from) {
            for i in 0..self.heap.table(t).array_len() {
                let v = self.heap.table(t).array()[i];
                if self.is_cleared(v) {
                    self.heap.table_mut(t).array_mut()[i] = TValue::Nil;
                }
            }
            for i in 0..self.heap.table(t).node_len() {
                let n = self.heap.table(t).nodes()[i];
                if !n.val.is_nil() && self.is_cleared(n.val) {
                    self.heap.table_mut(t).nodes_mut()[i].val = TValue::Nil;
                    self.remove_entry(t, i);
                }
            }
        }
        *self.gc.weak_list_mut(which) = list;
    }

    // ---- Finalization ----

    /// Register `obj` for finalization if its new metatable has `__gc`.
    pub fn check_finalizer(&mut self, obj: GcRef, mt: Option<GcIdx<Table>>) {
        if self.header(obj).finalize || self.fast_tm(mt, TagMethod::Gc).is_none() {
            return;
        }
        if self.gc.is_sweep_phase() {
            // "sweep" it now; unlinking moves the sweep cursor past it
            let white = self.gc.current_white;
            self.set_color(obj, white);
        }
        self.unlink_object(obj);
        self.link_front(obj, GcList::FinObj);
        self.header_mut(obj).finalize = true;
    }

    /// Move unreachable objects (or all, when `all`) from the finalizable
    /// list to the end of the to-be-finalized list.
    fn separate_tobefnz(&mut self, all: bool) {
        let mut cur = self.gc.finobj.head;
        while let Some(r) = cur {
            cur = self.header(r).next;
            if all || self.color(r).is_white() {
                self.unlink_object(r);
                self.link_back(r, GcList::ToBeFnz);
            }
        }
    }

    /// Take the next object to finalize and return it to the main list.
    fn take_to_be_finalized(&mut self) -> Option<GcRef> {
        let r = self.gc.tobefnz.head?;
        self.unlink_object(r);
        self.link_front(r, GcList::AllGc);
        self.header_mut(r).finalize = false;
        if self.gc.is_sweep_phase() {
            let white = self.gc.current_white;
            self.set_color(r, white);
        }
        Some(r)
    }

    // ---- Atomic phase ----

    fn atomic(&mut self) -> usize {
        let grayagain = std::mem::take(&mut self.gc.grayagain);
        debug_assert!(self.gc.ephemeron.is_empty() && self.gc.weak.is_empty());
        self.gc.phase = GcPhase::InsideAtomic;
        self.gc.mem_trav = 0;
        self.mark_object(GcRef::Thread(self.running));
        // the registry and type metatables may have been changed by the host
        self.mark_object(GcRef::Table(self.registry));
        self.mark_type_metatables();
        self.mark_anchors();
        self.remark_upvals();
        self.propagate_all();
        let mut work = self.gc.mem_trav;
        self.gc.gray = grayagain;
        self.propagate_all();
        self.gc.mem_trav = 0;
        self.converge_ephemerons();
        // every strongly reachable object is marked now
        self.clear_values(WeakList::Weak, 0);
        self.clear_values(WeakList::AllWeak, 0);
        let orig_weak = self.gc.weak.len();
        let orig_all = self.gc.allweak.len();
        work += self.gc.mem_trav;
        self.separate_tobefnz(false);
        self.gc.finnum = 1;
        self.mark_being_fnz();
        self.propagate_all();
        self.gc.mem_trav = 0;
        self.converge_ephemerons();
        // resurrected objects are marked too
        self.clear_keys(WeakList::Ephemeron);
        self.clear_keys(WeakList::AllWeak);
        self.clear_values(WeakList::Weak, orig_weak);
        self.clear_values(WeakList::AllWeak, orig_all);
        self.strings.clear_cache(self.mem_err_msg);
        self.gc.current_white = self.gc.current_white.other_white();
        work + self.gc.mem_trav
    }

    // ---- Sweeping ----

    fn enter_sweep(&mut self) {
        self.gc.phase = GcPhase::SweepAllGc;
        self.gc.sweep_cursor = self.gc.allgc.head;
    }

    /// Sweep up to `count` objects from the cursor.
    fn sweep_list(&mut self, count: usize) {
        let white = self.gc.current_white;
        let dead = white.other_white();
        for _ in 0..count {
            let Some(r) = self.gc.sweep_cursor else { break };
            if self.color(r) == dead {
                // unlinking advances the cursor
                self.free_object(r);
            } else {
                self.gc.sweep_cursor = self.header(r).next;
                self.set_color(r, white);
            }
        }
    }

    fn sweep_step(&mut self, next: GcPhase, next_list: Option<GcList>) -> usize {
        if self.gc.sweep_cursor.is_some() {
            let old_debt = self.gc.debt;
            self.sweep_list(GCSWEEPMAX);
            self.gc.estimate += self.gc.debt - old_debt;
            if self.gc.sweep_cursor.is_some() {
                return GCSWEEPMAX * GCSWEEPCOST;
            }
        }
        self.gc.phase = next;
        self.gc.sweep_cursor = next_list.and_then(|l| self.gc.list(l).head);
        0
    }

    fn free_object(&mut self, r: GcRef) {
        self.unlink_object(r);
        let size = match r {
            GcRef::String(id) => self.strings.free(id),
            GcRef::Table(t) => self.heap.tables.free(t.0).map_or(0, |t| t.mem_size()),
            GcRef::LuaClosure(c) => match self.heap.lua_closures.free(c.0) {
                Some(cl) => {
                    for uv in cl.upvalues.iter().flatten() {
                        self.upval_dec(*uv);
                    }
                    LuaClosure::mem_size(cl.upvalues.len())
                }
                None => 0,
            },
            GcRef::Native(c) => self
                .heap
                .natives
                .free(c.0)
                .map_or(0, |cl| NativeClosure::mem_size(cl.upvalues.len())),
            GcRef::Userdata(u) => self
                .heap
                .userdata
                .free(u.0)
                .map_or(0, |ud| std::mem::size_of::<Userdata>() + ud.data.len()),
            GcRef::Thread(th) => {
                self.close_upvals(th, 0);
                self.twups.swap_remove(&th);
                self.heap.threads.free(th.0).map_or(0, |t| t.mem_size())
            }
        };
        self.gc.account_free(size);
        self.gc.swept_bytes += size;
    }

    /// Shrink the string table when it is mostly empty.
    fn check_sizes(&mut self) {
        if self.gc.kind == GcKind::Emergency {
            return;
        }
        let old_debt = self.gc.debt;
        let size = self.strings.size();
        if self.strings.nuse() < size / 4 {
            self.shrink_string_table(size / 2);
        }
        self.gc.estimate += self.gc.debt - old_debt;
    }

    /// One unit of collector work for every phase but `CallFin`.
    /// Returns the work done.
    fn collect_step(&mut self) -> usize {
        match self.gc.phase {
            GcPhase::Pause => {
                self.gc.mem_trav = self.strings.size() * std::mem::size_of::<Option<StringId>>();
                self.restart_collection();
                self.gc.phase = GcPhase::Propagate;
                tracing::trace!(bytes = self.gc.total_bytes(), "collection cycle started");
                self.gc.mem_trav
            }
            GcPhase::Propagate => {
                self.gc.mem_trav = 0;
                self.propagate_mark();
                if self.gc.gray.is_empty() {
                    self.gc.phase = GcPhase::Atomic;
                }
                self.gc.mem_trav
            }
            GcPhase::Atomic => {
                self.propagate_all();
                let work = self.atomic();
                self.enter_sweep();
                self.gc.estimate = self.gc.total + self.gc.debt;
                work
            }
            GcPhase::SweepAllGc => self.sweep_step(GcPhase::SweepFinObj, Some(GcList::FinObj)),
            GcPhase::SweepFinObj => self.sweep_step(GcPhase::SweepToBeFnz, Some(GcList::ToBeFnz)),
            GcPhase::SweepToBeFnz => self.sweep_step(GcPhase::SweepEnd, None),
            GcPhase::SweepEnd => {
                let white = self.gc.current_white;
                self.heap.threads.header_mut(self.main_thread.0).color = white;
                self.check_sizes();
                self.gc.phase = GcPhase::CallFin;
                self.gc.last_swept_bytes = self.gc.swept_bytes;
                self.gc.cycles += 1;
                tracing::debug!(
                    freed = self.gc.swept_bytes,
                    live = self.gc.total_bytes(),
                    kind = ?self.gc.kind,
                    "collection cycle swept"
                );
                0
            }
            GcPhase::CallFin | GcPhase::InsideAtomic => 0,
        }
    }

    // ---- Debugging ----

    fn children(&self, r: GcRef) -> Vec<TValue> {
        match r {
            GcRef::Table(t) => {
                let tbl = self.heap.table(t);
                let mut out: Vec<TValue> = tbl.metatable.map(TValue::Table).into_iter().collect();
                out.extend(tbl.array().iter().copied());
                for n in tbl.nodes().iter().filter(|n| !n.val.is_nil()) {
                    out.push(n.key);
                    out.push(n.val);
                }
                out
            }
            GcRef::LuaClosure(c) => self
                .heap
                .closure(c)
                .upvalues
                .iter()
                .flatten()
                .filter_map(|&uv| match self.heap.upvals.get(uv).location {
                    UpValLocation::Closed(v) => Some(v),
                    UpValLocation::Open { .. } => None,
                })
                .collect(),
            GcRef::Native(c) => self.heap.native(c).upvalues.clone(),
            GcRef::Userdata(u) => {
                let ud = self.heap.udata(u);
                vec![ud.metatable.map_or(TValue::Nil, TValue::Table), ud.user_value]
            }
            GcRef::String(_) | GcRef::Thread(_) => Vec::new(),
        }
    }

    /// Pairs (black object, white object it refers to). Always empty unless
    /// the collector is broken.
    pub fn invariant_violations(&self) -> Vec<(GcRef, GcRef)> {
        let mut out = Vec::new();
        if !self.gc.keep_invariant() {
            return out;
        }
        for l in [GcList::AllGc, GcList::FinObj, GcList::ToBeFnz] {
            for r in self.list_objects(l) {
                if self.color(r) != Color::Black {
                    continue;
                }
                for child in self.children(r) {
                    if let Some(cr) = child.gc_ref() {
                        if self.color(cr).is_white() {
                            out.push((r, cr));
                        }
                    }
                }
            }
        }
        out
    }
}

// ---- Driving the collector ----

fn finalizer_error(g: &GlobalState, e: LuaError) -> LuaError {
    if e.status() != ThreadStatus::ErrRun {
        return e;
    }
    let msg = match e {
        LuaError::Value(TValue::Str(id)) => g.string_lossy(id),
        LuaError::Value(_) => "no message".to_string(),
        other => other.to_string(),
    };
    LuaError::GcMetamethod(msg)
}

/// Run the finalizer of the next object waiting for one. With `propagate`,
/// a failing finalizer becomes an error of the caller.
fn gc_tm<D: GcDriver + ?Sized>(d: &mut D, propagate: bool) -> Result<(), LuaError> {
    let g = d.global();
    let Some(r) = g.take_to_be_finalized() else {
        return Ok(());
    };
    let obj = r.to_value();
    let tm = g.tm_by_obj(&obj, TagMethod::Gc);
    if !tm.is_function() {
        return Ok(());
    }
    // no collector steps while a finalizer runs
    let running = std::mem::replace(&mut g.gc.running, false);
    let result = d.call_finalizer(tm, obj);
    let g = d.global();
    g.gc.running = running;
    match result {
        Ok(()) => Ok(()),
        Err(e) if propagate => Err(finalizer_error(g, e)),
        Err(e) => {
            tracing::warn!(error = %e, "error in finalizer ignored");
            Ok(())
        }
    }
}

/// Run a batch of pending finalizers; the batch doubles each time.
pub fn run_a_few_finalizers<D: GcDriver + ?Sized>(d: &mut D) -> Result<usize, LuaError> {
    let mut n = 0;
    while d.global().gc.has_pending_finalizers() && n < d.global().gc.finnum {
        gc_tm(d, true)?;
        n += 1;
    }
    let gc = &mut d.global().gc;
    gc.finnum = if gc.has_pending_finalizers() { gc.finnum * 2 } else { 0 };
    Ok(n as usize)
}

/// Perform one unit of collector work. Returns the work done.
pub fn single_step<D: GcDriver + ?Sized>(d: &mut D) -> Result<usize, LuaError> {
    let g = d.global();
    if g.gc.phase != GcPhase::CallFin {
        return Ok(g.collect_step());
    }
    if g.gc.has_pending_finalizers() && g.gc.kind != GcKind::Emergency {
        let n = run_a_few_finalizers(d)?;
        Ok(n * GCFINALIZECOST)
    } else {
        g.gc.phase = GcPhase::Pause;
        Ok(0)
    }
}

/// Step until `stop` holds for the current phase.
pub fn run_until<D: GcDriver + ?Sized>(d: &mut D, stop: impl Fn(GcPhase) -> bool) -> Result<(), LuaError> {
    while !stop(d.global().gc.phase) {
        single_step(d)?;
    }
    Ok(())
}

/// Pay the current debt with collector work.
pub fn step<D: GcDriver + ?Sized>(d: &mut D) -> Result<(), LuaError> {
    let g = d.global();
    let mut debt = g.gc.scaled_debt();
    if !g.gc.running {
        // do not come back too soon
        g.gc.set_debt(-GCSTEPSIZE * 10);
        return Ok(());
    }
    loop {
        debt -= single_step(d)? as i64;
        if debt <= -GCSTEPSIZE || d.global().gc.phase == GcPhase::Pause {
            break;
        }
    }
    let gc = &mut d.global().gc;
    if gc.phase == GcPhase::Pause {
        gc.set_pause();
    } else {
        // convert work units back into bytes
        let debt = (debt / gc.stepmul as i64) * STEPMULADJ;
        gc.set_debt(debt);
        run_a_few_finalizers(d)?;
    }
    Ok(())
}

/// Step if allocation has put the collector in debt.
pub fn check_gc<D: GcDriver + ?Sized>(d: &mut D) -> Result<(), LuaError> {
    if d.global().gc.debt() > 0 {
        step(d)?;
    }
    Ok(())
}

/// Run a complete cycle. An emergency cycle runs no finalizers and
/// resizes nothing.
pub fn full_gc<D: GcDriver + ?Sized>(d: &mut D, emergency: bool) -> Result<(), LuaError> {
    let g = d.global();
    debug_assert_eq!(g.gc.kind, GcKind::Normal);
    if emergency {
        g.gc.kind = GcKind::Emergency;
    }
    if g.gc.keep_invariant() {
        // sweep everything back to white
        g.enter_sweep();
    }
    let result = (|| {
        run_until(d, |p| p == GcPhase::Pause)?;
        run_until(d, |p| p != GcPhase::Pause)?;
        run_until(d, |p| p == GcPhase::CallFin)?;
        run_until(d, |p| p == GcPhase::Pause)
    })();
    let gc = &mut d.global().gc;
    gc.kind = GcKind::Normal;
    gc.set_pause();
    result
}

/// Finalize every object with a finalizer, then free every object. Used
/// when the runtime shuts down.
pub fn free_all_objects<D: GcDriver + ?Sized>(d: &mut D) {
    let g = d.global();
    let main = g.main_thread;
    g.close_upvals(main, 0);
    g.separate_tobefnz(true);
    while d.global().gc.has_pending_finalizers() {
        // errors are already reported and dropped
        let _ = gc_tm(d, false);
    }
    let g = d.global();
    g.gc.kind = GcKind::Normal;
    // no barrier may fire while objects are being torn down
    g.gc.phase = GcPhase::Pause;
    for l in [GcList::FinObj, GcList::AllGc, GcList::Fixed] {
        while let Some(r) = g.gc.list(l).head {
            g.free_object(r);
        }
    }
    tracing::debug!(remaining = g.gc.total_bytes(), "all objects freed");
}
