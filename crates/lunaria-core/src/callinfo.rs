//! Call frame information.
//!
//! Frames of a thread form a doubly linked list stored in a slab. The list
//! outlives the frames in use: returning from a call only moves the
//! `current` cursor back, and the nodes after it are reused by later calls
//! until a collection shrinks the list.

use crate::func::ContinuationId;

/// Handle to a frame node of one thread's [`CallStack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

/// Multiple results.
pub const MULTRET: i32 = -1;

// Flags for CallInfo boolean fields
const FLAG_IS_LUA: u8 = 1;
const FLAG_FRESH: u8 = 2;
const FLAG_YPCALL: u8 = 4;
const FLAG_TAIL: u8 = 8;
const FLAG_FIN: u8 = 16;

/// A call frame.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack slot holding the called function.
    pub func: usize,
    /// Top of the stack available to this frame.
    pub top: usize,
    pub previous: Option<FrameId>,
    pub next: Option<FrameId>,
    /// Expected number of results (`MULTRET` = all).
    pub num_results: i32,
    /// First register slot (scripted frames).
    pub base: usize,
    /// Saved program position (scripted frames).
    pub saved_pc: usize,
    /// Continuation to finish a host frame interrupted by a yield.
    pub k: Option<ContinuationId>,
    pub ctx: isize,
    /// Error handler in effect before a yieldable protected call.
    pub old_errfunc: usize,
    /// Saved `func` while the frame is suspended by a yield.
    pub extra: usize,
    /// Packed boolean flags (is_lua, fresh, ypcall, tail, fin).
    flags: u8,
}

impl CallInfo {
    pub fn new(func: usize, top: usize, num_results: i32) -> Self {
        CallInfo {
            func,
            top,
            previous: None,
            next: None,
            num_results,
            base: func + 1,
            saved_pc: 0,
            k: None,
            ctx: 0,
            old_errfunc: 0,
            extra: 0,
            flags: 0,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.flags & FLAG_IS_LUA != 0
    }

    #[inline(always)]
    pub fn set_is_lua(&mut self, v: bool) {
        self.set_flag(FLAG_IS_LUA, v);
    }

    #[inline(always)]
    pub fn is_fresh(&self) -> bool {
        self.flags & FLAG_FRESH != 0
    }

    #[inline(always)]
    pub fn set_is_fresh(&mut self, v: bool) {
        self.set_flag(FLAG_FRESH, v);
    }

    /// A yieldable protected call is running in this frame.
    #[inline(always)]
    pub fn is_ypcall(&self) -> bool {
        self.flags & FLAG_YPCALL != 0
    }

    #[inline(always)]
    pub fn set_is_ypcall(&mut self, v: bool) {
        self.set_flag(FLAG_YPCALL, v);
    }

    #[inline(always)]
    pub fn is_tail_call(&self) -> bool {
        self.flags & FLAG_TAIL != 0
    }

    #[inline(always)]
    pub fn set_is_tail_call(&mut self, v: bool) {
        self.set_flag(FLAG_TAIL, v);
    }

    /// Frame runs a finalizer.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    #[inline(always)]
    pub fn set_is_fin(&mut self, v: bool) {
        self.set_flag(FLAG_FIN, v);
    }

    #[inline(always)]
    fn set_flag(&mut self, flag: u8, v: bool) {
        if v {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Reset a reused node for a new activation, keeping its links.
    pub fn reset(&mut self, func: usize, top: usize, num_results: i32) {
        let (previous, next) = (self.previous, self.next);
        *self = CallInfo::new(func, top, num_results);
        self.previous = previous;
        self.next = next;
    }
}

/// The frame list of one thread.
#[derive(Debug)]
pub struct CallStack {
    nodes: Vec<Option<CallInfo>>,
    free: Vec<u32>,
    base: FrameId,
    current: FrameId,
    /// Number of nodes besides the base frame.
    nci: usize,
}

impl CallStack {
    /// A list holding only the base frame.
    pub fn new(func: usize, top: usize) -> Self {
        CallStack {
            nodes: vec![Some(CallInfo::new(func, top, 0))],
            free: Vec::new(),
            base: FrameId(0),
            current: FrameId(0),
            nci: 0,
        }
    }

    #[inline]
    pub fn get(&self, id: FrameId) -> &CallInfo {
        self.nodes[id.0 as usize].as_ref().expect("frame was freed")
    }

    #[inline]
    pub fn get_mut(&mut self, id: FrameId) -> &mut CallInfo {
        self.nodes[id.0 as usize].as_mut().expect("frame was freed")
    }

    #[inline]
    pub fn current(&self) -> FrameId {
        self.current
    }

    #[inline]
    pub fn ci(&self) -> &CallInfo {
        self.get(self.current)
    }

    #[inline]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        let cur = self.current;
        self.get_mut(cur)
    }

    #[inline]
    pub fn base(&self) -> FrameId {
        self.base
    }

    #[inline]
    pub fn at_base(&self) -> bool {
        self.current == self.base
    }

    pub fn set_current(&mut self, id: FrameId) {
        self.current = id;
    }

    /// Number of frame nodes besides the base frame.
    pub fn len(&self) -> usize {
        self.nci
    }

    pub fn is_empty(&self) -> bool {
        self.nci == 0
    }

    /// Node after the current one, if already allocated.
    pub fn peek_next(&self) -> Option<FrameId> {
        self.ci().next
    }

    /// Append a node after the current one, which must be the last.
    pub fn extend(&mut self) -> FrameId {
        debug_assert!(self.ci().next.is_none());
        let node = CallInfo {
            previous: Some(self.current),
            ..CallInfo::new(0, 0, 0)
        };
        let id = match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                FrameId(i)
            }
            None => {
                self.nodes.push(Some(node));
                FrameId(self.nodes.len() as u32 - 1)
            }
        };
        self.ci_mut().next = Some(id);
        self.nci += 1;
        id
    }

    /// Move to the next frame, allocating a node if needed.
    pub fn push(&mut self) -> FrameId {
        let id = match self.peek_next() {
            Some(id) => id,
            None => self.extend(),
        };
        self.current = id;
        id
    }

    /// Return to the previous frame.
    pub fn pop(&mut self) {
        if let Some(prev) = self.ci().previous {
            self.current = prev;
        }
    }

    fn release(&mut self, id: FrameId) {
        self.nodes[id.0 as usize] = None;
        self.free.push(id.0);
        self.nci -= 1;
    }

    /// Free every node after the current one. Returns how many were freed.
    pub fn free_unused(&mut self) -> usize {
        let mut freed = 0;
        let mut next = self.ci_mut().next.take();
        while let Some(id) = next {
            next = self.get(id).next;
            self.release(id);
            freed += 1;
        }
        freed
    }

    /// Free every other node after the current one. Returns how many were freed.
    pub fn shrink(&mut self) -> usize {
        let mut freed = 0;
        let mut ci = self.current;
        loop {
            let Some(next) = self.get(ci).next else { break };
            let Some(next2) = self.get(next).next else { break };
            self.release(next);
            freed += 1;
            self.get_mut(ci).next = Some(next2);
            self.get_mut(next2).previous = Some(ci);
            ci = next2;
        }
        freed
    }

    /// Frames in use, from the current one down to the base.
    pub fn active(&self) -> impl Iterator<Item = &CallInfo> + '_ {
        let mut cur = Some(self.current);
        std::iter::from_fn(move || {
            let id = cur?;
            let ci = self.get(id);
            cur = ci.previous;
            Some(ci)
        })
    }

    /// Number of frames in use, base included.
    pub fn depth(&self) -> usize {
        self.active().count()
    }
}
