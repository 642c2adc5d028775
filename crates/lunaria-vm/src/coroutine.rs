//! Coroutines: resume, yield, continuations and recovery of errors raised
//! inside yieldable protected calls.

use crate::vm::Vm;
use lunaria_core::callinfo::{FrameId, MULTRET};
use lunaria_core::error::{LuaError, ThreadStatus};
use lunaria_core::func::ContinuationId;
use lunaria_core::gc::GcIdx;
use lunaria_core::state::LuaThread;
use lunaria_core::value::TValue;

/// Coroutine status as seen from the running thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoStatus {
    /// Currently executing (the running thread).
    Running,
    /// Yielded, or created and not yet started.
    Suspended,
    /// Active but not running (it resumed another coroutine).
    Normal,
    /// Finished or failed with an error.
    Dead,
}

impl CoStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoStatus::Running => "running",
            CoStatus::Suspended => "suspended",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }
}

impl Vm {
    /// Create a thread and push it.
    pub fn new_thread(&mut self) -> Result<GcIdx<LuaThread>, LuaError> {
        let co = self.g.new_thread()?;
        self.push(TValue::Thread(co));
        self.check_gc()?;
        Ok(co)
    }

    pub fn is_yieldable(&self) -> bool {
        self.thread().is_yieldable()
    }

    /// Move the top `n` values of thread `from` onto thread `to`.
    pub fn xmove(&mut self, from: GcIdx<LuaThread>, to: GcIdx<LuaThread>, n: usize) -> Result<(), LuaError> {
        if from == to || n == 0 {
            return Ok(());
        }
        self.g.check_stack(to, n)?;
        let src = self.g.heap.thread(from).top - n;
        for i in 0..n {
            let v = self.g.heap.thread(from).stack[src + i];
            let t = self.g.heap.thread_mut(to);
            let top = t.top;
            t.stack[top] = v;
            t.top += 1;
        }
        let t = self.g.heap.thread_mut(to);
        let top = t.top;
        let ci = t.ci_mut();
        if ci.top < top {
            ci.top = top;
        }
        self.g.heap.thread_mut(from).top = src;
        Ok(())
    }

    /// Number of values on top of the current frame of `co`.
    pub fn thread_get_top(&self, co: GcIdx<LuaThread>) -> usize {
        let t = self.g.heap.thread(co);
        t.top - (t.ci().func + 1)
    }

    /// Status of `co` relative to the running thread.
    pub fn coroutine_status(&self, co: GcIdx<LuaThread>) -> CoStatus {
        if co == self.g.running {
            return CoStatus::Running;
        }
        let t = self.g.heap.thread(co);
        match t.status {
            ThreadStatus::Yield => CoStatus::Suspended,
            ThreadStatus::Ok if !t.frames.at_base() => CoStatus::Normal,
            ThreadStatus::Ok if t.top == t.ci().func + 1 => CoStatus::Dead,
            ThreadStatus::Ok => CoStatus::Suspended,
            _ => CoStatus::Dead,
        }
    }

    fn resume_error(&mut self, co: GcIdx<LuaThread>, e: LuaError, nargs: usize) -> (ThreadStatus, usize) {
        let v = e.to_value(&mut self.g);
        let t = self.g.heap.thread_mut(co);
        let avail = t.top - (t.ci().func + 1);
        t.top -= nargs.min(avail);
        let top = t.top;
        t.stack[top] = v;
        t.top += 1;
        (ThreadStatus::ErrRun, 1)
    }

    /// Start or continue `co` with `nargs` values from the top of its stack.
    ///
    /// To start a coroutine its stack must hold the body function followed
    /// by the arguments. Returns the outcome and how many values on top of
    /// `co` carry its results: the yielded values, the returned values or
    /// the error object.
    pub fn resume(&mut self, co: GcIdx<LuaThread>, nargs: usize) -> (ThreadStatus, usize) {
        let from = self.g.running;
        {
            let t = self.g.heap.thread(co);
            let nvals = t.top - (t.ci().func + 1);
            let startable = t.status == ThreadStatus::Ok && t.frames.at_base();
            if co == from || co == self.g.main_thread || (t.status == ThreadStatus::Ok && !t.frames.at_base()) {
                return self.resume_error(co, LuaError::ResumeNonSuspended, nargs);
            }
            if !(t.status == ThreadStatus::Yield || (startable && nvals > nargs)) {
                return self.resume_error(co, LuaError::ResumeDead, nargs);
            }
        }
        let ccalls = self.thread().n_ccalls + 1;
        if ccalls >= self.g.config.max_ccalls {
            return self.resume_error(co, LuaError::CStackOverflow, nargs);
        }
        let t = self.g.heap.thread_mut(co);
        let old_nny = t.nny;
        t.n_ccalls = ccalls;
        t.nny = 0;
        self.g.running = co;
        tracing::trace!(thread = co.0, nargs, "resume");

        let mut result = self.resume_body(nargs);
        let status = loop {
            match result {
                Ok(()) => break ThreadStatus::Ok,
                Err(LuaError::Yield) => break ThreadStatus::Yield,
                Err(e) => {
                    self.thread_mut().n_ccalls = ccalls;
                    let e = self.handle_error(e);
                    let status = e.status();
                    let v = e.to_value(&mut self.g);
                    if self.recover(v) {
                        result = self.unroll(Some(status));
                    } else {
                        // unrecoverable: the coroutine is dead
                        let t = self.thread_mut();
                        t.status = status;
                        let top = t.top;
                        t.stack[top] = v;
                        t.top += 1;
                        t.ci_mut().top = top + 1;
                        break status;
                    }
                }
            }
        };
        let t = self.thread_mut();
        t.nny = old_nny;
        t.n_ccalls = ccalls - 1;
        self.g.running = from;
        let nres = if status.is_error() { 1 } else { self.thread_get_top(co) };
        (status, nres)
    }

    fn resume_body(&mut self, nargs: usize) -> Result<(), LuaError> {
        if self.thread().status == ThreadStatus::Ok {
            let first = self.top_slot() - nargs;
            return self.precall(first - 1, MULTRET);
        }
        let t = self.thread_mut();
        t.status = ThreadStatus::Ok;
        let ci = t.ci_mut();
        ci.func = ci.extra;
        if !ci.is_lua() {
            let (k, ctx) = (ci.k, ci.ctx);
            let n = match k {
                Some(k) => {
                    let kf = self.continuation(k)?;
                    kf(self, ThreadStatus::Yield, ctx)?
                }
                // the values passed to resume become the results
                None => nargs,
            };
            self.poscall(n);
        }
        self.unroll(None)
    }

    pub(crate) fn continuation(&self, k: ContinuationId) -> Result<crate::vm::KFunction, LuaError> {
        self.continuations
            .get(k.0 as usize)
            .copied()
            .ok_or_else(|| LuaError::Runtime(format!("unregistered continuation {}", k.0)))
    }

    /// Run the continuations of every frame down to the base frame.
    fn unroll(&mut self, status: Option<ThreadStatus>) -> Result<(), LuaError> {
        if let Some(status) = status {
            self.finish_ccall(status)?;
        }
        while !self.thread().frames.at_base() {
            if self.thread().ci().is_lua() {
                // the executor picks the frame up again from its saved pc
                let func = self.frame_func();
                let Some(cl) = self.thread().stack[func].as_lua_closure() else {
                    return Err(LuaError::Runtime("scripted frame without a closure".into()));
                };
                let exec = self
                    .executor
                    .ok_or_else(|| LuaError::Runtime("no executor for scripted functions".into()))?;
                let n = exec(self, cl)?;
                self.poscall(n);
            } else {
                self.finish_ccall(ThreadStatus::Yield)?;
            }
        }
        Ok(())
    }

    /// Complete a host frame interrupted by a yield or a recovered error by
    /// calling its continuation.
    fn finish_ccall(&mut self, status: ThreadStatus) -> Result<(), LuaError> {
        let t = self.thread_mut();
        let ci = t.ci_mut();
        if ci.is_ypcall() {
            // the continuation runs inside the same protected call
            ci.set_is_ypcall(false);
            let old = ci.old_errfunc;
            t.errfunc = old;
        }
        let (k, ctx) = {
            let ci = t.ci();
            (ci.k, ci.ctx)
        };
        self.adjust_results(MULTRET);
        let Some(k) = k else {
            return Err(LuaError::Runtime("interrupted frame has no continuation".into()));
        };
        let kf = self.continuation(k)?;
        let n = kf(self, status, ctx)?;
        self.poscall(n);
        Ok(())
    }

    fn find_pcall(&self) -> Option<FrameId> {
        let frames = &self.thread().frames;
        let mut cur = Some(frames.current());
        while let Some(id) = cur {
            let ci = frames.get(id);
            if ci.is_ypcall() {
                return Some(id);
            }
            cur = ci.previous;
        }
        None
    }

    /// Unwind to the innermost yieldable protected call, leaving `err` in
    /// place of its callee. False when there is none.
    fn recover(&mut self, err: TValue) -> bool {
        let Some(id) = self.find_pcall() else {
            return false;
        };
        let th = self.g.running;
        let old_top = self.thread().frames.get(id).extra;
        self.g.close_upvals(th, old_top);
        let t = self.thread_mut();
        t.stack[old_top] = err;
        t.top = old_top + 1;
        t.frames.set_current(id);
        t.nny = 0;
        let old_errfunc = t.ci().old_errfunc;
        self.g.shrink_stack(th);
        self.thread_mut().errfunc = old_errfunc;
        true
    }

    /// Suspend the running coroutine with the top `nresults` values as the
    /// results of its resume. On the next resume the frame finishes through
    /// `k`, or returns the resume arguments when `k` is `None`.
    ///
    /// Always returns `Err`; a native function returns it as is.
    pub fn yield_k(&mut self, nresults: usize, ctx: isize, k: Option<ContinuationId>) -> Result<usize, LuaError> {
        let in_main = self.g.running == self.g.main_thread;
        let t = self.thread_mut();
        if t.nny > 0 {
            return Err(if in_main {
                LuaError::YieldOutsideCoroutine
            } else {
                LuaError::YieldAcrossBoundary
            });
        }
        let top = t.top;
        if nresults > top - (t.ci().func + 1) {
            return Err(LuaError::Runtime("not enough elements in the stack".into()));
        }
        t.status = ThreadStatus::Yield;
        let ci = t.ci_mut();
        ci.extra = ci.func;
        if !ci.is_lua() {
            ci.k = k;
            if k.is_some() {
                ci.ctx = ctx;
            }
            // protect the stack below the results
            ci.func = top - nresults - 1;
        }
        Err(LuaError::Yield)
    }

    pub fn yield_(&mut self, nresults: usize) -> Result<usize, LuaError> {
        self.yield_k(nresults, 0, None)
    }

    /// Close the upvalues of a suspended or dead coroutine and reset it to
    /// an empty dead state.
    pub fn close_thread(&mut self, co: GcIdx<LuaThread>) -> Result<(), LuaError> {
        match self.coroutine_status(co) {
            CoStatus::Running | CoStatus::Normal => {
                return Err(LuaError::Runtime(format!(
                    "cannot close a {} coroutine",
                    self.coroutine_status(co).name()
                )))
            }
            CoStatus::Suspended | CoStatus::Dead => {}
        }
        self.g.close_upvals(co, 0);
        let t = self.g.heap.thread_mut(co);
        let base = t.frames.base();
        t.frames.set_current(base);
        t.stack.iter_mut().for_each(|v| *v = TValue::Nil);
        t.top = 1;
        t.status = ThreadStatus::Ok;
        t.errfunc = 0;
        t.nny = 1;
        let ci = t.ci_mut();
        ci.func = 0;
        ci.top = 1 + lunaria_core::state::LUA_MINSTACK;
        self.g.free_frames(co);
        self.g.shrink_stack(co);
        Ok(())
    }
}
