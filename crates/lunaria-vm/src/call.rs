//! Calls, protected calls and the message handler.
//!
//! Errors travel as `Err(LuaError)` through the Rust stack while the frame
//! list of the thread is left as it was at the failure point. The nearest
//! protected boundary restores the frames and leaves the error object in
//! place of the called function.

use crate::vm::{Vm, REGISTRY_INDEX};
use lunaria_core::callinfo::MULTRET;
use lunaria_core::collector::check_gc;
use lunaria_core::error::{LuaError, ThreadStatus};
use lunaria_core::func::ContinuationId;
use lunaria_core::object::TagMethod;
use lunaria_core::state::LUA_MINSTACK;
use lunaria_core::value::TValue;

impl Vm {
    /// Call the value in slot `func` with every value above it as arguments.
    /// With `yieldable` false the callee may not yield.
    pub(crate) fn call_at(&mut self, func: usize, nresults: i32, yieldable: bool) -> Result<(), LuaError> {
        let max = self.g.config.max_ccalls;
        let t = self.thread_mut();
        t.n_ccalls += 1;
        if t.n_ccalls >= max {
            if t.n_ccalls == max {
                return Err(LuaError::CStackOverflow);
            } else if t.n_ccalls >= max + (max >> 3) {
                // overflow while handling an overflow
                return Err(LuaError::ErrorInHandler);
            }
        }
        if !yieldable {
            t.nny += 1;
        }
        self.precall(func, nresults)?;
        let t = self.thread_mut();
        if !yieldable {
            t.nny -= 1;
        }
        t.n_ccalls -= 1;
        Ok(())
    }

    /// Enter the callee in `func`, run it and move its results into place.
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> Result<(), LuaError> {
        let f = self.thread().stack[func];
        match f {
            TValue::Native(c) => {
                let id = self.g.heap.native(c).func;
                let native = self
                    .natives
                    .get(id.0 as usize)
                    .copied()
                    .ok_or_else(|| LuaError::Runtime(format!("unregistered native function {}", id.0)))?;
                self.enter_frame(func, nresults, false)?;
                check_gc(self)?;
                let n = native(self)?;
                self.poscall(n);
                Ok(())
            }
            TValue::LuaFn(cl) => {
                let exec = self
                    .executor
                    .ok_or_else(|| LuaError::Runtime("no executor for scripted functions".into()))?;
                self.enter_frame(func, nresults, true)?;
                let n = exec(self, cl)?;
                self.poscall(n);
                Ok(())
            }
            _ => {
                let tm = self.g.tm_by_obj(&f, TagMethod::Call);
                if !tm.is_function() {
                    return Err(LuaError::Runtime(format!("attempt to call a {} value", f.type_name())));
                }
                // the handler becomes the callee, the called object its first argument
                let th = self.g.running;
                self.g.check_stack(th, 1)?;
                let t = self.thread_mut();
                let top = t.top;
                t.stack.copy_within(func..top, func + 1);
                t.stack[func] = tm;
                t.top += 1;
                self.precall(func, nresults)
            }
        }
    }

    fn enter_frame(&mut self, func: usize, nresults: i32, is_lua: bool) -> Result<(), LuaError> {
        let th = self.g.running;
        self.g.check_stack(th, LUA_MINSTACK)?;
        self.g.next_frame(th)?;
        let t = self.thread_mut();
        let top = t.top + LUA_MINSTACK;
        let ci = t.ci_mut();
        ci.reset(func, top, nresults);
        ci.base = func + 1;
        ci.set_is_lua(is_lua);
        Ok(())
    }

    /// Leave the current frame, whose last `n` stack values are its results.
    pub(crate) fn poscall(&mut self, n: usize) {
        let th = self.g.running;
        let (func, wanted) = {
            let ci = self.thread().ci();
            (ci.func, ci.num_results)
        };
        // host frames may have captured their own slots too
        self.g.close_upvals(th, func + 1);
        let t = self.thread_mut();
        let n = n.min(t.top - (func + 1));
        let first = t.top - n;
        t.frames.pop();
        let wanted = Vm::wanted(wanted).unwrap_or(n);
        t.stack.copy_within(first..first + n.min(wanted), func);
        for slot in func + n..func + wanted {
            t.stack[slot] = TValue::Nil;
        }
        t.top = func + wanted;
    }

    pub(crate) fn adjust_results(&mut self, nresults: i32) {
        let t = self.thread_mut();
        let top = t.top;
        let ci = t.ci_mut();
        if nresults == MULTRET && ci.top < top {
            ci.top = top;
        }
    }

    /// Slot of the function below `nargs` arguments on top of the stack.
    fn callee_slot(&mut self, nargs: usize, nresults: i32) -> Result<usize, LuaError> {
        let t = self.thread();
        let func = t
            .top
            .checked_sub(nargs + 1)
            .filter(|&f| f > t.ci().func)
            .ok_or_else(|| LuaError::Runtime("not enough elements in the stack".into()))?;
        if let Some(n) = Vm::wanted(nresults) {
            if n > nargs {
                self.check_stack(n - nargs)?;
            }
        }
        Ok(func)
    }

    /// Call the function below `nargs` arguments on top of the stack,
    /// replacing them with `nresults` results (all of them for [`MULTRET`]).
    ///
    /// An error that no protected call catches leaves the thread as it was
    /// at the failure point; the runtime can then only be dropped.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<(), LuaError> {
        self.call_k(nargs, nresults, 0, None)
    }

    /// Like [`Vm::call`], but when the running thread may yield, the callee
    /// may yield too; the calling frame then continues in `k` on resume.
    /// Calls made from a scripted frame may always yield: on resume the
    /// executor is entered again for that frame.
    pub fn call_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        ctx: isize,
        k: Option<ContinuationId>,
    ) -> Result<(), LuaError> {
        let func = self.callee_slot(nargs, nresults)?;
        let t = self.thread();
        let yieldable = t.nny == 0 && (k.is_some() || t.ci().is_lua());
        if yieldable {
            let ci = self.thread_mut().ci_mut();
            ci.k = k;
            ci.ctx = ctx;
        }
        self.call_at(func, nresults, yieldable)?;
        self.adjust_results(nresults);
        Ok(())
    }

    /// Run the callee at `func` in protected mode with message handler
    /// slot `ef` (0 for none). On error the frames, the non-yieldable
    /// count and the handler are restored and the error object is left
    /// in slot `func`.
    pub(crate) fn pcall_at(&mut self, func: usize, nresults: i32, ef: usize) -> ThreadStatus {
        let (old_ci, old_nny, old_errfunc, old_ccalls) = {
            let t = self.thread();
            (t.frames.current(), t.nny, t.errfunc, t.n_ccalls)
        };
        self.thread_mut().errfunc = ef;
        let status = match self.call_at(func, nresults, false) {
            Ok(()) => ThreadStatus::Ok,
            Err(e) => {
                let e = self.handle_error(e);
                let status = e.status();
                let v = e.to_value(&mut self.g);
                let th = self.g.running;
                self.g.close_upvals(th, func);
                let t = self.thread_mut();
                t.stack[func] = v;
                t.top = func + 1;
                t.frames.set_current(old_ci);
                t.nny = old_nny;
                t.n_ccalls = old_ccalls;
                self.g.shrink_stack(th);
                tracing::trace!(?status, "protected call failed");
                status
            }
        };
        self.thread_mut().errfunc = old_errfunc;
        status
    }

    /// Give the message handler of the running thread a chance to replace
    /// the value of a runtime error. The frames where the error happened
    /// are still in place while it runs.
    pub(crate) fn handle_error(&mut self, e: LuaError) -> LuaError {
        let ef = self.thread().errfunc;
        if ef == 0 || e.status() != ThreadStatus::ErrRun {
            return e;
        }
        let handler = self.thread().stack[ef];
        let th = self.g.running;
        // growing the stack may collect: an error object popped by the
        // failing function is held here, and a message string is made after
        let held = match e {
            LuaError::Value(v) => v,
            _ => TValue::Nil,
        };
        let mark = self.g.anchor(&[held]);
        let grown = self.g.check_stack(th, 2);
        self.g.release_anchors(mark);
        if grown.is_err() {
            return LuaError::ErrorInHandler;
        }
        let v = e.to_value(&mut self.g);
        let t = self.thread_mut();
        let top = t.top;
        t.stack[top] = handler;
        t.stack[top + 1] = v;
        t.top += 2;
        match self.call_at(top, 1, false) {
            Ok(()) => {
                let t = self.thread_mut();
                t.top -= 1;
                LuaError::Value(t.stack[t.top])
            }
            Err(_) => LuaError::ErrorInHandler,
        }
    }

    fn errfunc_slot(&self, errfunc: i32) -> Result<usize, LuaError> {
        if errfunc == 0 {
            return Ok(0);
        }
        if errfunc <= REGISTRY_INDEX {
            return Err(LuaError::Runtime("message handler must be a stack index".into()));
        }
        self.stack_slot(errfunc)
    }

    /// Call the function below `nargs` arguments in protected mode. Errors
    /// are caught and reported through the returned status, with the error
    /// object left on the stack; `errfunc` names a message handler on the
    /// stack, or 0.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: i32) -> Result<ThreadStatus, LuaError> {
        self.pcall_k(nargs, nresults, errfunc, 0, None)
    }

    /// Protected call that lets the callee yield when the running thread
    /// may. In that mode errors are not caught here: they propagate to
    /// the enclosing resume, which restores this frame and calls `k` with
    /// the error status. The caller must pass such errors on unchanged.
    pub fn pcall_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        errfunc: i32,
        ctx: isize,
        k: Option<ContinuationId>,
    ) -> Result<ThreadStatus, LuaError> {
        let ef = self.errfunc_slot(errfunc)?;
        let func = self.callee_slot(nargs, nresults)?;
        let status = if k.is_none() || self.thread().nny > 0 {
            self.pcall_at(func, nresults, ef)
        } else {
            let t = self.thread_mut();
            let old_errfunc = t.errfunc;
            let ci = t.ci_mut();
            ci.k = k;
            ci.ctx = ctx;
            ci.extra = func;
            ci.old_errfunc = old_errfunc;
            ci.set_is_ypcall(true);
            t.errfunc = ef;
            self.call_at(func, nresults, true)?;
            let t = self.thread_mut();
            t.ci_mut().set_is_ypcall(false);
            t.errfunc = old_errfunc;
            ThreadStatus::Ok
        };
        self.adjust_results(nresults);
        Ok(status)
    }
}
