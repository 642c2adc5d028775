//! Collector control from the host and the finalizer bridge.

use crate::vm::Vm;
use lunaria_core::collector::{self, GcDriver, GcPhase, GCSTEPSIZE, MIN_STEPMUL};
use lunaria_core::error::{LuaError, ThreadStatus};
use lunaria_core::state::GlobalState;
use lunaria_core::value::TValue;

/// A request to the collector, answered by [`Vm::gc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcCommand {
    /// Stop automatic collection.
    Stop,
    /// Restart automatic collection.
    Restart,
    /// Run a full cycle.
    Collect,
    /// Memory in use, in kilobytes.
    Count,
    /// Remainder of the memory in use modulo 1024.
    CountBytes,
    /// Perform collector work as if `n` kilobytes had been allocated; a
    /// basic step for 0. Answers 1 when the step finished a cycle.
    Step(i64),
    /// Set the pause; answers the previous value.
    SetPause(i64),
    /// Set the step multiplier; answers the previous value.
    SetStepMul(i64),
    /// Whether automatic collection is running.
    IsRunning,
}

impl Vm {
    pub fn gc(&mut self, cmd: GcCommand) -> Result<i64, LuaError> {
        let res = match cmd {
            GcCommand::Stop => {
                self.g.gc.running = false;
                0
            }
            GcCommand::Restart => {
                self.g.gc.set_debt(0);
                self.g.gc.running = true;
                0
            }
            GcCommand::Collect => {
                collector::full_gc(self, false)?;
                0
            }
            GcCommand::Count => (self.g.gc.total_bytes() >> 10) as i64,
            GcCommand::CountBytes => (self.g.gc.total_bytes() & 0x3ff) as i64,
            GcCommand::Step(data) => {
                let old_running = std::mem::replace(&mut self.g.gc.running, true);
                let mut debt = 1;
                let result = if data == 0 {
                    self.g.gc.set_debt(-GCSTEPSIZE);
                    collector::step(self)
                } else {
                    debt = data.saturating_mul(1024).saturating_add(self.g.gc.debt());
                    self.g.gc.set_debt(debt);
                    collector::check_gc(self)
                };
                self.g.gc.running = old_running;
                result?;
                i64::from(debt > 0 && self.g.gc.phase == GcPhase::Pause)
            }
            GcCommand::SetPause(data) => {
                let old = self.g.gc.pause;
                self.g.gc.pause = data.clamp(0, u32::MAX as i64) as u32;
                old as i64
            }
            GcCommand::SetStepMul(data) => {
                let old = self.g.gc.stepmul;
                self.g.gc.stepmul = data.clamp(MIN_STEPMUL as i64, u32::MAX as i64) as u32;
                old as i64
            }
            GcCommand::IsRunning => i64::from(self.g.gc.running),
        };
        Ok(res)
    }

    /// Take a collector step if allocation has put it in debt.
    pub fn check_gc(&mut self) -> Result<(), LuaError> {
        collector::check_gc(self)
    }
}

fn strip_gc_prefix(msg: String) -> String {
    msg.strip_prefix("error in __gc metamethod (")
        .and_then(|m| m.strip_suffix(')'))
        .map(str::to_owned)
        .unwrap_or(msg)
}

impl GcDriver for Vm {
    fn global(&mut self) -> &mut GlobalState {
        &mut self.g
    }

    /// Run `f(obj)` in protected mode on the running thread.
    fn call_finalizer(&mut self, f: TValue, obj: TValue) -> Result<(), LuaError> {
        let th = self.g.running;
        self.g.check_stack(th, 2)?;
        let t = self.thread_mut();
        let func = t.top;
        t.stack[func] = f;
        t.stack[func + 1] = obj;
        t.top += 2;
        t.ci_mut().set_is_fin(true);
        let status = self.pcall_at(func, 0, 0);
        let t = self.thread_mut();
        t.ci_mut().set_is_fin(false);
        if status == ThreadStatus::Ok {
            return Ok(());
        }
        let v = t.stack[func];
        t.top = func;
        Err(match status {
            ThreadStatus::ErrMem => LuaError::Memory,
            ThreadStatus::ErrErr => LuaError::ErrorInHandler,
            ThreadStatus::ErrGcMm => {
                let msg = match v {
                    TValue::Str(id) => self.g.string_lossy(id),
                    _ => String::new(),
                };
                LuaError::GcMetamethod(strip_gc_prefix(msg))
            }
            _ => LuaError::Value(v),
        })
    }
}
