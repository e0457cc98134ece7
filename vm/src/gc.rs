//! The hook through which a host-provided collector reclaims clones and
//! dynamic memory.
//!
//! The VM only reports what it keeps alive; deciding what else is reachable
//! (through object properties, locals, kernel lists) is the collector's job.

use log::debug;
use sci_object::{Reg, SegmentManager};

use crate::VM;
use crate::exec_stack::ExecFrame;

pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Reg));
}

pub trait GarbageCollector {
    fn collect(&mut self, segments: &mut SegmentManager, roots: &dyn RootProvider);
}

/// The registers, frames and live stack of a VM.
pub struct VmRoots<'a> {
    pub acc: Reg,
    pub prev: Reg,
    pub frames: &'a [ExecFrame],
    pub stack: &'a [Reg],
}

impl RootProvider for VmRoots<'_> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Reg)) {
        visitor(self.acc);
        visitor(self.prev);
        for frame in self.frames {
            visitor(frame.objp);
            visitor(frame.sendp);
            visitor(frame.pc.into());
        }
        for &value in self.stack {
            if value.is_pointer() {
                visitor(value);
            }
        }
    }
}

impl VM {
    pub fn set_garbage_collector(&mut self, gc: Box<dyn GarbageCollector>) {
        self.gc = Some(gc);
    }

    /// Count down one kernel call and collect when the interval is up.
    pub(crate) fn tick_gc(&mut self) {
        if self.gc.is_none() {
            return;
        }
        self.gc_countdown = self.gc_countdown.saturating_sub(1);
        if self.gc_countdown > 0 {
            return;
        }
        self.gc_countdown = self.settings.gc_interval;
        self.collect_garbage();
    }

    pub fn collect_garbage(&mut self) {
        let Some(mut gc) = self.gc.take() else { return };
        let sp = self.exec.top().map_or(0, |f| f.sp);
        let roots = VmRoots {
            acc: self.acc,
            prev: self.prev,
            frames: self.exec.frames(),
            stack: self.stack.live(sp),
        };
        debug!("collecting garbage, {} frames live", roots.frames.len());
        gc.collect(&mut self.segments, &roots);
        self.gc = Some(gc);
    }
}

// ── Tests ──────────────────────────────────────────────────────────
