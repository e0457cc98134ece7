use log::{debug, warn};
use sci_object::{ObjVarRef, Reg, SegmentError, SelectorId, SelectorLookup, lookup_selector};

use crate::VM;
use crate::debug::SelectorAccess;
use crate::error::{RunError, VmError};
use crate::exec_stack::{ExecFrame, FrameKind};

/// A send group larger than this means a corrupt argument count.
const MAX_SEND_ARGS: u16 = 0x800;

impl VM {
    fn selector_name(&self, selector: SelectorId) -> String {
        self.selectors.display_name(selector)
    }

    pub(crate) fn integer_at(&self, slot: usize) -> Result<u16, VmError> {
        let value = self.stack.get(slot)?;
        value.as_u16().ok_or(VmError::NotAnInteger(value))
    }

    /// Expand the selector groups at `argp` into exec frames.
    ///
    /// Each group is `selector, argc, args...` and `framesize` counts the
    /// words of all groups. Frames are pushed in reverse so the first group
    /// runs first; the first method gets `sp`, later ones inherit pointers
    /// from whatever returns into them. Property groups are performed right
    /// away when they end up on top.
    pub fn send_selector(
        &mut self,
        send_obj: Reg,
        work_obj: Reg,
        sp: usize,
        framesize: usize,
        argp: usize,
    ) -> Result<(), VmError> {
        let origin = self.exec.len().checked_sub(1);
        let local_script = self.exec.top().map_or(send_obj.segment(), |f| f.local_script);
        let caller_pc = self.exec.top().map(|f| f.pc);

        let mut frames = Vec::new();
        let mut sp = Some(sp);
        let mut argp = argp;
        let mut remaining = framesize as i64;
        while remaining > 0 {
            let mut raw = self.integer_at(argp)?;
            if self.settings.legacy_selector_lsb && raw & 1 != 0 {
                warn!("masking low bit of selector {raw:#x}");
                raw &= !1;
            }
            let selector = SelectorId(raw);
            let argc = self.integer_at(argp + 1)?;
            if argc > MAX_SEND_ARGS {
                return Err(VmError::TooManyArguments {
                    selector: self.selector_name(selector),
                    argc,
                });
            }

            let mut frame = match lookup_selector(&self.segments, send_obj, selector)? {
                SelectorLookup::None => {
                    return Err(VmError::SelectorNotFound {
                        object: self.segments.object_name(send_obj).to_owned(),
                        selector: self.selector_name(selector),
                    });
                }
                SelectorLookup::Variable(var) => {
                    let access = if argc == 0 { SelectorAccess::Read } else { SelectorAccess::Write };
                    self.check_selector_breakpoint(access, send_obj, selector);
                    let pc = caller_pc.unwrap_or_else(|| sci_object::CodePos::new(send_obj.segment(), 0));
                    let mut frame = ExecFrame::call(pc, 0, work_obj, argc, argp + 1);
                    frame.kind = FrameKind::VarSelector { var };
                    frame.sp_carried = true;
                    frame.local_script = local_script;
                    frame
                }
                SelectorLookup::Method(pc) => {
                    self.check_selector_breakpoint(SelectorAccess::Exec, send_obj, selector);
                    match sp.take() {
                        Some(sp) => ExecFrame::call(pc, sp, work_obj, argc, argp + 1),
                        None => {
                            let mut frame = ExecFrame::call(pc, 0, work_obj, argc, argp + 1);
                            frame.sp_carried = true;
                            frame
                        }
                    }
                }
            };
            frame.sendp = send_obj;
            frame.selector = Some(selector);
            frame.origin = origin;
            debug!(
                "send {}::{}({argc})",
                self.segments.object_name(send_obj),
                self.selector_name(selector)
            );
            frames.push(frame);

            remaining -= 2 + argc as i64;
            argp += argc as usize + 2;
        }

        for frame in frames.into_iter().rev() {
            self.push_frame(frame)?;
        }
        self.exec_varselectors()
    }

    /// Perform and pop every property access frame on top of the stack.
    pub fn exec_varselectors(&mut self) -> Result<(), VmError> {
        while let Some(frame) = self.exec.top() {
            if !frame.is_var_selector() {
                break;
            }
            let frame = frame.clone();
            self.exec_varselector(&frame)?;
            self.exec.pop();
        }
        Ok(())
    }

    /// Read a property into the accumulator, or write the first argument.
    pub(crate) fn exec_varselector(&mut self, frame: &ExecFrame) -> Result<(), VmError> {
        let FrameKind::VarSelector { var } = frame.kind else {
            return Ok(());
        };
        if frame.argc == 0 {
            self.acc = self.property_value(var)?;
            return Ok(());
        }
        if frame.argc > 1 {
            warn!(
                "property write to {}::{} with {} arguments",
                self.segments.object_name(var.obj),
                frame.selector.map(|s| self.selector_name(s)).unwrap_or_default(),
                frame.argc
            );
        }
        let value = self.stack.get(frame.argp + 1)?;
        self.set_property_value(var, value)
    }

    fn property_value(&self, var: ObjVarRef) -> Result<Reg, VmError> {
        self.segments
            .object(var.obj)
            .and_then(|o| o.property(var.index))
            .ok_or(VmError::Segment(SegmentError::InvalidReference(var.obj)))
    }

    fn set_property_value(&mut self, var: ObjVarRef, value: Reg) -> Result<(), VmError> {
        let slot = self
            .segments
            .object_mut(var.obj)
            .and_then(|o| o.property_mut(var.index))
            .ok_or(VmError::Segment(SegmentError::InvalidReference(var.obj)))?;
        *slot = value;
        Ok(())
    }

    /// Value of property `selector` of `obj`, or null when `obj` has no such
    /// property.
    pub fn read_selector(&self, obj: Reg, selector: SelectorId) -> Result<Reg, VmError> {
        match lookup_selector(&self.segments, obj, selector)? {
            SelectorLookup::Variable(var) => self.property_value(var),
            _ => Ok(Reg::NULL),
        }
    }

    pub fn write_selector(&mut self, obj: Reg, selector: SelectorId, value: Reg) -> Result<(), VmError> {
        match lookup_selector(&self.segments, obj, selector)? {
            SelectorLookup::Variable(var) => self.set_property_value(var, value),
            _ => Err(VmError::NotAVariable {
                object: self.segments.object_name(obj).to_owned(),
                selector: self.selector_name(selector),
            }),
        }
    }

    /// Call method `selector` of `obj` in a nested run and return its result.
    ///
    /// The arguments are placed above the current frame's stack area. The
    /// registers of the calling run are left as they were.
    pub fn invoke_selector(
        &mut self,
        obj: Reg,
        selector: SelectorId,
        args: &[Reg],
    ) -> Result<Reg, RunError> {
        let found = lookup_selector(&self.segments, obj, selector).map_err(|e| self.fatal(e.into()))?;
        match found {
            SelectorLookup::Method(_) => {}
            SelectorLookup::Variable(_) => {
                return Err(self.fatal(VmError::NotAMethod {
                    object: self.segments.object_name(obj).to_owned(),
                    selector: self.selector_name(selector),
                }));
            }
            SelectorLookup::None => {
                return Err(self.fatal(VmError::SelectorNotFound {
                    object: self.segments.object_name(obj).to_owned(),
                    selector: self.selector_name(selector),
                }));
            }
        }

        let base = self.free_slot();
        let framesize = 2 + args.len();
        self.place_send(base, selector, args).map_err(|e| self.fatal(e))?;

        let saved = self.save_registers();
        if let Err(e) = self.send_selector(obj, obj, base + framesize, framesize, base) {
            let error = self.fatal(e);
            self.restore_registers(saved);
            return Err(error);
        }
        let result = self.run();
        self.restore_registers(saved);
        result
    }

    fn place_send(&mut self, base: usize, selector: SelectorId, args: &[Reg]) -> Result<(), VmError> {
        self.stack.set(base, Reg::word(selector.0))?;
        self.stack.set(base + 1, Reg::word(args.len() as u16))?;
        for (i, &arg) in args.iter().enumerate() {
            self.stack.set(base + 2 + i, arg)?;
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
