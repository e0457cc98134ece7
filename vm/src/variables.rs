use log::{debug, warn};
use sci_bytecode::VarClass;
use sci_object::{Reg, SegmentError, SegmentId, SelectorLookup, lookup_selector};

use crate::VM;
use crate::debug::SelectorAccess;
use crate::error::{Fault, VmError};
use crate::settings::UninitializedReadPolicy;
use crate::workarounds::WorkaroundSolution;

/// Where each variable class lives for the active frame.
///
/// Globals and locals are locals blocks; temps and params are windows of
/// the data stack starting at `fp` and at the argc slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariableBlocks {
    pub globals: Option<SegmentId>,
    pub locals: Option<SegmentId>,
    pub temp_base: usize,
    pub temp_max: usize,
    pub param_base: usize,
    /// argc + 1: slot 0 is argc itself.
    pub param_max: usize,
}

impl VM {
    /// Point the variable blocks at the top frame.
    pub(crate) fn refresh_variables(&mut self) {
        let Some(frame) = self.exec.top() else { return };
        self.vars.locals = self
            .segments
            .script(frame.local_script)
            .and_then(|s| s.locals_segment);
        self.vars.temp_base = frame.fp;
        self.vars.temp_max = frame.sp.saturating_sub(frame.fp);
        self.vars.param_base = frame.argp;
        self.vars.param_max = frame.argc as usize + 1;
    }

    pub fn variables(&self) -> &VariableBlocks {
        &self.vars
    }

    fn block_segment(&self, class: VarClass) -> Option<SegmentId> {
        match class {
            VarClass::Global => self.vars.globals,
            _ => self.vars.locals,
        }
    }

    /// Stack slot of temp or param `index`.
    ///
    /// Indices past the class maximum are tolerated as long as they stay on
    /// the stack; scripts rely on it.
    fn stack_slot(&self, class: VarClass, index: i32) -> Result<usize, Fault> {
        let (base, max) = match class {
            VarClass::Temp => (self.vars.temp_base, self.vars.temp_max),
            _ => (self.vars.param_base, self.vars.param_max),
        };
        if index >= 0 && (index as usize) < max {
            return Ok(base + index as usize);
        }
        let slot = base as i64 + index as i64;
        if slot >= 0 && (slot as usize) < self.stack.len() {
            warn!("{} {index} is past the maximum {max}, reading stack slot {slot:#x}", class.name());
            return Ok(slot as usize);
        }
        Err(Fault::Fatal(VmError::VariableOutOfRange { class, index, max }))
    }

    /// Read variable `index` of `class`.
    pub fn read_var(&self, class: VarClass, index: i32) -> Result<Reg, Fault> {
        match class {
            VarClass::Global | VarClass::Local => {
                let values = self
                    .block_segment(class)
                    .and_then(|seg| self.segments.locals(seg))
                    .map_or(&[][..], |block| &block.values[..]);
                if index < 0 || index as usize >= values.len() {
                    return Err(Fault::Fatal(VmError::VariableOutOfRange {
                        class,
                        index,
                        max: values.len(),
                    }));
                }
                Ok(values[index as usize])
            }
            VarClass::Temp | VarClass::Param => {
                let value = self.stack.get(self.stack_slot(class, index)?)?;
                if value.is_uninitialized() {
                    return Err(self.uninitialized_read(class, index));
                }
                Ok(value)
            }
        }
    }

    fn uninitialized_read(&self, class: VarClass, index: i32) -> Fault {
        let table = match class {
            VarClass::Temp => &self.workarounds.uninitialized_temp,
            _ => &self.workarounds.uninitialized_param,
        };
        let cause = VmError::UninitializedRead { class, index };
        match self.find_workaround(table, u16::try_from(index).ok()) {
            Some(WorkaroundSolution::Fake(value)) => Fault::Recoverable {
                substitute: Reg::word(value),
                cause,
            },
            Some(_) => Fault::Recoverable { substitute: Reg::NULL, cause },
            None => match self.settings.uninit_policy {
                UninitializedReadPolicy::Lenient => Fault::Recoverable { substitute: Reg::NULL, cause },
                UninitializedReadPolicy::Strict => Fault::Fatal(cause),
            },
        }
    }

    /// Write variable `index` of `class`.
    pub fn write_var(&mut self, class: VarClass, index: i32, value: Reg) -> Result<(), Fault> {
        match class {
            VarClass::Global | VarClass::Local => {
                let block = self
                    .block_segment(class)
                    .and_then(|seg| self.segments.locals_mut(seg));
                let len = block.as_ref().map_or(0, |b| b.values.len());
                match block.and_then(|b| b.values.get_mut(usize::try_from(index).ok()?)) {
                    Some(slot) => *slot = value,
                    None => {
                        return Err(Fault::Fatal(VmError::VariableOutOfRange { class, index, max: len }));
                    }
                }
                if class == VarClass::Global {
                    self.swap_actor(index, value);
                }
                Ok(())
            }
            VarClass::Temp | VarClass::Param => {
                let slot = self.stack_slot(class, index)?;
                self.stack.set(slot, value)?;
                Ok(())
            }
        }
    }

    /// Read a variable, taking the substitute of a recoverable fault. A
    /// substituted temp is written back so the warning fires once.
    pub fn load_var(&mut self, class: VarClass, index: i32) -> Result<Reg, VmError> {
        match self.read_var(class, index) {
            Ok(value) => Ok(value),
            Err(fault) => {
                let value = fault.recover()?;
                if class == VarClass::Temp {
                    self.write_var(class, index, value).map_err(Fault::escalate)?;
                }
                Ok(value)
            }
        }
    }

    pub fn store_var(&mut self, class: VarClass, index: i32, value: Reg) -> Result<(), VmError> {
        self.write_var(class, index, value).map_err(Fault::escalate)
    }

    /// Mirror writes of the actor global into the configured object.
    fn swap_actor(&mut self, index: i32, value: Reg) {
        let Some(swap) = &self.settings.actor_swap else { return };
        if swap.global as i32 != index || value.is_null() {
            return;
        }
        let Some(obj) = self.segments.find_object_by_name(&swap.object_name) else { return };
        let Some(selector) = self.selectors.find(&swap.selector) else { return };
        if let Ok(SelectorLookup::Variable(var)) = lookup_selector(&self.segments, obj, selector) {
            if let Some(slot) = self.segments.object_mut(var.obj).and_then(|o| o.property_mut(var.index)) {
                *slot = value;
                debug!("actor global {index} mirrored into {}", swap.object_name);
            }
        }
    }

    /// Address of a variable, as computed by `lea`.
    pub fn variable_address(&self, class: VarClass, index: i32) -> Result<Reg, VmError> {
        let out_of_range = |max| VmError::VariableOutOfRange { class, index, max };
        match class {
            VarClass::Global | VarClass::Local => {
                let seg = self.block_segment(class).ok_or(out_of_range(0))?;
                let offset = u32::try_from(index).map_err(|_| out_of_range(0))?;
                Ok(Reg::pointer(seg, offset * 2))
            }
            VarClass::Temp | VarClass::Param => {
                let base = match class {
                    VarClass::Temp => self.vars.temp_base,
                    _ => self.vars.param_base,
                };
                let slot = base as i64 + index as i64;
                if slot < 0 || slot as usize >= self.stack.len() {
                    return Err(out_of_range(self.stack.len()));
                }
                Ok(self.stack.address(slot as usize))
            }
        }
    }

    /// Read through a pointer into a locals block or the stack.
    pub fn read_reference(&self, reg: Reg) -> Result<Reg, VmError> {
        if let Some(slot) = self.stack.index_of(reg) {
            return self.stack.get(slot);
        }
        self.segments
            .locals(reg.segment())
            .and_then(|block| block.values.get(reg.offset() as usize / 2).copied())
            .ok_or(VmError::InvalidReference(reg))
    }

    pub fn write_reference(&mut self, reg: Reg, value: Reg) -> Result<(), VmError> {
        if let Some(slot) = self.stack.index_of(reg) {
            return self.stack.set(slot, value);
        }
        let slot = self
            .segments
            .locals_mut(reg.segment())
            .and_then(|block| block.values.get_mut(reg.offset() as usize / 2))
            .ok_or(VmError::InvalidReference(reg))?;
        *slot = value;
        Ok(())
    }

    // ── properties of self ─────────────────────────────────────────

    fn self_object(&self) -> Result<Reg, Fault> {
        let objp = self.frame()?.objp;
        if !self.segments.is_object(objp) {
            return Err(Fault::Fatal(SegmentError::NotAnObject(objp).into()));
        }
        Ok(objp)
    }

    fn property_out_of_range(&self, objp: Reg, index: usize) -> VmError {
        VmError::PropertyOutOfRange {
            object: self.segments.object_name(objp).to_owned(),
            index,
            count: self.segments.object(objp).map_or(0, |o| o.property_count()),
        }
    }

    /// Property slot `index` of the current object.
    pub fn read_property(&mut self, index: usize) -> Result<Reg, Fault> {
        let objp = self.self_object()?;
        let (value, selector) = match self.segments.object(objp) {
            Some(o) => (o.property(index), o.property_selector(index)),
            None => (None, None),
        };
        let Some(value) = value else {
            return Err(Fault::Recoverable {
                substitute: self.dummy,
                cause: self.property_out_of_range(objp, index),
            });
        };
        if let Some(selector) = selector {
            self.check_selector_breakpoint(SelectorAccess::Read, objp, selector);
        }
        Ok(value)
    }

    /// Write property slot `index` of the current object. Out-of-range
    /// writes land in the dummy register.
    pub fn write_property(&mut self, index: usize, value: Reg) -> Result<(), Fault> {
        let objp = self.self_object()?;
        let selector = self.segments.object(objp).and_then(|o| o.property_selector(index));
        let slot = self.segments.object_mut(objp).and_then(|o| o.property_mut(index));
        let Some(slot) = slot else {
            self.dummy = value;
            return Err(Fault::Recoverable {
                substitute: value,
                cause: self.property_out_of_range(objp, index),
            });
        };
        *slot = value;
        if let Some(selector) = selector {
            self.check_selector_breakpoint(SelectorAccess::Write, objp, selector);
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
