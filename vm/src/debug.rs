//! Breakpoints, tracing and the console the interpreter reports to.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use sci_object::{CodePos, Reg, SelectorId};

use crate::VM;
use crate::exec_stack::FrameKind;

/// Arguments shown per frame in a backtrace.
const BACKTRACE_ARGS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorAccess {
    Exec,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// `Obj::sel`, or `Obj::` for every selector of `Obj`.
    SelectorExec(String),
    SelectorRead(String),
    SelectorWrite(String),
    /// A kernel name pattern, see [`match_kernel_pattern`].
    Kernel(String),
    Export { script: u16, export: u16 },
    Address(CodePos),
}

impl BreakpointKind {
    fn mask(&self) -> u8 {
        match self {
            BreakpointKind::SelectorExec(_) => 1 << 0,
            BreakpointKind::SelectorRead(_) => 1 << 1,
            BreakpointKind::SelectorWrite(_) => 1 << 2,
            BreakpointKind::Kernel(_) => 1 << 3,
            BreakpointKind::Export { .. } => 1 << 4,
            BreakpointKind::Address(_) => 1 << 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakpointAction {
    /// Stop and hand control to the console.
    #[default]
    Break,
    Log,
    Backtrace,
    /// Dump the object involved.
    Inspect,
    /// Skip the kernel call entirely.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub kind: BreakpointKind,
    pub action: BreakpointAction,
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            BreakpointKind::SelectorExec(name) => write!(f, "execute {name}")?,
            BreakpointKind::SelectorRead(name) => write!(f, "read {name}")?,
            BreakpointKind::SelectorWrite(name) => write!(f, "write {name}")?,
            BreakpointKind::Kernel(pattern) => write!(f, "kernel {pattern}")?,
            BreakpointKind::Export { script, export } => write!(f, "export {script}:{export}")?,
            BreakpointKind::Address(pos) => write!(f, "address {pos}")?,
        }
        write!(f, " ({:?})", self.action)
    }
}

/// What the interpreter is stopped at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub pos: CodePos,
    /// The instruction about to execute.
    pub disassembly: String,
    pub frame: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resume {
    /// Leave debugging mode.
    #[default]
    Continue,
    /// Stop again before the next instruction.
    Step,
    Abort,
}

/// Where breakpoint messages, traces and stops go.
pub trait DebugConsole {
    fn print(&mut self, line: &str);

    /// Called before an instruction while debugging.
    fn stopped(&mut self, stop: &StopInfo) -> Resume {
        let _ = stop;
        Resume::Continue
    }
}

/// Writes everything to the log and never stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConsole;

impl DebugConsole for LogConsole {
    fn print(&mut self, line: &str) {
        info!("{line}");
    }
}

#[derive(Debug, Default)]
struct Buffer {
    lines: Vec<String>,
    responses: VecDeque<Resume>,
    stops: Vec<StopInfo>,
}

/// Records output and answers stops from a queue. Clones share the buffer,
/// so a host can keep one while the VM owns another.
#[derive(Debug, Clone, Default)]
pub struct BufferedConsole(Arc<Mutex<Buffer>>);

impl BufferedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer successive stops with `responses`, then with `Continue`.
    pub fn with_responses(responses: impl IntoIterator<Item = Resume>) -> Self {
        let console = Self::new();
        console.0.lock().responses.extend(responses);
        console
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().lines.clone()
    }

    pub fn stops(&self) -> Vec<StopInfo> {
        self.0.lock().stops.clone()
    }
}

impl DebugConsole for BufferedConsole {
    fn print(&mut self, line: &str) {
        self.0.lock().lines.push(line.to_owned());
    }

    fn stopped(&mut self, stop: &StopInfo) -> Resume {
        let mut buffer = self.0.lock();
        buffer.stops.push(stop.clone());
        buffer.responses.pop_front().unwrap_or_default()
    }
}

pub struct DebugState {
    breakpoints: Vec<Breakpoint>,
    /// Union of the kinds present, so checks are free when nothing is set.
    active: u8,
    /// Stop before the next instruction.
    pub debugging: bool,
    /// Print every instruction.
    pub trace: bool,
    /// Set whenever a breakpoint matches; hosts clear it.
    pub breakpoint_hit: bool,
    pub console: Box<dyn DebugConsole>,
}

impl Default for DebugState {
    fn default() -> Self {
        Self {
            breakpoints: Vec::new(),
            active: 0,
            debugging: false,
            trace: false,
            breakpoint_hit: false,
            console: Box::new(LogConsole),
        }
    }
}

impl DebugState {
    pub fn set_console(&mut self, console: impl DebugConsole + 'static) {
        self.console = Box::new(console);
    }

    /// Add a breakpoint, returning its index.
    pub fn add(&mut self, kind: BreakpointKind, action: BreakpointAction) -> usize {
        self.active |= kind.mask();
        self.breakpoints.push(Breakpoint { kind, action });
        self.breakpoints.len() - 1
    }

    pub fn remove(&mut self, index: usize) -> Option<Breakpoint> {
        if index >= self.breakpoints.len() {
            return None;
        }
        let removed = self.breakpoints.remove(index);
        self.active = self.breakpoints.iter().fold(0, |m, b| m | b.kind.mask());
        Some(removed)
    }

    pub fn set_action(&mut self, index: usize, action: BreakpointAction) -> bool {
        match self.breakpoints.get_mut(index) {
            Some(bp) => {
                bp.action = action;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
        self.active = 0;
    }

    pub fn list(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    fn has(&self, mask: u8) -> bool {
        self.active & mask != 0
    }

    fn find(&self, mut matches: impl FnMut(&BreakpointKind) -> bool) -> Option<BreakpointAction> {
        self.breakpoints.iter().find(|b| matches(&b.kind)).map(|b| b.action)
    }
}

/// Match a kernel name against a pattern such as `DoSound*,!DoSoundUpdateCues`.
///
/// Atoms are separated by commas. A trailing `*` matches a prefix and a
/// leading `!` excludes. The last atom that matches decides.
pub fn match_kernel_pattern(pattern: &str, name: &str) -> bool {
    let mut result = false;
    for atom in pattern.split(',') {
        let atom = atom.trim();
        let (include, atom) = match atom.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, atom),
        };
        let matched = match atom.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => atom == name,
        };
        if matched {
            result = include;
        }
    }
    result
}

fn selector_matches(breakpoint: &str, method: &str) -> bool {
    if breakpoint.ends_with("::") {
        method.starts_with(breakpoint)
    } else {
        breakpoint == method
    }
}

impl VM {
    fn print_debug(&mut self, line: &str) {
        self.debug.console.print(line);
    }

    /// Carry out a matched breakpoint. `obj` is inspected for `Inspect`.
    fn apply_breakpoint(&mut self, action: BreakpointAction, message: String, obj: Option<Reg>) {
        self.debug.breakpoint_hit = true;
        match action {
            BreakpointAction::Ignore => return,
            BreakpointAction::Break => self.debug.debugging = true,
            BreakpointAction::Log => {}
            BreakpointAction::Backtrace => {
                self.print_debug(&message);
                for line in self.log_backtrace() {
                    self.print_debug(&line);
                }
                return;
            }
            BreakpointAction::Inspect => {
                self.print_debug(&message);
                if let Some(obj) = obj {
                    for line in self.inspect_object(obj) {
                        self.print_debug(&line);
                    }
                }
                return;
            }
        }
        self.print_debug(&message);
    }

    /// Check a selector access against the breakpoints.
    pub fn check_selector_breakpoint(
        &mut self,
        access: SelectorAccess,
        obj: Reg,
        selector: SelectorId,
    ) -> bool {
        let mask = match access {
            SelectorAccess::Exec => 1 << 0,
            SelectorAccess::Read => 1 << 1,
            SelectorAccess::Write => 1 << 2,
        };
        if !self.debug.has(mask) {
            return false;
        }
        let method = format!(
            "{}::{}",
            self.segments.object_name(obj),
            self.selectors.display_name(selector)
        );
        let found = self.debug.find(|kind| match (kind, access) {
            (BreakpointKind::SelectorExec(name), SelectorAccess::Exec)
            | (BreakpointKind::SelectorRead(name), SelectorAccess::Read)
            | (BreakpointKind::SelectorWrite(name), SelectorAccess::Write) => {
                selector_matches(name, &method)
            }
            _ => false,
        });
        let Some(action) = found else { return false };
        let message = format!("Break on {method} (in [{obj}])");
        self.apply_breakpoint(action, message, Some(obj));
        true
    }

    pub fn check_export_breakpoint(&mut self, script: u16, export: u16) -> bool {
        if !self.debug.has(1 << 4) {
            return false;
        }
        let found = self.debug.find(|kind| {
            *kind == BreakpointKind::Export { script, export }
        });
        let Some(action) = found else { return false };
        self.apply_breakpoint(action, format!("Break on script {script}, export {export}"), None);
        true
    }

    pub fn check_address_breakpoint(&mut self, pos: CodePos) -> bool {
        if !self.debug.has(1 << 5) {
            return false;
        }
        let Some(action) = self.debug.find(|kind| *kind == BreakpointKind::Address(pos)) else {
            return false;
        };
        self.apply_breakpoint(action, format!("Break at {pos}"), None);
        true
    }

    /// Check a kernel call by display name; the caller skips the call on
    /// [`BreakpointAction::Ignore`].
    pub fn check_kernel_breakpoint(&mut self, name: &str) -> Option<BreakpointAction> {
        if !self.debug.has(1 << 3) {
            return None;
        }
        let action = self.debug.find(|kind| match kind {
            BreakpointKind::Kernel(pattern) => match_kernel_pattern(pattern, name),
            _ => false,
        })?;
        self.apply_breakpoint(action, format!("Break on k{name}"), None);
        Some(action)
    }

    /// Render the execution stack, outermost frame first.
    pub fn log_backtrace(&self) -> Vec<String> {
        let mut lines = vec![format!("Call stack (current base: 0x{:x}):", self.exec.base())];
        for (i, frame) in self.exec.frames().iter().enumerate() {
            let origin = frame
                .origin
                .map_or_else(|| "-".to_owned(), |o| format!("{o:x}"));
            let obj = self.segments.object_name(frame.sendp);
            let selector = frame
                .selector
                .map(|s| self.selectors.display_name(s))
                .unwrap_or_default();
            let mut line = match frame.kind {
                FrameKind::Call => {
                    let script = self
                        .segments
                        .script(frame.pc.segment)
                        .map_or_else(|| "?".to_owned(), |s| s.number.to_string());
                    let what = match (frame.selector, frame.export, frame.local_call_offset) {
                        (_, _, Some(offset)) => format!("call {offset:x} ("),
                        (Some(_), _, _) => format!("{obj}::{selector}("),
                        (None, Some(export), _) => format!("export {export} ("),
                        (None, None, None) => "(".to_owned(),
                    };
                    format!(" {i:x}: script {script} - {what}")
                }
                FrameKind::Kernel { function, sub } => {
                    format!(" {i:x}:[{origin}]  k{}(", self.kernel.name(function, sub))
                }
                FrameKind::VarSelector { .. } => {
                    let access = if frame.argc == 0 { "read" } else { "write" };
                    format!(" {i:x}:[{origin}] vs{access} {obj}::{selector} (")
                }
            };

            let shown = (frame.argc as usize).min(BACKTRACE_ARGS);
            let args: Vec<String> = (0..shown)
                .map(|j| {
                    self.stack
                        .get(frame.argp + 1 + j)
                        .map_or_else(|_| "????".to_owned(), |r| r.to_string())
                })
                .collect();
            line.push_str(&args.join(", "));
            if frame.argc as usize > shown {
                line.push_str("...");
            }
            line.push(')');
            lines.push(line);

            let mut detail = format!("     by {origin} obj@{}", frame.objp);
            if frame.is_call() {
                detail.push_str(&format!(" pc={}", frame.pc));
                if frame.sp_carried {
                    detail.push_str(" sp,fp:carry");
                } else {
                    detail.push_str(&format!(" sp=ST:{:04x} fp=ST:{:04x}", frame.sp, frame.fp));
                }
            } else {
                detail.push_str(" pc:none");
            }
            detail.push_str(&format!(" argp:ST:{:04x}", frame.argp));
            lines.push(detail);
        }
        lines
    }

    /// Describe an object: its hierarchy, properties and methods.
    pub fn inspect_object(&self, obj: Reg) -> Vec<String> {
        let Some(object) = self.segments.object(obj) else {
            return vec![format!("[{obj}] is not an object")];
        };
        let kind = if object.is_class {
            "class"
        } else if object.is_clone {
            "clone"
        } else {
            "object"
        };
        let mut lines = vec![format!("[{obj}] {} ({kind}, script {})", object.name, object.script)];
        lines.push(format!(
            "  superclass: {} [{}]",
            self.segments.object_name(object.superclass),
            object.superclass
        ));
        lines.push(format!("  {} properties:", object.property_count()));
        for (i, value) in object.properties.iter().enumerate() {
            let name = object
                .property_selector(i)
                .map_or_else(|| format!("#{i}"), |s| self.selectors.display_name(s));
            lines.push(format!("    {name} = {value}"));
        }
        lines.push(format!("  {} methods:", object.methods.len()));
        for method in &object.methods {
            lines.push(format!(
                "    {} at {:04x}",
                self.selectors.display_name(method.selector),
                method.offset
            ));
        }
        lines
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use crate::kernel::KernelRegistry;
    use crate::testing::{self, TestGame};
    use sci_bytecode::{BytecodeBuilder, VarClass};

    #[test]
    fn kernel_patterns() {
        let pattern = "DoSound*,!DoSoundUpdateCues";
        assert!(match_kernel_pattern(pattern, "DoSoundPlay"));
        assert!(!match_kernel_pattern(pattern, "DoSoundUpdateCues"));
        assert!(!match_kernel_pattern(pattern, "Animate"));
        assert!(match_kernel_pattern("*", "Animate"));
        assert!(match_kernel_pattern("GetTime", "GetTime"));
        assert!(!match_kernel_pattern("GetTime", "GetTimeOfDay"));
    }

    #[test]
    fn object_prefix_matches_every_selector() {
        let mut vm = TestGame::new().build();
        let console = BufferedConsole::new();
        vm.debug.set_console(console.clone());
        vm.debug.add(BreakpointKind::SelectorRead("ego::".into()), BreakpointAction::Log);
        let ego = testing::object(&vm, "ego");
        let groop = testing::object(&vm, "stopGroop");
        let x = testing::selector(&vm, "x");

        assert!(vm.check_selector_breakpoint(SelectorAccess::Read, ego, x));
        assert!(!vm.check_selector_breakpoint(SelectorAccess::Write, ego, x));
        assert!(!vm.check_selector_breakpoint(SelectorAccess::Read, groop, x));
        assert_eq!(console.lines(), vec![format!("Break on ego::x (in [{ego}])")]);
        assert!(!vm.debug.debugging);
    }

    #[test]
    fn break_action_enters_debugging() {
        let mut vm = TestGame::new().build();
        vm.debug.set_console(BufferedConsole::new());
        let index = vm.debug.add(
            BreakpointKind::Export { script: 0, export: 2 },
            BreakpointAction::Break,
        );
        assert!(!vm.check_export_breakpoint(0, 1));
        assert!(vm.check_export_breakpoint(0, 2));
        assert!(vm.debug.debugging && vm.debug.breakpoint_hit);

        vm.debug.remove(index);
        vm.debug.debugging = false;
        assert!(!vm.check_export_breakpoint(0, 2));
    }

    #[test]
    fn ignored_kernel_calls_are_reported_to_the_caller() {
        let mut vm = TestGame::new().build();
        let console = BufferedConsole::new();
        vm.debug.set_console(console.clone());
        vm.debug.add(BreakpointKind::Kernel("Graph*".into()), BreakpointAction::Ignore);
        assert_eq!(vm.check_kernel_breakpoint("GraphFillBox"), Some(BreakpointAction::Ignore));
        assert_eq!(vm.check_kernel_breakpoint("Animate"), None);
        assert!(console.lines().is_empty());
    }

    #[test]
    fn inspection_names_properties() {
        let vm = TestGame::new().build();
        let ego = testing::object(&vm, "ego");
        let lines = vm.inspect_object(ego);
        assert!(lines[0].contains("ego (object, script 0)"));
        assert!(lines[1].contains("Actor"));
        assert!(lines.iter().any(|l| l.trim() == "x = 0000:0000"));
    }

    fn answer(_: &mut VM, _: &[Reg]) -> Result<Reg, RunError> {
        Ok(Reg::int(42))
    }

    #[test]
    fn backtrace_lists_every_frame() {
        let mut kernel = KernelRegistry::new();
        let number = kernel.register("Answer", "i", answer).unwrap();
        let mut doit = BytecodeBuilder::new();
        doit.push1();
        doit.pushi(7);
        doit.callk(number, 1);
        doit.ret();
        // (ego doit: 5)
        let mut caller = BytecodeBuilder::new();
        caller.pushi(testing::vocab("doit"));
        caller.push1();
        caller.pushi(5);
        testing::load_global(&mut caller, 1);
        caller.send(3);
        caller.ret();
        let mut vm = TestGame::new()
            .kernel(kernel)
            .method("ego", "doit", doit)
            .export(caller)
            .build();
        let ego = testing::object(&vm, "ego");
        vm.store_var(VarClass::Global, 1, ego).unwrap();
        let console = BufferedConsole::new();
        vm.debug.set_console(console.clone());
        vm.debug.add(BreakpointKind::Kernel("Answer".into()), BreakpointAction::Backtrace);

        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(42)));
        let lines = console.lines();
        assert_eq!(lines[0], "Break on kAnswer");
        assert_eq!(lines[1], "Call stack (current base: 0x0):");
        assert_eq!(lines[2], " 0: script 0 - export 0 ()");
        assert!(lines[3].starts_with("     by - obj@"));
        assert_eq!(lines[4], " 1: script 0 - ego::doit(0000:0005)");
        assert!(lines[5].starts_with(&format!("     by 0 obj@{ego}")));
        assert_eq!(lines.len(), 6);
        assert!(!vm.debug.debugging);
    }

    #[test]
    fn inspect_action_dumps_the_object() {
        let mut vm = TestGame::new().build();
        let console = BufferedConsole::new();
        vm.debug.set_console(console.clone());
        vm.debug.add(BreakpointKind::SelectorRead("ego::x".into()), BreakpointAction::Inspect);
        let ego = testing::object(&vm, "ego");
        let x = testing::selector(&vm, "x");
        vm.write_selector(ego, x, Reg::int(9)).unwrap();

        assert!(vm.check_selector_breakpoint(SelectorAccess::Read, ego, x));
        let lines = console.lines();
        assert_eq!(lines[0], format!("Break on ego::x (in [{ego}])"));
        assert_eq!(lines[1], format!("[{ego}] ego (object, script 0)"));
        assert!(lines[2].starts_with("  superclass: Actor"));
        assert_eq!(lines[3], "  3 properties:");
        assert_eq!(lines[4], "    x = 0000:0009");
        assert!(!vm.debug.debugging);
    }
}
