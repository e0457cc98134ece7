use clap::Parser as ClapParser;
use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    process,
};

use log::info;
use sci_bytecode::{BytecodeBuilder, Op, VarClass, VarOp, VarOpKind};
use sci_object::{
    CodePos, LoadError, ObjectImage, Reg, ScriptImage, ScriptLoader, SegmentManager, SelectorId,
    SelectorTable,
};
use sci_vm::{
    BreakpointAction, BreakpointKind, DebugConsole, GarbageCollector, KernelRegistry, Resume,
    RootProvider, RunError, StopInfo, UninitializedReadPolicy, VM, VmError, VmSettings,
};

const GLOBALS: usize = 16;
const OBJECT_BASE: u32 = 0x4000;
/// Global holding the demo's counter object.
const COUNTER_GLOBAL: u16 = 1;

const VOCABULARY: [&str; 3] = ["x", "step", "doit"];
const X: u16 = 0;
const DOIT: u16 = 2;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// How many times the demo script sends `doit` to its counter
    #[arg(default_value_t = 3)]
    iterations: i16,

    #[arg(long, help = "Print every instruction before it runs")]
    trace: bool,

    #[arg(long, help = "Stop on reads of uninitialized temps and parameters")]
    strict: bool,

    #[arg(long, value_name = "PATTERN", help = "Break on kernel calls matching PATTERN")]
    break_kernel: Vec<String>,

    #[arg(long, value_name = "OBJ::SEL", help = "Break when OBJ::SEL is executed")]
    break_selector: Vec<String>,

    #[arg(long, value_name = "SCRIPT:EXPORT", value_parser = parse_export, help = "Break when an export is called")]
    break_export: Vec<(u16, u16)>,

    #[arg(long, value_name = "N", help = "Kernel calls between garbage collections")]
    gc_interval: Option<u32>,

    #[arg(short, long, help = "Log at debug level unless RUST_LOG says otherwise")]
    verbose: bool,

    #[arg(long, help = "List the demo script instead of running it")]
    disassemble: bool,
}

fn parse_export(s: &str) -> Result<(u16, u16), String> {
    let (script, export) = s
        .split_once(':')
        .ok_or_else(|| format!("expected SCRIPT:EXPORT, got '{s}'"))?;
    let script = script.parse().map_err(|e| format!("bad script number '{script}': {e}"))?;
    let export = export.parse().map_err(|e| format!("bad export number '{export}': {e}"))?;
    Ok((script, export))
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut settings = VmSettings::default();
    if cli.strict {
        settings.uninit_policy = UninitializedReadPolicy::Strict;
    }
    if let Some(interval) = cli.gc_interval {
        settings.gc_interval = interval;
    }

    let mut vm = match build_demo(settings) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error loading demo game: {err}");
            process::exit(1);
        }
    };

    if cli.disassemble {
        if let Err(err) = print_listing(&vm) {
            eprintln!("Error disassembling: {err}");
            process::exit(1);
        }
        return;
    }

    vm.debug.set_console(StdioConsole);
    vm.debug.trace = cli.trace;
    for pattern in cli.break_kernel {
        vm.debug.add(BreakpointKind::Kernel(pattern), BreakpointAction::Break);
    }
    for name in cli.break_selector {
        vm.debug.add(BreakpointKind::SelectorExec(name), BreakpointAction::Break);
    }
    for (script, export) in cli.break_export {
        vm.debug.add(BreakpointKind::Export { script, export }, BreakpointAction::Break);
    }
    vm.set_garbage_collector(Box::new(RootCounter));

    match vm.run_export(0, 0, &[Reg::int(cli.iterations as i32)]) {
        Ok(result) => println!("result: {result}"),
        Err(RunError::Aborted) => {
            vm.reset_execution();
            println!("aborted");
        }
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    }
}

/// Prints to stdout and asks on stdin what to do at a stop.
struct StdioConsole;

impl DebugConsole for StdioConsole {
    fn print(&mut self, line: &str) {
        println!("{line}");
    }

    fn stopped(&mut self, stop: &StopInfo) -> Resume {
        println!("{}", stop.disassembly);
        let stdin = io::stdin();
        let mut input = String::new();
        loop {
            print!("[c]ontinue, [s]tep, [q]uit> ");
            if io::stdout().flush().is_err() {
                return Resume::Continue;
            }
            input.clear();
            match stdin.lock().read_line(&mut input) {
                Ok(0) | Err(_) => return Resume::Continue,
                Ok(_) => match input.trim() {
                    "" | "s" => return Resume::Step,
                    "c" => return Resume::Continue,
                    "q" => return Resume::Abort,
                    other => println!("unknown command '{other}'"),
                },
            }
        }
    }
}

/// Reclaims nothing; reports how much the VM keeps alive.
struct RootCounter;

impl GarbageCollector for RootCounter {
    fn collect(&mut self, _segments: &mut SegmentManager, roots: &dyn RootProvider) {
        let mut count = 0;
        roots.visit_roots(&mut |_| count += 1);
        info!("gc: {count} roots");
    }
}

struct DemoLoader {
    scripts: HashMap<u16, ScriptImage>,
}

impl ScriptLoader for DemoLoader {
    fn load_script(&mut self, number: u16) -> Result<ScriptImage, LoadError> {
        self.scripts.get(&number).cloned().ok_or(LoadError::NotFound(number))
    }

    fn class_script(&self, class: u16) -> Option<u16> {
        (class <= 1).then_some(0)
    }
}

fn k_display(vm: &mut VM, args: &[Reg]) -> Result<Reg, RunError> {
    let words: Vec<String> = args
        .iter()
        .map(|&arg| match arg.as_i16() {
            Some(value) => value.to_string(),
            None => vm.segments.object_name(arg).to_owned(),
        })
        .collect();
    println!("{}", words.join(" "));
    Ok(Reg::NULL)
}

fn var(kind: VarOpKind, class: VarClass, stack: bool) -> VarOp {
    VarOp { kind, class, stack, indexed: false }
}

/// Script 0: a `Counter` class whose `doit` adds `step` to `x`, an instance
/// stepping by 2, and an export that sends `doit` as often as its first
/// parameter says.
fn demo_script(display: u16) -> ScriptImage {
    let mut code = BytecodeBuilder::new();

    let doit = code.current_offset() as u32;
    code.property(Op::PToS, 0);
    code.property(Op::PToA, 1);
    code.op(Op::Add);
    code.property(Op::AToP, 0);
    code.ret();

    let entry = code.current_offset() as u32;
    code.link(1);
    code.ldi(0);
    code.var(var(VarOpKind::Store, VarClass::Temp, false), 0);
    let top = code.current_offset();
    code.var(var(VarOpKind::Load, VarClass::Temp, true), 0);
    code.var(var(VarOpKind::Load, VarClass::Param, false), 1);
    code.op(Op::Lt);
    let done = code.bnt();
    code.pushi(DOIT as i16);
    code.push0();
    code.var(var(VarOpKind::Load, VarClass::Global, false), COUNTER_GLOBAL);
    code.send(2);
    code.push1();
    code.push();
    code.callk(display, 1);
    code.var(var(VarOpKind::Increment, VarClass::Temp, false), 0);
    code.branch_to(Op::Jmp, top);
    code.bind(done);
    code.pushi(X as i16);
    code.push0();
    code.var(var(VarOpKind::Load, VarClass::Global, false), COUNTER_GLOBAL);
    code.send(2);
    code.ret();

    let properties = vec![SelectorId(0), SelectorId(1)];
    let objects = vec![
        ObjectImage {
            offset: OBJECT_BASE,
            name: "Obj".into(),
            class: Some(0),
            ..Default::default()
        },
        ObjectImage {
            offset: OBJECT_BASE + 0x10,
            name: "Counter".into(),
            class: Some(1),
            superclass: Some(0),
            properties: vec![0, 1],
            property_selectors: properties.clone(),
            methods: vec![(SelectorId(DOIT), doit)],
            ..Default::default()
        },
        ObjectImage {
            offset: OBJECT_BASE + 0x20,
            name: "counter".into(),
            superclass: Some(1),
            properties: vec![0, 2],
            property_selectors: properties,
            ..Default::default()
        },
    ];
    ScriptImage {
        bytecode: code.into_bytes(),
        exports: vec![entry],
        locals: vec![0; GLOBALS],
        objects,
        ..Default::default()
    }
}

fn build_demo(settings: VmSettings) -> Result<VM, VmError> {
    let mut kernel = KernelRegistry::new();
    let display = kernel.register("Display", "[io]*", k_display)?;
    let loader = DemoLoader {
        scripts: HashMap::from([(0, demo_script(display))]),
    };
    let selectors = SelectorTable::from_names(VOCABULARY);
    let mut vm = VM::new(settings, Box::new(loader), selectors, kernel)?;
    let counter = vm
        .segments
        .find_object_by_name("counter")
        .ok_or(VmError::InvalidReference(Reg::NULL))?;
    vm.store_var(VarClass::Global, COUNTER_GLOBAL as i32, counter)?;
    Ok(vm)
}

fn print_listing(vm: &VM) -> Result<(), VmError> {
    let Some(segment) = vm.segments.script_segment(0) else {
        return Ok(());
    };
    let size = vm.segments.script(segment).map_or(0, |s| s.size());
    let mut pos = CodePos::new(segment, 0);
    while (pos.offset as usize) < size {
        let (line, next) = vm.disassemble(pos, true, false)?;
        println!("{line}");
        pos = next;
    }
    Ok(())
}
