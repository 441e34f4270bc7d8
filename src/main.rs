/// jseng CLI
///
/// The embedder side of this crate's CLI surface: loads a named demo
/// program (there is no parser to load `.js` source with — see
/// `assembler`'s doc comment) and runs it to completion, reporting either
/// the completion value or a rendered uncaught-exception diagnostic.
use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use miette::Result;

use jseng::assembler::CompiledCodeBuilder;
use jseng::bytecode::{CodeFlags, Op, ProtectedKind};
use jseng::conf::EngineConfigBuilder;
use jseng::context::EngineState;
use jseng::diagnostics::UncaughtError;
use jseng::object::PropName;
use jseng::strings::MagicStr;
use jseng::value::Value;
use jseng::vm::Vm;

#[derive(ClapParser)]
#[command(name = "jseng", version, about = "A bytecode execution core for a small ECMAScript subset")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble and run one of the built-in demo programs
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Which demo program to assemble and run
    #[arg(value_enum, default_value_t = Demo::Arithmetic)]
    demo: Demo,

    /// Print the disassembled bytecode before running it
    #[arg(long)]
    show_opcodes: bool,

    /// Print heap load factor and live object count after running
    #[arg(long)]
    mem_stats: bool,

    /// Verbosity of this process's own trace output, not the script's
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Exit with a nonzero status if the script throws uncaught, instead of
    /// just printing the rendered diagnostic
    #[arg(long)]
    abort_on_fail: bool,

    /// Accepted for CLI-surface parity; snapshot serialization is out of
    /// scope for this execution core.
    #[arg(long)]
    dump_snapshot_for_jerry_init: bool,

    /// Accepted for CLI-surface parity; snapshot serialization is out of
    /// scope for this execution core.
    #[arg(long)]
    exec_snapshot: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Demo {
    /// push 1, push 2, add, return
    Arithmetic,
    /// declares a const binding, assigns to it, and lets the reassignment
    /// fail as a TypeError
    ConstReassign,
    /// throws inside a try body, recovers in catch, runs finally, returns
    TryCatchFinally,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn trace(level: LogLevel, configured: LogLevel, msg: &str) {
    if level <= configured {
        eprintln!("[jseng] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    if args.dump_snapshot_for_jerry_init || args.exec_snapshot.is_some() {
        return Err(miette::miette!("snapshot serialization is out of scope for this execution core"));
    }

    let code = match args.demo {
        Demo::Arithmetic => build_arithmetic_demo(),
        Demo::ConstReassign => build_const_reassign_demo(),
        Demo::TryCatchFinally => build_try_catch_finally_demo(),
    };

    if args.show_opcodes {
        println!("{}", code.disassemble());
    }

    trace(LogLevel::Info, args.log_level, "booting engine");
    let mut engine = EngineState::new(EngineConfigBuilder::new().build());
    let mut vm = Vm::new();

    match vm.run_script(&mut engine, std::rc::Rc::new(code)) {
        Ok(v) => {
            println!("=> {}", describe_value(&engine, v));
        }
        Err(thrown) => {
            let kind = extract_kind(&engine, thrown);
            let message = extract_message(&engine, thrown);
            let diagnostic = UncaughtError::new(kind, message, "<demo>", "<assembled bytecode has no source text>".to_string(), 0, 0);
            eprintln!("{}", diagnostic.render());
            if args.abort_on_fail {
                std::process::exit(1);
            }
        }
    }

    if args.mem_stats {
        println!("heap load factor: {:.3}", engine.heap.load_factor());
    }

    Ok(())
}

fn describe_value(engine: &EngineState, v: Value) -> String {
    if let Some(n) = v.as_small_int() {
        return n.to_string();
    }
    if v.is_undefined() {
        return "undefined".to_string();
    }
    if v.is_null() {
        return "null".to_string();
    }
    if let Some(b) = v.as_bool() {
        return b.to_string();
    }
    format!("<object {}>", jseng::dispatch::type_of_tag(&engine.heap, v))
}

fn extract_message(engine: &EngineState, thrown: Value) -> String {
    if let Some(cp) = thrown.as_cp() {
        if let Some(jseng::object::PropValue::Data(msg)) = jseng::dispatch::get_own(&engine.heap, cp, PropName::Magic(MagicStr(5))) {
            return describe_value(engine, msg);
        }
    }
    describe_value(engine, thrown)
}

fn extract_kind(engine: &EngineState, thrown: Value) -> jseng::JsErrorKind {
    use jseng::JsErrorKind;
    let name = thrown
        .as_cp()
        .and_then(|cp| jseng::dispatch::get_own(&engine.heap, cp, PropName::Magic(MagicStr(4))))
        .and_then(|v| match v {
            jseng::object::PropValue::Data(name_v) => name_v.as_cp(),
            _ => None,
        })
        .and_then(|name_cp| engine.heap.get(name_cp))
        .and_then(|r| r.as_string())
        .map(|s| s.as_str_lossy().into_owned());

    match name.as_deref() {
        Some("EvalError") => JsErrorKind::EvalError,
        Some("RangeError") => JsErrorKind::RangeError,
        Some("ReferenceError") => JsErrorKind::ReferenceError,
        Some("SyntaxError") => JsErrorKind::SyntaxError,
        Some("TypeError") => JsErrorKind::TypeError,
        Some("URIError") => JsErrorKind::UriError,
        Some("AggregateError") => JsErrorKind::AggregateError,
        _ => JsErrorKind::Error,
    }
}

fn build_arithmetic_demo() -> jseng::bytecode::CompiledCode {
    let mut b = CompiledCodeBuilder::new().source_name("arithmetic.demo");
    b.emit(Op::PushSmallInt, 1);
    b.emit(Op::PushSmallInt, 2);
    b.emit(Op::Add, 0);
    b.emit(Op::Return, 0);
    b.build()
}

fn build_const_reassign_demo() -> jseng::bytecode::CompiledCode {
    let mut b = CompiledCodeBuilder::new().strict().source_name("const_reassign.demo");
    let idx = b.push_literal(Value::from_magic_str(MagicStr(9))); // "value"
    b.emit(Op::DeclareLexical, jseng::assembler::declare_lexical_operand(true, idx));
    b.emit(Op::PushSmallInt, 1);
    b.emit(Op::InitVar, idx as i32);
    b.emit(Op::PushSmallInt, 2);
    b.emit(Op::SetVar, idx as i32);
    b.emit(Op::PushUndefined, 0);
    b.emit(Op::Return, 0);
    let mut code = b.build();
    code.flags.insert(CodeFlags::STRICT);
    code
}

fn build_try_catch_finally_demo() -> jseng::bytecode::CompiledCode {
    let mut b = CompiledCodeBuilder::new().source_name("try_catch_finally.demo");
    let try_start = b.emit(Op::PushSmallInt, 7);
    b.emit(Op::Throw, 0);
    let catch_start = b.here();
    b.emit(Op::Pop, 0);
    let finally_start = b.emit(Op::FinallyEnter, 0);
    b.emit(Op::PushSmallInt, 99);
    b.emit(Op::FinallyExit, 0);
    b.emit(Op::Return, 0);
    b.protected_range(try_start, catch_start, catch_start, ProtectedKind::Catch);
    b.protected_range(try_start, finally_start, finally_start, ProtectedKind::Finally);
    b.build()
}
