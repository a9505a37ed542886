use clap::Parser as ClapParser;
use std::process;

use bytecode::{BytecodeBuilder, CompiledDef, DefId, Op};
use types::{TypeDescriptor, TypeId};
use vm::{Context, Interpreter};

/// Demo driver: assembles a few canned programs through the public builder
/// API and executes them. Stands in for the compiler front end, which
/// lives elsewhere.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Program to run (see --list)
    program: Option<String>,

    /// List the available demo programs
    #[arg(long)]
    list: bool,

    /// Print the disassembly before running
    #[arg(long)]
    disasm: bool,

    /// Enable trace logging
    #[arg(long)]
    trace: bool,

    /// Operand stack capacity in bytes
    #[arg(long, default_value_t = vm::DEFAULT_STACK_CAPACITY)]
    stack_size: usize,
}

enum Output {
    I64,
    I32,
    Bool,
}

struct Demo {
    name: &'static str,
    about: &'static str,
    build: fn() -> (Context, DefId, Output),
}

const DEMOS: &[Demo] = &[
    Demo {
        name: "arith",
        about: "7 - 5 == 2, folded through cmp_i64/cmp_eq",
        build: build_arith,
    },
    Demo {
        name: "wrap",
        about: "i32 wrap-around addition",
        build: build_wrap,
    },
    Demo {
        name: "sum",
        about: "loop summing 1..=100 with locals and branches",
        build: build_sum,
    },
    Demo {
        name: "fib",
        about: "iterative fib(50) with wrapping adds",
        build: build_fib,
    },
    Demo {
        name: "union",
        about: "widen an Int32 into Int32 | String and test is_a?",
        build: build_union,
    },
];

fn main() {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .init();
    }

    if cli.list || cli.program.is_none() {
        println!("available programs:");
        for demo in DEMOS {
            println!("  {:8} {}", demo.name, demo.about);
        }
        return;
    }

    let requested = cli.program.unwrap();
    let Some(demo) = DEMOS.iter().find(|d| d.name == requested) else {
        eprintln!("unknown program '{requested}', try --list");
        process::exit(1);
    };

    let (ctx, def, output) = (demo.build)();
    if cli.disasm {
        println!("{}", bytecode::disassemble(&ctx.def(def).code));
    }

    let mut interp = Interpreter::with_stack_capacity(ctx, cli.stack_size);
    match interp.run(def, &[]) {
        Ok(bytes) => match output {
            Output::I64 => println!(
                "{}",
                i64::from_ne_bytes(bytes.as_slice().try_into().unwrap())
            ),
            Output::I32 => println!(
                "{}",
                i32::from_ne_bytes(bytes.as_slice().try_into().unwrap())
            ),
            Output::Bool => println!("{}", bytes[0] != 0),
        },
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    }
}

fn add_main(
    ctx: &mut Context,
    frame_size: u32,
    return_size: u32,
    build: impl FnOnce(&mut BytecodeBuilder),
) -> DefId {
    let name = ctx.intern_symbol("main");
    let mut b = BytecodeBuilder::new();
    build(&mut b);
    ctx.add_def(CompiledDef {
        name,
        owner: TypeId::NIL,
        args_size: 0,
        frame_size,
        return_size,
        block: None,
        code: b.into_bytes(),
        handlers: vec![],
    })
}

fn build_arith() -> (Context, DefId, Output) {
    let mut ctx = Context::new();
    let def = add_main(&mut ctx, 0, 1, |b| {
        b.put_i64(7);
        b.put_i64(5);
        b.op(Op::SubI64);
        b.put_i64(2);
        b.op(Op::CmpI64);
        b.op(Op::CmpEq);
        b.leave(1);
    });
    (ctx, def, Output::Bool)
}

fn build_wrap() -> (Context, DefId, Output) {
    let mut ctx = Context::new();
    let def = add_main(&mut ctx, 0, 4, |b| {
        b.put_i64(i32::MAX as i64);
        b.put_i64(1);
        b.op(Op::AddWrapI32);
        b.leave(4);
    });
    (ctx, def, Output::I32)
}

fn build_sum() -> (Context, DefId, Output) {
    let mut ctx = Context::new();
    let def = add_main(&mut ctx, 16, 8, |b| {
        let top = b.current_offset();
        b.get_local(0, 8);
        b.put_i64(100);
        b.op(Op::CmpI64);
        b.op(Op::CmpLt);
        let exit = b.branch_unless();
        b.get_local(0, 8);
        b.put_i64(1);
        b.op(Op::AddI64);
        b.set_local(0, 8);
        b.get_local(8, 8);
        b.get_local(0, 8);
        b.op(Op::AddI64);
        b.set_local(8, 8);
        b.jump_to(top);
        b.bind(exit);
        b.get_local(8, 8);
        b.leave(8);
    });
    (ctx, def, Output::I64)
}

fn build_fib() -> (Context, DefId, Output) {
    let mut ctx = Context::new();
    // locals: a @0, b @8, i @16
    let def = add_main(&mut ctx, 24, 8, |b| {
        b.put_i64(1);
        b.set_local(8, 8);
        let top = b.current_offset();
        b.get_local(16, 8);
        b.put_i64(50);
        b.op(Op::CmpI64);
        b.op(Op::CmpLt);
        let exit = b.branch_unless();
        b.get_local(0, 8);
        b.get_local(8, 8);
        b.op(Op::AddWrapI64);
        b.get_local(8, 8);
        b.set_local(0, 8);
        b.set_local(8, 8);
        b.get_local(16, 8);
        b.put_i64(1);
        b.op(Op::AddI64);
        b.set_local(16, 8);
        b.jump_to(top);
        b.bind(exit);
        b.get_local(0, 8);
        b.leave(8);
    });
    (ctx, def, Output::I64)
}

fn build_union() -> (Context, DefId, Output) {
    let mut ctx = Context::new();
    let int32 = ctx
        .types
        .register(TypeDescriptor::primitive("Int32", types::Primitive::I32));
    let object =
        ctx.types.register(TypeDescriptor::reference("Object", None, 4));
    let string = ctx
        .types
        .register(TypeDescriptor::reference("String", Some(object), 16));
    ctx.types.register_union("Int32 | String", vec![int32, string]);
    let def = add_main(&mut ctx, 0, 1, move |b| {
        b.put_i64(42);
        b.put_in_union(int32, 4, 16);
        b.union_is_a(16, int32);
        b.leave(1);
    });
    (ctx, def, Output::Bool)
}
