//! Dispatch-loop benchmark: a countdown loop and an iterative fib, both
//! authored through the public builder API.
//!
//! Run with:
//!   cargo bench --bench interp

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytecode::{BytecodeBuilder, CompiledDef, DefId, Op};
use types::TypeId;
use vm::{Context, Interpreter};

fn add_main(
    ctx: &mut Context,
    frame_size: u32,
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
        return_size: 8,
        block: None,
        code: b.into_bytes(),
        handlers: vec![],
    })
}

fn countdown_program(iterations: i64) -> (Context, DefId) {
    let mut ctx = Context::new();
    let def = add_main(&mut ctx, 8, |b| {
        b.put_i64(iterations);
        b.set_local(0, 8);
        let top = b.current_offset();
        b.get_local(0, 8);
        b.put_i64(1);
        b.op(Op::SubWrapI64);
        b.set_local(0, 8);
        b.get_local(0, 8);
        b.put_i64(0);
        b.op(Op::CmpI64);
        b.op(Op::CmpGt);
        b.branch_if_to(top);
        b.get_local(0, 8);
        b.leave(8);
    });
    (ctx, def)
}

fn fib_program(n: i64) -> (Context, DefId) {
    let mut ctx = Context::new();
    let def = add_main(&mut ctx, 24, |b| {
        b.put_i64(1);
        b.set_local(8, 8);
        let top = b.current_offset();
        b.get_local(16, 8);
        b.put_i64(n);
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
        b.op(Op::AddWrapI64);
        b.set_local(16, 8);
        b.jump_to(top);
        b.bind(exit);
        b.get_local(0, 8);
        b.leave(8);
    });
    (ctx, def)
}

fn bench_countdown(c: &mut Criterion) {
    let (ctx, def) = countdown_program(10_000);
    let mut interp = Interpreter::new(ctx);
    c.bench_function("countdown_10k", |bench| {
        bench.iter(|| {
            let out = interp.run(def, &[]).unwrap();
            black_box(out);
        })
    });
}

fn bench_fib(c: &mut Criterion) {
    let (ctx, def) = fib_program(90);
    let mut interp = Interpreter::new(ctx);
    c.bench_function("fib_90", |bench| {
        bench.iter(|| {
            let out = interp.run(def, &[]).unwrap();
            black_box(out);
        })
    });
}

criterion_group!(benches, bench_countdown, bench_fib);
criterion_main!(benches);
