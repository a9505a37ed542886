pub mod context;
pub mod ffi;
mod fiber;
mod frame;
pub mod interpreter;
pub mod stack;

pub use context::{Context, TrapHook, TrapInfo, WellKnownErrors};
pub use ffi::{CallInterface, FfiKind, InterfaceFlags, LibFunction};
pub use fiber::MAIN_FIBER;
pub use interpreter::{Interpreter, VmError};
pub use stack::{OperandStack, DEFAULT_STACK_CAPACITY};

#[cfg(test)]
mod tests {
    use std::ffi::CStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytecode::{
        BytecodeBuilder, CompiledBlock, CompiledDef, DefId, ExceptionHandler,
        Op, RmwOp,
    };
    use types::{Primitive, TypeDescriptor, TypeId};

    use super::*;

    struct Fixture {
        ctx: Context,
        bool_t: TypeId,
        int32: TypeId,
        object: TypeId,
        string: TypeId,
        int_or_string: TypeId,
        raw_ptr: TypeId,
    }

    fn fixture() -> Fixture {
        let mut ctx = Context::new();
        let bool_t = ctx
            .types
            .register(TypeDescriptor::primitive("Bool", Primitive::Bool));
        let int32 = ctx
            .types
            .register(TypeDescriptor::primitive("Int32", Primitive::I32));
        let object =
            ctx.types.register(TypeDescriptor::reference("Object", None, 4));
        let string = ctx.types.register(TypeDescriptor::reference(
            "String",
            Some(object),
            16,
        ));
        let int_or_string = ctx
            .types
            .register_union("Int32 | String", vec![int32, string]);
        let raw_ptr =
            ctx.types.register(TypeDescriptor::pointer("Pointer(UInt8)", 1));
        Fixture {
            ctx,
            bool_t,
            int32,
            object,
            string,
            int_or_string,
            raw_ptr,
        }
    }

    fn add_main(
        ctx: &mut Context,
        frame_size: u32,
        return_size: u32,
        handlers: Vec<ExceptionHandler>,
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
            handlers,
        })
    }

    fn run_main(
        ctx: Context,
        frame_size: u32,
        return_size: u32,
        build: impl FnOnce(&mut BytecodeBuilder),
    ) -> Result<Vec<u8>, VmError> {
        let mut ctx = ctx;
        let def = add_main(&mut ctx, frame_size, return_size, vec![], build);
        Interpreter::new(ctx).run(def, &[])
    }

    fn expect(
        ctx: Context,
        frame_size: u32,
        return_size: u32,
        build: impl FnOnce(&mut BytecodeBuilder),
    ) -> Vec<u8> {
        run_main(ctx, frame_size, return_size, build).unwrap()
    }

    fn as_i64(bytes: &[u8]) -> i64 {
        i64::from_ne_bytes(bytes.try_into().unwrap())
    }

    fn as_u64(bytes: &[u8]) -> u64 {
        u64::from_ne_bytes(bytes.try_into().unwrap())
    }

    fn as_i32(bytes: &[u8]) -> i32 {
        i32::from_ne_bytes(bytes.try_into().unwrap())
    }

    fn as_f64(bytes: &[u8]) -> f64 {
        f64::from_ne_bytes(bytes.try_into().unwrap())
    }

    fn put_f64(b: &mut BytecodeBuilder, v: f64) {
        b.put_i64(v.to_bits() as i64);
    }

    // ── arithmetic and comparisons ─────────────────────────────────

    #[test]
    fn arithmetic_and_comparison() {
        // 7 - 5 == 2
        let out = expect(Context::new(), 0, 1, |b| {
            b.put_i64(7);
            b.put_i64(5);
            b.op(Op::SubI64);
            b.put_i64(2);
            b.op(Op::CmpI64);
            b.op(Op::CmpEq);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn wrapping_add_wraps_two_complement() {
        let out = expect(Context::new(), 0, 4, |b| {
            b.put_i64(0x7FFF_FFFF);
            b.put_i64(1);
            b.op(Op::AddWrapI32);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), i32::MIN);
    }

    #[test]
    fn checked_overflow_without_registered_type_is_fatal() {
        let err = run_main(Context::new(), 0, 4, |b| {
            b.put_i64(i32::MAX as i64);
            b.put_i64(1);
            b.op(Op::AddI32);
            b.leave(4);
        })
        .unwrap_err();
        assert_eq!(err, VmError::Overflow);
    }

    #[test]
    fn checked_overflow_raises_catchable_exception() {
        let mut f = fixture();
        let overflow = f
            .ctx
            .types
            .register(TypeDescriptor::reference("OverflowError", None, 4));
        f.ctx.errors.overflow = overflow;

        let name = f.ctx.intern_symbol("main");
        let mut b = BytecodeBuilder::new();
        b.put_i64(i64::MAX);
        b.put_i64(1);
        b.op(Op::AddI64);
        b.leave(8);
        let target = b.current_offset();
        b.pop(8); // exception reference
        b.put_i64(42);
        b.leave(8);

        let def = f.ctx.add_def(CompiledDef {
            name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 8,
            block: None,
            code: b.into_bytes(),
            handlers: vec![ExceptionHandler {
                start: 0,
                end: target,
                target,
                types: vec![overflow],
                stack_depth: 0,
            }],
        });
        let out = Interpreter::new(f.ctx).run(def, &[]).unwrap();
        assert_eq!(as_i64(&out), 42);
    }

    #[test]
    fn unsigned_underflow_raises() {
        let err = run_main(Context::new(), 0, 4, |b| {
            b.put_i64(0);
            b.put_i64(1);
            b.op(Op::SubU32);
            b.leave(4);
        })
        .unwrap_err();
        assert_eq!(err, VmError::Overflow);
    }

    #[test]
    fn mixed_sign_comparisons() {
        let out = expect(Context::new(), 0, 4, |b| {
            b.put_i64(-1);
            b.put_i64(1);
            b.op(Op::CmpI64U64);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), -1);

        let out = expect(Context::new(), 0, 4, |b| {
            b.put_i64(1);
            b.put_i64(-1);
            b.op(Op::CmpU64I64);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 1);
    }

    #[test]
    fn float_nan_compares_greater() {
        let out = expect(Context::new(), 0, 4, |b| {
            put_f64(b, f64::NAN);
            put_f64(b, 1.0);
            b.op(Op::CmpF64);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 1);
    }

    #[test]
    fn float_arithmetic_and_libm() {
        let out = expect(Context::new(), 0, 8, |b| {
            put_f64(b, 9.0);
            b.op(Op::SqrtF64);
            put_f64(b, 0.5);
            b.op(Op::AddF64);
            b.leave(8);
        });
        assert_eq!(as_f64(&out), 3.5);

        let out = expect(Context::new(), 0, 8, |b| {
            put_f64(b, 2.0);
            b.put_i64(10);
            b.op(Op::PowiF64);
            b.leave(8);
        });
        assert_eq!(as_f64(&out), 1024.0);

        let out = expect(Context::new(), 0, 8, |b| {
            put_f64(b, 3.0);
            put_f64(b, 1.5);
            b.op(Op::MinF64);
            b.leave(8);
        });
        assert_eq!(as_f64(&out), 1.5);
    }

    #[test]
    fn conversions_round_trip() {
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(7);
            b.op(Op::I32ToF64);
            b.leave(8);
        });
        assert_eq!(as_f64(&out), 7.0);

        let out = expect(Context::new(), 0, 8, |b| {
            put_f64(b, -3.7);
            b.op(Op::F64ToI64Bang);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), -3);

        let out = expect(Context::new(), 0, 8, |b| {
            put_f64(b, f64::NAN);
            b.op(Op::F64ToI64Bang);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 0);
    }

    #[test]
    fn sign_extend_round_trips() {
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(0xFF);
            b.sign_extend(7);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), -1);

        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(0xFF);
            b.zero_extend(7);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 0xFF);

        // A representable value survives the extend.
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(42);
            b.sign_extend(7);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 42);
    }

    #[test]
    fn intrinsics_bit_tricks() {
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(1);
            b.op(Op::Bswap64);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 1 << 56);

        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(0xFF);
            b.op(Op::Popcount64);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 8);

        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(8);
            b.op(Op::TrailingZeros64);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 3);
    }

    // ── stack manipulation ─────────────────────────────────────────

    #[test]
    fn dup_and_pop_from_offset() {
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(21);
            b.dup(8);
            b.op(Op::AddI64);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 42);

        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(1);
            b.put_i64(2);
            b.put_i64(3);
            b.pop_from_offset(8, 8); // removes the 2
            b.op(Op::AddI64);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 4);
    }

    #[test]
    fn stack_top_pointer_reads_back() {
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(42);
            b.put_stack_top_pointer(8);
            b.pointer_get(8);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 42);
    }

    // ── locals, branches, calls ────────────────────────────────────

    #[test]
    fn loop_sums_with_locals_and_branches() {
        // i = 0; acc = 0; while i < 5 { i += 1; acc += i }; acc == 15
        let mut ctx = Context::new();
        let name = ctx.intern_symbol("main");
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.get_local(0, 8);
        b.put_i64(5);
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

        let def = ctx.add_def(CompiledDef {
            name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 16,
            return_size: 8,
            block: None,
            code: b.into_bytes(),
            handlers: vec![],
        });
        let out = Interpreter::new(ctx).run(def, &[]).unwrap();
        assert_eq!(as_i64(&out), 15);
    }

    #[test]
    fn call_copies_args_and_leave_restores_stack() {
        let mut ctx = Context::new();
        let inc_name = ctx.intern_symbol("inc");
        let mut b = BytecodeBuilder::new();
        b.get_local(0, 8);
        b.put_i64(1);
        b.op(Op::AddI64);
        b.leave(8);
        let inc = ctx.add_def(CompiledDef {
            name: inc_name,
            owner: TypeId::NIL,
            args_size: 8,
            frame_size: 8,
            return_size: 8,
            block: None,
            code: b.into_bytes(),
            handlers: vec![],
        });

        let main = add_main(&mut ctx, 0, 8, vec![], |b| {
            b.put_i64(9);
            b.call(inc);
            b.put_i64(32);
            b.op(Op::AddI64);
            b.leave(8);
        });
        let out = Interpreter::new(ctx).run(main, &[]).unwrap();
        assert_eq!(as_i64(&out), 42);
    }

    // ── unions and is_a ────────────────────────────────────────────

    #[test]
    fn union_put_then_remove_is_identity() {
        let f = fixture();
        let int32 = f.int32;
        let out = expect(f.ctx, 0, 4, |b| {
            b.put_i64(42);
            b.put_in_union(int32, 4, 16);
            b.remove_from_union(16, 4);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 42);
    }

    #[test]
    fn union_is_a_matches_member() {
        let f = fixture();
        let (int32, string) = (f.int32, f.string);
        let out = expect(f.ctx, 0, 1, |b| {
            b.put_i64(42);
            b.put_in_union(int32, 4, 16);
            b.union_is_a(16, int32);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);

        let f = fixture();
        let int32 = f.int32;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.put_i64(42);
            b.put_in_union(int32, 4, 16);
            b.union_is_a(16, string);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn union_against_union_filter() {
        let f = fixture();
        let (int32, filter) = (f.int32, f.int_or_string);
        let out = expect(f.ctx, 0, 1, |b| {
            b.put_i64(7);
            b.put_in_union(int32, 4, 16);
            b.union_is_a(16, filter);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn nilable_union_truthiness() {
        // Null pointer: all-zero union, falsey.
        let f = fixture();
        let out = expect(f.ctx, 0, 1, |b| {
            b.put_i64(0);
            b.put_nilable_type_in_union(16);
            b.union_to_bool(16);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);

        // A live reference: header read from the cell, truthy.
        let f = fixture();
        let string = f.string;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.allocate_class(16, string);
            b.put_nilable_type_in_union(16);
            b.union_to_bool(16);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn union_to_bool_falsey_members() {
        // Header 0 (nil payload).
        let f = fixture();
        let out = expect(f.ctx, 0, 1, |b| {
            b.push_zeros(16);
            b.union_to_bool(16);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);

        // false Bool member.
        let f = fixture();
        let bool_t = f.bool_t;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.put_i64(0);
            b.put_in_union(bool_t, 1, 16);
            b.union_to_bool(16);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);

        // Null pointer member.
        let f = fixture();
        let raw_ptr = f.raw_ptr;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.put_i64(0);
            b.put_in_union(raw_ptr, 8, 16);
            b.union_to_bool(16);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);

        // true Bool member.
        let f = fixture();
        let bool_t = f.bool_t;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.put_i64(1);
            b.put_in_union(bool_t, 1, 16);
            b.union_to_bool(16);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn reference_union_header_comes_from_cell() {
        let f = fixture();
        let string = f.string;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.allocate_class(16, string);
            b.put_reference_type_in_union(16);
            b.union_is_a(16, string);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);

        // Null reference widens to a header of 0 and never matches.
        let f = fixture();
        let out = expect(f.ctx, 0, 1, move |b| {
            b.put_i64(0);
            b.put_reference_type_in_union(16);
            b.union_is_a(16, string);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn reference_is_a_walks_parents_and_rejects_null() {
        let f = fixture();
        let (object, string, int32) = (f.object, f.string, f.int32);
        let out = expect(f.ctx, 0, 1, move |b| {
            b.allocate_class(16, string);
            b.reference_is_a(object);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);

        let f = fixture();
        let string2 = f.string;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.allocate_class(16, string2);
            b.reference_is_a(int32);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);

        let f = fixture();
        let string3 = f.string;
        let out = expect(f.ctx, 0, 1, move |b| {
            b.put_i64(0);
            b.reference_is_a(string3);
            b.leave(1);
        });
        assert_eq!(out, vec![0]);
    }

    // ── tuples and aggregates ──────────────────────────────────────

    #[test]
    fn tuple_indexer_extracts_middle_field() {
        // (i32, i64, bool) — the i64 lives at offset 8 of a 24-byte tuple.
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(5);
            b.put_i64(-1);
            b.put_i64(1);
            b.tuple_indexer_known_index(24, 8, 8);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), -1);
    }

    #[test]
    fn struct_ivar_extraction() {
        let out = expect(Context::new(), 0, 8, |b| {
            b.put_i64(1);
            b.put_i64(2);
            b.put_i64(3);
            b.get_struct_ivar(16, 8, 24);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 3);
    }

    // ── heap objects and instance variables ────────────────────────

    #[test]
    fn self_and_class_ivar_access() {
        let f = fixture();
        let string = f.string;
        let out = expect(f.ctx, 8, 4, move |b| {
            b.allocate_class(16, string);
            b.set_local(0, 8);
            b.put_i64(123);
            b.set_self_ivar(8, 4);
            b.get_local(0, 8);
            b.get_class_ivar(8, 4);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 123);
    }

    #[test]
    fn self_ivar_read_back() {
        let f = fixture();
        let string = f.string;
        let out = expect(f.ctx, 8, 4, move |b| {
            b.allocate_class(16, string);
            b.set_local(0, 8);
            b.put_i64(7);
            b.set_self_ivar(12, 4);
            b.get_self_ivar(12, 4);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 7);
    }

    // ── pointers ───────────────────────────────────────────────────

    #[test]
    fn pointer_add_diff_inverse() {
        let out = expect(Context::new(), 8, 8, |b| {
            b.put_i64(4);
            b.pointer_malloc(4);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(3);
            b.pointer_add(4);
            b.get_local(0, 8);
            b.pointer_diff(4);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 3);
    }

    #[test]
    fn pointer_set_get_round_trip() {
        let out = expect(Context::new(), 8, 4, |b| {
            b.put_i64(1);
            b.pointer_malloc(4);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(77);
            b.pointer_set(4);
            b.get_local(0, 8);
            b.pointer_get(4);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 77);
    }

    #[test]
    fn pointer_realloc_preserves_contents() {
        let out = expect(Context::new(), 8, 8, |b| {
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(42);
            b.pointer_set(8);
            b.get_local(0, 8);
            b.put_i64(4);
            b.pointer_realloc(8);
            b.pointer_get(8);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 42);
    }

    #[test]
    fn pointer_null_checks() {
        let out = expect(Context::new(), 0, 1, |b| {
            b.put_i64(0);
            b.op(Op::PointerIsNull);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);

        let out = expect(Context::new(), 0, 1, |b| {
            b.put_i64(1);
            b.pointer_malloc(1);
            b.op(Op::PointerIsNotNull);
            b.leave(1);
        });
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn mem_set_and_copy() {
        let out = expect(Context::new(), 8, 8, |b| {
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(0xAB);
            b.put_i64(8);
            b.put_i64(0); // volatile = false
            b.op(Op::MemSet);
            b.get_local(0, 8);
            b.pointer_get(8);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 0xABAB_ABAB_ABAB_ABAB);

        let out = expect(Context::new(), 16, 8, |b| {
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(0, 8);
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(8, 8);
            b.get_local(0, 8);
            b.put_i64(42);
            b.pointer_set(8);
            b.get_local(8, 8); // dst
            b.get_local(0, 8); // src
            b.put_i64(8);
            b.put_i64(0);
            b.op(Op::MemCopy);
            b.get_local(8, 8);
            b.pointer_get(8);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 42);
    }

    // ── constants and class variables ──────────────────────────────

    #[test]
    fn constant_lazy_initialization() {
        let mut ctx = Context::new();
        let c = ctx.add_constant(8);
        let out = expect(ctx, 0, 8, move |b| {
            b.const_initialized(c);
            let skip = b.branch_if();
            b.put_i64(41);
            b.put_i64(1);
            b.op(Op::AddI64);
            b.set_const(c, 8);
            b.bind(skip);
            b.get_const(c, 8);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 42);
    }

    // ── blocks ─────────────────────────────────────────────────────

    /// Three programs that differ only in how the block exits: a plain
    /// `leave` resumes the yielding def, `break_block` returns from the
    /// yielding def, and `leave_def` performs the non-local return from
    /// the def the block lexically belongs to.
    fn run_block_program(exit: impl FnOnce(&mut BytecodeBuilder)) -> i64 {
        let mut ctx = Context::new();
        let mut bb = BytecodeBuilder::new();
        exit(&mut bb);
        let block = ctx.add_block(CompiledBlock {
            args_size: 8,
            args_offset: 8,
            code: bb.into_bytes(),
            handlers: vec![],
        });

        let m_name = ctx.intern_symbol("each");
        let mut mb = BytecodeBuilder::new();
        mb.put_i64(5);
        mb.call_block(block);
        mb.pop(8);
        mb.put_i64(100);
        mb.leave(8);
        let m = ctx.add_def(CompiledDef {
            name: m_name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 8,
            block: Some(block),
            code: mb.into_bytes(),
            handlers: vec![],
        });

        let main = add_main(&mut ctx, 16, 8, vec![], |b| {
            b.call_with_block(m);
            b.put_i64(1);
            b.op(Op::AddI64);
            b.leave(8);
        });
        as_i64(&Interpreter::new(ctx).run(main, &[]).unwrap())
    }

    #[test]
    fn block_arg_lands_in_home_locals_and_returns() {
        let result = run_block_program(|b| {
            b.get_local(8, 8); // block arg, stored in main's frame
            b.put_i64(2);
            b.op(Op::MulI64);
            b.leave(8);
        });
        // Block yields 10, `each` discards it and returns 100, main adds 1.
        assert_eq!(result, 101);
    }

    #[test]
    fn break_block_returns_from_the_yielding_def() {
        let result = run_block_program(|b| {
            b.put_i64(7);
            b.break_block(8);
        });
        // `each` returns 7 immediately, main adds 1.
        assert_eq!(result, 8);
    }

    #[test]
    fn leave_def_is_a_non_local_return() {
        let result = run_block_program(|b| {
            b.put_i64(7);
            b.leave_def(8);
        });
        // The block lexically belongs to main: main itself returns 7.
        assert_eq!(result, 7);
    }

    // ── exceptions ─────────────────────────────────────────────────

    #[test]
    fn raise_and_catch_by_type() {
        let mut f = fixture();
        let string = f.string;
        let name = f.ctx.intern_symbol("main");
        let mut b = BytecodeBuilder::new();
        b.allocate_class(16, string);
        b.op(Op::RaiseException);
        b.put_i64(0);
        b.leave(8);
        let target = b.current_offset();
        b.reference_is_a(string); // the handler receives the exception
        b.leave(1);

        let def = f.ctx.add_def(CompiledDef {
            name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 1,
            block: None,
            code: b.into_bytes(),
            handlers: vec![ExceptionHandler {
                start: 0,
                end: target,
                target,
                types: vec![string],
                stack_depth: 0,
            }],
        });
        let out = Interpreter::new(f.ctx).run(def, &[]).unwrap();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn unhandled_exception_unwinds_frames_to_error() {
        let mut f = fixture();
        let string = f.string;
        let raiser_name = f.ctx.intern_symbol("raiser");
        let mut b = BytecodeBuilder::new();
        b.allocate_class(16, string);
        b.op(Op::RaiseException);
        b.leave(0);
        let raiser = f.ctx.add_def(CompiledDef {
            name: raiser_name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 0,
            block: None,
            code: b.into_bytes(),
            handlers: vec![],
        });
        let main = add_main(&mut f.ctx, 0, 0, vec![], |b| {
            b.call(raiser);
            b.leave(0);
        });
        let err = Interpreter::new(f.ctx).run(main, &[]).unwrap_err();
        assert_eq!(err, VmError::UncaughtException { type_id: string });
    }

    #[test]
    fn handler_in_caller_catches_callee_raise() {
        let mut f = fixture();
        let string = f.string;
        let raiser_name = f.ctx.intern_symbol("raiser");
        let mut b = BytecodeBuilder::new();
        b.allocate_class(16, string);
        b.op(Op::RaiseException);
        b.leave(0);
        let raiser = f.ctx.add_def(CompiledDef {
            name: raiser_name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 0,
            block: None,
            code: b.into_bytes(),
            handlers: vec![],
        });

        let name = f.ctx.intern_symbol("main");
        let mut b = BytecodeBuilder::new();
        b.call(raiser);
        b.put_i64(0);
        b.leave(8);
        let target = b.current_offset();
        b.pop(8);
        b.put_i64(7);
        b.leave(8);
        let main = f.ctx.add_def(CompiledDef {
            name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 8,
            block: None,
            code: b.into_bytes(),
            handlers: vec![ExceptionHandler {
                start: 0,
                end: target,
                target,
                types: vec![],
                stack_depth: 0,
            }],
        });
        let out = Interpreter::new(f.ctx).run(main, &[]).unwrap();
        assert_eq!(as_i64(&out), 7);
    }

    #[test]
    fn reraise_propagates_the_caught_exception() {
        let mut f = fixture();
        let string = f.string;
        let name = f.ctx.intern_symbol("main");
        let mut b = BytecodeBuilder::new();
        b.allocate_class(16, string);
        b.op(Op::RaiseException);
        b.leave(0);
        let target = b.current_offset();
        b.pop(8);
        b.op(Op::Reraise);
        let main = f.ctx.add_def(CompiledDef {
            name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 0,
            block: None,
            code: b.into_bytes(),
            handlers: vec![ExceptionHandler {
                start: 0,
                end: target,
                target,
                types: vec![],
                stack_depth: 0,
            }],
        });
        let err = Interpreter::new(f.ctx).run(main, &[]).unwrap_err();
        assert_eq!(err, VmError::UncaughtException { type_id: string });
    }

    #[test]
    fn backtrace_record_names_the_frames() {
        let mut ctx = Context::new();
        let main_sym = ctx.intern_symbol("main");
        let main = add_main(&mut ctx, 0, 8, vec![], |b| {
            b.op(Op::CallStackUnwind);
            b.leave(8);
        });
        let out = Interpreter::new(ctx).run(main, &[]).unwrap();
        let record = as_u64(&out) as usize as *const u64;
        unsafe {
            assert_eq!(record.read_unaligned(), 1);
            assert_eq!(record.add(1).read_unaligned(), main_sym as u64);
        }
    }

    #[test]
    fn unreachable_reports_its_message() {
        let mut ctx = Context::new();
        let msg = ctx.intern_symbol("invalid state");
        let err = run_main(ctx, 0, 0, move |b| {
            b.unreachable(msg as u64);
        })
        .unwrap_err();
        assert_eq!(
            err,
            VmError::Unreachable {
                message: "invalid state".into()
            }
        );
    }

    // ── symbols and process arguments ──────────────────────────────

    #[test]
    fn symbol_to_s_returns_interned_pointer() {
        let mut ctx = Context::new();
        let sym = ctx.intern_symbol("hello");
        let out = expect(ctx, 0, 8, move |b| {
            b.put_i64(sym as i64);
            b.op(Op::SymbolToS);
            b.leave(8);
        });
        let ptr = as_u64(&out) as usize as *const libc::c_char;
        let s = unsafe { CStr::from_ptr(ptr) };
        assert_eq!(s.to_str().unwrap(), "hello");
    }

    #[test]
    fn argc_and_argv() {
        let mut ctx = Context::new();
        ctx.set_argv(vec!["vm".into(), "a".into(), "b".into()]);
        let out = expect(ctx, 0, 4, |b| {
            b.op(Op::Argc);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 3);

        let mut ctx = Context::new();
        ctx.set_argv(vec!["vm".into(), "alpha".into()]);
        let out = expect(ctx, 0, 8, |b| {
            b.op(Op::Argv);
            b.leave(8);
        });
        let argv = as_u64(&out) as usize as *const *const libc::c_char;
        unsafe {
            let arg1 = CStr::from_ptr(*argv.add(1));
            assert_eq!(arg1.to_str().unwrap(), "alpha");
            assert!((*argv.add(2)).is_null());
        }
    }

    // ── atomics ────────────────────────────────────────────────────

    #[test]
    fn atomic_store_rmw_load() {
        let out = expect(Context::new(), 8, 8, |b| {
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(5);
            b.store_atomic(8, 0);
            b.get_local(0, 8);
            b.put_i64(3);
            b.atomicrmw(RmwOp::Add, 8, 0);
            b.pop(8); // discard the old value
            b.get_local(0, 8);
            b.load_atomic(8, 0);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 8);
    }

    #[test]
    fn atomic_rmw_returns_old_value() {
        let out = expect(Context::new(), 8, 8, |b| {
            b.put_i64(1);
            b.pointer_malloc(4);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(5);
            b.store_atomic(4, 0);
            b.get_local(0, 8);
            b.put_i64(3);
            b.atomicrmw(RmwOp::Xchg, 4, 0);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 5);
    }

    #[test]
    fn cmpxchg_swaps_on_match() {
        let out = expect(Context::new(), 8, 8, |b| {
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(5);
            b.store_atomic(8, 0);
            b.get_local(0, 8);
            b.put_i64(5); // expected
            b.put_i64(9); // new
            b.cmpxchg(8, 0, 0);
            b.pop(8); // success flag
            b.pop(8); // old value
            b.get_local(0, 8);
            b.load_atomic(8, 0);
            b.leave(8);
        });
        assert_eq!(as_u64(&out), 9);
    }

    #[test]
    fn cmpxchg_reports_failure() {
        let out = expect(Context::new(), 8, 1, |b| {
            b.put_i64(1);
            b.pointer_malloc(8);
            b.set_local(0, 8);
            b.get_local(0, 8);
            b.put_i64(5);
            b.store_atomic(8, 0);
            b.get_local(0, 8);
            b.put_i64(6); // expected, does not match
            b.put_i64(9);
            b.cmpxchg(8, 0, 0);
            b.leave(1); // the success flag is on top
        });
        assert_eq!(out, vec![0]);
    }

    // ── fibers ─────────────────────────────────────────────────────

    #[test]
    fn fiber_spawn_swap_and_return_to_main() {
        let mut ctx = Context::new();
        let cv_main = ctx.add_class_var(8);
        let cv_val = ctx.add_class_var(8);

        let fiber_name = ctx.intern_symbol("fiber_entry");
        let mut fb = BytecodeBuilder::new();
        fb.put_i64(42);
        fb.set_class_var(cv_val, 8);
        fb.op(Op::CurrentFiber);
        fb.get_class_var(cv_main, 8);
        fb.op(Op::SwapFiber);
        fb.leave(0); // never reached; main never swaps back
        let entry = ctx.add_def(CompiledDef {
            name: fiber_name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 0,
            block: None,
            code: fb.into_bytes(),
            handlers: vec![],
        });

        let main = add_main(&mut ctx, 8, 8, vec![], move |b| {
            b.op(Op::CurrentFiber);
            b.set_class_var(cv_main, 8);
            b.put_i64(entry.0 as i64);
            b.put_i64(0);
            b.op(Op::SpawnFiber);
            b.set_local(0, 8);
            b.op(Op::CurrentFiber);
            b.get_local(0, 8);
            b.op(Op::SwapFiber);
            b.get_class_var(cv_val, 8);
            b.leave(8);
        });
        let out = Interpreter::new(ctx).run(main, &[]).unwrap();
        assert_eq!(as_i64(&out), 42);
    }

    #[test]
    fn finished_fiber_resumes_main() {
        let mut ctx = Context::new();
        let cv = ctx.add_class_var(8);

        let fiber_name = ctx.intern_symbol("fiber_entry");
        let mut fb = BytecodeBuilder::new();
        fb.put_i64(7);
        fb.set_class_var(cv, 8);
        fb.leave(0); // entry frame returns: control goes back to main
        let entry = ctx.add_def(CompiledDef {
            name: fiber_name,
            owner: TypeId::NIL,
            args_size: 0,
            frame_size: 0,
            return_size: 0,
            block: None,
            code: fb.into_bytes(),
            handlers: vec![],
        });

        let main = add_main(&mut ctx, 8, 8, vec![], move |b| {
            b.put_i64(entry.0 as i64);
            b.put_i64(0);
            b.op(Op::SpawnFiber);
            b.set_local(0, 8);
            b.op(Op::CurrentFiber);
            b.get_local(0, 8);
            b.op(Op::SwapFiber);
            b.get_class_var(cv, 8);
            b.leave(8);
        });
        let out = Interpreter::new(ctx).run(main, &[]).unwrap();
        assert_eq!(as_i64(&out), 7);
    }

    // ── procs and the C bridge ─────────────────────────────────────

    fn doubling_def(ctx: &mut Context) -> DefId {
        let name = ctx.intern_symbol("double");
        let mut b = BytecodeBuilder::new();
        b.get_local(0, 4);
        b.get_local(0, 4);
        b.op(Op::AddI32);
        b.leave(4);
        ctx.add_def(CompiledDef {
            name,
            owner: TypeId::NIL,
            args_size: 8,
            frame_size: 8,
            return_size: 4,
            block: None,
            code: b.into_bytes(),
            handlers: vec![],
        })
    }

    #[test]
    fn proc_call_invokes_the_def() {
        let mut ctx = Context::new();
        let double = doubling_def(&mut ctx);
        let main = add_main(&mut ctx, 0, 4, vec![], move |b| {
            b.put_i64(21);
            b.put_i64(double.0 as i64);
            b.put_i64(0); // no closure data
            b.op(Op::ProcCall);
            b.leave(4);
        });
        let out = Interpreter::new(ctx).run(main, &[]).unwrap();
        assert_eq!(as_i32(&out), 42);
    }

    #[test]
    fn proc_to_c_fun_is_callable_from_c() {
        let mut ctx = Context::new();
        let double = doubling_def(&mut ctx);
        let iface = ctx
            .add_interface(
                vec![FfiKind::I32],
                FfiKind::I32,
                InterfaceFlags::NONE,
                0,
            )
            .unwrap();
        let main = add_main(&mut ctx, 0, 8, vec![], move |b| {
            b.put_i64(double.0 as i64);
            b.put_i64(0);
            b.proc_to_c_fun(iface);
            b.leave(8);
        });

        let mut interp = Interpreter::new(ctx);
        let out = interp.run(main, &[]).unwrap();
        let code = as_u64(&out);
        assert_ne!(code, 0);

        let f: extern "C" fn(i32) -> i32 =
            unsafe { std::mem::transmute(code as usize) };
        assert_eq!(f(21), 42);
        // The closure is stable: calling again reuses the same trampoline.
        assert_eq!(f(-3), -6);
    }

    #[test]
    fn c_fun_round_trips_back_to_a_proc() {
        let mut ctx = Context::new();
        let double = doubling_def(&mut ctx);
        let iface = ctx
            .add_interface(
                vec![FfiKind::I32],
                FfiKind::I32,
                InterfaceFlags::NONE,
                0,
            )
            .unwrap();
        let make = add_main(&mut ctx, 0, 8, vec![], move |b| {
            b.put_i64(double.0 as i64);
            b.put_i64(0);
            b.proc_to_c_fun(iface);
            b.leave(8);
        });

        let use_name = ctx.intern_symbol("use_cfun");
        let mut b = BytecodeBuilder::new();
        b.put_i64(21);
        b.get_local(0, 8);
        b.op(Op::CFunToProc);
        b.op(Op::ProcCall);
        b.leave(4);
        let use_def = ctx.add_def(CompiledDef {
            name: use_name,
            owner: TypeId::NIL,
            args_size: 8,
            frame_size: 8,
            return_size: 4,
            block: None,
            code: b.into_bytes(),
            handlers: vec![],
        });

        let mut interp = Interpreter::new(ctx);
        let code = as_u64(&interp.run(make, &[]).unwrap());
        let out = interp.run(use_def, &code.to_ne_bytes()).unwrap();
        assert_eq!(as_i32(&out), 42);
    }

    extern "C" fn native_add(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    #[test]
    fn lib_call_marshals_through_libffi() {
        let mut ctx = Context::new();
        let iface = ctx
            .add_interface(
                vec![FfiKind::I32, FfiKind::I32],
                FfiKind::I32,
                InterfaceFlags::NONE,
                0,
            )
            .unwrap();
        let f = ctx.add_lib_function("native_add", native_add as usize, iface);
        let out = expect(ctx, 0, 4, move |b| {
            b.put_i64(5);
            b.put_i64(37);
            b.lib_call(f);
            b.leave(4);
        });
        assert_eq!(as_i32(&out), 42);
    }

    extern "C" fn native_scale(x: f64, factor: f64) -> f64 {
        x * factor
    }

    #[test]
    fn lib_call_handles_float_returns() {
        let mut ctx = Context::new();
        let iface = ctx
            .add_interface(
                vec![FfiKind::F64, FfiKind::F64],
                FfiKind::F64,
                InterfaceFlags::NONE,
                0,
            )
            .unwrap();
        let f =
            ctx.add_lib_function("native_scale", native_scale as usize, iface);
        let out = expect(ctx, 0, 8, move |b| {
            put_f64(b, 2.5);
            put_f64(b, 4.0);
            b.lib_call(f);
            b.leave(8);
        });
        assert_eq!(as_f64(&out), 10.0);
    }

    // ── debug trap ─────────────────────────────────────────────────

    #[test]
    fn debug_trap_invokes_the_inspector() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let mut ctx = Context::new();
        ctx.trap_hook = Some(Box::new(move |info: &TrapInfo| {
            assert_eq!(info.fiber, MAIN_FIBER);
            assert_eq!(info.frame_count, 1);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let out = expect(ctx, 0, 8, |b| {
            b.op(Op::DebugTrap);
            b.put_i64(1);
            b.leave(8);
        });
        assert_eq!(as_i64(&out), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    // ── driver sanity ──────────────────────────────────────────────

    #[test]
    fn run_resets_between_invocations() {
        let mut ctx = Context::new();
        let main = add_main(&mut ctx, 0, 8, vec![], |b| {
            b.put_i64(11);
            b.leave(8);
        });
        let mut interp = Interpreter::new(ctx);
        assert_eq!(as_i64(&interp.run(main, &[]).unwrap()), 11);
        assert_eq!(as_i64(&interp.run(main, &[]).unwrap()), 11);
    }
}
