/// Bytecode opcodes.
///
/// Each instruction is one opcode byte followed by its inline operands,
/// encoded little-endian with a fixed width per operand kind (see
/// [`OperandKind`]). Branch targets are absolute byte offsets into the
/// current bytecode buffer; side-table operands are 64-bit indices into the
/// context's registries (defs, blocks, lib functions, call interfaces,
/// symbols).
///
/// Stack operands are popped in reverse push order; at most one result is
/// pushed. Every value on the operand stack occupies its size rounded up to
/// the word (see `types::aligned_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ── put ──────────────────────────────────────────────────────────

    /// Push nil. Nil occupies zero bytes, so this pushes nothing.
    PutNil = 0x00,
    /// Push a 64-bit literal. Operands: `value:i64`.
    PutI64,

    // ── numeric conversions ──────────────────────────────────────────

    I8ToF32,
    I8ToF64,
    I16ToF32,
    I16ToF64,
    I32ToF32,
    I32ToF64,
    I64ToF32,
    I64ToF64,
    U8ToF32,
    U8ToF64,
    U16ToF32,
    U16ToF64,
    U32ToF32,
    U32ToF64,
    U64ToF32,
    U64ToF64,
    F32ToF64,
    F64ToF32,
    /// Truncate an f64 toward zero and wrap modulo 2^64 into an i64.
    /// NaN becomes 0.
    F64ToI64Bang,
    /// Fill the top `n` bytes of the top stack word with the sign bit of
    /// the remaining value. Operands: `n:u32`.
    SignExtend,
    /// Fill the top `n` bytes of the top stack word with zeros.
    /// Operands: `n:u32`.
    ZeroExtend,

    // ── checked arithmetic (raises on overflow) ──────────────────────

    AddI32,
    SubI32,
    MulI32,
    AddU32,
    SubU32,
    MulU32,
    AddI64,
    SubI64,
    MulI64,
    AddU64,
    SubU64,
    MulU64,

    // ── wrapping arithmetic (two's complement, never raises) ─────────

    AddWrapI32,
    SubWrapI32,
    MulWrapI32,
    AddWrapI64,
    SubWrapI64,
    MulWrapI64,

    // ── unchecked division (caller guards zero and INT_MIN/-1) ───────

    UnsafeDivI32,
    UnsafeDivU32,
    UnsafeDivI64,
    UnsafeDivU64,
    UnsafeModI32,
    UnsafeModU32,
    UnsafeModI64,
    UnsafeModU64,

    // ── bitwise ──────────────────────────────────────────────────────

    AndI64,
    OrI64,
    XorI64,
    UnsafeShlI64,
    UnsafeShrI64,
    UnsafeShrU64,

    // ── float arithmetic ─────────────────────────────────────────────

    AddF32,
    SubF32,
    MulF32,
    DivF32,
    AddF64,
    SubF64,
    MulF64,
    DivF64,

    // ── comparisons ──────────────────────────────────────────────────
    //
    // cmp_* pop two values and push a tri-state i32 (-1/0/+1). Floats
    // follow IEEE ordering except that any NaN operand yields +1, matching
    // the native backend's lowering. cmp_eq..cmp_ge fold a tri-state into
    // a bool.

    CmpI32,
    CmpU32,
    CmpI64,
    CmpU64,
    CmpI64U64,
    CmpU64I64,
    CmpF32,
    CmpF64,
    CmpEq,
    CmpNeq,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    // ── pointers ─────────────────────────────────────────────────────

    /// Pop an element count, allocate `count * elem_size` zeroed bytes and
    /// push the pointer. Operands: `elem_size:u32`.
    PointerMalloc,
    /// Pop a count and a pointer; reallocate and push the new pointer.
    /// Operands: `elem_size:u32`.
    PointerRealloc,
    /// Pop a value and a pointer; copy exactly `elem_size` bytes to the
    /// pointee. Operands: `elem_size:u32`.
    PointerSet,
    /// Pop a pointer; push `elem_size` bytes read from it.
    /// Operands: `elem_size:u32`.
    PointerGet,
    /// Reinterpret the top i64 as a pointer.
    PointerNew,
    /// Pop an offset and a pointer; push `ptr + offset * elem_size`.
    /// Operands: `elem_size:u32`.
    PointerAdd,
    /// Pop two pointers; push their byte difference floor-divided by
    /// `elem_size`. Operands: `elem_size:u32`.
    PointerDiff,
    PointerIsNull,
    PointerIsNotNull,
    /// Reinterpret the top pointer as a u64 address.
    PointerAddress,

    // ── locals ───────────────────────────────────────────────────────

    /// Push `size` bytes from frame offset `offset`.
    /// Operands: `offset:u32`, `size:u32`.
    GetLocal,
    /// Pop `size` bytes and store them at frame offset `offset`.
    /// Operands: `offset:u32`, `size:u32`.
    SetLocal,

    // ── instance variables ───────────────────────────────────────────

    /// Read a field through the receiver pointer held in local 0.
    /// Operands: `offset:u32`, `size:u32`.
    GetSelfIvar,
    /// Write a field through the receiver pointer held in local 0.
    /// Operands: `offset:u32`, `size:u32`.
    SetSelfIvar,
    /// Pop an object pointer and read a field through it.
    /// Operands: `offset:u32`, `size:u32`.
    GetClassIvar,
    /// Extract a field from an aggregate of `total` bytes left on the
    /// stack, shrinking the stack to the field's aligned size.
    /// Operands: `offset:u32`, `size:u32`, `total:u32`.
    GetStructIvar,

    // ── constants and class variables (lazy init) ────────────────────

    /// Push the "initialized" flag of constant `idx`. Operands: `idx:u32`.
    ConstInitialized,
    /// Operands: `idx:u32`, `size:u32`.
    GetConst,
    /// Operands: `idx:u32`, `size:u32`.
    SetConst,
    /// Operands: `idx:u32`.
    ClassVarInitialized,
    /// Operands: `idx:u32`, `size:u32`.
    GetClassVar,
    /// Operands: `idx:u32`, `size:u32`.
    SetClassVar,

    // ── stack manipulation ───────────────────────────────────────────

    /// Remove the top `size` bytes. Operands: `size:u32`.
    Pop,
    /// Remove `size` bytes starting `offset` bytes below the top.
    /// Operands: `size:u32`, `offset:u32`.
    PopFromOffset,
    /// Duplicate the top `size` bytes. Operands: `size:u32`.
    Dup,
    /// Push `amount` zero bytes. Operands: `amount:u32`.
    PushZeros,
    /// Push a pointer to the top `size` bytes (used to pass stack values
    /// by reference). Operands: `size:u32`.
    PutStackTopPointer,

    // ── branches (absolute byte offsets) ─────────────────────────────

    /// Pop a bool; jump if true. Operands: `ip:u32`.
    BranchIf,
    /// Pop a bool; jump if false. Operands: `ip:u32`.
    BranchUnless,
    /// Operands: `ip:u32`.
    Jump,

    // ── calls and returns ────────────────────────────────────────────

    /// Enter a def whose arguments were pushed left to right.
    /// Operands: `def:u64`.
    Call,
    /// Like `call`, additionally binding the callee def's attached block
    /// to the new frame. Operands: `def:u64`.
    CallWithBlock,
    /// Enter an inlined block frame (yield). Operands: `block:u64`.
    CallBlock,
    /// Marshal stack arguments through libffi into a C function.
    /// Operands: `fn:u64`.
    LibCall,
    /// Return: copy the top `size` bytes over the current frame and
    /// restore the caller. Operands: `size:u32`.
    Leave,
    /// Return from the innermost def, discarding any open block frames.
    /// Operands: `size:u32`.
    LeaveDef,
    /// Unwind past block frames and return from the block's lexical home
    /// def. Operands: `size:u32`.
    BreakBlock,

    // ── allocation ───────────────────────────────────────────────────

    /// Allocate a zeroed heap cell and write `type_id` at offset 0.
    /// Operands: `size:u32`, `type_id:u32`.
    AllocateClass,

    // ── unions ───────────────────────────────────────────────────────

    /// Widen the top `from` bytes into a union of `union_size` bytes with
    /// the given header. Operands: `type_id:u32`, `from:u32`,
    /// `union_size:u32`.
    PutInUnion,
    /// Widen the top reference into a union, reading the header from the
    /// pointee (0 if null). Operands: `union_size:u32`.
    PutReferenceTypeInUnion,
    /// Widen a possibly-null pointer: null becomes an all-zero union.
    /// Operands: `union_size:u32`.
    PutNilableTypeInUnion,
    /// Unwrap the known `from`-sized member out of a union.
    /// Operands: `union_size:u32`, `from:u32`.
    RemoveFromUnion,
    /// Pop a union and push its truthiness (nil, false and null pointers
    /// are falsey). Operands: `union_size:u32`.
    UnionToBool,

    // ── is_a? filters ────────────────────────────────────────────────

    /// Pop a reference; push whether its dynamic type is a subtype of the
    /// filter (false for null). Operands: `filter:u32`.
    ReferenceIsA,
    /// Same against a union header. Operands: `union_size:u32`,
    /// `filter:u32`.
    UnionIsA,

    // ── tuples ───────────────────────────────────────────────────────

    /// Extract a fixed-position tuple field, shrinking the stack.
    /// Operands: `total:u32`, `offset:u32`, `value_size:u32`.
    TupleIndexerKnownIndex,

    // ── symbols ──────────────────────────────────────────────────────

    /// Pop an i32 symbol index; push a pointer to the interned
    /// NUL-terminated string bytes.
    SymbolToS,

    // ── procs ────────────────────────────────────────────────────────

    /// Pop a proc value (def, closure-data) and call it; a non-null
    /// closure pointer is passed as the last argument.
    ProcCall,
    /// Pop a proc value and push a native function pointer backed by a
    /// libffi closure. Operands: `interface:u64`.
    ProcToCFun,
    /// Pop a function pointer previously produced by `proc_to_c_fun` and
    /// push the proc value back.
    CFunToProc,

    // ── atomics (all orderings executed sequentially consistent) ─────

    /// Operands: `size:u8`, `ordering:u8`.
    LoadAtomic,
    /// Operands: `size:u8`, `ordering:u8`.
    StoreAtomic,
    /// Operands: `op:u8`, `size:u8`, `ordering:u8`.
    Atomicrmw,
    /// Operands: `size:u8`, `success:u8`, `failure:u8`.
    Cmpxchg,

    // ── fibers ───────────────────────────────────────────────────────

    /// Push the current fiber's handle.
    CurrentFiber,
    /// Pop a proc value; create a parked fiber running it and push its
    /// handle.
    SpawnFiber,
    /// Pop (from, to) fiber handles and switch execution to `to`.
    SwapFiber,

    // ── exceptions ───────────────────────────────────────────────────

    /// Pop an exception reference and unwind to the nearest matching
    /// handler.
    RaiseException,
    /// Rethrow the last caught exception.
    Reraise,
    /// Push a pointer to a freshly captured backtrace record.
    CallStackUnwind,

    // ── intrinsics ───────────────────────────────────────────────────

    Bswap16,
    Bswap32,
    Bswap64,
    Popcount32,
    Popcount64,
    LeadingZeros32,
    LeadingZeros64,
    TrailingZeros32,
    TrailingZeros64,
    ReadCycleCounter,
    CpuPause,
    /// Suspend and hand the full VM state to the installed inspector.
    DebugTrap,
    /// Pop (dst, src, count, volatile) and copy without overlap.
    MemCopy,
    /// Pop (dst, src, count, volatile) and copy with overlap allowed.
    MemMove,
    /// Pop (dst, value, count, volatile) and fill.
    MemSet,

    // ── libm surface ─────────────────────────────────────────────────

    CeilF32,
    CeilF64,
    CosF32,
    CosF64,
    ExpF32,
    ExpF64,
    FloorF32,
    FloorF64,
    LogF32,
    LogF64,
    RoundF32,
    RoundF64,
    RintF32,
    RintF64,
    SinF32,
    SinF64,
    SqrtF32,
    SqrtF64,
    TruncF32,
    TruncF64,
    PowF32,
    PowF64,
    PowiF32,
    PowiF64,
    MinF32,
    MinF64,
    MaxF32,
    MaxF64,
    CopysignF32,
    CopysignF64,

    // ── process ──────────────────────────────────────────────────────

    /// Push the process argument count as an i32.
    Argc,
    /// Push a pointer to the NULL-terminated argv vector.
    Argv,

    // ── fatal ────────────────────────────────────────────────────────

    /// Raise a fatal interpreter error with the given diagnostic.
    /// Operands: `msg:u64` (symbol index).
    Unreachable,
}

/// Width and disassembly style of one inline operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// One byte.
    U8,
    /// Four bytes, little-endian.
    U32,
    /// Eight bytes, little-endian, signed literal.
    I64,
    /// Four bytes; an absolute branch target, printed as `@n`.
    Target,
    /// Eight bytes; a side-table index, printed as `#n`.
    Table,
    /// Four bytes; a type id, printed as `tn`.
    Type,
}

impl OperandKind {
    pub const fn width(self) -> usize {
        match self {
            OperandKind::U8 => 1,
            OperandKind::U32 | OperandKind::Target | OperandKind::Type => 4,
            OperandKind::I64 | OperandKind::Table => 8,
        }
    }
}

/// Static description of one opcode: mnemonic and inline operand layout.
///
/// This table is the source of truth shared by the builder's debug
/// validation and the disassembler.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub operands: &'static [OperandKind],
}

use OperandKind::{Table, Target, Type, I64, U32, U8};

macro_rules! info {
    ($name:literal) => {
        OpInfo { name: $name, operands: &[] }
    };
    ($name:literal, $($kind:expr),+) => {
        OpInfo { name: $name, operands: &[$($kind),+] }
    };
}

impl Op {
    pub const COUNT: usize = Op::Unreachable as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        core::mem::transmute::<u8, Op>(byte)
    }

    /// Mnemonic and operand layout for this opcode.
    pub const fn info(self) -> OpInfo {
        match self {
            Op::PutNil => info!("put_nil"),
            Op::PutI64 => info!("put_i64", I64),
            Op::I8ToF32 => info!("i8_to_f32"),
            Op::I8ToF64 => info!("i8_to_f64"),
            Op::I16ToF32 => info!("i16_to_f32"),
            Op::I16ToF64 => info!("i16_to_f64"),
            Op::I32ToF32 => info!("i32_to_f32"),
            Op::I32ToF64 => info!("i32_to_f64"),
            Op::I64ToF32 => info!("i64_to_f32"),
            Op::I64ToF64 => info!("i64_to_f64"),
            Op::U8ToF32 => info!("u8_to_f32"),
            Op::U8ToF64 => info!("u8_to_f64"),
            Op::U16ToF32 => info!("u16_to_f32"),
            Op::U16ToF64 => info!("u16_to_f64"),
            Op::U32ToF32 => info!("u32_to_f32"),
            Op::U32ToF64 => info!("u32_to_f64"),
            Op::U64ToF32 => info!("u64_to_f32"),
            Op::U64ToF64 => info!("u64_to_f64"),
            Op::F32ToF64 => info!("f32_to_f64"),
            Op::F64ToF32 => info!("f64_to_f32"),
            Op::F64ToI64Bang => info!("f64_to_i64!"),
            Op::SignExtend => info!("sign_extend", U32),
            Op::ZeroExtend => info!("zero_extend", U32),
            Op::AddI32 => info!("add_i32"),
            Op::SubI32 => info!("sub_i32"),
            Op::MulI32 => info!("mul_i32"),
            Op::AddU32 => info!("add_u32"),
            Op::SubU32 => info!("sub_u32"),
            Op::MulU32 => info!("mul_u32"),
            Op::AddI64 => info!("add_i64"),
            Op::SubI64 => info!("sub_i64"),
            Op::MulI64 => info!("mul_i64"),
            Op::AddU64 => info!("add_u64"),
            Op::SubU64 => info!("sub_u64"),
            Op::MulU64 => info!("mul_u64"),
            Op::AddWrapI32 => info!("add_wrap_i32"),
            Op::SubWrapI32 => info!("sub_wrap_i32"),
            Op::MulWrapI32 => info!("mul_wrap_i32"),
            Op::AddWrapI64 => info!("add_wrap_i64"),
            Op::SubWrapI64 => info!("sub_wrap_i64"),
            Op::MulWrapI64 => info!("mul_wrap_i64"),
            Op::UnsafeDivI32 => info!("unsafe_div_i32"),
            Op::UnsafeDivU32 => info!("unsafe_div_u32"),
            Op::UnsafeDivI64 => info!("unsafe_div_i64"),
            Op::UnsafeDivU64 => info!("unsafe_div_u64"),
            Op::UnsafeModI32 => info!("unsafe_mod_i32"),
            Op::UnsafeModU32 => info!("unsafe_mod_u32"),
            Op::UnsafeModI64 => info!("unsafe_mod_i64"),
            Op::UnsafeModU64 => info!("unsafe_mod_u64"),
            Op::AndI64 => info!("and_i64"),
            Op::OrI64 => info!("or_i64"),
            Op::XorI64 => info!("xor_i64"),
            Op::UnsafeShlI64 => info!("unsafe_shl_i64"),
            Op::UnsafeShrI64 => info!("unsafe_shr_i64"),
            Op::UnsafeShrU64 => info!("unsafe_shr_u64"),
            Op::AddF32 => info!("add_f32"),
            Op::SubF32 => info!("sub_f32"),
            Op::MulF32 => info!("mul_f32"),
            Op::DivF32 => info!("div_f32"),
            Op::AddF64 => info!("add_f64"),
            Op::SubF64 => info!("sub_f64"),
            Op::MulF64 => info!("mul_f64"),
            Op::DivF64 => info!("div_f64"),
            Op::CmpI32 => info!("cmp_i32"),
            Op::CmpU32 => info!("cmp_u32"),
            Op::CmpI64 => info!("cmp_i64"),
            Op::CmpU64 => info!("cmp_u64"),
            Op::CmpI64U64 => info!("cmp_i64_u64"),
            Op::CmpU64I64 => info!("cmp_u64_i64"),
            Op::CmpF32 => info!("cmp_f32"),
            Op::CmpF64 => info!("cmp_f64"),
            Op::CmpEq => info!("cmp_eq"),
            Op::CmpNeq => info!("cmp_neq"),
            Op::CmpLt => info!("cmp_lt"),
            Op::CmpLe => info!("cmp_le"),
            Op::CmpGt => info!("cmp_gt"),
            Op::CmpGe => info!("cmp_ge"),
            Op::PointerMalloc => info!("pointer_malloc", U32),
            Op::PointerRealloc => info!("pointer_realloc", U32),
            Op::PointerSet => info!("pointer_set", U32),
            Op::PointerGet => info!("pointer_get", U32),
            Op::PointerNew => info!("pointer_new"),
            Op::PointerAdd => info!("pointer_add", U32),
            Op::PointerDiff => info!("pointer_diff", U32),
            Op::PointerIsNull => info!("pointer_is_null"),
            Op::PointerIsNotNull => info!("pointer_is_not_null"),
            Op::PointerAddress => info!("pointer_address"),
            Op::GetLocal => info!("get_local", U32, U32),
            Op::SetLocal => info!("set_local", U32, U32),
            Op::GetSelfIvar => info!("get_self_ivar", U32, U32),
            Op::SetSelfIvar => info!("set_self_ivar", U32, U32),
            Op::GetClassIvar => info!("get_class_ivar", U32, U32),
            Op::GetStructIvar => info!("get_struct_ivar", U32, U32, U32),
            Op::ConstInitialized => info!("const_initialized", U32),
            Op::GetConst => info!("get_const", U32, U32),
            Op::SetConst => info!("set_const", U32, U32),
            Op::ClassVarInitialized => info!("class_var_initialized", U32),
            Op::GetClassVar => info!("get_class_var", U32, U32),
            Op::SetClassVar => info!("set_class_var", U32, U32),
            Op::Pop => info!("pop", U32),
            Op::PopFromOffset => info!("pop_from_offset", U32, U32),
            Op::Dup => info!("dup", U32),
            Op::PushZeros => info!("push_zeros", U32),
            Op::PutStackTopPointer => info!("put_stack_top_pointer", U32),
            Op::BranchIf => info!("branch_if", Target),
            Op::BranchUnless => info!("branch_unless", Target),
            Op::Jump => info!("jump", Target),
            Op::Call => info!("call", Table),
            Op::CallWithBlock => info!("call_with_block", Table),
            Op::CallBlock => info!("call_block", Table),
            Op::LibCall => info!("lib_call", Table),
            Op::Leave => info!("leave", U32),
            Op::LeaveDef => info!("leave_def", U32),
            Op::BreakBlock => info!("break_block", U32),
            Op::AllocateClass => info!("allocate_class", U32, Type),
            Op::PutInUnion => info!("put_in_union", Type, U32, U32),
            Op::PutReferenceTypeInUnion => {
                info!("put_reference_type_in_union", U32)
            }
            Op::PutNilableTypeInUnion => {
                info!("put_nilable_type_in_union", U32)
            }
            Op::RemoveFromUnion => info!("remove_from_union", U32, U32),
            Op::UnionToBool => info!("union_to_bool", U32),
            Op::ReferenceIsA => info!("reference_is_a", Type),
            Op::UnionIsA => info!("union_is_a", U32, Type),
            Op::TupleIndexerKnownIndex => {
                info!("tuple_indexer_known_index", U32, U32, U32)
            }
            Op::SymbolToS => info!("symbol_to_s"),
            Op::ProcCall => info!("proc_call"),
            Op::ProcToCFun => info!("proc_to_c_fun", Table),
            Op::CFunToProc => info!("c_fun_to_proc"),
            Op::LoadAtomic => info!("load_atomic", U8, U8),
            Op::StoreAtomic => info!("store_atomic", U8, U8),
            Op::Atomicrmw => info!("atomicrmw", U8, U8, U8),
            Op::Cmpxchg => info!("cmpxchg", U8, U8, U8),
            Op::CurrentFiber => info!("current_fiber"),
            Op::SpawnFiber => info!("spawn_fiber"),
            Op::SwapFiber => info!("swap_fiber"),
            Op::RaiseException => info!("raise_exception"),
            Op::Reraise => info!("reraise"),
            Op::CallStackUnwind => info!("call_stack_unwind"),
            Op::Bswap16 => info!("bswap16"),
            Op::Bswap32 => info!("bswap32"),
            Op::Bswap64 => info!("bswap64"),
            Op::Popcount32 => info!("popcount32"),
            Op::Popcount64 => info!("popcount64"),
            Op::LeadingZeros32 => info!("leading_zeros32"),
            Op::LeadingZeros64 => info!("leading_zeros64"),
            Op::TrailingZeros32 => info!("trailing_zeros32"),
            Op::TrailingZeros64 => info!("trailing_zeros64"),
            Op::ReadCycleCounter => info!("read_cycle_counter"),
            Op::CpuPause => info!("cpu_pause"),
            Op::DebugTrap => info!("debug_trap"),
            Op::MemCopy => info!("mem_copy"),
            Op::MemMove => info!("mem_move"),
            Op::MemSet => info!("mem_set"),
            Op::CeilF32 => info!("ceil_f32"),
            Op::CeilF64 => info!("ceil_f64"),
            Op::CosF32 => info!("cos_f32"),
            Op::CosF64 => info!("cos_f64"),
            Op::ExpF32 => info!("exp_f32"),
            Op::ExpF64 => info!("exp_f64"),
            Op::FloorF32 => info!("floor_f32"),
            Op::FloorF64 => info!("floor_f64"),
            Op::LogF32 => info!("log_f32"),
            Op::LogF64 => info!("log_f64"),
            Op::RoundF32 => info!("round_f32"),
            Op::RoundF64 => info!("round_f64"),
            Op::RintF32 => info!("rint_f32"),
            Op::RintF64 => info!("rint_f64"),
            Op::SinF32 => info!("sin_f32"),
            Op::SinF64 => info!("sin_f64"),
            Op::SqrtF32 => info!("sqrt_f32"),
            Op::SqrtF64 => info!("sqrt_f64"),
            Op::TruncF32 => info!("trunc_f32"),
            Op::TruncF64 => info!("trunc_f64"),
            Op::PowF32 => info!("pow_f32"),
            Op::PowF64 => info!("pow_f64"),
            Op::PowiF32 => info!("powi_f32"),
            Op::PowiF64 => info!("powi_f64"),
            Op::MinF32 => info!("min_f32"),
            Op::MinF64 => info!("min_f64"),
            Op::MaxF32 => info!("max_f32"),
            Op::MaxF64 => info!("max_f64"),
            Op::CopysignF32 => info!("copysign_f32"),
            Op::CopysignF64 => info!("copysign_f64"),
            Op::Argc => info!("argc"),
            Op::Argv => info!("argv"),
            Op::Unreachable => info!("unreachable", Table),
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Read-modify-write operation selector for [`Op::Atomicrmw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RmwOp {
    Add = 0,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
    Max,
    Min,
    UMax,
    UMin,
}

impl TryFrom<u8> for RmwOp {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte <= RmwOp::UMin as u8 {
            // SAFETY: RmwOp is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, RmwOp>(byte) })
        } else {
            Err(byte)
        }
    }
}
