use types::TypeId;

use crate::defs::{BlockId, DefId};
use crate::op::{Op, OperandKind, RmwOp};

/// A forward branch whose target has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`], [`BytecodeBuilder::branch_if`] and
/// [`BytecodeBuilder::branch_unless`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the u32 target bytes in the buffer.
    patch_pos: usize,
}

/// Builds a bytecode byte sequence.
///
/// Instructions with inline operands have a dedicated method; operandless
/// instructions go through [`op`](Self::op). In debug builds every emission
/// is validated against [`Op::info`].
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op, operands: &[OperandKind]) {
        debug_assert_eq!(
            op.info().operands,
            operands,
            "operand layout mismatch for {op:?}"
        );
        self.buf.push(op as u8);
    }

    /// Emit an instruction that carries no inline operands.
    pub fn op(&mut self, op: Op) {
        self.emit_op(op, &[]);
    }

    // ── literals ───────────────────────────────────────────────────

    /// `put_i64 <value:i64>`.
    pub fn put_i64(&mut self, value: i64) {
        self.emit_op(Op::PutI64, &[OperandKind::I64]);
        self.emit_i64(value);
    }

    /// `put_nil` — pushes nothing.
    pub fn put_nil(&mut self) {
        self.op(Op::PutNil);
    }

    // ── conversions ────────────────────────────────────────────────

    /// `sign_extend <n:u32>`.
    pub fn sign_extend(&mut self, n: u32) {
        self.emit_op(Op::SignExtend, &[OperandKind::U32]);
        self.emit_u32(n);
    }

    /// `zero_extend <n:u32>`.
    pub fn zero_extend(&mut self, n: u32) {
        self.emit_op(Op::ZeroExtend, &[OperandKind::U32]);
        self.emit_u32(n);
    }

    // ── pointers ───────────────────────────────────────────────────

    pub fn pointer_malloc(&mut self, elem_size: u32) {
        self.emit_op(Op::PointerMalloc, &[OperandKind::U32]);
        self.emit_u32(elem_size);
    }

    pub fn pointer_realloc(&mut self, elem_size: u32) {
        self.emit_op(Op::PointerRealloc, &[OperandKind::U32]);
        self.emit_u32(elem_size);
    }

    pub fn pointer_set(&mut self, elem_size: u32) {
        self.emit_op(Op::PointerSet, &[OperandKind::U32]);
        self.emit_u32(elem_size);
    }

    pub fn pointer_get(&mut self, elem_size: u32) {
        self.emit_op(Op::PointerGet, &[OperandKind::U32]);
        self.emit_u32(elem_size);
    }

    pub fn pointer_add(&mut self, elem_size: u32) {
        self.emit_op(Op::PointerAdd, &[OperandKind::U32]);
        self.emit_u32(elem_size);
    }

    pub fn pointer_diff(&mut self, elem_size: u32) {
        self.emit_op(Op::PointerDiff, &[OperandKind::U32]);
        self.emit_u32(elem_size);
    }

    // ── locals ─────────────────────────────────────────────────────

    /// `get_local <offset:u32> <size:u32>`.
    pub fn get_local(&mut self, offset: u32, size: u32) {
        self.emit_op(Op::GetLocal, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(offset);
        self.emit_u32(size);
    }

    /// `set_local <offset:u32> <size:u32>`.
    pub fn set_local(&mut self, offset: u32, size: u32) {
        self.emit_op(Op::SetLocal, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(offset);
        self.emit_u32(size);
    }

    // ── instance variables ─────────────────────────────────────────

    pub fn get_self_ivar(&mut self, offset: u32, size: u32) {
        self.emit_op(Op::GetSelfIvar, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(offset);
        self.emit_u32(size);
    }

    pub fn set_self_ivar(&mut self, offset: u32, size: u32) {
        self.emit_op(Op::SetSelfIvar, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(offset);
        self.emit_u32(size);
    }

    pub fn get_class_ivar(&mut self, offset: u32, size: u32) {
        self.emit_op(Op::GetClassIvar, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(offset);
        self.emit_u32(size);
    }

    pub fn get_struct_ivar(&mut self, offset: u32, size: u32, total: u32) {
        self.emit_op(
            Op::GetStructIvar,
            &[OperandKind::U32, OperandKind::U32, OperandKind::U32],
        );
        self.emit_u32(offset);
        self.emit_u32(size);
        self.emit_u32(total);
    }

    // ── constants and class variables ──────────────────────────────

    pub fn const_initialized(&mut self, idx: u32) {
        self.emit_op(Op::ConstInitialized, &[OperandKind::U32]);
        self.emit_u32(idx);
    }

    pub fn get_const(&mut self, idx: u32, size: u32) {
        self.emit_op(Op::GetConst, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(idx);
        self.emit_u32(size);
    }

    pub fn set_const(&mut self, idx: u32, size: u32) {
        self.emit_op(Op::SetConst, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(idx);
        self.emit_u32(size);
    }

    pub fn class_var_initialized(&mut self, idx: u32) {
        self.emit_op(Op::ClassVarInitialized, &[OperandKind::U32]);
        self.emit_u32(idx);
    }

    pub fn get_class_var(&mut self, idx: u32, size: u32) {
        self.emit_op(Op::GetClassVar, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(idx);
        self.emit_u32(size);
    }

    pub fn set_class_var(&mut self, idx: u32, size: u32) {
        self.emit_op(Op::SetClassVar, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(idx);
        self.emit_u32(size);
    }

    // ── stack manipulation ─────────────────────────────────────────

    pub fn pop(&mut self, size: u32) {
        self.emit_op(Op::Pop, &[OperandKind::U32]);
        self.emit_u32(size);
    }

    pub fn pop_from_offset(&mut self, size: u32, offset: u32) {
        self.emit_op(Op::PopFromOffset, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(size);
        self.emit_u32(offset);
    }

    pub fn dup(&mut self, size: u32) {
        self.emit_op(Op::Dup, &[OperandKind::U32]);
        self.emit_u32(size);
    }

    pub fn push_zeros(&mut self, amount: u32) {
        self.emit_op(Op::PushZeros, &[OperandKind::U32]);
        self.emit_u32(amount);
    }

    pub fn put_stack_top_pointer(&mut self, size: u32) {
        self.emit_op(Op::PutStackTopPointer, &[OperandKind::U32]);
        self.emit_u32(size);
    }

    // ── branches ───────────────────────────────────────────────────

    /// Emit a forward `branch_if`; resolve with [`bind`](Self::bind).
    pub fn branch_if(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchIf)
    }

    /// Emit a forward `branch_unless`; resolve with [`bind`](Self::bind).
    pub fn branch_unless(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchUnless)
    }

    /// Emit a forward `jump`; resolve with [`bind`](Self::bind).
    pub fn jump(&mut self) -> Label {
        self.emit_branch_placeholder(Op::Jump)
    }

    /// `branch_if <ip>` to a known offset (backward branches).
    pub fn branch_if_to(&mut self, ip: u32) {
        self.emit_op(Op::BranchIf, &[OperandKind::Target]);
        self.emit_u32(ip);
    }

    /// `branch_unless <ip>` to a known offset.
    pub fn branch_unless_to(&mut self, ip: u32) {
        self.emit_op(Op::BranchUnless, &[OperandKind::Target]);
        self.emit_u32(ip);
    }

    /// `jump <ip>` to a known offset.
    pub fn jump_to(&mut self, ip: u32) {
        self.emit_op(Op::Jump, &[OperandKind::Target]);
        self.emit_u32(ip);
    }

    /// Bind a forward branch label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len() as u32;
        self.buf[label.patch_pos..label.patch_pos + 4]
            .copy_from_slice(&target.to_le_bytes());
    }

    fn emit_branch_placeholder(&mut self, op: Op) -> Label {
        self.emit_op(op, &[OperandKind::Target]);
        let patch_pos = self.buf.len();
        self.emit_u32(0); // placeholder
        Label { patch_pos }
    }

    // ── calls ──────────────────────────────────────────────────────

    /// `call <def:u64>`.
    pub fn call(&mut self, def: DefId) {
        self.emit_op(Op::Call, &[OperandKind::Table]);
        self.emit_u64(def.0 as u64);
    }

    /// `call_with_block <def:u64>`.
    pub fn call_with_block(&mut self, def: DefId) {
        self.emit_op(Op::CallWithBlock, &[OperandKind::Table]);
        self.emit_u64(def.0 as u64);
    }

    /// `call_block <block:u64>`.
    pub fn call_block(&mut self, block: BlockId) {
        self.emit_op(Op::CallBlock, &[OperandKind::Table]);
        self.emit_u64(block.0 as u64);
    }

    /// `lib_call <fn:u64>`.
    pub fn lib_call(&mut self, function: u64) {
        self.emit_op(Op::LibCall, &[OperandKind::Table]);
        self.emit_u64(function);
    }

    pub fn leave(&mut self, size: u32) {
        self.emit_op(Op::Leave, &[OperandKind::U32]);
        self.emit_u32(size);
    }

    pub fn leave_def(&mut self, size: u32) {
        self.emit_op(Op::LeaveDef, &[OperandKind::U32]);
        self.emit_u32(size);
    }

    pub fn break_block(&mut self, size: u32) {
        self.emit_op(Op::BreakBlock, &[OperandKind::U32]);
        self.emit_u32(size);
    }

    // ── allocation, unions, filters ────────────────────────────────

    pub fn allocate_class(&mut self, size: u32, type_id: TypeId) {
        self.emit_op(Op::AllocateClass, &[OperandKind::U32, OperandKind::Type]);
        self.emit_u32(size);
        self.emit_u32(type_id.0);
    }

    pub fn put_in_union(&mut self, type_id: TypeId, from: u32, union_size: u32) {
        self.emit_op(
            Op::PutInUnion,
            &[OperandKind::Type, OperandKind::U32, OperandKind::U32],
        );
        self.emit_u32(type_id.0);
        self.emit_u32(from);
        self.emit_u32(union_size);
    }

    pub fn put_reference_type_in_union(&mut self, union_size: u32) {
        self.emit_op(Op::PutReferenceTypeInUnion, &[OperandKind::U32]);
        self.emit_u32(union_size);
    }

    pub fn put_nilable_type_in_union(&mut self, union_size: u32) {
        self.emit_op(Op::PutNilableTypeInUnion, &[OperandKind::U32]);
        self.emit_u32(union_size);
    }

    pub fn remove_from_union(&mut self, union_size: u32, from: u32) {
        self.emit_op(Op::RemoveFromUnion, &[OperandKind::U32, OperandKind::U32]);
        self.emit_u32(union_size);
        self.emit_u32(from);
    }

    pub fn union_to_bool(&mut self, union_size: u32) {
        self.emit_op(Op::UnionToBool, &[OperandKind::U32]);
        self.emit_u32(union_size);
    }

    pub fn reference_is_a(&mut self, filter: TypeId) {
        self.emit_op(Op::ReferenceIsA, &[OperandKind::Type]);
        self.emit_u32(filter.0);
    }

    pub fn union_is_a(&mut self, union_size: u32, filter: TypeId) {
        self.emit_op(Op::UnionIsA, &[OperandKind::U32, OperandKind::Type]);
        self.emit_u32(union_size);
        self.emit_u32(filter.0);
    }

    pub fn tuple_indexer_known_index(
        &mut self,
        total: u32,
        offset: u32,
        value_size: u32,
    ) {
        self.emit_op(
            Op::TupleIndexerKnownIndex,
            &[OperandKind::U32, OperandKind::U32, OperandKind::U32],
        );
        self.emit_u32(total);
        self.emit_u32(offset);
        self.emit_u32(value_size);
    }

    // ── procs ──────────────────────────────────────────────────────

    /// `proc_to_c_fun <interface:u64>`.
    pub fn proc_to_c_fun(&mut self, interface: u64) {
        self.emit_op(Op::ProcToCFun, &[OperandKind::Table]);
        self.emit_u64(interface);
    }

    // ── atomics ────────────────────────────────────────────────────

    pub fn load_atomic(&mut self, size: u8, ordering: u8) {
        self.emit_op(Op::LoadAtomic, &[OperandKind::U8, OperandKind::U8]);
        self.emit_u8(size);
        self.emit_u8(ordering);
    }

    pub fn store_atomic(&mut self, size: u8, ordering: u8) {
        self.emit_op(Op::StoreAtomic, &[OperandKind::U8, OperandKind::U8]);
        self.emit_u8(size);
        self.emit_u8(ordering);
    }

    pub fn atomicrmw(&mut self, op: RmwOp, size: u8, ordering: u8) {
        self.emit_op(
            Op::Atomicrmw,
            &[OperandKind::U8, OperandKind::U8, OperandKind::U8],
        );
        self.emit_u8(op as u8);
        self.emit_u8(size);
        self.emit_u8(ordering);
    }

    pub fn cmpxchg(&mut self, size: u8, success: u8, failure: u8) {
        self.emit_op(
            Op::Cmpxchg,
            &[OperandKind::U8, OperandKind::U8, OperandKind::U8],
        );
        self.emit_u8(size);
        self.emit_u8(success);
        self.emit_u8(failure);
    }

    // ── fatal ──────────────────────────────────────────────────────

    /// `unreachable <msg:u64>` — symbol index of the diagnostic.
    pub fn unreachable(&mut self, msg: u64) {
        self.emit_op(Op::Unreachable, &[OperandKind::Table]);
        self.emit_u64(msg);
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
