use std::ffi::c_void;
use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64,
    AtomicU8, Ordering::SeqCst,
};

use bytecode::{BlockId, DefId, Op, RmwOp};
use libffi::low;
use libffi::middle::CodePtr;
use libffi::raw;
use types::{aligned_size, Primitive, TypeId, TypeKind, UNION_HEADER_SIZE};

use crate::context::{Context, TrapInfo};
use crate::ffi::{self, CFunCell, CFunEntry, FfiKind, FfiValue};
use crate::fiber::{ParkedFiber, MAIN_FIBER};
use crate::frame::{Frame, FrameUnit};
use crate::stack::{OperandStack, DEFAULT_STACK_CAPACITY};

const MAX_FRAMES: usize = 4096;

/// Fatal conditions of the VM itself. Source-language exceptions never
/// appear here; they flow through the handler tables and only surface as
/// [`VmError::UncaughtException`] when no frame catches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    StackOverflow,
    InvalidOpcode { byte: u8, ip: usize },
    UncaughtException { type_id: TypeId },
    NullPointerDeref { what: &'static str },
    UnknownFiber { handle: u64 },
    UnknownCFun { address: u64 },
    UnknownSymbol { index: i32 },
    UnknownTypeId { id: u32 },
    /// Checked arithmetic overflowed with no overflow exception type
    /// registered.
    Overflow,
    /// The host allocator failed with no out-of-memory exception type
    /// registered.
    OutOfMemory,
    /// A libffi status failure with no library exception type registered.
    Ffi { message: String },
    /// An `unreachable` opcode executed.
    Unreachable { message: String },
    Internal { message: &'static str },
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::InvalidOpcode { byte, ip } => {
                write!(f, "invalid opcode 0x{byte:02x} at {ip}")
            }
            VmError::UncaughtException { type_id } => {
                write!(f, "uncaught exception of type {type_id}")
            }
            VmError::NullPointerDeref { what } => {
                write!(f, "null pointer dereference ({what})")
            }
            VmError::UnknownFiber { handle } => {
                write!(f, "unknown fiber handle {handle}")
            }
            VmError::UnknownCFun { address } => {
                write!(f, "no proc registered for function pointer {address:#x}")
            }
            VmError::UnknownSymbol { index } => {
                write!(f, "unknown symbol index {index}")
            }
            VmError::UnknownTypeId { id } => {
                write!(f, "union header names unknown type id {id}")
            }
            VmError::Overflow => write!(f, "arithmetic overflow"),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::Ffi { message } => write!(f, "ffi failure: {message}"),
            VmError::Unreachable { message } => {
                write!(f, "unreachable: {message}")
            }
            VmError::Internal { message } => write!(f, "vm bug: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

/// The stack machine executor.
///
/// Owns the [`Context`] plus one operand stack, frame list and instruction
/// pointer per fiber (exactly one fiber runs at a time; the rest are
/// parked). Registries must be fully populated before the first `run`:
/// the dispatch loop holds a raw pointer into the current def's bytecode.
///
/// The interpreter must not be moved while native function pointers
/// produced by `proc_to_c_fun` may still be invoked; their trampolines
/// re-enter through the address captured at registration.
pub struct Interpreter {
    ctx: Context,
    stack: OperandStack,
    frames: Vec<Frame>,
    ip: usize,
    code: *const u8,
    code_len: usize,
    current_fiber: u64,
    next_fiber: u64,
    parked: Vec<ParkedFiber>,
    last_exception: u64,
    stack_capacity: usize,
}

impl Interpreter {
    pub fn new(ctx: Context) -> Self {
        Self::with_stack_capacity(ctx, DEFAULT_STACK_CAPACITY)
    }

    pub fn with_stack_capacity(ctx: Context, capacity: usize) -> Self {
        Self {
            ctx,
            stack: OperandStack::new(capacity),
            frames: Vec::new(),
            ip: 0,
            code: core::ptr::null(),
            code_len: 0,
            current_fiber: MAIN_FIBER,
            next_fiber: MAIN_FIBER + 1,
            parked: Vec::new(),
            last_exception: 0,
            stack_capacity: capacity,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Execute `def` on the main fiber and return its result bytes.
    ///
    /// `args` must be the def's arguments laid out exactly as the call
    /// protocol pushes them (each word-aligned, `args_size` bytes total).
    pub fn run(&mut self, def: DefId, args: &[u8]) -> Result<Vec<u8>, VmError> {
        debug_assert_eq!(args.len() % 8, 0, "arguments must be word-aligned");
        self.stack.set_sp(0);
        self.frames.clear();
        self.parked.clear();
        self.current_fiber = MAIN_FIBER;
        self.next_fiber = MAIN_FIBER + 1;
        self.last_exception = 0;

        if !self.stack.grow_zeroed(args.len()) {
            return Err(VmError::StackOverflow);
        }
        self.stack
            .bytes_mut(0..args.len())
            .copy_from_slice(args);

        self.enter(def)?;

        let return_size = self.ctx.def(def).return_size as usize;
        let footprint = aligned_size(return_size);
        let top = self.stack.sp() - footprint;
        let out = self.stack.bytes(top..top + return_size).to_vec();
        self.stack.discard(footprint);
        Ok(out)
    }

    /// Push a frame for `def` (arguments already on the stack) and execute
    /// until it returns. Re-entrant: FFI trampolines call this while an
    /// outer `execute` is live.
    pub(crate) fn enter(&mut self, def: DefId) -> Result<(), VmError> {
        let depth = self.frames.len();
        self.call_def(def, None)?;
        self.execute(depth)
    }

    // ── dispatch loop ──────────────────────────────────────────────

    fn execute(&mut self, stop_depth: usize) -> Result<(), VmError> {
        loop {
            if self.frames.len() <= stop_depth {
                if self.frames.len() < stop_depth {
                    return Err(VmError::Internal {
                        message: "unwound past a native call boundary",
                    });
                }
                if stop_depth == 0 && self.current_fiber != MAIN_FIBER {
                    self.finish_fiber()?;
                    continue;
                }
                return Ok(());
            }
            debug_assert_eq!(self.stack.sp() % 8, 0, "stack misaligned");

            let op = self.fetch_op()?;
            match op {
                // ── put ────────────────────────────────────────────
                Op::PutNil => {}
                Op::PutI64 => {
                    let v = self.fetch_i64();
                    self.stack.push_i64(v);
                }

                // ── conversions ────────────────────────────────────
                Op::I8ToF32 => {
                    let v = self.stack.pop_u8() as i8;
                    self.stack.push_f32(v as f32);
                }
                Op::I8ToF64 => {
                    let v = self.stack.pop_u8() as i8;
                    self.stack.push_f64(v as f64);
                }
                Op::I16ToF32 => {
                    let v = self.stack.pop_u16() as i16;
                    self.stack.push_f32(v as f32);
                }
                Op::I16ToF64 => {
                    let v = self.stack.pop_u16() as i16;
                    self.stack.push_f64(v as f64);
                }
                Op::I32ToF32 => {
                    let v = self.stack.pop_i32();
                    self.stack.push_f32(v as f32);
                }
                Op::I32ToF64 => {
                    let v = self.stack.pop_i32();
                    self.stack.push_f64(v as f64);
                }
                Op::I64ToF32 => {
                    let v = self.stack.pop_i64();
                    self.stack.push_f32(v as f32);
                }
                Op::I64ToF64 => {
                    let v = self.stack.pop_i64();
                    self.stack.push_f64(v as f64);
                }
                Op::U8ToF32 => {
                    let v = self.stack.pop_u8();
                    self.stack.push_f32(v as f32);
                }
                Op::U8ToF64 => {
                    let v = self.stack.pop_u8();
                    self.stack.push_f64(v as f64);
                }
                Op::U16ToF32 => {
                    let v = self.stack.pop_u16();
                    self.stack.push_f32(v as f32);
                }
                Op::U16ToF64 => {
                    let v = self.stack.pop_u16();
                    self.stack.push_f64(v as f64);
                }
                Op::U32ToF32 => {
                    let v = self.stack.pop_u32();
                    self.stack.push_f32(v as f32);
                }
                Op::U32ToF64 => {
                    let v = self.stack.pop_u32();
                    self.stack.push_f64(v as f64);
                }
                Op::U64ToF32 => {
                    let v = self.stack.pop_u64();
                    self.stack.push_f32(v as f32);
                }
                Op::U64ToF64 => {
                    let v = self.stack.pop_u64();
                    self.stack.push_f64(v as f64);
                }
                Op::F32ToF64 => {
                    let v = self.stack.pop_f32();
                    self.stack.push_f64(v as f64);
                }
                Op::F64ToF32 => {
                    let v = self.stack.pop_f64();
                    self.stack.push_f32(v as f32);
                }
                Op::F64ToI64Bang => {
                    let f = self.stack.pop_f64();
                    // Truncate toward zero, wrap modulo 2^64. Values beyond
                    // the i128 range saturate before wrapping.
                    let v = if f.is_nan() { 0 } else { f.trunc() as i128 as i64 };
                    self.stack.push_i64(v);
                }
                Op::SignExtend => {
                    let n = self.fetch_u32();
                    debug_assert!(n < 8);
                    let sh = n * 8;
                    let v = self.stack.pop_u64();
                    self.stack.push_u64((((v << sh) as i64) >> sh) as u64);
                }
                Op::ZeroExtend => {
                    let n = self.fetch_u32();
                    debug_assert!(n < 8);
                    let sh = n * 8;
                    let v = self.stack.pop_u64();
                    self.stack.push_u64((v << sh) >> sh);
                }

                // ── checked arithmetic ─────────────────────────────
                Op::AddI32 => self.checked_i32(i32::checked_add)?,
                Op::SubI32 => self.checked_i32(i32::checked_sub)?,
                Op::MulI32 => self.checked_i32(i32::checked_mul)?,
                Op::AddU32 => self.checked_u32(u32::checked_add)?,
                Op::SubU32 => self.checked_u32(u32::checked_sub)?,
                Op::MulU32 => self.checked_u32(u32::checked_mul)?,
                Op::AddI64 => self.checked_i64(i64::checked_add)?,
                Op::SubI64 => self.checked_i64(i64::checked_sub)?,
                Op::MulI64 => self.checked_i64(i64::checked_mul)?,
                Op::AddU64 => self.checked_u64(u64::checked_add)?,
                Op::SubU64 => self.checked_u64(u64::checked_sub)?,
                Op::MulU64 => self.checked_u64(u64::checked_mul)?,

                // ── wrapping arithmetic ────────────────────────────
                Op::AddWrapI32 => self.raw_i32(i32::wrapping_add),
                Op::SubWrapI32 => self.raw_i32(i32::wrapping_sub),
                Op::MulWrapI32 => self.raw_i32(i32::wrapping_mul),
                Op::AddWrapI64 => self.raw_i64(i64::wrapping_add),
                Op::SubWrapI64 => self.raw_i64(i64::wrapping_sub),
                Op::MulWrapI64 => self.raw_i64(i64::wrapping_mul),

                // ── unchecked division (divide-by-zero aborts) ─────
                Op::UnsafeDivI32 => self.raw_i32(i32::wrapping_div),
                Op::UnsafeDivU32 => self.raw_u32(u32::wrapping_div),
                Op::UnsafeDivI64 => self.raw_i64(i64::wrapping_div),
                Op::UnsafeDivU64 => self.raw_u64(u64::wrapping_div),
                Op::UnsafeModI32 => self.raw_i32(i32::wrapping_rem),
                Op::UnsafeModU32 => self.raw_u32(u32::wrapping_rem),
                Op::UnsafeModI64 => self.raw_i64(i64::wrapping_rem),
                Op::UnsafeModU64 => self.raw_u64(u64::wrapping_rem),

                // ── bitwise ────────────────────────────────────────
                Op::AndI64 => self.raw_i64(|a, b| a & b),
                Op::OrI64 => self.raw_i64(|a, b| a | b),
                Op::XorI64 => self.raw_i64(|a, b| a ^ b),
                Op::UnsafeShlI64 => {
                    let b = self.stack.pop_u64();
                    let a = self.stack.pop_i64();
                    self.stack.push_i64(a.wrapping_shl(b as u32));
                }
                Op::UnsafeShrI64 => {
                    let b = self.stack.pop_u64();
                    let a = self.stack.pop_i64();
                    self.stack.push_i64(a.wrapping_shr(b as u32));
                }
                Op::UnsafeShrU64 => {
                    let b = self.stack.pop_u64();
                    let a = self.stack.pop_u64();
                    self.stack.push_u64(a.wrapping_shr(b as u32));
                }

                // ── float arithmetic ───────────────────────────────
                Op::AddF32 => self.float32(|a, b| a + b),
                Op::SubF32 => self.float32(|a, b| a - b),
                Op::MulF32 => self.float32(|a, b| a * b),
                Op::DivF32 => self.float32(|a, b| a / b),
                Op::AddF64 => self.float64(|a, b| a + b),
                Op::SubF64 => self.float64(|a, b| a - b),
                Op::MulF64 => self.float64(|a, b| a * b),
                Op::DivF64 => self.float64(|a, b| a / b),

                // ── comparisons ────────────────────────────────────
                Op::CmpI32 => {
                    let b = self.stack.pop_i32();
                    let a = self.stack.pop_i32();
                    self.stack.push_i32(ord_value(a.cmp(&b)));
                }
                Op::CmpU32 => {
                    let b = self.stack.pop_u32();
                    let a = self.stack.pop_u32();
                    self.stack.push_i32(ord_value(a.cmp(&b)));
                }
                Op::CmpI64 => {
                    let b = self.stack.pop_i64();
                    let a = self.stack.pop_i64();
                    self.stack.push_i32(ord_value(a.cmp(&b)));
                }
                Op::CmpU64 => {
                    let b = self.stack.pop_u64();
                    let a = self.stack.pop_u64();
                    self.stack.push_i32(ord_value(a.cmp(&b)));
                }
                Op::CmpI64U64 => {
                    let b = self.stack.pop_u64();
                    let a = self.stack.pop_i64();
                    let r = if a < 0 {
                        -1
                    } else {
                        ord_value((a as u64).cmp(&b))
                    };
                    self.stack.push_i32(r);
                }
                Op::CmpU64I64 => {
                    let b = self.stack.pop_i64();
                    let a = self.stack.pop_u64();
                    let r = if b < 0 {
                        1
                    } else {
                        ord_value(a.cmp(&(b as u64)))
                    };
                    self.stack.push_i32(r);
                }
                Op::CmpF32 => {
                    let b = self.stack.pop_f32();
                    let a = self.stack.pop_f32();
                    // NaN compares greater, as the native backend lowers it.
                    let r = if a < b {
                        -1
                    } else if a == b {
                        0
                    } else {
                        1
                    };
                    self.stack.push_i32(r);
                }
                Op::CmpF64 => {
                    let b = self.stack.pop_f64();
                    let a = self.stack.pop_f64();
                    let r = if a < b {
                        -1
                    } else if a == b {
                        0
                    } else {
                        1
                    };
                    self.stack.push_i32(r);
                }
                Op::CmpEq => {
                    let t = self.stack.pop_i32();
                    self.stack.push_bool(t == 0);
                }
                Op::CmpNeq => {
                    let t = self.stack.pop_i32();
                    self.stack.push_bool(t != 0);
                }
                Op::CmpLt => {
                    let t = self.stack.pop_i32();
                    self.stack.push_bool(t < 0);
                }
                Op::CmpLe => {
                    let t = self.stack.pop_i32();
                    self.stack.push_bool(t <= 0);
                }
                Op::CmpGt => {
                    let t = self.stack.pop_i32();
                    self.stack.push_bool(t > 0);
                }
                Op::CmpGe => {
                    let t = self.stack.pop_i32();
                    self.stack.push_bool(t >= 0);
                }

                // ── pointers ───────────────────────────────────────
                Op::PointerMalloc => {
                    let elem = self.fetch_u32() as u64;
                    let count = self.stack.pop_u64();
                    let bytes =
                        count.checked_mul(elem).unwrap_or(u64::MAX) as usize;
                    match host_malloc_zeroed(bytes) {
                        Some(ptr) => self.stack.push_u64(ptr),
                        None => self.raise_out_of_memory()?,
                    }
                }
                Op::PointerRealloc => {
                    let elem = self.fetch_u32() as u64;
                    let count = self.stack.pop_u64();
                    let ptr = self.stack.pop_u64();
                    let bytes =
                        count.checked_mul(elem).unwrap_or(u64::MAX) as usize;
                    let new = unsafe {
                        libc::realloc(
                            ptr as usize as *mut c_void,
                            bytes.max(1),
                        )
                    };
                    if new.is_null() {
                        self.raise_out_of_memory()?;
                    } else {
                        self.stack.push_u64(new as u64);
                    }
                }
                Op::PointerSet => {
                    let elem = self.fetch_u32() as usize;
                    let footprint = aligned_size(elem);
                    let src = self.stack.sp() - footprint;
                    let ptr = self.stack.read_u64_at(src - 8);
                    if ptr == 0 {
                        return Err(VmError::NullPointerDeref {
                            what: "pointer_set",
                        });
                    }
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            self.stack.ptr_at(src),
                            ptr as usize as *mut u8,
                            elem,
                        );
                    }
                    self.stack.discard(footprint + 8);
                }
                Op::PointerGet => {
                    let elem = self.fetch_u32() as usize;
                    let ptr = self.stack.pop_u64();
                    if ptr == 0 {
                        return Err(VmError::NullPointerDeref {
                            what: "pointer_get",
                        });
                    }
                    let pushed = unsafe {
                        self.stack
                            .push_from_ptr(ptr as usize as *const u8, elem)
                    };
                    if !pushed {
                        return Err(VmError::StackOverflow);
                    }
                }
                // An i64 address and a pointer have the same representation.
                Op::PointerNew | Op::PointerAddress => {}
                Op::PointerAdd => {
                    let elem = self.fetch_u32() as i64;
                    let offset = self.stack.pop_i64();
                    let ptr = self.stack.pop_u64();
                    let moved = (ptr as i64)
                        .wrapping_add(offset.wrapping_mul(elem));
                    self.stack.push_u64(moved as u64);
                }
                Op::PointerDiff => {
                    let elem = self.fetch_u32() as i64;
                    let b = self.stack.pop_u64();
                    let a = self.stack.pop_u64();
                    let diff = (a as i64).wrapping_sub(b as i64);
                    self.stack.push_i64(diff.div_euclid(elem));
                }
                Op::PointerIsNull => {
                    let ptr = self.stack.pop_u64();
                    self.stack.push_bool(ptr == 0);
                }
                Op::PointerIsNotNull => {
                    let ptr = self.stack.pop_u64();
                    self.stack.push_bool(ptr != 0);
                }

                // ── locals ─────────────────────────────────────────
                Op::GetLocal => {
                    let offset = self.fetch_u32() as usize;
                    let size = self.fetch_u32() as usize;
                    let locals = self.frames.last().unwrap().locals;
                    if !self.stack.push_within(locals + offset, size) {
                        return Err(VmError::StackOverflow);
                    }
                }
                Op::SetLocal => {
                    let offset = self.fetch_u32() as usize;
                    let size = self.fetch_u32() as usize;
                    let locals = self.frames.last().unwrap().locals;
                    let footprint = aligned_size(size);
                    let src = self.stack.sp() - footprint;
                    self.stack.copy_within(src, locals + offset, size);
                    self.stack.discard(footprint);
                }

                // ── instance variables ─────────────────────────────
                Op::GetSelfIvar => {
                    let offset = self.fetch_u32() as usize;
                    let size = self.fetch_u32() as usize;
                    let receiver = self.self_pointer()?;
                    let pushed = unsafe {
                        self.stack.push_from_ptr(
                            (receiver as usize + offset) as *const u8,
                            size,
                        )
                    };
                    if !pushed {
                        return Err(VmError::StackOverflow);
                    }
                }
                Op::SetSelfIvar => {
                    let offset = self.fetch_u32() as usize;
                    let size = self.fetch_u32() as usize;
                    let receiver = self.self_pointer()?;
                    let footprint = aligned_size(size);
                    let src = self.stack.sp() - footprint;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            self.stack.ptr_at(src),
                            (receiver as usize + offset) as *mut u8,
                            size,
                        );
                    }
                    self.stack.discard(footprint);
                }
                Op::GetClassIvar => {
                    let offset = self.fetch_u32() as usize;
                    let size = self.fetch_u32() as usize;
                    let ptr = self.stack.pop_u64();
                    if ptr == 0 {
                        return Err(VmError::NullPointerDeref {
                            what: "get_class_ivar",
                        });
                    }
                    let pushed = unsafe {
                        self.stack.push_from_ptr(
                            (ptr as usize + offset) as *const u8,
                            size,
                        )
                    };
                    if !pushed {
                        return Err(VmError::StackOverflow);
                    }
                }
                Op::GetStructIvar => {
                    let offset = self.fetch_u32();
                    let size = self.fetch_u32();
                    let total = self.fetch_u32();
                    self.extract_field(total, offset, size);
                }

                // ── constants and class variables ──────────────────
                Op::ConstInitialized => {
                    let idx = self.fetch_u32();
                    let v = self.ctx.const_initialized(idx).ok_or(
                        VmError::Internal {
                            message: "constant index out of range",
                        },
                    )?;
                    self.stack.push_bool(v);
                }
                Op::GetConst => {
                    let idx = self.fetch_u32();
                    let size = self.fetch_u32();
                    let bytes = self.ctx.const_slice(idx, size).ok_or(
                        VmError::Internal {
                            message: "constant index out of range",
                        },
                    )?;
                    self.stack.push_bytes(bytes);
                }
                Op::SetConst => {
                    let idx = self.fetch_u32();
                    let size = self.fetch_u32() as usize;
                    let footprint = aligned_size(size);
                    let src = self.stack.sp() - footprint;
                    self.ctx
                        .write_const(idx, self.stack.bytes(src..src + size))
                        .ok_or(VmError::Internal {
                            message: "constant index out of range",
                        })?;
                    self.stack.discard(footprint);
                }
                Op::ClassVarInitialized => {
                    let idx = self.fetch_u32();
                    let v = self.ctx.class_var_initialized(idx).ok_or(
                        VmError::Internal {
                            message: "class variable index out of range",
                        },
                    )?;
                    self.stack.push_bool(v);
                }
                Op::GetClassVar => {
                    let idx = self.fetch_u32();
                    let size = self.fetch_u32();
                    let bytes = self.ctx.class_var_slice(idx, size).ok_or(
                        VmError::Internal {
                            message: "class variable index out of range",
                        },
                    )?;
                    self.stack.push_bytes(bytes);
                }
                Op::SetClassVar => {
                    let idx = self.fetch_u32();
                    let size = self.fetch_u32() as usize;
                    let footprint = aligned_size(size);
                    let src = self.stack.sp() - footprint;
                    self.ctx
                        .write_class_var(
                            idx,
                            self.stack.bytes(src..src + size),
                        )
                        .ok_or(VmError::Internal {
                            message: "class variable index out of range",
                        })?;
                    self.stack.discard(footprint);
                }

                // ── stack manipulation ─────────────────────────────
                Op::Pop => {
                    let size = self.fetch_u32() as usize;
                    self.stack.discard(aligned_size(size));
                }
                Op::PopFromOffset => {
                    let size = self.fetch_u32() as usize;
                    let offset = self.fetch_u32() as usize;
                    debug_assert_eq!(size % 8, 0);
                    debug_assert_eq!(offset % 8, 0);
                    let sp = self.stack.sp();
                    self.stack.copy_within(sp - offset, sp - offset - size, offset);
                    self.stack.discard(size);
                }
                Op::Dup => {
                    let size = self.fetch_u32() as usize;
                    let footprint = aligned_size(size);
                    let src = self.stack.sp() - footprint;
                    if !self.stack.push_within(src, footprint) {
                        return Err(VmError::StackOverflow);
                    }
                }
                Op::PushZeros => {
                    let amount = self.fetch_u32() as usize;
                    if !self.stack.grow_zeroed(aligned_size(amount)) {
                        return Err(VmError::StackOverflow);
                    }
                }
                Op::PutStackTopPointer => {
                    let size = self.fetch_u32() as usize;
                    let top = self.stack.sp() - aligned_size(size);
                    let ptr = self.stack.ptr_at(top) as u64;
                    self.stack.push_u64(ptr);
                }

                // ── branches ───────────────────────────────────────
                Op::BranchIf => {
                    let target = self.fetch_u32() as usize;
                    if self.stack.pop_bool() {
                        self.ip = target;
                    }
                }
                Op::BranchUnless => {
                    let target = self.fetch_u32() as usize;
                    if !self.stack.pop_bool() {
                        self.ip = target;
                    }
                }
                Op::Jump => {
                    self.ip = self.fetch_u32() as usize;
                }

                // ── calls and returns ──────────────────────────────
                Op::Call => {
                    let id = DefId(self.fetch_u64() as u32);
                    self.call_def(id, None)?;
                }
                Op::CallWithBlock => {
                    let id = DefId(self.fetch_u64() as u32);
                    let block = self
                        .ctx
                        .try_def(id)
                        .ok_or(VmError::Internal { message: "unknown def" })?
                        .block
                        .ok_or(VmError::Internal {
                            message: "call_with_block on a def without a block",
                        })?;
                    let home = self.frames.len() - 1;
                    self.call_def(id, Some((block, home)))?;
                }
                Op::CallBlock => {
                    let id = BlockId(self.fetch_u64() as u32);
                    self.call_block(id)?;
                }
                Op::LibCall => {
                    let id = self.fetch_u64();
                    self.lib_call(id)?;
                }
                Op::Leave => {
                    let size = self.fetch_u32() as usize;
                    self.do_leave(size);
                }
                Op::LeaveDef => {
                    let size = self.fetch_u32() as usize;
                    // Non-local return: unwind to the def the current code
                    // lexically belongs to, following the home chain.
                    let mut target = self.frames.len() - 1;
                    while self.frames[target].is_block() {
                        target = self.frames[target].home;
                    }
                    self.frames.truncate(target + 1);
                    self.do_leave(size);
                }
                Op::BreakBlock => {
                    let size = self.fetch_u32() as usize;
                    // Return from the method that yielded: discard the open
                    // block frames, then leave the def beneath them.
                    while self
                        .frames
                        .last()
                        .map(Frame::is_block)
                        .unwrap_or(false)
                    {
                        self.frames.pop();
                    }
                    self.do_leave(size);
                }

                // ── allocation ─────────────────────────────────────
                Op::AllocateClass => {
                    let size = self.fetch_u32().max(4) as usize;
                    let tid = self.fetch_u32();
                    match host_malloc_zeroed(size) {
                        Some(ptr) => {
                            unsafe {
                                (ptr as usize as *mut u32)
                                    .write_unaligned(tid);
                            }
                            self.stack.push_u64(ptr);
                        }
                        None => self.raise_out_of_memory()?,
                    }
                }

                // ── unions ─────────────────────────────────────────
                Op::PutInUnion => {
                    let tid = self.fetch_u32();
                    let from = self.fetch_u32() as usize;
                    let union_size = self.fetch_u32() as usize;
                    self.union_put(tid, from, union_size)?;
                }
                Op::PutReferenceTypeInUnion => {
                    let union_size = self.fetch_u32() as usize;
                    let ptr = self.stack.read_u64_at(self.stack.sp() - 8);
                    let tid = heap_type_id(ptr);
                    self.union_put(tid, 8, union_size)?;
                }
                Op::PutNilableTypeInUnion => {
                    let union_size = self.fetch_u32() as usize;
                    let ptr = self.stack.pop_u64();
                    if ptr == 0 {
                        if !self.stack.grow_zeroed(union_size) {
                            return Err(VmError::StackOverflow);
                        }
                    } else {
                        self.stack.push_u64(ptr);
                        self.union_put(heap_type_id(ptr), 8, union_size)?;
                    }
                }
                Op::RemoveFromUnion => {
                    let union_size = self.fetch_u32() as usize;
                    let from = self.fetch_u32() as usize;
                    let base = self.stack.sp() - union_size;
                    self.stack
                        .copy_within(base + UNION_HEADER_SIZE, base, from);
                    let footprint = aligned_size(from);
                    self.stack.zero(base + from..base + footprint);
                    self.stack.set_sp(base + footprint);
                }
                Op::UnionToBool => {
                    let union_size = self.fetch_u32() as usize;
                    let truthy = self.union_truthiness(union_size)?;
                    self.stack.discard(union_size);
                    self.stack.push_bool(truthy);
                }

                // ── is_a? filters ──────────────────────────────────
                Op::ReferenceIsA => {
                    let filter = TypeId(self.fetch_u32());
                    let ptr = self.stack.pop_u64();
                    let tid = TypeId(heap_type_id(ptr));
                    self.stack
                        .push_bool(self.ctx.types.is_subtype(tid, filter));
                }
                Op::UnionIsA => {
                    let union_size = self.fetch_u32() as usize;
                    let filter = TypeId(self.fetch_u32());
                    let base = self.stack.sp() - union_size;
                    let tid = TypeId(self.stack.read_u64_at(base) as u32);
                    self.stack.discard(union_size);
                    self.stack
                        .push_bool(self.ctx.types.is_subtype(tid, filter));
                }

                // ── tuples ─────────────────────────────────────────
                Op::TupleIndexerKnownIndex => {
                    let total = self.fetch_u32();
                    let offset = self.fetch_u32();
                    let size = self.fetch_u32();
                    self.extract_field(total, offset, size);
                }

                // ── symbols ────────────────────────────────────────
                Op::SymbolToS => {
                    let index = self.stack.pop_i32();
                    let ptr = self
                        .ctx
                        .symbol(index as u32)
                        .ok_or(VmError::UnknownSymbol { index })?
                        .as_ptr() as u64;
                    self.stack.push_u64(ptr);
                }

                // ── procs ──────────────────────────────────────────
                Op::ProcCall => {
                    let closure_data = self.stack.pop_u64();
                    let def = DefId(self.stack.pop_u64() as u32);
                    if closure_data != 0 {
                        self.stack.push_u64(closure_data);
                    }
                    self.call_def(def, None)?;
                }
                Op::ProcToCFun => {
                    let interface = self.fetch_u64();
                    let closure_data = self.stack.pop_u64();
                    let def = DefId(self.stack.pop_u64() as u32);
                    if let Some(code) =
                        self.register_cfun(def, closure_data, interface)?
                    {
                        self.stack.push_u64(code as u64);
                    }
                }
                Op::CFunToProc => {
                    let code = self.stack.pop_u64();
                    let (def, closure_data) = self
                        .ctx
                        .cfun_by_code(code as usize)
                        .ok_or(VmError::UnknownCFun { address: code })?;
                    self.stack.push_u64(def.0 as u64);
                    self.stack.push_u64(closure_data);
                }

                // ── atomics ────────────────────────────────────────
                Op::LoadAtomic => {
                    let size = self.fetch_u8();
                    let _ordering = self.fetch_u8();
                    let ptr = self.stack.pop_u64();
                    let v = atomic_load(size, ptr)?;
                    self.stack.push_u64(v);
                }
                Op::StoreAtomic => {
                    let size = self.fetch_u8();
                    let _ordering = self.fetch_u8();
                    let value = self.stack.pop_u64();
                    let ptr = self.stack.pop_u64();
                    atomic_store(size, ptr, value)?;
                }
                Op::Atomicrmw => {
                    let op = RmwOp::try_from(self.fetch_u8()).map_err(|_| {
                        VmError::Internal {
                            message: "invalid atomicrmw operation",
                        }
                    })?;
                    let size = self.fetch_u8();
                    let _ordering = self.fetch_u8();
                    let value = self.stack.pop_u64();
                    let ptr = self.stack.pop_u64();
                    let old = atomic_rmw(op, size, ptr, value)?;
                    self.stack.push_u64(old);
                }
                Op::Cmpxchg => {
                    let size = self.fetch_u8();
                    let _success = self.fetch_u8();
                    let _failure = self.fetch_u8();
                    let new = self.stack.pop_u64();
                    let expected = self.stack.pop_u64();
                    let ptr = self.stack.pop_u64();
                    let (old, swapped) =
                        atomic_cmpxchg(size, ptr, expected, new)?;
                    self.stack.push_u64(old);
                    self.stack.push_bool(swapped);
                }

                // ── fibers ─────────────────────────────────────────
                Op::CurrentFiber => {
                    self.stack.push_u64(self.current_fiber);
                }
                Op::SpawnFiber => {
                    let closure_data = self.stack.pop_u64();
                    let def = DefId(self.stack.pop_u64() as u32);
                    let id = self.spawn_fiber(def, closure_data)?;
                    self.stack.push_u64(id);
                }
                Op::SwapFiber => {
                    let to = self.stack.pop_u64();
                    let from = self.stack.pop_u64();
                    self.swap_fiber(from, to)?;
                }

                // ── exceptions ─────────────────────────────────────
                Op::RaiseException => {
                    let exc = self.stack.pop_u64();
                    self.raise_value(exc)?;
                }
                Op::Reraise => {
                    if self.last_exception == 0 {
                        return Err(VmError::Internal {
                            message: "reraise without an active exception",
                        });
                    }
                    self.raise_value(self.last_exception)?;
                }
                Op::CallStackUnwind => {
                    self.capture_backtrace()?;
                }

                // ── intrinsics ─────────────────────────────────────
                Op::Bswap16 => {
                    let v = self.stack.pop_u16();
                    self.stack.push_u16(v.swap_bytes());
                }
                Op::Bswap32 => {
                    let v = self.stack.pop_u32();
                    self.stack.push_u32(v.swap_bytes());
                }
                Op::Bswap64 => {
                    let v = self.stack.pop_u64();
                    self.stack.push_u64(v.swap_bytes());
                }
                Op::Popcount32 => {
                    let v = self.stack.pop_u32();
                    self.stack.push_u32(v.count_ones());
                }
                Op::Popcount64 => {
                    let v = self.stack.pop_u64();
                    self.stack.push_u64(v.count_ones() as u64);
                }
                Op::LeadingZeros32 => {
                    let v = self.stack.pop_u32();
                    self.stack.push_u32(v.leading_zeros());
                }
                Op::LeadingZeros64 => {
                    let v = self.stack.pop_u64();
                    self.stack.push_u64(v.leading_zeros() as u64);
                }
                Op::TrailingZeros32 => {
                    let v = self.stack.pop_u32();
                    self.stack.push_u32(v.trailing_zeros());
                }
                Op::TrailingZeros64 => {
                    let v = self.stack.pop_u64();
                    self.stack.push_u64(v.trailing_zeros() as u64);
                }
                Op::ReadCycleCounter => {
                    self.stack.push_u64(cycle_counter());
                }
                Op::CpuPause => {
                    core::hint::spin_loop();
                }
                Op::DebugTrap => {
                    self.debug_trap();
                }
                Op::MemCopy => {
                    let _volatile = self.stack.pop_bool();
                    let count = self.stack.pop_u64() as usize;
                    let src = self.stack.pop_u64();
                    let dst = self.stack.pop_u64();
                    if count > 0 {
                        if src == 0 || dst == 0 {
                            return Err(VmError::NullPointerDeref {
                                what: "mem_copy",
                            });
                        }
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                src as usize as *const u8,
                                dst as usize as *mut u8,
                                count,
                            );
                        }
                    }
                }
                Op::MemMove => {
                    let _volatile = self.stack.pop_bool();
                    let count = self.stack.pop_u64() as usize;
                    let src = self.stack.pop_u64();
                    let dst = self.stack.pop_u64();
                    if count > 0 {
                        if src == 0 || dst == 0 {
                            return Err(VmError::NullPointerDeref {
                                what: "mem_move",
                            });
                        }
                        unsafe {
                            core::ptr::copy(
                                src as usize as *const u8,
                                dst as usize as *mut u8,
                                count,
                            );
                        }
                    }
                }
                Op::MemSet => {
                    let _volatile = self.stack.pop_bool();
                    let count = self.stack.pop_u64() as usize;
                    let value = self.stack.pop_u64() as u8;
                    let dst = self.stack.pop_u64();
                    if count > 0 {
                        if dst == 0 {
                            return Err(VmError::NullPointerDeref {
                                what: "mem_set",
                            });
                        }
                        unsafe {
                            core::ptr::write_bytes(
                                dst as usize as *mut u8,
                                value,
                                count,
                            );
                        }
                    }
                }

                // ── libm surface ───────────────────────────────────
                Op::CeilF32 => self.unary_f32(f32::ceil),
                Op::CeilF64 => self.unary_f64(f64::ceil),
                Op::CosF32 => self.unary_f32(f32::cos),
                Op::CosF64 => self.unary_f64(f64::cos),
                Op::ExpF32 => self.unary_f32(f32::exp),
                Op::ExpF64 => self.unary_f64(f64::exp),
                Op::FloorF32 => self.unary_f32(f32::floor),
                Op::FloorF64 => self.unary_f64(f64::floor),
                Op::LogF32 => self.unary_f32(f32::ln),
                Op::LogF64 => self.unary_f64(f64::ln),
                Op::RoundF32 => self.unary_f32(f32::round),
                Op::RoundF64 => self.unary_f64(f64::round),
                // rint rounds half to even.
                Op::RintF32 => self.unary_f32(f32::round_ties_even),
                Op::RintF64 => self.unary_f64(f64::round_ties_even),
                Op::SinF32 => self.unary_f32(f32::sin),
                Op::SinF64 => self.unary_f64(f64::sin),
                Op::SqrtF32 => self.unary_f32(f32::sqrt),
                Op::SqrtF64 => self.unary_f64(f64::sqrt),
                Op::TruncF32 => self.unary_f32(f32::trunc),
                Op::TruncF64 => self.unary_f64(f64::trunc),
                Op::PowF32 => self.float32(f32::powf),
                Op::PowF64 => self.float64(f64::powf),
                Op::PowiF32 => {
                    let e = self.stack.pop_i32();
                    let x = self.stack.pop_f32();
                    self.stack.push_f32(x.powi(e));
                }
                Op::PowiF64 => {
                    let e = self.stack.pop_i32();
                    let x = self.stack.pop_f64();
                    self.stack.push_f64(x.powi(e));
                }
                Op::MinF32 => self.float32(f32::min),
                Op::MinF64 => self.float64(f64::min),
                Op::MaxF32 => self.float32(f32::max),
                Op::MaxF64 => self.float64(f64::max),
                Op::CopysignF32 => self.float32(f32::copysign),
                Op::CopysignF64 => self.float64(f64::copysign),

                // ── process ────────────────────────────────────────
                Op::Argc => {
                    self.stack.push_i32(self.ctx.argc());
                }
                Op::Argv => {
                    self.stack.push_u64(self.ctx.argv_ptr() as u64);
                }

                // ── fatal ──────────────────────────────────────────
                Op::Unreachable => {
                    let msg = self.fetch_u64() as u32;
                    let message = self
                        .ctx
                        .symbol_str(msg)
                        .unwrap_or("unreachable code reached")
                        .to_string();
                    return Err(VmError::Unreachable { message });
                }
            }
        }
    }

    // ── operand fetch ──────────────────────────────────────────────

    #[inline(always)]
    fn fetch_op(&mut self) -> Result<Op, VmError> {
        if self.ip >= self.code_len {
            return Err(VmError::Internal {
                message: "instruction pointer ran off the bytecode",
            });
        }
        let byte = unsafe { *self.code.add(self.ip) };
        self.ip += 1;
        Op::try_from(byte).map_err(|byte| VmError::InvalidOpcode {
            byte,
            ip: self.ip - 1,
        })
    }

    #[inline(always)]
    fn fetch_u8(&mut self) -> u8 {
        debug_assert!(self.ip < self.code_len);
        let v = unsafe { *self.code.add(self.ip) };
        self.ip += 1;
        v
    }

    #[inline(always)]
    fn fetch_u32(&mut self) -> u32 {
        debug_assert!(self.ip + 4 <= self.code_len);
        let v = unsafe {
            (self.code.add(self.ip) as *const u32).read_unaligned()
        };
        self.ip += 4;
        u32::from_le(v)
    }

    #[inline(always)]
    fn fetch_u64(&mut self) -> u64 {
        debug_assert!(self.ip + 8 <= self.code_len);
        let v = unsafe {
            (self.code.add(self.ip) as *const u64).read_unaligned()
        };
        self.ip += 8;
        u64::from_le(v)
    }

    #[inline(always)]
    fn fetch_i64(&mut self) -> i64 {
        self.fetch_u64() as i64
    }

    // ── frames ─────────────────────────────────────────────────────

    fn refresh_code(&mut self) {
        if let Some(frame) = self.frames.last() {
            let code: &[u8] = match frame.unit {
                FrameUnit::Def(d) => &self.ctx.def(d).code,
                FrameUnit::Block(b) => &self.ctx.block(b).code,
            };
            self.code = code.as_ptr();
            self.code_len = code.len();
        }
    }

    fn call_def(
        &mut self,
        id: DefId,
        binding: Option<(BlockId, usize)>,
    ) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }
        let (args_size, frame_size) = {
            let def = self.ctx.try_def(id).ok_or(VmError::Internal {
                message: "unknown def",
            })?;
            (def.args_size as usize, def.frame_size as usize)
        };
        debug_assert!(frame_size >= args_size);
        debug_assert!(self.stack.sp() >= args_size);

        // The pushed arguments become the lowest local slots in place.
        let base = self.stack.sp() - args_size;
        if !self.stack.grow_zeroed(frame_size - args_size) {
            return Err(VmError::StackOverflow);
        }

        let index = self.frames.len();
        self.frames.push(Frame {
            unit: FrameUnit::Def(id),
            base,
            locals: base,
            home: index,
            return_ip: self.ip,
            block: binding,
        });
        self.ip = 0;
        self.refresh_code();
        Ok(())
    }

    fn call_block(&mut self, id: BlockId) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }
        let def_frame = self
            .frames
            .iter()
            .rposition(|f| !f.is_block())
            .ok_or(VmError::Internal { message: "yield without a frame" })?;
        let (bound, home) =
            self.frames[def_frame].block.ok_or(VmError::Internal {
                message: "yield without a bound block",
            })?;
        debug_assert_eq!(bound, id, "call_block operand disagrees with binding");

        let (args_size, args_offset) = {
            let block = self.ctx.try_block(id).ok_or(VmError::Internal {
                message: "unknown block",
            })?;
            (block.args_size as usize, block.args_offset as usize)
        };

        // Block arguments land in the home frame's locals.
        let home_locals = self.frames[home].locals;
        let src = self.stack.sp() - args_size;
        self.stack.copy_within(src, home_locals + args_offset, args_size);
        self.stack.discard(args_size);

        self.frames.push(Frame {
            unit: FrameUnit::Block(id),
            base: self.stack.sp(),
            locals: home_locals,
            home,
            return_ip: self.ip,
            block: None,
        });
        self.ip = 0;
        self.refresh_code();
        Ok(())
    }

    /// Pop the current frame, copying the top `size` result bytes over its
    /// region and restoring the caller's instruction pointer.
    fn do_leave(&mut self, size: usize) {
        let frame = self.frames.pop().expect("leave without a frame");
        let footprint = aligned_size(size);
        let top = self.stack.sp() - footprint;
        self.stack.copy_within(top, frame.base, footprint);
        self.stack.set_sp(frame.base + footprint);
        self.ip = frame.return_ip;
        self.refresh_code();
    }

    /// Receiver pointer of the current frame: local slot 0 of the frame's
    /// addressed locals.
    fn self_pointer(&self) -> Result<u64, VmError> {
        let locals = self.frames.last().unwrap().locals;
        let receiver = self.stack.read_u64_at(locals);
        if receiver == 0 {
            return Err(VmError::NullPointerDeref { what: "self" });
        }
        Ok(receiver)
    }

    /// Shrink an aggregate of `total` bytes on the stack top down to the
    /// field at `offset`, keeping the field's aligned footprint.
    fn extract_field(&mut self, total: u32, offset: u32, size: u32) {
        let base = self.stack.sp() - aligned_size(total as usize);
        self.stack
            .copy_within(base + offset as usize, base, size as usize);
        let footprint = aligned_size(size as usize);
        self.stack.zero(base + size as usize..base + footprint);
        self.stack.set_sp(base + footprint);
    }

    // ── exceptions ─────────────────────────────────────────────────

    /// Unwind to the nearest matching handler. Returns an error only when
    /// the exception escapes every frame or the VM state is corrupt.
    fn raise_value(&mut self, exc: u64) -> Result<(), VmError> {
        if exc == 0 {
            return Err(VmError::Internal {
                message: "raised a nil exception",
            });
        }
        let tid =
            TypeId(unsafe { (exc as usize as *const u32).read_unaligned() });
        tracing::trace!(target: "vm", type_id = tid.0, "raise");

        let mut i = self.frames.len();
        while i > 0 {
            i -= 1;
            let frame_ip = if i + 1 == self.frames.len() {
                self.ip
            } else {
                self.frames[i + 1].return_ip
            } as u32;
            let found = {
                let handlers = match self.frames[i].unit {
                    FrameUnit::Def(d) => &self.ctx.def(d).handlers,
                    FrameUnit::Block(b) => &self.ctx.block(b).handlers,
                };
                let table = &self.ctx.types;
                handlers
                    .iter()
                    .find(|h| {
                        h.covers(frame_ip)
                            && (h.types.is_empty()
                                || h.types
                                    .iter()
                                    .any(|&t| table.is_subtype(tid, t)))
                    })
                    .map(|h| (h.target as usize, h.stack_depth as usize))
            };
            if let Some((target, depth)) = found {
                self.frames.truncate(i + 1);
                let base = self.frames[i].base;
                self.stack.set_sp(base + depth);
                self.stack.push_u64(exc);
                self.ip = target;
                self.last_exception = exc;
                self.refresh_code();
                return Ok(());
            }
        }
        Err(VmError::UncaughtException { type_id: tid })
    }

    /// Allocate a header-only exception cell of a well-known type and
    /// raise it; falls back to the fatal error when the type is not
    /// registered.
    fn raise_well_known(
        &mut self,
        tid: TypeId,
        fatal: VmError,
    ) -> Result<(), VmError> {
        if tid.is_nil() {
            return Err(fatal);
        }
        let ptr =
            host_malloc_zeroed(UNION_HEADER_SIZE).ok_or(VmError::OutOfMemory)?;
        unsafe {
            (ptr as usize as *mut u32).write_unaligned(tid.0);
        }
        self.raise_value(ptr)
    }

    fn raise_overflow(&mut self) -> Result<(), VmError> {
        self.raise_well_known(self.ctx.errors.overflow, VmError::Overflow)
    }

    fn raise_out_of_memory(&mut self) -> Result<(), VmError> {
        self.raise_well_known(
            self.ctx.errors.out_of_memory,
            VmError::OutOfMemory,
        )
    }

    fn raise_library_error(&mut self, message: &str) -> Result<(), VmError> {
        self.raise_well_known(
            self.ctx.errors.library,
            VmError::Ffi {
                message: message.to_string(),
            },
        )
    }

    /// Allocate and push a backtrace record: a word count followed by the
    /// def-name symbol of each live frame, outermost first.
    fn capture_backtrace(&mut self) -> Result<(), VmError> {
        let count = self.frames.len();
        let Some(ptr) = host_malloc_zeroed((count + 1) * 8) else {
            return self.raise_out_of_memory();
        };
        unsafe {
            let words = ptr as usize as *mut u64;
            words.write_unaligned(count as u64);
            for (i, frame) in self.frames.iter().enumerate() {
                let name = match frame.unit {
                    FrameUnit::Def(d) => self.ctx.def(d).name,
                    FrameUnit::Block(_) => {
                        match self.frames[frame.home].unit {
                            FrameUnit::Def(d) => self.ctx.def(d).name,
                            FrameUnit::Block(_) => u32::MAX,
                        }
                    }
                };
                words.add(1 + i).write_unaligned(name as u64);
            }
        }
        self.stack.push_u64(ptr);
        Ok(())
    }

    // ── unions ─────────────────────────────────────────────────────

    /// Widen the top `from` bytes into a union with the given header.
    fn union_put(
        &mut self,
        tid: u32,
        from: usize,
        union_size: usize,
    ) -> Result<(), VmError> {
        debug_assert!(union_size >= UNION_HEADER_SIZE + from);
        let payload_footprint = aligned_size(from);
        let base = self.stack.sp() - payload_footprint;
        if !self.stack.grow_zeroed(union_size - payload_footprint) {
            return Err(VmError::StackOverflow);
        }
        self.stack.copy_within(base, base + UNION_HEADER_SIZE, from);
        self.stack
            .zero(base + UNION_HEADER_SIZE + from..base + union_size);
        self.stack.write_u64_at(base, tid as u64);
        Ok(())
    }

    /// Truthiness of the union on the stack top (not popped): nil, false
    /// and null pointers are falsey.
    fn union_truthiness(&self, union_size: usize) -> Result<bool, VmError> {
        let base = self.stack.sp() - union_size;
        let tid = self.stack.read_u64_at(base) as u32;
        if tid == 0 {
            return Ok(false);
        }
        let desc = self
            .ctx
            .types
            .try_get(TypeId(tid))
            .ok_or(VmError::UnknownTypeId { id: tid })?;
        Ok(match desc.kind {
            TypeKind::Primitive(Primitive::Bool) => {
                self.stack.bytes(
                    base + UNION_HEADER_SIZE..base + UNION_HEADER_SIZE + 1,
                )[0] != 0
            }
            TypeKind::Pointer { .. } => {
                self.stack.read_u64_at(base + UNION_HEADER_SIZE) != 0
            }
            _ => true,
        })
    }

    // ── arithmetic helpers ─────────────────────────────────────────

    fn checked_i32(
        &mut self,
        f: fn(i32, i32) -> Option<i32>,
    ) -> Result<(), VmError> {
        let b = self.stack.pop_i32();
        let a = self.stack.pop_i32();
        match f(a, b) {
            Some(v) => {
                self.stack.push_i32(v);
                Ok(())
            }
            None => self.raise_overflow(),
        }
    }

    fn checked_u32(
        &mut self,
        f: fn(u32, u32) -> Option<u32>,
    ) -> Result<(), VmError> {
        let b = self.stack.pop_u32();
        let a = self.stack.pop_u32();
        match f(a, b) {
            Some(v) => {
                self.stack.push_u32(v);
                Ok(())
            }
            None => self.raise_overflow(),
        }
    }

    fn checked_i64(
        &mut self,
        f: fn(i64, i64) -> Option<i64>,
    ) -> Result<(), VmError> {
        let b = self.stack.pop_i64();
        let a = self.stack.pop_i64();
        match f(a, b) {
            Some(v) => {
                self.stack.push_i64(v);
                Ok(())
            }
            None => self.raise_overflow(),
        }
    }

    fn checked_u64(
        &mut self,
        f: fn(u64, u64) -> Option<u64>,
    ) -> Result<(), VmError> {
        let b = self.stack.pop_u64();
        let a = self.stack.pop_u64();
        match f(a, b) {
            Some(v) => {
                self.stack.push_u64(v);
                Ok(())
            }
            None => self.raise_overflow(),
        }
    }

    fn raw_i32(&mut self, f: fn(i32, i32) -> i32) {
        let b = self.stack.pop_i32();
        let a = self.stack.pop_i32();
        self.stack.push_i32(f(a, b));
    }

    fn raw_u32(&mut self, f: fn(u32, u32) -> u32) {
        let b = self.stack.pop_u32();
        let a = self.stack.pop_u32();
        self.stack.push_u32(f(a, b));
    }

    fn raw_i64(&mut self, f: fn(i64, i64) -> i64) {
        let b = self.stack.pop_i64();
        let a = self.stack.pop_i64();
        self.stack.push_i64(f(a, b));
    }

    fn raw_u64(&mut self, f: fn(u64, u64) -> u64) {
        let b = self.stack.pop_u64();
        let a = self.stack.pop_u64();
        self.stack.push_u64(f(a, b));
    }

    fn float32(&mut self, f: fn(f32, f32) -> f32) {
        let b = self.stack.pop_f32();
        let a = self.stack.pop_f32();
        self.stack.push_f32(f(a, b));
    }

    fn float64(&mut self, f: fn(f64, f64) -> f64) {
        let b = self.stack.pop_f64();
        let a = self.stack.pop_f64();
        self.stack.push_f64(f(a, b));
    }

    fn unary_f32(&mut self, f: fn(f32) -> f32) {
        let v = self.stack.pop_f32();
        self.stack.push_f32(f(v));
    }

    fn unary_f64(&mut self, f: fn(f64) -> f64) {
        let v = self.stack.pop_f64();
        self.stack.push_f64(f(v));
    }

    // ── FFI ────────────────────────────────────────────────────────

    fn lib_call(&mut self, id: u64) -> Result<(), VmError> {
        let (address, interface) = {
            let function =
                self.ctx.try_lib_function(id).ok_or(VmError::Internal {
                    message: "unknown lib function",
                })?;
            (function.address, function.interface)
        };
        let (kinds, ret, cif) = {
            let iface =
                self.ctx.try_interface(interface).ok_or(VmError::Internal {
                    message: "unknown call interface",
                })?;
            (iface.args.clone(), iface.ret, iface.cif_ptr())
        };
        tracing::trace!(target: "vm::ffi", id, args = kinds.len(), "lib call");

        // Pop right to left; the argument vector wants declaration order.
        let mut values: Vec<FfiValue> = kinds
            .iter()
            .rev()
            .map(|&kind| FfiValue::pop(&mut self.stack, kind))
            .collect();
        values.reverse();
        let mut arg_ptrs: Vec<*mut c_void> =
            values.iter().map(FfiValue::as_arg_ptr).collect();

        let mut ret_slot: u64 = 0;
        let code = CodePtr(address as *mut c_void);
        unsafe {
            raw::ffi_call(
                cif,
                Some(*code.as_safe_fun()),
                &mut ret_slot as *mut u64 as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }
        ffi::push_return(&mut self.stack, ret, ret_slot);
        Ok(())
    }

    /// Build (or reuse) a libffi closure for a proc. `Ok(None)` means a
    /// library error was raised and handled; the caller pushes nothing.
    fn register_cfun(
        &mut self,
        def: DefId,
        closure_data: u64,
        interface: u64,
    ) -> Result<Option<usize>, VmError> {
        if let Some(code) = self.ctx.find_cfun(def, closure_data, interface) {
            return Ok(Some(code));
        }
        let cif = self
            .ctx
            .try_interface(interface)
            .ok_or(VmError::Internal {
                message: "unknown call interface",
            })?
            .cif_ptr();

        let cell = Box::into_raw(Box::new(CFunCell {
            interp: self as *mut Interpreter as *mut c_void,
            def,
            closure_data,
            interface,
        }));
        let (closure, code) = low::closure_alloc();
        let prepped = unsafe {
            low::prep_closure(closure, cif, cfun_trampoline, cell, code)
        };
        if prepped.is_err() {
            unsafe {
                low::closure_free(closure);
                drop(Box::from_raw(cell));
            }
            self.raise_library_error("failed to prepare native closure")?;
            return Ok(None);
        }

        let address = code.as_mut_ptr() as usize;
        self.ctx.cfuns.lock().push(CFunEntry {
            code: address,
            def,
            closure_data,
            interface,
            closure,
            cell,
        });
        tracing::trace!(target: "vm::ffi", def = def.0, address, "proc_to_c_fun");
        Ok(Some(address))
    }

    // ── fibers ─────────────────────────────────────────────────────

    fn spawn_fiber(
        &mut self,
        def: DefId,
        closure_data: u64,
    ) -> Result<u64, VmError> {
        let (args_size, frame_size) = {
            let d = self.ctx.try_def(def).ok_or(VmError::Internal {
                message: "unknown def",
            })?;
            (d.args_size as usize, d.frame_size as usize)
        };
        let mut stack = OperandStack::new(self.stack_capacity);
        if closure_data != 0 {
            stack.push_u64(closure_data);
        }
        debug_assert!(stack.sp() >= args_size);
        let base = stack.sp() - args_size;
        if !stack.grow_zeroed(frame_size - args_size) {
            return Err(VmError::StackOverflow);
        }
        let frames = vec![Frame {
            unit: FrameUnit::Def(def),
            base,
            locals: base,
            home: 0,
            return_ip: 0,
            block: None,
        }];
        let id = self.next_fiber;
        self.next_fiber += 1;
        self.parked.push(ParkedFiber {
            id,
            stack,
            frames,
            ip: 0,
        });
        tracing::trace!(target: "vm", fiber = id, def = def.0, "spawn fiber");
        Ok(id)
    }

    fn swap_fiber(&mut self, from: u64, to: u64) -> Result<(), VmError> {
        if from != self.current_fiber {
            return Err(VmError::Internal {
                message: "swapcontext from a fiber that is not running",
            });
        }
        if to == self.current_fiber {
            return Ok(());
        }
        let index = self
            .parked
            .iter()
            .position(|p| p.id == to)
            .ok_or(VmError::UnknownFiber { handle: to })?;
        let target = self.parked.swap_remove(index);
        tracing::trace!(target: "vm", from, to, "swap fiber");
        self.install_fiber(target, true);
        Ok(())
    }

    /// A spawned fiber's entry frame returned: drop it and resume main.
    fn finish_fiber(&mut self) -> Result<(), VmError> {
        tracing::trace!(target: "vm", fiber = self.current_fiber, "fiber finished");
        let index = self
            .parked
            .iter()
            .position(|p| p.id == MAIN_FIBER)
            .ok_or(VmError::Internal {
                message: "main fiber is gone",
            })?;
        let target = self.parked.swap_remove(index);
        self.install_fiber(target, false);
        Ok(())
    }

    /// Swap the running execution state with `target`, optionally parking
    /// the outgoing fiber.
    fn install_fiber(&mut self, target: ParkedFiber, park_outgoing: bool) {
        let out_stack = core::mem::replace(&mut self.stack, target.stack);
        let out_frames = core::mem::replace(&mut self.frames, target.frames);
        let out_ip = self.ip;
        let out_id = self.current_fiber;
        self.ip = target.ip;
        self.current_fiber = target.id;
        if park_outgoing {
            self.parked.push(ParkedFiber {
                id: out_id,
                stack: out_stack,
                frames: out_frames,
                ip: out_ip,
            });
        }
        self.refresh_code();
    }

    // ── debug trap ─────────────────────────────────────────────────

    fn debug_trap(&mut self) {
        let mut hook = self.ctx.trap_hook.take();
        match hook.as_mut() {
            Some(inspect) => {
                let info = TrapInfo {
                    fiber: self.current_fiber,
                    ip: self.ip - 1,
                    frame_count: self.frames.len(),
                    stack_depth: self.stack.sp(),
                };
                inspect(&info);
            }
            None => {
                tracing::debug!(target: "vm", "debug_trap with no inspector");
            }
        }
        if self.ctx.trap_hook.is_none() {
            self.ctx.trap_hook = hook;
        }
    }
}

// ── free helpers ───────────────────────────────────────────────────

#[inline(always)]
fn ord_value(ord: core::cmp::Ordering) -> i32 {
    match ord {
        core::cmp::Ordering::Less => -1,
        core::cmp::Ordering::Equal => 0,
        core::cmp::Ordering::Greater => 1,
    }
}

/// TypeId stored in a heap cell's first four bytes; 0 for the null
/// reference.
#[inline(always)]
fn heap_type_id(ptr: u64) -> u32 {
    if ptr == 0 {
        0
    } else {
        unsafe { (ptr as usize as *const u32).read_unaligned() }
    }
}

fn host_malloc_zeroed(bytes: usize) -> Option<u64> {
    let ptr = unsafe { libc::malloc(bytes.max(1)) };
    if ptr.is_null() {
        return None;
    }
    unsafe {
        core::ptr::write_bytes(ptr as *mut u8, 0, bytes);
    }
    Some(ptr as u64)
}

fn cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

// ── atomics ────────────────────────────────────────────────────────
//
// The memory-ordering operands are accepted and executed sequentially
// consistent, a stricter ordering than any the compiler requests.

unsafe fn atomic_ref<T>(ptr: u64) -> Result<&'static T, VmError> {
    if ptr == 0 {
        return Err(VmError::NullPointerDeref { what: "atomic" });
    }
    debug_assert_eq!(ptr as usize % core::mem::size_of::<T>(), 0);
    Ok(&*(ptr as usize as *const T))
}

fn atomic_load(size: u8, ptr: u64) -> Result<u64, VmError> {
    unsafe {
        Ok(match size {
            1 => atomic_ref::<AtomicU8>(ptr)?.load(SeqCst) as u64,
            2 => atomic_ref::<AtomicU16>(ptr)?.load(SeqCst) as u64,
            4 => atomic_ref::<AtomicU32>(ptr)?.load(SeqCst) as u64,
            8 => atomic_ref::<AtomicU64>(ptr)?.load(SeqCst),
            _ => {
                return Err(VmError::Internal {
                    message: "invalid atomic width",
                })
            }
        })
    }
}

fn atomic_store(size: u8, ptr: u64, value: u64) -> Result<(), VmError> {
    unsafe {
        match size {
            1 => atomic_ref::<AtomicU8>(ptr)?.store(value as u8, SeqCst),
            2 => atomic_ref::<AtomicU16>(ptr)?.store(value as u16, SeqCst),
            4 => atomic_ref::<AtomicU32>(ptr)?.store(value as u32, SeqCst),
            8 => atomic_ref::<AtomicU64>(ptr)?.store(value, SeqCst),
            _ => {
                return Err(VmError::Internal {
                    message: "invalid atomic width",
                })
            }
        }
    }
    Ok(())
}

fn atomic_rmw(
    op: RmwOp,
    size: u8,
    ptr: u64,
    value: u64,
) -> Result<u64, VmError> {
    macro_rules! rmw {
        ($unsigned:ty, $int:ty, $signed:ty, $satomic:ty) => {{
            let a = atomic_ref::<$unsigned>(ptr)?;
            match op {
                RmwOp::Add => a.fetch_add(value as $int, SeqCst) as u64,
                RmwOp::Sub => a.fetch_sub(value as $int, SeqCst) as u64,
                RmwOp::And => a.fetch_and(value as $int, SeqCst) as u64,
                RmwOp::Or => a.fetch_or(value as $int, SeqCst) as u64,
                RmwOp::Xor => a.fetch_xor(value as $int, SeqCst) as u64,
                RmwOp::Xchg => a.swap(value as $int, SeqCst) as u64,
                RmwOp::UMax => a.fetch_max(value as $int, SeqCst) as u64,
                RmwOp::UMin => a.fetch_min(value as $int, SeqCst) as u64,
                RmwOp::Max => {
                    let s = atomic_ref::<$satomic>(ptr)?;
                    s.fetch_max(value as $int as $signed, SeqCst) as $int
                        as u64
                }
                RmwOp::Min => {
                    let s = atomic_ref::<$satomic>(ptr)?;
                    s.fetch_min(value as $int as $signed, SeqCst) as $int
                        as u64
                }
            }
        }};
    }
    unsafe {
        Ok(match size {
            1 => rmw!(AtomicU8, u8, i8, AtomicI8),
            2 => rmw!(AtomicU16, u16, i16, AtomicI16),
            4 => rmw!(AtomicU32, u32, i32, AtomicI32),
            8 => rmw!(AtomicU64, u64, i64, AtomicI64),
            _ => {
                return Err(VmError::Internal {
                    message: "invalid atomic width",
                })
            }
        })
    }
}

fn atomic_cmpxchg(
    size: u8,
    ptr: u64,
    expected: u64,
    new: u64,
) -> Result<(u64, bool), VmError> {
    macro_rules! cmpxchg {
        ($unsigned:ty, $int:ty) => {{
            let a = atomic_ref::<$unsigned>(ptr)?;
            match a.compare_exchange(
                expected as $int,
                new as $int,
                SeqCst,
                SeqCst,
            ) {
                Ok(old) => (old as u64, true),
                Err(old) => (old as u64, false),
            }
        }};
    }
    unsafe {
        Ok(match size {
            1 => cmpxchg!(AtomicU8, u8),
            2 => cmpxchg!(AtomicU16, u16),
            4 => cmpxchg!(AtomicU32, u32),
            8 => cmpxchg!(AtomicU64, u64),
            _ => {
                return Err(VmError::Internal {
                    message: "invalid atomic width",
                })
            }
        })
    }
}

// ── C-to-interpreter trampoline ────────────────────────────────────

/// Entry point libffi closures jump to. Reads the C arguments, pushes them
/// on the interpreter stack, runs the bound def to completion, and writes
/// the return value back into the libffi result slot.
///
/// An exception that escapes the def cannot cross the native boundary; it
/// aborts the process with a diagnostic.
unsafe extern "C" fn cfun_trampoline(
    _cif: &low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    userdata: &CFunCell,
) {
    let interp = &mut *(userdata.interp as *mut Interpreter);
    let (kinds, ret) = match interp.ctx.try_interface(userdata.interface) {
        Some(iface) => (iface.args.clone(), iface.ret),
        None => {
            tracing::error!(target: "vm::ffi", "closure with unknown interface");
            std::process::abort();
        }
    };

    for (i, kind) in kinds.iter().enumerate() {
        let p = *args.add(i) as *const u8;
        push_c_arg(&mut interp.stack, *kind, p);
    }
    if userdata.closure_data != 0 {
        interp.stack.push_u64(userdata.closure_data);
    }

    *result = 0;
    match interp.enter(userdata.def) {
        Ok(()) => {
            *result = pop_c_return(&mut interp.stack, ret);
        }
        Err(err) => {
            tracing::error!(
                target: "vm::ffi",
                error = %err,
                "error crossed a native callback boundary"
            );
            std::process::abort();
        }
    }
}

unsafe fn push_c_arg(stack: &mut OperandStack, kind: FfiKind, p: *const u8) {
    match kind {
        FfiKind::Void => {}
        FfiKind::I8 | FfiKind::U8 => stack.push_u8(*p),
        FfiKind::I16 | FfiKind::U16 => stack.push_u16(*(p as *const u16)),
        FfiKind::I32 | FfiKind::U32 => stack.push_u32(*(p as *const u32)),
        FfiKind::I64 | FfiKind::U64 | FfiKind::Pointer => {
            stack.push_u64(*(p as *const u64))
        }
        FfiKind::F32 => stack.push_f32(*(p as *const f32)),
        FfiKind::F64 => stack.push_f64(*(p as *const f64)),
    }
}

/// Pop the def's return value and widen it into the libffi return slot
/// (`ffi_arg` conventions: signed values sign-extend).
fn pop_c_return(stack: &mut OperandStack, kind: FfiKind) -> u64 {
    match kind {
        FfiKind::Void => 0,
        FfiKind::I8 => stack.pop_u8() as i8 as i64 as u64,
        FfiKind::U8 => stack.pop_u8() as u64,
        FfiKind::I16 => stack.pop_u16() as i16 as i64 as u64,
        FfiKind::U16 => stack.pop_u16() as u64,
        FfiKind::I32 => stack.pop_i32() as i64 as u64,
        FfiKind::U32 => stack.pop_u32() as u64,
        FfiKind::I64 | FfiKind::U64 | FfiKind::Pointer => stack.pop_u64(),
        FfiKind::F32 => stack.pop_f32().to_bits() as u64,
        FfiKind::F64 => stack.pop_f64().to_bits(),
    }
}
