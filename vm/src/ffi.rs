use std::ffi::{c_void, CString};

use bytecode::DefId;
use libffi::low;
use libffi::middle::Type;

use crate::stack::OperandStack;

/// Call-interface flags, stored alongside the libffi cif.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct InterfaceFlags(pub u8);

impl InterfaceFlags {
    pub const NONE: Self = Self(0);
    pub const VARIADIC: Self = Self(1 << 0);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// Scalar C types the bridge marshals. Aggregate FFI values are passed by
/// pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiKind {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
}

impl FfiKind {
    pub const fn size(self) -> usize {
        match self {
            FfiKind::Void => 0,
            FfiKind::I8 | FfiKind::U8 => 1,
            FfiKind::I16 | FfiKind::U16 => 2,
            FfiKind::I32 | FfiKind::U32 | FfiKind::F32 => 4,
            FfiKind::I64 | FfiKind::U64 | FfiKind::F64 | FfiKind::Pointer => 8,
        }
    }

    fn ffi_type(self) -> Type {
        match self {
            FfiKind::Void => Type::void(),
            FfiKind::I8 => Type::i8(),
            FfiKind::U8 => Type::u8(),
            FfiKind::I16 => Type::i16(),
            FfiKind::U16 => Type::u16(),
            FfiKind::I32 => Type::i32(),
            FfiKind::U32 => Type::u32(),
            FfiKind::I64 => Type::i64(),
            FfiKind::U64 => Type::u64(),
            FfiKind::F32 => Type::f32(),
            FfiKind::F64 => Type::f64(),
            FfiKind::Pointer => Type::pointer(),
        }
    }
}

/// A prepared libffi call interface: argument kinds, return kind and the
/// ready-to-call cif.
///
/// The middle-layer [`Type`]s own the `ffi_type` allocations the cif points
/// into, so they are kept alive here alongside the raw pointer array.
pub struct CallInterface {
    pub args: Vec<FfiKind>,
    pub ret: FfiKind,
    pub flags: InterfaceFlags,
    /// For variadic interfaces, how many leading arguments are fixed.
    pub fixed_args: u16,
    _arg_types: Vec<Type>,
    _ret_type: Type,
    _raw_arg_types: Box<[*mut low::ffi_type]>,
    cif: Box<low::ffi_cif>,
}

// SAFETY: the raw pointers reference heap allocations owned by this value;
// the cif is immutable after prep.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    /// Prepare a cif for the given signature. A non-OK libffi status is
    /// returned to the caller (the context surfaces it as a registration
    /// error; a runtime status failure raises a library error instead).
    pub fn new(
        args: Vec<FfiKind>,
        ret: FfiKind,
        flags: InterfaceFlags,
        fixed_args: u16,
    ) -> Result<Self, low::Error> {
        let arg_types: Vec<Type> =
            args.iter().map(|kind| kind.ffi_type()).collect();
        let ret_type = ret.ffi_type();
        let mut raw_arg_types: Box<[*mut low::ffi_type]> = arg_types
            .iter()
            .map(|t| t.as_raw_ptr())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut cif: Box<low::ffi_cif> = Box::default();

        unsafe {
            if flags.contains(InterfaceFlags::VARIADIC) {
                low::prep_cif_var(
                    cif.as_mut(),
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    fixed_args as usize,
                    args.len(),
                    ret_type.as_raw_ptr(),
                    raw_arg_types.as_mut_ptr(),
                )?;
            } else {
                low::prep_cif(
                    cif.as_mut(),
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    args.len(),
                    ret_type.as_raw_ptr(),
                    raw_arg_types.as_mut_ptr(),
                )?;
            }
        }

        Ok(Self {
            args,
            ret,
            flags,
            fixed_args,
            _arg_types: arg_types,
            _ret_type: ret_type,
            _raw_arg_types: raw_arg_types,
            cif,
        })
    }

    #[inline]
    pub(crate) fn cif_ptr(&self) -> *mut low::ffi_cif {
        self.cif.as_ref() as *const low::ffi_cif as *mut low::ffi_cif
    }
}

/// A resolved native function: symbol name (diagnostics), address, and the
/// index of its [`CallInterface`].
pub struct LibFunction {
    pub name: CString,
    pub address: usize,
    pub interface: u64,
}

/// Owned storage for one marshaled argument; libffi receives a pointer to
/// the inner value.
pub(crate) enum FfiValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(usize),
}

impl FfiValue {
    /// Pop one argument of the given kind off the operand stack.
    pub fn pop(stack: &mut OperandStack, kind: FfiKind) -> FfiValue {
        match kind {
            FfiKind::Void => unreachable!("void is not a parameter type"),
            FfiKind::I8 => FfiValue::I8(stack.pop_u8() as i8),
            FfiKind::U8 => FfiValue::U8(stack.pop_u8()),
            FfiKind::I16 => FfiValue::I16(stack.pop_u16() as i16),
            FfiKind::U16 => FfiValue::U16(stack.pop_u16()),
            FfiKind::I32 => FfiValue::I32(stack.pop_i32()),
            FfiKind::U32 => FfiValue::U32(stack.pop_u32()),
            FfiKind::I64 => FfiValue::I64(stack.pop_i64()),
            FfiKind::U64 => FfiValue::U64(stack.pop_u64()),
            FfiKind::F32 => FfiValue::F32(stack.pop_f32()),
            FfiKind::F64 => FfiValue::F64(stack.pop_f64()),
            FfiKind::Pointer => FfiValue::Pointer(stack.pop_u64() as usize),
        }
    }

    /// Pointer to the stored value, for the libffi argument vector.
    pub fn as_arg_ptr(&self) -> *mut c_void {
        match self {
            FfiValue::I8(v) => v as *const i8 as *mut c_void,
            FfiValue::U8(v) => v as *const u8 as *mut c_void,
            FfiValue::I16(v) => v as *const i16 as *mut c_void,
            FfiValue::U16(v) => v as *const u16 as *mut c_void,
            FfiValue::I32(v) => v as *const i32 as *mut c_void,
            FfiValue::U32(v) => v as *const u32 as *mut c_void,
            FfiValue::I64(v) => v as *const i64 as *mut c_void,
            FfiValue::U64(v) => v as *const u64 as *mut c_void,
            FfiValue::F32(v) => v as *const f32 as *mut c_void,
            FfiValue::F64(v) => v as *const f64 as *mut c_void,
            FfiValue::Pointer(v) => v as *const usize as *mut c_void,
        }
    }
}

/// Push a lib-call return value. libffi widens integral returns to
/// `ffi_arg`, so the meaningful bytes sit at the start of the 8-byte
/// return slot on little-endian hosts.
pub(crate) fn push_return(stack: &mut OperandStack, kind: FfiKind, ret: u64) {
    match kind {
        FfiKind::Void => {}
        FfiKind::I8 | FfiKind::U8 => stack.push_u8(ret as u8),
        FfiKind::I16 | FfiKind::U16 => stack.push_u16(ret as u16),
        FfiKind::I32 | FfiKind::U32 => stack.push_u32(ret as u32),
        FfiKind::I64 | FfiKind::U64 | FfiKind::Pointer => stack.push_u64(ret),
        FfiKind::F32 => stack.push_f32(f32::from_bits(ret as u32)),
        FfiKind::F64 => stack.push_f64(f64::from_bits(ret)),
    }
}

/// Userdata bound to a libffi closure: enough to re-enter the interpreter
/// when C calls the trampoline.
///
/// `interp` is the interpreter's address at registration time, stored
/// type-erased to keep this module independent of the executor.
pub(crate) struct CFunCell {
    pub interp: *mut c_void,
    pub def: DefId,
    pub closure_data: u64,
    pub interface: u64,
}

/// One registered `proc_to_c_fun` closure, owned by the context for the
/// life of the VM.
pub(crate) struct CFunEntry {
    pub code: usize,
    pub def: DefId,
    pub closure_data: u64,
    pub interface: u64,
    pub closure: *mut low::ffi_closure,
    pub cell: *mut CFunCell,
}

// SAFETY: the closure and cell allocations are owned by the entry and only
// freed on context drop.
unsafe impl Send for CFunEntry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_prep_succeeds_for_scalars() {
        let iface = CallInterface::new(
            vec![FfiKind::I32, FfiKind::I32],
            FfiKind::I32,
            InterfaceFlags::NONE,
            0,
        )
        .unwrap();
        assert_eq!(iface.args.len(), 2);
        assert!(!iface.cif_ptr().is_null());
    }

    #[test]
    fn marshaled_args_round_trip_through_storage() {
        let mut stack = OperandStack::new(256);
        stack.push_i32(-7);
        stack.push_f64(1.5);
        let f = FfiValue::pop(&mut stack, FfiKind::F64);
        let i = FfiValue::pop(&mut stack, FfiKind::I32);
        unsafe {
            assert_eq!(*(f.as_arg_ptr() as *const f64), 1.5);
            assert_eq!(*(i.as_arg_ptr() as *const i32), -7);
        }
    }

    #[test]
    fn return_push_widths() {
        let mut stack = OperandStack::new(256);
        push_return(&mut stack, FfiKind::I8, 0xFF);
        assert_eq!(stack.pop_u8() as i8, -1);
        push_return(&mut stack, FfiKind::F32, 1.25f32.to_bits() as u64);
        assert_eq!(stack.pop_f32(), 1.25);
        push_return(&mut stack, FfiKind::Void, 0);
        assert_eq!(stack.sp(), 0);
    }

    #[test]
    fn interface_flags() {
        assert!(InterfaceFlags::VARIADIC.contains(InterfaceFlags::VARIADIC));
        assert!(!InterfaceFlags::NONE.contains(InterfaceFlags::VARIADIC));
    }
}
