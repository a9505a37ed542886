use core::fmt;

use types::TypeId;

/// Arena index of a [`CompiledDef`] in the context's def registry.
///
/// Defs are identified by index rather than by address; the index doubles
/// as the def's identity for hashing and for the 64-bit `call` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DefId(pub u32);

/// Arena index of a [`CompiledBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BlockId(pub u32);

impl fmt::Display for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// One interval of the handler table attached to a bytecode buffer.
///
/// An exception raised while `start <= ip < end` whose dynamic type is a
/// subtype of any entry in `types` (empty means catch-all) transfers
/// control to `target` after the operand stack is cut back to
/// `frame base + stack_depth`. The exception reference is then pushed for
/// the handler body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub types: Vec<TypeId>,
    pub stack_depth: u32,
}

impl ExceptionHandler {
    pub fn covers(&self, ip: u32) -> bool {
        self.start <= ip && ip < self.end
    }
}

/// A type-specialized, bytecode-encoded method body plus its metadata.
///
/// Created by the external compiler and registered in the context before
/// execution. `args_size` is the total aligned byte size of the pushed
/// arguments; they land in the lowest local slots of a frame of
/// `frame_size` bytes (the remainder is zeroed on entry).
#[derive(Debug, Clone)]
pub struct CompiledDef {
    /// Symbol index of the method name, for diagnostics.
    pub name: u32,
    /// Owner type, for diagnostics and method resolution traces.
    pub owner: TypeId,
    pub args_size: u32,
    pub frame_size: u32,
    pub return_size: u32,
    /// The block attached at this call shape, bound by `call_with_block`.
    pub block: Option<BlockId>,
    pub code: Vec<u8>,
    pub handlers: Vec<ExceptionHandler>,
}

/// Bytecode for a block body.
///
/// Blocks are inlined at their yield site: a block frame shares the locals
/// of its lexical home frame. The captured-variable descriptor is the pair
/// (`args_offset`, `args_size`): on entry the pushed block arguments are
/// copied into the home frame's locals at `args_offset`.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub args_size: u32,
    pub args_offset: u32,
    pub code: Vec<u8>,
    pub handlers: Vec<ExceptionHandler>,
}
