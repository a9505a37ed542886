use std::collections::HashMap;
use std::ffi::{CStr, CString};

use bytecode::{BlockId, CompiledBlock, CompiledDef, DefId};
use libffi::low;
use parking_lot::Mutex;
use types::{TypeId, TypeTable};

use crate::ffi::{CallInterface, CFunEntry, FfiKind, InterfaceFlags, LibFunction};

/// Type ids of the exceptions the VM raises on its own: checked-arithmetic
/// overflow, FFI failures, and allocation failure. An unregistered id
/// (`TypeId::NIL`) turns the corresponding condition into a fatal error.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownErrors {
    pub overflow: TypeId,
    pub library: TypeId,
    pub out_of_memory: TypeId,
}

impl Default for WellKnownErrors {
    fn default() -> Self {
        Self {
            overflow: TypeId::NIL,
            library: TypeId::NIL,
            out_of_memory: TypeId::NIL,
        }
    }
}

/// Snapshot handed to the debug-trap inspector.
#[derive(Debug, Clone, Copy)]
pub struct TrapInfo {
    pub fiber: u64,
    pub ip: usize,
    pub frame_count: usize,
    pub stack_depth: usize,
}

/// The externally supplied inspector invoked by `debug_trap`: the VM
/// suspends, calls the hook, and resumes when it returns.
pub type TrapHook = Box<dyn FnMut(&TrapInfo)>;

/// Lazily initialized backing storage for one constant or class variable.
struct PoolSlot {
    initialized: bool,
    data: Box<[u8]>,
}

/// Context services: symbol table, type table, def/block registries,
/// lib-function and call-interface tables, constant and class-variable
/// pools, and process arguments.
///
/// All registries are append-only and must be populated before execution
/// starts; the executor holds raw pointers into the def bytecode buffers.
/// The FFI-closure registry is the one exception: it grows at runtime under
/// a mutex, because native callbacks may consult it concurrently with the
/// dispatch loop.
pub struct Context {
    pub types: TypeTable,
    pub errors: WellKnownErrors,
    pub trap_hook: Option<TrapHook>,
    symbols: Vec<CString>,
    symbol_ids: HashMap<String, u32>,
    defs: Vec<CompiledDef>,
    blocks: Vec<CompiledBlock>,
    lib_functions: Vec<LibFunction>,
    interfaces: Vec<CallInterface>,
    constants: Vec<PoolSlot>,
    class_vars: Vec<PoolSlot>,
    argv_storage: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    pub(crate) cfuns: Mutex<Vec<CFunEntry>>,
}

impl Context {
    pub fn new() -> Self {
        let mut ctx = Self {
            types: TypeTable::new(),
            errors: WellKnownErrors::default(),
            trap_hook: None,
            symbols: Vec::new(),
            symbol_ids: HashMap::new(),
            defs: Vec::new(),
            blocks: Vec::new(),
            lib_functions: Vec::new(),
            interfaces: Vec::new(),
            constants: Vec::new(),
            class_vars: Vec::new(),
            argv_storage: Vec::new(),
            argv_ptrs: Vec::new(),
            cfuns: Mutex::new(Vec::new()),
        };
        ctx.set_argv(std::env::args().collect());
        ctx
    }

    // ── symbols ────────────────────────────────────────────────────

    /// Intern a string, returning its stable symbol index.
    pub fn intern_symbol(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.symbol_ids.get(name) {
            return id;
        }
        let id = self.symbols.len() as u32;
        self.symbols
            .push(CString::new(name).expect("symbol contains NUL"));
        self.symbol_ids.insert(name.to_string(), id);
        tracing::debug!(target: "vm::context", id, name, "intern symbol");
        id
    }

    pub fn symbol(&self, id: u32) -> Option<&CStr> {
        self.symbols.get(id as usize).map(|s| s.as_c_str())
    }

    pub fn symbol_str(&self, id: u32) -> Option<&str> {
        self.symbol(id).and_then(|s| s.to_str().ok())
    }

    // ── defs and blocks ────────────────────────────────────────────

    pub fn add_def(&mut self, def: CompiledDef) -> DefId {
        let id = DefId(self.defs.len() as u32);
        self.defs.push(def);
        id
    }

    pub fn add_block(&mut self, block: CompiledBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    #[inline]
    pub fn def(&self, id: DefId) -> &CompiledDef {
        &self.defs[id.0 as usize]
    }

    #[inline]
    pub fn try_def(&self, id: DefId) -> Option<&CompiledDef> {
        self.defs.get(id.0 as usize)
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &CompiledBlock {
        &self.blocks[id.0 as usize]
    }

    #[inline]
    pub fn try_block(&self, id: BlockId) -> Option<&CompiledBlock> {
        self.blocks.get(id.0 as usize)
    }

    // ── lib functions and call interfaces ──────────────────────────

    /// Prepare and register a call interface; a non-OK libffi status is
    /// surfaced to the caller.
    pub fn add_interface(
        &mut self,
        args: Vec<FfiKind>,
        ret: FfiKind,
        flags: InterfaceFlags,
        fixed_args: u16,
    ) -> Result<u64, low::Error> {
        let iface = CallInterface::new(args, ret, flags, fixed_args)?;
        self.interfaces.push(iface);
        Ok(self.interfaces.len() as u64 - 1)
    }

    pub fn add_lib_function(
        &mut self,
        name: &str,
        address: usize,
        interface: u64,
    ) -> u64 {
        self.lib_functions.push(LibFunction {
            name: CString::new(name).expect("symbol contains NUL"),
            address,
            interface,
        });
        self.lib_functions.len() as u64 - 1
    }

    #[inline]
    pub(crate) fn try_interface(&self, id: u64) -> Option<&CallInterface> {
        self.interfaces.get(id as usize)
    }

    #[inline]
    pub(crate) fn try_lib_function(&self, id: u64) -> Option<&LibFunction> {
        self.lib_functions.get(id as usize)
    }

    // ── constant and class-variable pools ──────────────────────────

    pub fn add_constant(&mut self, size: u32) -> u32 {
        self.constants.push(PoolSlot {
            initialized: false,
            data: vec![0u8; size as usize].into_boxed_slice(),
        });
        self.constants.len() as u32 - 1
    }

    pub fn add_class_var(&mut self, size: u32) -> u32 {
        self.class_vars.push(PoolSlot {
            initialized: false,
            data: vec![0u8; size as usize].into_boxed_slice(),
        });
        self.class_vars.len() as u32 - 1
    }

    pub(crate) fn const_initialized(&self, idx: u32) -> Option<bool> {
        self.constants.get(idx as usize).map(|s| s.initialized)
    }

    pub(crate) fn const_slice(&self, idx: u32, size: u32) -> Option<&[u8]> {
        self.constants
            .get(idx as usize)
            .map(|s| &s.data[..size as usize])
    }

    pub(crate) fn write_const(&mut self, idx: u32, bytes: &[u8]) -> Option<()> {
        let slot = self.constants.get_mut(idx as usize)?;
        slot.data[..bytes.len()].copy_from_slice(bytes);
        slot.initialized = true;
        Some(())
    }

    pub(crate) fn class_var_initialized(&self, idx: u32) -> Option<bool> {
        self.class_vars.get(idx as usize).map(|s| s.initialized)
    }

    pub(crate) fn class_var_slice(&self, idx: u32, size: u32) -> Option<&[u8]> {
        self.class_vars
            .get(idx as usize)
            .map(|s| &s.data[..size as usize])
    }

    pub(crate) fn write_class_var(
        &mut self,
        idx: u32,
        bytes: &[u8],
    ) -> Option<()> {
        let slot = self.class_vars.get_mut(idx as usize)?;
        slot.data[..bytes.len()].copy_from_slice(bytes);
        slot.initialized = true;
        Some(())
    }

    // ── process arguments ──────────────────────────────────────────

    /// Install the argv the interpreted program observes. The pointer
    /// vector is NULL-terminated like a C `argv`.
    pub fn set_argv(&mut self, args: Vec<String>) {
        self.argv_storage = args
            .into_iter()
            .map(|a| CString::new(a).unwrap_or_default())
            .collect();
        self.argv_ptrs = self
            .argv_storage
            .iter()
            .map(|s| s.as_ptr())
            .chain(core::iter::once(core::ptr::null()))
            .collect();
    }

    pub fn argc(&self) -> i32 {
        self.argv_storage.len() as i32
    }

    pub fn argv_ptr(&self) -> *const *const libc::c_char {
        self.argv_ptrs.as_ptr()
    }

    // ── FFI closure registry ───────────────────────────────────────

    pub(crate) fn find_cfun(
        &self,
        def: DefId,
        closure_data: u64,
        interface: u64,
    ) -> Option<usize> {
        self.cfuns
            .lock()
            .iter()
            .find(|e| {
                e.def == def
                    && e.closure_data == closure_data
                    && e.interface == interface
            })
            .map(|e| e.code)
    }

    pub(crate) fn cfun_by_code(&self, code: usize) -> Option<(DefId, u64)> {
        self.cfuns
            .lock()
            .iter()
            .find(|e| e.code == code)
            .map(|e| (e.def, e.closure_data))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Registered closures live as long as the VM; free them with it.
        for entry in self.cfuns.get_mut().drain(..) {
            unsafe {
                low::closure_free(entry.closure);
                drop(Box::from_raw(entry.cell));
            }
        }
    }
}
