use core::fmt;

use crate::layout::{aligned_size, UNION_HEADER_SIZE};

/// Dense integer id of a monomorphized type.
///
/// The semantic analyzer assigns ids starting at 1; id 0 is reserved for the
/// null reference (and for the nil payload of a union).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeId(pub u32);

impl TypeId {
    /// The null reference / nil union header.
    pub const NIL: TypeId = TypeId(0);

    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Primitive value kinds. Bool is stored as a single byte; Symbol is a
/// compact i32 index into the context's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
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
    Symbol,
}

impl Primitive {
    pub const fn size(self) -> u32 {
        match self {
            Primitive::Bool | Primitive::I8 | Primitive::U8 => 1,
            Primitive::I16 | Primitive::U16 => 2,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 4,
            Primitive::I64 | Primitive::U64 | Primitive::F64 => 8,
            Primitive::Symbol => 4,
        }
    }
}

/// A field of an aggregate type, at its analyzer-assigned offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub offset: u32,
    pub size: u32,
}

/// The shape of a type, as a tagged sum matched exhaustively by the
/// executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Primitive(Primitive),
    /// Heap-allocated class instance; a value is a single pointer. The heap
    /// cell starts with the object's `TypeId` in its first four bytes.
    Reference { parent: Option<TypeId> },
    /// Inline aggregate, passed by value on the stack.
    Struct { fields: Vec<Element> },
    Tuple { elements: Vec<Element> },
    NamedTuple { names: Vec<u32>, elements: Vec<Element> },
    /// Tagged union: an 8-byte `TypeId` header followed by the payload of
    /// the active member.
    Union { members: Vec<TypeId> },
    /// Raw pointer to `elem_size`-byte elements.
    Pointer { elem_size: u32 },
    /// A (def, closure-data) pair, two words on the stack.
    Proc,
}

/// A resolved type descriptor: everything the executor needs to move values
/// of this type around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    pub size: u32,
    pub align: u32,
}

impl TypeDescriptor {
    pub fn primitive(name: impl Into<String>, prim: Primitive) -> Self {
        let size = prim.size();
        Self {
            name: name.into(),
            kind: TypeKind::Primitive(prim),
            size,
            align: size,
        }
    }

    pub fn reference(
        name: impl Into<String>,
        parent: Option<TypeId>,
        instance_size: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Reference { parent },
            size: instance_size,
            align: 8,
        }
    }

    pub fn pointer(name: impl Into<String>, elem_size: u32) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Pointer { elem_size },
            size: 8,
            align: 8,
        }
    }

    pub fn proc_type(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Proc,
            size: 16,
            align: 8,
        }
    }

    pub fn tuple(name: impl Into<String>, elements: Vec<Element>, size: u32) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Tuple { elements },
            size,
            align: 8,
        }
    }
}

/// The id → descriptor mapping built by the semantic analyzer.
///
/// Read-only during execution; the executor resolves every union header and
/// `is_a?` filter through it.
#[derive(Debug, Default)]
pub struct TypeTable {
    entries: Vec<TypeDescriptor>,
}

impl TypeTable {
    pub fn new() -> Self {
        // Slot 0 is the null reference; it never names a real type.
        let nil = TypeDescriptor {
            name: "<nil>".into(),
            kind: TypeKind::Reference { parent: None },
            size: 0,
            align: 8,
        };
        Self { entries: vec![nil] }
    }

    /// Register a descriptor, returning its dense id.
    pub fn register(&mut self, desc: TypeDescriptor) -> TypeId {
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(desc);
        id
    }

    /// Register a union over `members`, computing its stack footprint from
    /// the largest member payload (references and pointers pay one word).
    pub fn register_union(
        &mut self,
        name: impl Into<String>,
        members: Vec<TypeId>,
    ) -> TypeId {
        let max_payload = members
            .iter()
            .map(|&m| self.payload_size(m))
            .max()
            .unwrap_or(0);
        let size = UNION_HEADER_SIZE + aligned_size(max_payload as usize);
        self.register(TypeDescriptor {
            name: name.into(),
            kind: TypeKind::Union { members },
            size: size as u32,
            align: 8,
        })
    }

    /// Bytes a value of `id` contributes to a union payload.
    pub fn payload_size(&self, id: TypeId) -> u32 {
        let desc = self.get(id);
        match desc.kind {
            TypeKind::Reference { .. } | TypeKind::Pointer { .. } => 8,
            _ => desc.size,
        }
    }

    #[inline]
    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        &self.entries[id.0 as usize]
    }

    #[inline]
    pub fn try_get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.entries.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Whether `sub` is a subtype of `sup`.
    ///
    /// The nil id is a subtype of nothing (a null reference never passes an
    /// `is_a?` filter). Union supertypes accept any of their members;
    /// reference types accept their descendants.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub.is_nil() {
            return false;
        }
        if sub == sup {
            return true;
        }
        match &self.get(sup).kind {
            TypeKind::Union { members } => {
                members.iter().any(|&m| self.is_subtype(sub, m))
            }
            TypeKind::Reference { .. } => {
                let mut cur = sub;
                loop {
                    match self.get(cur).kind {
                        TypeKind::Reference { parent: Some(p) } => {
                            if p == sup {
                                return true;
                            }
                            cur = p;
                        }
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (TypeTable, TypeId, TypeId, TypeId, TypeId) {
        let mut t = TypeTable::new();
        let int32 = t.register(TypeDescriptor::primitive("Int32", Primitive::I32));
        let obj = t.register(TypeDescriptor::reference("Object", None, 4));
        let string = t.register(TypeDescriptor::reference("String", Some(obj), 16));
        let uni = t.register_union("Int32 | String", vec![int32, string]);
        (t, int32, obj, string, uni)
    }

    #[test]
    fn ids_are_dense_from_one() {
        let (t, int32, obj, string, uni) = table();
        assert_eq!(int32, TypeId(1));
        assert_eq!(obj, TypeId(2));
        assert_eq!(string, TypeId(3));
        assert_eq!(uni, TypeId(4));
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn union_size_counts_header() {
        let (t, _, _, _, uni) = table();
        // Largest payload is the String pointer: 8 + 8.
        assert_eq!(t.get(uni).size, 16);
    }

    #[test]
    fn subtype_of_self_and_union() {
        let (t, int32, _, string, uni) = table();
        assert!(t.is_subtype(int32, int32));
        assert!(t.is_subtype(int32, uni));
        assert!(t.is_subtype(string, uni));
        assert!(!t.is_subtype(uni, int32));
    }

    #[test]
    fn subtype_walks_parent_chain() {
        let (t, int32, obj, string, _) = table();
        assert!(t.is_subtype(string, obj));
        assert!(!t.is_subtype(obj, string));
        assert!(!t.is_subtype(int32, obj));
    }

    #[test]
    fn nil_is_subtype_of_nothing() {
        let (t, int32, obj, _, uni) = table();
        assert!(!t.is_subtype(TypeId::NIL, int32));
        assert!(!t.is_subtype(TypeId::NIL, obj));
        assert!(!t.is_subtype(TypeId::NIL, uni));
    }
}
