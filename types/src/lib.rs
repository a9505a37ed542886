mod layout;
mod table;

pub use layout::{
    align_up, aligned_size, union_size_for, UNION_HEADER_SIZE, WORD_SIZE,
};
pub use table::{
    Element, Primitive, TypeDescriptor, TypeId, TypeKind, TypeTable,
};
