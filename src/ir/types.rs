//! Data types of values and locals.

use std::fmt;
use std::sync::Arc;

// ─── Address spaces ───────────────────────────────────────────────

/// Memory address space of a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Per-work-item memory (stack allocations).
    Private,
    /// External memory visible to every work-item.
    Global,
    /// External memory, read-only for the kernel.
    Constant,
    /// Memory shared by all work-items of a work-group.
    Local,
    Generic,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressSpace::Private => "private",
            AddressSpace::Global => "global",
            AddressSpace::Constant => "constant",
            AddressSpace::Local => "local",
            AddressSpace::Generic => "generic",
        };
        write!(f, "{}", s)
    }
}

// ─── Types ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Int,
    Float,
    Bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PointerType {
    pub element: DataType,
    pub space: AddressSpace,
    pub alignment: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub element: DataType,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructType {
    pub name: String,
    pub elements: Vec<DataType>,
    pub packed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageType {
    pub dimensions: u8,
    pub is_array: bool,
    pub is_buffer: bool,
    pub is_sampled: bool,
}

/// Type of a value. Scalars carry a vector width of 1..=16 lanes;
/// composite types are shared behind `Arc` so cloning a `Value` stays cheap.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Void,
    Label,
    Scalar {
        kind: ScalarKind,
        bits: u8,
        width: u8,
    },
    Pointer(Arc<PointerType>),
    Array(Arc<ArrayType>),
    Struct(Arc<StructType>),
    Image(ImageType),
}

pub const TYPE_INT8: DataType = DataType::Scalar {
    kind: ScalarKind::Int,
    bits: 8,
    width: 1,
};
pub const TYPE_INT16: DataType = DataType::Scalar {
    kind: ScalarKind::Int,
    bits: 16,
    width: 1,
};
pub const TYPE_INT32: DataType = DataType::Scalar {
    kind: ScalarKind::Int,
    bits: 32,
    width: 1,
};
pub const TYPE_INT64: DataType = DataType::Scalar {
    kind: ScalarKind::Int,
    bits: 64,
    width: 1,
};
pub const TYPE_FLOAT: DataType = DataType::Scalar {
    kind: ScalarKind::Float,
    bits: 32,
    width: 1,
};
pub const TYPE_BOOL: DataType = DataType::Scalar {
    kind: ScalarKind::Bool,
    bits: 1,
    width: 1,
};
pub const TYPE_LABEL: DataType = DataType::Label;
pub const TYPE_VOID: DataType = DataType::Void;

/// Number of SIMD lanes of a native vector register.
pub const NATIVE_VECTOR_SIZE: u8 = 16;

impl DataType {
    pub fn pointer_to(element: DataType, space: AddressSpace, alignment: u32) -> Self {
        DataType::Pointer(Arc::new(PointerType {
            element,
            space,
            alignment,
        }))
    }

    pub fn array_of(element: DataType, size: u32) -> Self {
        DataType::Array(Arc::new(ArrayType { element, size }))
    }

    /// The same scalar type with `width` lanes. Non-scalar types are
    /// returned unchanged.
    pub fn to_vector(&self, width: u8) -> Self {
        match self {
            DataType::Scalar { kind, bits, .. } => DataType::Scalar {
                kind: *kind,
                bits: *bits,
                width,
            },
            other => other.clone(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, DataType::Scalar { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::Scalar {
                kind: ScalarKind::Float,
                ..
            }
        )
    }

    pub fn is_bool(&self) -> bool {
        matches!(
            self,
            DataType::Scalar {
                kind: ScalarKind::Bool,
                ..
            }
        )
    }

    pub fn is_label(&self) -> bool {
        matches!(self, DataType::Label)
    }

    pub fn pointer(&self) -> Option<&PointerType> {
        match self {
            DataType::Pointer(ptr) => Some(ptr),
            _ => None,
        }
    }

    pub fn array(&self) -> Option<&ArrayType> {
        match self {
            DataType::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Element type: pointee for pointers, element for arrays, the scalar
    /// element for vectors.
    pub fn element_type(&self) -> DataType {
        match self {
            DataType::Pointer(ptr) => ptr.element.clone(),
            DataType::Array(arr) => arr.element.clone(),
            DataType::Scalar { .. } => self.to_vector(1),
            other => other.clone(),
        }
    }

    pub fn vector_width(&self) -> u8 {
        match self {
            DataType::Scalar { width, .. } => *width,
            _ => 1,
        }
    }

    pub fn scalar_bits(&self) -> u32 {
        match self {
            DataType::Scalar { bits, .. } => *bits as u32,
            DataType::Pointer(_) => 32,
            _ => 0,
        }
    }

    /// Size in bytes when stored in memory.
    pub fn in_memory_size(&self) -> u32 {
        match self {
            DataType::Void | DataType::Label => 0,
            DataType::Scalar { bits, width, .. } => {
                let element = (*bits as u32).div_ceil(8).max(1);
                // 3-element vectors occupy the space of 4 elements
                let lanes = if *width == 3 { 4 } else { *width as u32 };
                element * lanes
            }
            DataType::Pointer(_) | DataType::Image(_) => 4,
            DataType::Array(arr) => arr.element.in_memory_size() * arr.size,
            DataType::Struct(st) => {
                let mut size = 0u32;
                for element in &st.elements {
                    if !st.packed {
                        size = size.next_multiple_of(element.alignment());
                    }
                    size += element.in_memory_size();
                }
                size
            }
        }
    }

    /// Natural alignment in bytes.
    pub fn alignment(&self) -> u32 {
        match self {
            DataType::Void | DataType::Label => 1,
            DataType::Scalar { .. } => self.in_memory_size().max(1),
            DataType::Pointer(_) | DataType::Image(_) => 4,
            DataType::Array(arr) => arr.element.alignment(),
            DataType::Struct(st) => {
                if st.packed {
                    1
                } else {
                    st.elements.iter().map(|e| e.alignment()).max().unwrap_or(1)
                }
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Void => write!(f, "void"),
            DataType::Label => write!(f, "label"),
            DataType::Scalar { kind, bits, width } => {
                let base = match kind {
                    ScalarKind::Int => format!("i{}", bits),
                    ScalarKind::Float => format!("f{}", bits),
                    ScalarKind::Bool => "bool".to_string(),
                };
                if *width > 1 {
                    write!(f, "{}x{}", base, width)
                } else {
                    write!(f, "{}", base)
                }
            }
            DataType::Pointer(ptr) => write!(f, "{} {}*", ptr.space, ptr.element),
            DataType::Array(arr) => write!(f, "[{} x {}]", arr.size, arr.element),
            DataType::Struct(st) => write!(f, "%{}", st.name),
            DataType::Image(img) => write!(f, "image{}d", img.dimensions),
        }
    }
}
