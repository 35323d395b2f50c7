//! A compilation unit: module-level globals and the kernels using them.

use std::sync::Arc;

use crate::ir::types::{ArrayType, ImageType, PointerType, StructType};
use crate::ir::{AddressSpace, DataType, Literal, Method, NameGenerator};

/// Module-level data, laid out back to back in the global data segment.
#[derive(Clone, Debug, PartialEq)]
pub struct Global {
    pub name: String,
    /// Type of the stored data (not of the pointer referencing it).
    pub ty: DataType,
    pub alignment: u32,
    pub constant: bool,
    /// Initial contents, one literal per element. Absent for
    /// zero-initialized data.
    pub initializer: Option<Vec<Literal>>,
}

#[derive(Debug, Default)]
pub struct Module {
    pub methods: Vec<Method>,
    globals: Vec<Global>,
    names: Arc<NameGenerator>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name generator shared by all methods of this module.
    pub fn name_generator(&self) -> &Arc<NameGenerator> {
        &self.names
    }

    pub fn create_method(&mut self, name: &str) -> &mut Method {
        let index = self.methods.len();
        self.methods.push(Method::new(name, Arc::clone(&self.names)));
        &mut self.methods[index]
    }

    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    // ─── Globals ──────────────────────────────────────────────────

    pub fn add_global(&mut self, global: Global) {
        match self.globals.iter_mut().find(|g| g.name == global.name) {
            Some(existing) => *existing = global,
            None => self.globals.push(global),
        }
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn find_global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Offset of a global inside the global data segment.
    ///
    /// `None` as argument asks for the end of the segment, which is where
    /// the stack frames start. Names which are not globals have no offset.
    pub fn global_data_offset(&self, name: Option<&str>) -> Option<u32> {
        let mut offset = 0u32;
        for global in &self.globals {
            offset = offset.next_multiple_of(global.alignment.max(1));
            if name == Some(global.name.as_str()) {
                return Some(offset);
            }
            offset += global.ty.in_memory_size();
        }
        match name {
            None => Some(offset),
            Some(_) => None,
        }
    }

    /// Size of the global data segment in bytes.
    pub fn global_data_size(&self) -> u32 {
        self.global_data_offset(None).unwrap_or(0)
    }

    // ─── Type factories ───────────────────────────────────────────

    pub fn create_pointer_type(&self, element: DataType, space: AddressSpace, alignment: u32) -> DataType {
        DataType::Pointer(Arc::new(PointerType {
            element,
            space,
            alignment,
        }))
    }

    pub fn create_array_type(&self, element: DataType, size: u32) -> DataType {
        DataType::Array(Arc::new(ArrayType { element, size }))
    }

    pub fn create_struct_type(&self, name: &str, elements: Vec<DataType>, packed: bool) -> DataType {
        DataType::Struct(Arc::new(StructType {
            name: name.to_string(),
            elements,
            packed,
        }))
    }

    pub fn create_image_type(&self, dimensions: u8, is_array: bool, is_buffer: bool, is_sampled: bool) -> DataType {
        DataType::Image(ImageType {
            dimensions,
            is_array,
            is_buffer,
            is_sampled,
        })
    }
}
