use bitflags::bitflags;
use smallvec::SmallVec;

use crate::indices::{base_type_size, is_base_type, MetaIdx, NameIdx, SignatureIdx, TypeIdx};

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeFlags: u32 {
		const UNION = 1 << 0;
		const EXTERNAL = 1 << 1;
		const DEFINED = 1 << 8;
		const RESOLVING = 1 << 9;
		const RESOLVED = 1 << 10;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodFlags: u32 {
		const EXTERNAL = 1 << 1;
		const DEFINED = 1 << 8;
		const RESOLVED = 1 << 10;
	}
}

/// Source location record attached to declarations.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Metadata {
	pub index: MetaIdx,
	pub line_number: u32,
}

/// A named member of a struct or union. `offset` is resolved by the linker.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Field {
	pub name: NameIdx,
	pub ty: TypeIdx,
	pub offset: usize,
}

impl Field {
	pub fn new(name: NameIdx, ty: TypeIdx) -> Self {
		Self { name, ty, offset: 0 }
	}
}

/// A stack variable or signature parameter. `offset` is resolved by the
/// linker.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StackVar {
	pub ty: TypeIdx,
	pub offset: usize,
}

impl StackVar {
	pub fn new(ty: TypeIdx) -> Self {
		Self { ty, offset: 0 }
	}
}

/// Shape of a derived (generated) type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Generated {
	Pointer {
		underlying_type: TypeIdx,
		/// Cached size of the pointee, filled in during type resolution and
		/// used to scale pointer arithmetic.
		underlying_size: usize,
	},
	Array {
		underlying_type: TypeIdx,
		array_size: usize,
	},
	Signature {
		index: SignatureIdx,
	},
}

/// One entry of the type table. Primitives and user structs/unions have no
/// `generated` shape; pointer, array and signature types carry one.
#[derive(Debug, Clone)]
pub struct Type {
	pub name: NameIdx,
	pub index: TypeIdx,
	pub flags: TypeFlags,
	pub total_size: usize,
	/// Cached index of this type's pointer type, if one was ever taken.
	pub pointer_type: TypeIdx,
	pub fields: Vec<Field>,
	pub generated: Option<Generated>,
	pub meta: Metadata,
}

impl Type {
	pub fn new(name: NameIdx, index: TypeIdx) -> Self {
		let mut flags = TypeFlags::empty();
		let mut total_size = 0;
		if is_base_type(index) {
			flags |= TypeFlags::DEFINED;
			total_size = base_type_size(index);
		}
		Self {
			name,
			index,
			flags,
			total_size,
			pointer_type: TypeIdx::INVALID,
			fields: Vec::new(),
			generated: None,
			meta: Metadata::default(),
		}
	}

	pub fn make_pointer(&mut self, underlying_type: TypeIdx) {
		self.generated = Some(Generated::Pointer { underlying_type, underlying_size: 0 });
	}

	pub fn make_array(&mut self, underlying_type: TypeIdx, array_size: usize) {
		self.generated = Some(Generated::Array { underlying_type, array_size });
	}

	pub fn make_signature(&mut self, index: SignatureIdx) {
		self.generated = Some(Generated::Signature { index });
	}

	#[inline]
	pub fn is_defined(&self) -> bool {
		self.flags.contains(TypeFlags::DEFINED)
	}

	#[inline]
	pub fn is_resolved(&self) -> bool {
		self.flags.contains(TypeFlags::RESOLVED)
	}

	#[inline]
	pub fn is_union(&self) -> bool {
		self.flags.contains(TypeFlags::UNION)
	}

	#[inline]
	pub fn is_generated(&self) -> bool {
		self.generated.is_some()
	}

	#[inline]
	pub fn is_pointer(&self) -> bool {
		matches!(self.generated, Some(Generated::Pointer { .. }))
	}

	#[inline]
	pub fn is_array(&self) -> bool {
		matches!(self.generated, Some(Generated::Array { .. }))
	}

	#[inline]
	pub fn is_signature(&self) -> bool {
		matches!(self.generated, Some(Generated::Signature { .. }))
	}

	/// Struct or union declared by the user (or a native descriptor).
	#[inline]
	pub fn is_aggregate(&self) -> bool {
		!is_base_type(self.index) && self.generated.is_none()
	}

	#[inline]
	pub fn is_arithmetic(&self) -> bool {
		crate::indices::is_arithmetic_type(self.index)
	}

	#[inline]
	pub fn is_integral(&self) -> bool {
		crate::indices::is_integral_type(self.index)
	}

	pub fn pointee(&self) -> TypeIdx {
		match self.generated {
			Some(Generated::Pointer { underlying_type, .. }) => underlying_type,
			_ => TypeIdx::INVALID,
		}
	}

	pub fn pointee_size(&self) -> usize {
		match self.generated {
			Some(Generated::Pointer { underlying_size, .. }) => underlying_size,
			_ => 0,
		}
	}
}

/// Method signature: return type plus ordered parameters. `parameters_size`
/// and parameter offsets are resolved by the linker.
#[derive(Debug, Clone)]
pub struct Signature {
	pub index: SignatureIdx,
	pub return_type: TypeIdx,
	pub parameters: SmallVec<[StackVar; 4]>,
	pub parameters_size: usize,
	/// Cached index of the signature type, if one was ever declared.
	pub signature_type: TypeIdx,
	pub is_resolved: bool,
}

impl Signature {
	pub fn new(index: SignatureIdx, return_type: TypeIdx) -> Self {
		Self {
			index,
			return_type,
			parameters: SmallVec::new(),
			parameters_size: 0,
			signature_type: TypeIdx::INVALID,
			is_resolved: false,
		}
	}

	#[inline]
	pub fn has_return_value(&self) -> bool {
		self.return_type != TypeIdx::VOID
	}

	/// Canonical dedup key: return type followed by parameter types.
	pub fn make_key(return_type: TypeIdx, parameters: &[TypeIdx], buf: &mut Vec<u8>) {
		buf.clear();
		buf.extend_from_slice(&return_type.raw().to_le_bytes());
		for ty in parameters {
			buf.extend_from_slice(&ty.raw().to_le_bytes());
		}
	}
}

/// An interned field path: root type plus member names, resolved by the
/// linker to a byte offset and leaf type.
#[derive(Debug, Clone)]
pub struct FieldAddress {
	pub object_type: TypeIdx,
	pub field_names: SmallVec<[NameIdx; 4]>,
	pub ty: TypeIdx,
	pub offset: usize,
}

impl FieldAddress {
	pub fn new(object_type: TypeIdx, field_names: SmallVec<[NameIdx; 4]>) -> Self {
		Self { object_type, field_names, ty: TypeIdx::INVALID, offset: 0 }
	}

	/// Canonical dedup key: root type followed by the name path.
	pub fn make_key(object_type: TypeIdx, fields: &[NameIdx], buf: &mut Vec<u8>) {
		buf.clear();
		buf.extend_from_slice(&object_type.raw().to_le_bytes());
		for name in fields {
			buf.extend_from_slice(&name.raw().to_le_bytes());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn base_types_are_predefined() {
		let ty = Type::new(NameIdx::INVALID, TypeIdx::I64);
		assert!(ty.is_defined());
		assert_eq!(ty.total_size, 8);
		assert!(ty.is_arithmetic());
		assert!(ty.is_integral());
		assert!(!Type::new(NameIdx::INVALID, TypeIdx::F32).is_integral());
	}

	#[test]
	fn generated_shapes() {
		let mut ptr = Type::new(NameIdx::INVALID, TypeIdx::new(12));
		ptr.make_pointer(TypeIdx::I32);
		assert!(ptr.is_pointer() && ptr.is_generated() && !ptr.is_aggregate());
		assert_eq!(ptr.pointee(), TypeIdx::I32);

		let mut arr = Type::new(NameIdx::INVALID, TypeIdx::new(13));
		arr.make_array(TypeIdx::I32, 3);
		assert!(arr.is_array());
	}

	#[test]
	fn signature_keys_discriminate() {
		let mut a = Vec::new();
		let mut b = Vec::new();
		Signature::make_key(TypeIdx::I32, &[TypeIdx::I32], &mut a);
		Signature::make_key(TypeIdx::I32, &[TypeIdx::U32], &mut b);
		assert_ne!(a, b);
		Signature::make_key(TypeIdx::I32, &[TypeIdx::I32], &mut b);
		assert_eq!(a, b);
	}
}
