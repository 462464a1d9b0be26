use crate::indices::{MethodIdx, NameIdx, OffsetIdx, SignatureIdx};
use crate::runtime::CallIdx;
use crate::types::{Metadata, MethodFlags, StackVar};

/// One entry of the method table.
///
/// Until the linker runs, `calls`, `globals` and `offsets` are the
/// method-local lookup tables the bytecode indexes into; the linker rewrites
/// the bytecode against the assembly-global tables and drops them.
#[derive(Debug, Clone)]
pub struct Method {
	pub name: NameIdx,
	pub index: MethodIdx,
	pub flags: MethodFlags,
	pub signature: SignatureIdx,
	pub bytecode: Vec<u8>,
	/// Anchored label byte offsets, sorted. The linker and interpreter treat
	/// these as return-value clearing boundaries.
	pub labels: Vec<u32>,
	pub stackvars: Vec<StackVar>,
	pub calls: Vec<MethodIdx>,
	pub globals: Vec<NameIdx>,
	pub offsets: Vec<OffsetIdx>,
	/// Parameters plus stack variables, in bytes.
	pub method_stack_size: usize,
	/// `method_stack_size` plus the return-value scratch area.
	pub total_stack_size: usize,
	/// Set for external methods instead of bytecode.
	pub external_call: Option<CallIdx>,
	pub meta: Metadata,
}

impl Method {
	pub fn new(name: NameIdx, index: MethodIdx) -> Self {
		Self {
			name,
			index,
			flags: MethodFlags::empty(),
			signature: SignatureIdx::INVALID,
			bytecode: Vec::new(),
			labels: Vec::new(),
			stackvars: Vec::new(),
			calls: Vec::new(),
			globals: Vec::new(),
			offsets: Vec::new(),
			method_stack_size: 0,
			total_stack_size: 0,
			external_call: None,
			meta: Metadata::default(),
		}
	}

	#[inline]
	pub fn is_defined(&self) -> bool {
		self.flags.contains(MethodFlags::DEFINED)
	}

	#[inline]
	pub fn is_resolved(&self) -> bool {
		self.flags.contains(MethodFlags::RESOLVED)
	}

	#[inline]
	pub fn is_external(&self) -> bool {
		self.flags.contains(MethodFlags::EXTERNAL)
	}
}
