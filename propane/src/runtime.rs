use fxhash::FxHashMap;

use crate::host::SymbolHandle;
use crate::version::ToolchainVersion;

// 64-bit FNV-1a, used for the runtime fingerprint.
pub(crate) mod fnv {
	pub const OFFSET: u64 = 14695981039346656037;
	pub const PRIME: u64 = 1099511628211;

	#[inline]
	pub fn append(mut hash: u64, bytes: &[u8]) -> u64 {
		for &byte in bytes {
			hash ^= u64::from(byte);
			hash = hash.wrapping_mul(PRIME);
		}
		hash
	}

	#[inline]
	pub fn append_u64(hash: u64, value: u64) -> u64 {
		append(hash, &value.to_le_bytes())
	}
}

/// Native field descriptor of an externally-provided type.
#[derive(Debug, Clone)]
pub struct NativeField {
	pub name: String,
	pub ty: String,
}

/// Native type descriptor: resolves an undefined type at link time.
#[derive(Debug, Clone, Default)]
pub struct TypeDecl {
	pub name: String,
	pub size: usize,
	pub pointer_depth: usize,
	pub fields: Vec<NativeField>,
}

impl TypeDecl {
	pub fn new(name: impl Into<String>, size: usize) -> Self {
		Self { name: name.into(), size, pointer_depth: 0, fields: Vec::new() }
	}

	fn fold(&self, mut hash: u64) -> u64 {
		hash = fnv::append(hash, self.name.as_bytes());
		hash = fnv::append_u64(hash, self.size as u64);
		fnv::append_u64(hash, self.pointer_depth as u64)
	}
}

/// Parameter of an external call, laid out at `offset` in the parameter area.
#[derive(Debug, Clone)]
pub struct NativeParameter {
	pub decl: TypeDecl,
	pub offset: usize,
}

/// Trampoline provided by the host: receives the resolved symbol, the
/// return-slot address and the parameter-area address. The core guarantees
/// the argument layout; everything else is the host's contract.
pub type ForwardFn = unsafe fn(SymbolHandle, *mut u8, *const u8);

/// One externally-implemented method.
pub struct ExternalCall {
	pub name: String,
	pub return_type: TypeDecl,
	pub parameters: Vec<NativeParameter>,
	pub parameters_size: usize,
	pub forward: ForwardFn,
}

impl std::fmt::Debug for ExternalCall {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExternalCall")
			.field("name", &self.name)
			.field("return_type", &self.return_type.name)
			.field("parameters", &self.parameters.len())
			.finish()
	}
}

/// One host library: a path the host can open plus its calls and native
/// type descriptors.
#[derive(Debug, Default)]
pub struct Library {
	pub path: String,
	pub preload_symbols: bool,
	pub calls: Vec<ExternalCall>,
	pub types: Vec<TypeDecl>,
}

impl Library {
	pub fn new(path: impl Into<String>) -> Self {
		Self { path: path.into(), ..Default::default() }
	}
}

/// Position of an external call within the runtime, stored as the bytecode
/// of external methods.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CallIdx {
	pub library: u32,
	pub index: u32,
}

impl CallIdx {
	pub const WIRE_SIZE: usize = 8;
}

/// Immutable runtime descriptor consumed by the linker and the interpreter.
/// The hash binds assemblies to the exact external surface they were linked
/// against.
#[derive(Debug, Default)]
pub struct Runtime {
	libraries: Vec<Library>,
	call_lookup: FxHashMap<String, CallIdx>,
	type_lookup: FxHashMap<String, (u32, u32)>,
	hash: u64,
}

impl Runtime {
	pub fn new() -> Self {
		let mut runtime = Self::default();
		runtime.hash = runtime.compute_hash();
		runtime
	}

	pub fn with_libraries(libraries: Vec<Library>) -> Self {
		let mut runtime = Runtime { libraries, ..Default::default() };
		for (lib_idx, lib) in runtime.libraries.iter().enumerate() {
			for (call_idx, call) in lib.calls.iter().enumerate() {
				runtime.call_lookup.insert(
					call.name.clone(),
					CallIdx { library: lib_idx as u32, index: call_idx as u32 },
				);
			}
			for (type_idx, decl) in lib.types.iter().enumerate() {
				runtime
					.type_lookup
					.insert(decl.name.clone(), (lib_idx as u32, type_idx as u32));
			}
		}
		runtime.hash = runtime.compute_hash();
		runtime
	}

	fn compute_hash(&self) -> u64 {
		let mut hash = fnv::append(fnv::OFFSET, &ToolchainVersion::current().to_bytes());
		for lib in &self.libraries {
			for call in &lib.calls {
				hash = fnv::append(hash, call.name.as_bytes());
				hash = call.return_type.fold(hash);
				for param in &call.parameters {
					hash = param.decl.fold(hash);
				}
			}
		}
		hash
	}

	#[inline]
	pub fn hash(&self) -> u64 {
		self.hash
	}

	pub fn libraries(&self) -> &[Library] {
		&self.libraries
	}

	pub fn library(&self, index: u32) -> Option<&Library> {
		self.libraries.get(index as usize)
	}

	pub fn find_call(&self, name: &str) -> Option<CallIdx> {
		self.call_lookup.get(name).copied()
	}

	pub fn call(&self, idx: CallIdx) -> Option<&ExternalCall> {
		self.libraries
			.get(idx.library as usize)?
			.calls
			.get(idx.index as usize)
	}

	pub fn find_type(&self, name: &str) -> Option<&TypeDecl> {
		let &(lib, ty) = self.type_lookup.get(name)?;
		self.libraries.get(lib as usize)?.types.get(ty as usize)
	}

	pub fn has_calls(&self) -> bool {
		!self.call_lookup.is_empty()
	}
}

/// Interpreter configuration. The stack capacity is the largest power of two
/// within `[min_stack_size, max_stack_size]` the host grants; the callstack
/// cap applies to non-external calls only.
#[derive(Debug, Copy, Clone)]
pub struct RuntimeParameters {
	pub min_stack_size: usize,
	pub max_stack_size: usize,
	pub max_callstack_depth: usize,
}

impl Default for RuntimeParameters {
	fn default() -> Self {
		Self {
			min_stack_size: 4 << 10,
			max_stack_size: 1 << 20,
			max_callstack_depth: 1024,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	unsafe fn nop_forward(_: SymbolHandle, _: *mut u8, _: *const u8) {}

	fn call(name: &str) -> ExternalCall {
		ExternalCall {
			name: name.into(),
			return_type: TypeDecl::new("int", 4),
			parameters: vec![NativeParameter { decl: TypeDecl::new("int", 4), offset: 0 }],
			parameters_size: 4,
			forward: nop_forward,
		}
	}

	#[test]
	fn hash_depends_on_call_surface() {
		let empty = Runtime::new();

		let mut lib = Library::new("libtest");
		lib.calls.push(call("external_sum"));
		let a = Runtime::with_libraries(vec![lib]);
		assert_ne!(empty.hash(), a.hash());

		let mut lib = Library::new("libtest");
		lib.calls.push(call("external_sum"));
		let b = Runtime::with_libraries(vec![lib]);
		assert_eq!(a.hash(), b.hash());

		let mut lib = Library::new("libtest");
		let mut changed = call("external_sum");
		changed.return_type = TypeDecl::new("long", 8);
		lib.calls.push(changed);
		let c = Runtime::with_libraries(vec![lib]);
		assert_ne!(a.hash(), c.hash());
	}

	#[test]
	fn call_lookup_by_name() {
		let mut lib = Library::new("libtest");
		lib.calls.push(call("external_sum"));
		let runtime = Runtime::with_libraries(vec![lib]);
		let idx = runtime.find_call("external_sum").unwrap();
		assert_eq!(runtime.call(idx).unwrap().name, "external_sum");
		assert!(runtime.find_call("missing").is_none());
	}
}
