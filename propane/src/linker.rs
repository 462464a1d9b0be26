use fxhash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::address::{AddressHeader, AddressModifier, AddressPrefix, AddressType};
use crate::asm::{generate_type_name, Assembly, AssemblyData};
use crate::database::Lookup;
use crate::errors::{Errc, Error, Result};
use crate::indices::{
	base_type_size, is_base_type, GlobalIdx, MethodIdx, NameIdx, OffsetIdx, SignatureIdx, TypeIdx,
	offset_type, size_type,
};
use crate::intermediate::{DataTable, GenData, Intermediate};
use crate::opcodes::{Opcode, Subcode};
use crate::operations::{self, SET_MEMCPY};
use crate::runtime::{ExternalCall, Runtime, TypeDecl};
use crate::types::{Field, MethodFlags, Signature, StackVar, Type, TypeFlags};

/// Link an intermediate against a runtime, producing an executable assembly.
///
/// Resolution happens in stages: externals, types, signatures, field paths,
/// method re-encoding, method-pointer constants, global initialization and
/// entrypoint lookup. Any violation aborts the link with a coded error.
pub fn link(intermediate: &Intermediate, runtime: &Runtime) -> Result<Assembly> {
	let data = GenData::deserialize(intermediate)?;
	Linker::run(data, runtime)
}

struct Linker {
	data: GenData,
	runtime_hash: u64,
	main: MethodIdx,

	size_type: TypeIdx,
	offset_type: TypeIdx,
	ptr_size: usize,

	method_ptr_lookup: FxHashMap<NameIdx, GlobalIdx>,
	keybuf: Vec<u8>,

	// Re-encoding state for the current method.
	current_method: MethodIdx,
	current_op: Opcode,
	iidx: usize,
	return_value: TypeIdx,
	max_return_value_size: usize,
}

impl Linker {
	fn run(mut data: GenData, runtime: &Runtime) -> Result<Assembly> {
		data.restore_generated_types();

		let mut linker = Linker {
			data,
			runtime_hash: runtime.hash(),
			main: MethodIdx::INVALID,
			size_type: size_type(),
			offset_type: offset_type(),
			ptr_size: base_type_size(TypeIdx::VPTR),
			method_ptr_lookup: FxHashMap::default(),
			keybuf: Vec::with_capacity(32),
			current_method: MethodIdx::INVALID,
			current_op: Opcode::noop,
			iidx: 0,
			return_value: TypeIdx::VOID,
			max_return_value_size: 0,
		};

		linker.resolve_externals(runtime)?;

		for index in 0..linker.data.types.len() {
			if !linker.data.types[index].is_resolved() {
				linker.resolve_type(TypeIdx::new(index))?;
			}
		}
		for index in 0..linker.data.signatures.len() {
			if !linker.data.signatures[index].is_resolved {
				linker.resolve_signature(SignatureIdx::new(index));
			}
		}
		linker.resolve_offsets()?;
		for index in 0..linker.data.methods.len() {
			if !linker.data.methods[index].is_resolved() {
				linker.resolve_method(MethodIdx::new(index))?;
			}
		}

		linker.initialize_data_table(true)?;
		linker.initialize_data_table(false)?;
		linker.find_main();

		debug!(
			types = linker.data.types.len(),
			methods = linker.data.methods.len(),
			entrypoint = linker.main.is_valid(),
			"link complete"
		);

		linker.serialize_result()
	}

	fn serialize_result(self) -> Result<Assembly> {
		let data = self.data;
		let assembly = AssemblyData {
			database: data.database,
			metatable: data.metatable,
			types: data.types,
			methods: data.methods,
			signatures: data.signatures,
			offsets: data.offsets,
			globals: data.globals,
			constants: data.constants,
			main: self.main,
			runtime_hash: self.runtime_hash,
		};
		Ok(assembly.serialize())
	}

	// Diagnostics

	fn type_name(&self, ty: TypeIdx) -> String {
		let mut name = String::new();
		if !generate_type_name(&self.data.types, &self.data.signatures, &self.data.database, ty, &mut name) {
			name = format!("<type {}>", ty.raw());
		}
		name
	}

	fn method_name(&self, method: MethodIdx) -> String {
		self.data.database.name(self.data.methods[method.index()].name).to_owned()
	}

	fn instruction_error(&self, code: Errc, message: String) -> Error {
		match self.current_method.is_valid() {
			true => Error::new(
				code,
				format!(
					"{message} (see definition of method '{}', instruction #{}: {})",
					self.method_name(self.current_method),
					self.iidx,
					self.current_op
				),
			),
			false => Error::new(code, message),
		}
	}

	// Stage (a): external resolution

	fn resolve_externals(&mut self, runtime: &Runtime) -> Result<()> {
		if runtime.has_calls() {
			for index in 0..self.data.methods.len() {
				if self.data.methods[index].is_defined() {
					continue;
				}
				let name = self.data.methods[index].name;
				let method_name = self.data.database.name(name).to_owned();
				let Some(call_idx) = runtime.find_call(&method_name) else {
					return Err(Error::new(
						Errc::LnkUndefinedMethod,
						format!("failed to find a definition for method '{method_name}'"),
					));
				};
				let call = runtime.call(call_idx).unwrap();
				let signature = self.resolve_native_signature(call)?;

				let method = &mut self.data.methods[index];
				method.signature = signature;
				method.external_call = Some(call_idx);
				method.flags |= MethodFlags::DEFINED | MethodFlags::EXTERNAL;
				trace!(method = %method_name, "resolved external method");
			}
		}

		let unresolved: Vec<NameIdx> = self
			.data
			.types
			.iter()
			.filter(|t| !t.is_defined())
			.map(|t| t.name)
			.collect();
		for name in unresolved {
			let type_name = self.data.database.name(name).to_owned();
			let Some(decl) = runtime.find_type(&type_name) else {
				return Err(Error::new(
					Errc::LnkUndefinedType,
					format!("failed to find a definition for type '{type_name}'"),
				));
			};
			self.resolve_native_type(decl)?;
		}
		Ok(())
	}

	fn resolve_native_signature(&mut self, call: &ExternalCall) -> Result<SignatureIdx> {
		let return_type = self.resolve_native_type(&call.return_type)?;
		let mut params: SmallVec<[StackVar; 4]> = SmallVec::with_capacity(call.parameters.len());
		let mut param_types: SmallVec<[TypeIdx; 8]> = SmallVec::with_capacity(call.parameters.len());
		for parameter in &call.parameters {
			let ty = self.resolve_native_type(&parameter.decl)?;
			params.push(StackVar { ty, offset: parameter.offset });
			param_types.push(ty);
		}

		Signature::make_key(return_type, &param_types, &mut self.keybuf);
		if let Some(&existing) = self.data.signature_lookup.get(&self.keybuf) {
			return Ok(existing);
		}
		let index = SignatureIdx::new(self.data.signatures.len());
		let mut signature = Signature::new(index, return_type);
		signature.parameters = params;
		signature.parameters_size = call.parameters_size;
		signature.is_resolved = true;
		self.data.signature_lookup.insert(self.keybuf.clone(), index);
		self.data.signatures.push(signature);
		Ok(index)
	}

	fn resolve_native_type(&mut self, decl: &TypeDecl) -> Result<TypeIdx> {
		let mut result = match self.data.database.find(&decl.name) {
			Some(name) => match self.data.database.lookup(name) {
				Lookup::Type(existing) => {
					if !is_base_type(existing) {
						let ty = &mut self.data.types[existing.index()];
						ty.total_size = decl.size;
						ty.flags |= TypeFlags::EXTERNAL | TypeFlags::DEFINED;
					}
					existing
				}
				_ => {
					return Err(Error::new(
						Errc::LnkUndefinedType,
						format!("native descriptor '{}' collides with a non-type declaration", decl.name),
					));
				}
			},
			None => {
				let name = self.data.database.emplace(&decl.name);
				let index = TypeIdx::new(self.data.types.len());
				self.data.database.set_lookup(name, Lookup::Type(index));
				let mut ty = Type::new(name, index);
				ty.total_size = decl.size;
				ty.flags |= TypeFlags::EXTERNAL | TypeFlags::DEFINED;
				self.data.types.push(ty);
				index
			}
		};

		// Field descriptors, resolved against already-known type names.
		for field in &decl.fields {
			let Some(field_type_name) = self.data.database.find(&field.ty) else {
				return Err(Error::new(
					Errc::LnkUndefinedType,
					format!("failed to find a definition for type '{}'", field.ty),
				));
			};
			let Lookup::Type(field_type) = self.data.database.lookup(field_type_name) else {
				return Err(Error::new(
					Errc::LnkUndefinedType,
					format!("failed to find a definition for type '{}'", field.ty),
				));
			};
			let field_name = self.data.database.emplace(&field.name);
			let ty = &mut self.data.types[result.index()];
			if !ty.fields.iter().any(|f| f.name == field_name) {
				ty.fields.push(Field::new(field_name, field_type));
			}
		}

		for _ in 0..decl.pointer_depth {
			result = crate::intermediate::get_or_create_pointer(&mut self.data, result);
		}
		Ok(result)
	}

	// Stage (b): type resolution

	fn resolve_type(&mut self, index: TypeIdx) -> Result<()> {
		if !self.data.types[index.index()].is_resolved() {
			if self.data.types[index.index()].flags.contains(TypeFlags::RESOLVING) {
				return Err(Error::new(
					Errc::LnkRecursiveTypeDefinition,
					format!("type definition for '{}' is recursive", self.type_name(index)),
				));
			}
			self.data.types[index.index()].flags |= TypeFlags::RESOLVING;

			if !self.data.types[index.index()].is_defined() {
				return Err(Error::new(
					Errc::LnkUndefinedType,
					format!("failed to find a definition for type '{}'", self.type_name(index)),
				));
			}

			if is_base_type(index) {
				self.data.types[index.index()].total_size = base_type_size(index);
			} else if let Some(generated) = self.data.types[index.index()].generated {
				use crate::types::Generated;
				match generated {
					Generated::Pointer { .. } | Generated::Signature { .. } => {
						self.data.types[index.index()].total_size = self.ptr_size;
					}
					Generated::Array { underlying_type, array_size } => {
						self.resolve_type(underlying_type)?;
						let element_size = self.data.types[underlying_type.index()].total_size;
						self.data.types[index.index()].total_size = element_size * array_size;
					}
				}
			} else {
				// User-declared struct or union.
				let declared_size = self.data.types[index.index()].total_size;
				let field_count = self.data.types[index.index()].fields.len();
				let is_union = self.data.types[index.index()].is_union();
				let mut total_size = 0usize;
				for field_index in 0..field_count {
					let field_type = self.data.types[index.index()].fields[field_index].ty;
					self.resolve_type(field_type)?;
					let field_size = self.data.types[field_type.index()].total_size;
					let field = &mut self.data.types[index.index()].fields[field_index];
					field.offset = if is_union { 0 } else { total_size };
					total_size = if is_union { total_size.max(field_size) } else { total_size + field_size };
				}
				if field_count > 0 {
					self.data.types[index.index()].total_size = total_size;
				} else {
					// Native types keep their declared size.
					self.data.types[index.index()].total_size = declared_size;
				}
				if self.data.types[index.index()].total_size == 0 {
					return Err(Error::new(
						Errc::LnkTypeSizeZero,
						format!("size of type '{}' evaluated to zero", self.type_name(index)),
					));
				}
			}
			self.data.types[index.index()].flags |= TypeFlags::RESOLVED;
		}

		// The cached pointer type learns the pointee size once it is known.
		let pointer_type = self.data.types[index.index()].pointer_type;
		if pointer_type.is_valid() {
			let total_size = self.data.types[index.index()].total_size;
			if let Some(crate::types::Generated::Pointer { underlying_size, .. }) =
				&mut self.data.types[pointer_type.index()].generated
			{
				*underlying_size = total_size;
			}
		}
		Ok(())
	}

	// Stage (c): signature resolution

	fn resolve_signature(&mut self, index: SignatureIdx) {
		let parameter_count = self.data.signatures[index.index()].parameters.len();
		let mut offset = 0usize;
		for i in 0..parameter_count {
			let ty = self.data.signatures[index.index()].parameters[i].ty;
			let size = self.data.types[ty.index()].total_size;
			self.data.signatures[index.index()].parameters[i].offset = offset;
			offset += size;
		}
		let signature = &mut self.data.signatures[index.index()];
		signature.parameters_size = offset;
		signature.is_resolved = true;
	}

	// Stage (d): field-path resolution

	fn resolve_offsets(&mut self) -> Result<()> {
		for index in 0..self.data.offsets.len() {
			let root = self.data.offsets[index].object_type;
			let path_len = self.data.offsets[index].field_names.len();
			let mut current = root;
			let mut byte_offset = 0usize;
			let mut leaf = TypeIdx::INVALID;
			for hop in 0..path_len {
				let name = self.data.offsets[index].field_names[hop];
				let found = self.data.types[current.index()]
					.fields
					.iter()
					.find(|f| f.name == name)
					.map(|f| (f.ty, f.offset));
				let Some((field_type, field_offset)) = found else {
					return Err(Error::new(
						Errc::LnkUndefinedTypeField,
						format!(
							"failed to find field '{}' (see definition of type '{}')",
							self.data.database.name(name),
							self.type_name(current)
						),
					));
				};
				byte_offset += field_offset;
				leaf = field_type;
				current = field_type;
			}
			let entry = &mut self.data.offsets[index];
			entry.offset = byte_offset;
			entry.ty = leaf;
		}
		Ok(())
	}

	// Stage (f): method-pointer constants

	fn resolve_method_constant(&mut self, method: MethodIdx) -> Result<GlobalIdx> {
		let name = self.data.methods[method.index()].name;
		if let Some(&existing) = self.method_ptr_lookup.get(&name) {
			return Ok(existing);
		}
		if !self.data.methods[method.index()].is_defined() {
			return Err(Error::new(
				Errc::LnkUndefinedMethod,
				format!("failed to find a definition for method '{}'", self.method_name(method)),
			));
		}

		let signature = self.data.methods[method.index()].signature;
		let signature_type = {
			let existing = self.data.signatures[signature.index()].signature_type;
			match existing.is_valid() {
				true => existing,
				false => {
					let index = crate::intermediate::get_or_create_signature_type(&mut self.data, signature);
					let ty = &mut self.data.types[index.index()];
					ty.total_size = self.ptr_size;
					ty.flags |= TypeFlags::RESOLVED;
					index
				}
			}
		};

		let table = &mut self.data.constants;
		let global_index = GlobalIdx::new(table.info.len()).as_constant();
		let data_offset = table.data.len();
		table.data.extend_from_slice(&1u16.to_le_bytes());
		table.data.push(TypeIdx::VOID.raw() as u8);
		table.data.extend_from_slice(&name.raw().to_le_bytes());
		table.info.push(Field { name, ty: signature_type, offset: data_offset });
		self.method_ptr_lookup.insert(name, global_index);
		Ok(global_index)
	}

	// Stage (e): method re-encoding

	fn resolve_method(&mut self, index: MethodIdx) -> Result<()> {
		if !self.data.methods[index.index()].is_defined() {
			return Err(Error::new(
				Errc::LnkUndefinedMethod,
				format!("failed to find a definition for method '{}'", self.method_name(index)),
			));
		}

		// Translate the method-local global list from identifiers to final
		// table indices; method references become hashed constants.
		let global_names = std::mem::take(&mut self.data.methods[index.index()].globals);
		let mut translated_globals = Vec::with_capacity(global_names.len());
		for name in &global_names {
			let translated = match self.data.database.lookup(*name) {
				Lookup::Method(target) => self.resolve_method_constant(target)?,
				Lookup::Global(global) => global,
				Lookup::Constant(constant) => constant.as_constant(),
				_ => {
					return Err(Error::new(
						Errc::LnkUndefinedGlobal,
						format!(
							"failed to find a definition for global '{}'",
							self.data.database.name(*name)
						),
					));
				}
			};
			translated_globals.push(translated);
		}

		// Stack variable offsets follow the parameter block.
		let signature = self.data.methods[index.index()].signature;
		let parameters_size = self.data.signatures[signature.index()].parameters_size;
		let mut variable_size = 0usize;
		for i in 0..self.data.methods[index.index()].stackvars.len() {
			let ty = self.data.methods[index.index()].stackvars[i].ty;
			let size = self.data.types[ty.index()].total_size;
			self.data.methods[index.index()].stackvars[i].offset = variable_size;
			variable_size += size;
		}
		self.data.methods[index.index()].method_stack_size = parameters_size + variable_size;

		self.max_return_value_size = 0;
		if !self.data.methods[index.index()].is_external() {
			self.current_method = index;
			self.return_value = TypeIdx::VOID;
			self.recompile(index, &translated_globals)?;
			self.current_method = MethodIdx::INVALID;
		}
		let method = &mut self.data.methods[index.index()];
		method.total_stack_size = method.method_stack_size + self.max_return_value_size;

		// Drop the per-method lookup tables; the bytecode now references the
		// assembly-global tables directly.
		method.calls = Vec::new();
		method.offsets = Vec::new();
		method.flags |= MethodFlags::RESOLVED;
		Ok(())
	}

	fn recompile(&mut self, index: MethodIdx, globals: &[GlobalIdx]) -> Result<()> {
		let mut code = std::mem::take(&mut self.data.methods[index.index()].bytecode);
		let calls = std::mem::take(&mut self.data.methods[index.index()].calls);
		let offsets = std::mem::take(&mut self.data.methods[index.index()].offsets);
		let labels = self.data.methods[index.index()].labels.clone();
		let signature = self.data.methods[index.index()].signature;

		let result = self.recompile_code(&mut code, signature, &calls, globals, &offsets, &labels);
		self.data.methods[index.index()].bytecode = code;
		self.data.methods[index.index()].calls = calls;
		self.data.methods[index.index()].offsets = offsets;
		result
	}

	fn recompile_code(
		&mut self,
		code: &mut Vec<u8>,
		signature: SignatureIdx,
		calls: &[MethodIdx],
		globals: &[GlobalIdx],
		offsets: &[OffsetIdx],
		labels: &[u32],
	) -> Result<()> {
		let has_return_value = self.data.signatures[signature.index()].has_return_value();
		let return_type = self.data.signatures[signature.index()].return_type;

		let mut pos = 0usize;
		let mut label_idx = 0usize;
		let mut has_returned = false;
		self.iidx = 0;

		loop {
			while label_idx < labels.len() && pos >= labels[label_idx] as usize {
				// Return-value scratch does not survive a label boundary.
				self.return_value = TypeIdx::VOID;
				label_idx += 1;
			}

			if pos == code.len() {
				if !has_returned {
					if has_return_value {
						return Err(self.instruction_error(
							Errc::LnkInvalidReturnAddress,
							"method bytecode ends without returning a value".into(),
						));
					}
					code.push(Opcode::ret as u8);
				}
				break;
			}
			if pos > code.len() {
				return Err(self.malformed("instruction stream overruns the method body"));
			}

			has_returned = false;
			self.iidx += 1;
			let op = Opcode::decode(code[pos])
				.ok_or_else(|| self.malformed("unknown opcode byte"))?;
			self.current_op = op;
			pos += 1;

			match op {
				Opcode::noop => {}

				Opcode::set => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					code[sub_pos] = self.resolve_set(lhs, rhs)?.raw();
				}

				Opcode::conv => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					code[sub_pos] = self.resolve_conv(lhs, rhs)?.raw();
				}

				Opcode::ari_not | Opcode::ari_neg => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					code[sub_pos] = self.resolve_ari(op, lhs, lhs)?.raw();
				}

				Opcode::ari_mul
				| Opcode::ari_div
				| Opcode::ari_mod
				| Opcode::ari_add
				| Opcode::ari_sub
				| Opcode::ari_lsh
				| Opcode::ari_rsh
				| Opcode::ari_and
				| Opcode::ari_xor
				| Opcode::ari_or => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					code[sub_pos] = self.resolve_ari(op, lhs, rhs)?.raw();
				}

				Opcode::padd | Opcode::psub => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					code[sub_pos] = self.resolve_ptr(op, lhs, rhs)?.raw();
				}

				Opcode::pdif => {
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					self.resolve_pdif(lhs, rhs)?;
					self.set_return_value(self.offset_type);
				}

				Opcode::cmp
				| Opcode::ceq
				| Opcode::cne
				| Opcode::cgt
				| Opcode::cge
				| Opcode::clt
				| Opcode::cle => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					code[sub_pos] = self.resolve_cmp(op, lhs, rhs)?.raw();
					self.set_return_value(TypeIdx::I32);
				}

				Opcode::cze | Opcode::cnz => {
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, Some(TypeIdx::VOID), globals, offsets)?;
					code[sub_pos] = self.resolve_cmp(op, lhs, lhs)?.raw();
					self.set_return_value(TypeIdx::I32);
				}

				Opcode::br => {
					pos += 4;
					self.return_value = TypeIdx::VOID;
				}

				Opcode::beq | Opcode::bne | Opcode::bgt | Opcode::bge | Opcode::blt | Opcode::ble => {
					pos += 4;
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, None, globals, offsets)?;
					let rhs = self.resolve_address(code, &mut pos, Some(lhs), globals, offsets)?;
					code[sub_pos] = self.resolve_cmp(op.branch_comparison(), lhs, rhs)?.raw();
					self.return_value = TypeIdx::VOID;
				}

				Opcode::bze | Opcode::bnz => {
					pos += 4;
					let sub_pos = pos;
					pos += 1;
					let lhs = self.resolve_address(code, &mut pos, Some(TypeIdx::VOID), globals, offsets)?;
					code[sub_pos] = self.resolve_cmp(op.branch_comparison(), lhs, lhs)?.raw();
					self.return_value = TypeIdx::VOID;
				}

				Opcode::sw => {
					let ty = self.resolve_address(code, &mut pos, Some(TypeIdx::VOID), globals, offsets)?;
					if !self.data.types[ty.index()].is_integral() {
						return Err(self.instruction_error(
							Errc::LnkInvalidSwitchType,
							format!("non-integral type '{}' is not valid for switch instruction", self.type_name(ty)),
						));
					}
					let label_count = self.read_u32(code, &mut pos)? as usize;
					pos += 4 * label_count;
					self.return_value = TypeIdx::VOID;
				}

				Opcode::call => {
					let call_pos = pos;
					let local = self.read_u32(code, &mut pos)? as usize;
					let target = *calls
						.get(local)
						.ok_or_else(|| self.malformed("call lookup index out of range"))?;
					code[call_pos..call_pos + 4].copy_from_slice(&target.raw().to_le_bytes());

					if !self.data.methods[target.index()].is_defined() {
						return Err(Error::new(
							Errc::LnkUndefinedMethod,
							format!("failed to find a definition for method '{}'", self.method_name(target)),
						));
					}
					let callee_signature = self.data.methods[target.index()].signature;
					self.resolve_call_arguments(code, &mut pos, callee_signature, globals, offsets)?;
				}

				Opcode::callv => {
					let ty = self.resolve_address(code, &mut pos, Some(TypeIdx::VOID), globals, offsets)?;
					let Some(crate::types::Generated::Signature { index: callee_signature }) =
						self.data.types[ty.index()].generated
					else {
						return Err(self.instruction_error(
							Errc::LnkNonSignatureTypeInvoke,
							format!("type '{}' is not a valid method pointer", self.type_name(ty)),
						));
					};
					self.resolve_call_arguments(code, &mut pos, callee_signature, globals, offsets)?;
				}

				Opcode::ret => {
					if has_return_value {
						return Err(self.malformed("ret inside a method with a return value"));
					}
					has_returned = true;
				}

				Opcode::retv => {
					if !has_return_value {
						return Err(self.malformed("retv inside a method without a return value"));
					}
					has_returned = true;
					let sub_pos = pos;
					pos += 1;
					let rhs = self.resolve_address(code, &mut pos, Some(return_type), globals, offsets)?;
					code[sub_pos] = self.resolve_set(return_type, rhs)?.raw();
				}

				Opcode::dump => {
					self.resolve_address(code, &mut pos, Some(TypeIdx::VOID), globals, offsets)?;
				}
			}
		}
		Ok(())
	}

	fn resolve_call_arguments(
		&mut self,
		code: &mut Vec<u8>,
		pos: &mut usize,
		callee_signature: SignatureIdx,
		globals: &[GlobalIdx],
		offsets: &[OffsetIdx],
	) -> Result<()> {
		let arg_count = *code
			.get(*pos)
			.ok_or_else(|| self.malformed("truncated call argument count"))? as usize;
		*pos += 1;
		let parameter_count = self.data.signatures[callee_signature.index()].parameters.len();
		if arg_count != parameter_count {
			return Err(self.instruction_error(
				Errc::LnkFunctionArgumentCountMismatch,
				format!(
					"provided argument count does not match signature parameter count: {arg_count} provided where {parameter_count} was expected"
				),
			));
		}
		for i in 0..arg_count {
			let parameter_type = self.data.signatures[callee_signature.index()].parameters[i].ty;
			let sub_pos = *pos;
			*pos += 1;
			let arg_type = self.resolve_address(code, pos, Some(parameter_type), globals, offsets)?;
			code[sub_pos] = self.resolve_set(parameter_type, arg_type)?.raw();
		}
		let return_type = self.data.signatures[callee_signature.index()].return_type;
		self.set_return_value(return_type);
		Ok(())
	}

	fn malformed(&self, message: &str) -> Error {
		self.instruction_error(Errc::LnkInvalidIntermediate, message.to_owned())
	}

	fn read_u32(&self, code: &[u8], pos: &mut usize) -> Result<u32> {
		let bytes = code
			.get(*pos..*pos + 4)
			.ok_or_else(|| self.malformed("truncated instruction operand"))?;
		*pos += 4;
		Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
	}

	fn set_return_value(&mut self, ty: TypeIdx) {
		let size = self.data.types[ty.index()].total_size;
		if size > self.max_return_value_size {
			self.max_return_value_size = size;
		}
		self.return_value = ty;
	}

	/// Resolve one operand: compute its final type and rewrite its indices in
	/// place. `expected` is `None` for LHS operands, `Some(VOID)` for plain
	/// RHS operands, and a concrete type when casting context applies.
	fn resolve_address(
		&mut self,
		code: &mut Vec<u8>,
		pos: &mut usize,
		expected: Option<TypeIdx>,
		globals: &[GlobalIdx],
		offsets: &[OffsetIdx],
	) -> Result<TypeIdx> {
		let header_pos = *pos;
		let header_raw = self.read_u32(code, pos)?;
		let header = AddressHeader::from_raw(header_raw);
		let index = header.index();

		let mut current: TypeIdx;
		match header.address_type() {
			AddressType::Stackvar => {
				if index == AddressHeader::INDEX_MAX {
					if self.return_value == TypeIdx::VOID {
						return Err(self.instruction_error(
							Errc::LnkInvalidReturnAddress,
							"return value address is not valid here".into(),
						));
					}
					current = self.return_value;
				} else {
					let method = &self.data.methods[self.current_method.index()];
					let var = method
						.stackvars
						.get(index as usize)
						.ok_or_else(|| self.malformed("stack index out of range"))?;
					current = var.ty;
				}
			}
			AddressType::Parameter => {
				let signature = self.data.methods[self.current_method.index()].signature;
				let param = self.data.signatures[signature.index()]
					.parameters
					.get(index as usize)
					.ok_or_else(|| self.malformed("parameter index out of range"))?;
				current = param.ty;
			}
			AddressType::Global => {
				let global = *globals
					.get(index as usize)
					.ok_or_else(|| self.malformed("global lookup index out of range"))?;
				let mut patched = header;
				patched.set_index(global.raw());
				code[header_pos..header_pos + 4].copy_from_slice(&patched.raw().to_le_bytes());

				let table = match global.is_constant() {
					true => &self.data.constants,
					false => &self.data.globals,
				};
				let info = table
					.info
					.get(global.table_index())
					.ok_or_else(|| self.malformed("global index out of range"))?;
				current = info.ty;
			}
			AddressType::Constant => {
				let code_type = TypeIdx(index);
				if expected.is_none() {
					return Err(self.malformed("constant cannot be a left-hand side operand"));
				}
				if code_type.raw() > TypeIdx::VPTR.raw() {
					return Err(self.malformed("malformed constant operand"));
				}
				*pos += base_type_size(code_type);

				// A null pointer literal adopts the destination pointer type.
				let expected = expected.unwrap();
				if code_type == TypeIdx::VPTR
					&& expected != TypeIdx::VOID
					&& self.data.types[expected.index()].is_pointer()
				{
					return Ok(expected);
				}
				return Ok(code_type);
			}
		}

		match header.modifier() {
			AddressModifier::None => {
				// The payload slot is always present on the wire.
				*pos += 8;
			}
			AddressModifier::DirectField => {
				let payload_pos = *pos;
				let local = self.read_payload(code, pos)? as usize;
				let field_idx = *offsets
					.get(local)
					.ok_or_else(|| self.malformed("offset lookup index out of range"))?;
				self.write_payload(code, payload_pos, field_idx.raw() as u64);

				let field = &self.data.offsets[field_idx.index()];
				if self.data.types[current.index()].is_pointer() {
					return Err(self.instruction_error(
						Errc::LnkInvalidFieldDereference,
						format!("unable to dereference field on type '{}'", self.type_name(current)),
					));
				}
				if current != field.object_type {
					return Err(self.instruction_error(
						Errc::LnkFieldParentTypeMismatch,
						format!(
							"field offset root type '{}' does not match variable type '{}'",
							self.type_name(field.object_type),
							self.type_name(current)
						),
					));
				}
				current = field.ty;
			}
			AddressModifier::IndirectField => {
				let payload_pos = *pos;
				let local = self.read_payload(code, pos)? as usize;
				let field_idx = *offsets
					.get(local)
					.ok_or_else(|| self.malformed("offset lookup index out of range"))?;
				self.write_payload(code, payload_pos, field_idx.raw() as u64);

				let field_object = self.data.offsets[field_idx.index()].object_type;
				let field_type = self.data.offsets[field_idx.index()].ty;
				if !self.data.types[current.index()].is_pointer() {
					return Err(self.instruction_error(
						Errc::LnkInvalidPointerDereference,
						format!("unable to dereference non-pointer type '{}'", self.type_name(current)),
					));
				}
				let pointee = self.data.types[current.index()].pointee();
				if pointee != field_object {
					return Err(self.instruction_error(
						Errc::LnkFieldParentTypeMismatch,
						format!(
							"field offset root type '{}' does not match variable type '{}'",
							self.type_name(field_object),
							self.type_name(pointee)
						),
					));
				}
				current = field_type;
			}
			AddressModifier::Offset => {
				let offset_value = self.read_payload(code, pos)? as i64 as isize;
				let ty = &self.data.types[current.index()];
				if ty.is_pointer() {
					current = ty.pointee();
				} else if let Some(crate::types::Generated::Array { underlying_type, array_size }) = ty.generated
				{
					if offset_value < 0 || offset_value as usize >= array_size {
						return Err(self.instruction_error(
							Errc::LnkArrayIndexOutOfRange,
							format!(
								"constant array index out of range (index {offset_value} in array {})",
								self.type_name(current)
							),
						));
					}
					current = underlying_type;
				} else {
					return Err(self.instruction_error(
						Errc::LnkInvalidOffsetModifier,
						format!("unable to apply offset modifier on type '{}'", self.type_name(current)),
					));
				}
			}
		}

		match header.prefix() {
			AddressPrefix::None => {}
			AddressPrefix::Indirection => {
				let ty = &self.data.types[current.index()];
				if !ty.is_pointer() {
					return Err(self.instruction_error(
						Errc::LnkInvalidPointerDereference,
						format!("unable to dereference non-pointer type '{}'", self.type_name(current)),
					));
				}
				let pointee = ty.pointee();
				if pointee == TypeIdx::VOID {
					return Err(self.instruction_error(
						Errc::LnkAbstractPointerDereference,
						format!("unable to dereference abstract pointer type '{}'", self.type_name(current)),
					));
				}
				current = pointee;
			}
			AddressPrefix::AddressOf => {
				// Generators may omit pointer types that never appear in a
				// declaration; synthesize them on demand.
				let pointer_type = self.data.types[current.index()].pointer_type;
				current = match pointer_type.is_valid() {
					true => pointer_type,
					false => {
						let base_size = self.data.types[current.index()].total_size;
						let index = crate::intermediate::get_or_create_pointer(&mut self.data, current);
						let ty = &mut self.data.types[index.index()];
						ty.total_size = self.ptr_size;
						ty.flags |= TypeFlags::RESOLVED;
						if let Some(crate::types::Generated::Pointer { underlying_size, .. }) = &mut ty.generated {
							*underlying_size = base_size;
						}
						index
					}
				};
			}
			AddressPrefix::SizeOf => {
				current = self.size_type;
			}
		}

		Ok(current)
	}

	fn read_payload(&self, code: &[u8], pos: &mut usize) -> Result<u64> {
		let bytes = code
			.get(*pos..*pos + 8)
			.ok_or_else(|| self.malformed("truncated address payload"))?;
		*pos += 8;
		Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
	}

	fn write_payload(&self, code: &mut [u8], pos: usize, value: u64) {
		code[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
	}

	// Typing rules

	fn resolve_set(&self, mut lhs: TypeIdx, mut rhs: TypeIdx) -> Result<Subcode> {
		let lhs_type = &self.data.types[lhs.index()];
		let rhs_type = &self.data.types[rhs.index()];

		if lhs_type.is_pointer() {
			// Both pointer types must match, or LHS is the abstract pointer.
			if !(lhs == rhs || (lhs == TypeIdx::VPTR && rhs_type.is_pointer())) {
				return Err(self.implicit_conversion_error(lhs, rhs));
			}
			lhs = self.size_type;
			rhs = self.size_type;
		} else if lhs_type.is_signature() {
			if !(lhs == rhs || rhs == TypeIdx::VPTR) {
				return Err(self.implicit_conversion_error(lhs, rhs));
			}
			lhs = self.size_type;
			rhs = self.size_type;
		} else if lhs_type.is_arithmetic() {
			if !rhs_type.is_arithmetic() {
				return Err(self.implicit_conversion_error(lhs, rhs));
			}
		} else if (lhs_type.is_aggregate() || lhs_type.is_array()) && lhs == rhs {
			return Ok(SET_MEMCPY);
		} else {
			return Err(self.implicit_conversion_error(lhs, rhs));
		}

		let sub = operations::translate_set(lhs, rhs);
		match sub.is_valid() {
			true => Ok(sub),
			false => Err(self.implicit_conversion_error(lhs, rhs)),
		}
	}

	fn implicit_conversion_error(&self, lhs: TypeIdx, rhs: TypeIdx) -> Error {
		self.instruction_error(
			Errc::LnkInvalidImplicitConversion,
			format!(
				"invalid implicit conversion between types '{}' and '{}'",
				self.type_name(lhs),
				self.type_name(rhs)
			),
		)
	}

	fn resolve_conv(&self, lhs: TypeIdx, rhs: TypeIdx) -> Result<Subcode> {
		let original = (lhs, rhs);
		let lhs = match self.data.types[lhs.index()].is_pointer() {
			true => self.size_type,
			false => lhs,
		};
		let rhs = match self.data.types[rhs.index()].is_pointer() {
			true => self.size_type,
			false => rhs,
		};

		let error = || {
			self.instruction_error(
				Errc::LnkInvalidExplicitConversion,
				format!(
					"invalid explicit conversion between types '{}' and '{}'",
					self.type_name(original.0),
					self.type_name(original.1)
				),
			)
		};

		if !crate::indices::is_arithmetic_type(lhs)
			|| !crate::indices::is_arithmetic_type(rhs)
			|| original.0 == original.1
		{
			return Err(error());
		}
		let sub = operations::translate_conv(lhs, rhs);
		match sub.is_valid() {
			true => Ok(sub),
			false => Err(error()),
		}
	}

	fn resolve_ari(&self, op: Opcode, lhs: TypeIdx, rhs: TypeIdx) -> Result<Subcode> {
		let error = || {
			self.instruction_error(
				Errc::LnkInvalidArithmeticExpression,
				format!(
					"invalid arithmetic expression between types '{}' and '{}'",
					self.type_name(lhs),
					self.type_name(rhs)
				),
			)
		};
		if !self.data.types[lhs.index()].is_arithmetic() || !self.data.types[rhs.index()].is_arithmetic() {
			return Err(error());
		}
		let sub = operations::translate_ari(op, lhs, rhs);
		match sub.is_valid() {
			true => Ok(sub),
			false => Err(error()),
		}
	}

	fn resolve_cmp(&self, op: Opcode, mut lhs: TypeIdx, mut rhs: TypeIdx) -> Result<Subcode> {
		let error = |lhs: TypeIdx, rhs: TypeIdx| {
			self.instruction_error(
				Errc::LnkInvalidComparisonExpression,
				format!(
					"invalid comparison expression between types '{}' and '{}'",
					self.type_name(lhs),
					self.type_name(rhs)
				),
			)
		};
		if self.data.types[lhs.index()].is_pointer() {
			if lhs != rhs {
				return Err(error(lhs, rhs));
			}
			lhs = self.size_type;
			rhs = self.size_type;
		} else if !self.data.types[lhs.index()].is_arithmetic()
			|| !self.data.types[rhs.index()].is_arithmetic()
		{
			return Err(error(lhs, rhs));
		}
		let sub = operations::translate_cmp(op, lhs, rhs);
		match sub.is_valid() {
			true => Ok(sub),
			false => Err(error(lhs, rhs)),
		}
	}

	fn resolve_ptr(&self, op: Opcode, lhs: TypeIdx, rhs: TypeIdx) -> Result<Subcode> {
		let error = || {
			self.instruction_error(
				Errc::LnkInvalidPointerExpression,
				format!(
					"invalid pointer expression between types '{}' and '{}'",
					self.type_name(lhs),
					self.type_name(rhs)
				),
			)
		};
		if !self.data.types[lhs.index()].is_pointer()
			|| lhs == TypeIdx::VPTR
			|| !self.data.types[rhs.index()].is_integral()
		{
			return Err(error());
		}
		let sub = operations::translate_ptr(op, lhs, rhs);
		match sub.is_valid() {
			true => Ok(sub),
			false => Err(error()),
		}
	}

	fn resolve_pdif(&self, lhs: TypeIdx, rhs: TypeIdx) -> Result<()> {
		if !self.data.types[lhs.index()].is_pointer() || lhs == TypeIdx::VPTR || lhs != rhs {
			return Err(self.instruction_error(
				Errc::LnkInvalidPtrOffsetExpression,
				format!(
					"unable to take pointer offset between types '{}' and '{}'",
					self.type_name(lhs),
					self.type_name(rhs)
				),
			));
		}
		Ok(())
	}

	// Stage (g): global/constant initialization

	fn initialize_data_table(&mut self, constants: bool) -> Result<()> {
		let table = match constants {
			true => std::mem::take(&mut self.data.constants),
			false => std::mem::take(&mut self.data.globals),
		};

		let mut new_data: Vec<u8> = Vec::new();
		let mut new_info = Vec::with_capacity(table.info.len());
		for info in &table.info {
			let total_size = self.data.types[info.ty.index()].total_size;
			let dst_offset = new_data.len();
			new_data.resize(dst_offset + total_size, 0);

			let src = &table.data[info.offset..];
			let init_count = u16::from_le_bytes(
				src.get(..2)
					.ok_or_else(|| Error::new(Errc::LnkInvalidIntermediate, "truncated initializer stream"))?
					.try_into()
					.unwrap(),
			);
			let mut stream = InitStream { data: src, pos: 2, remaining: init_count };
			self.initialize_data_recursive(
				info.name,
				&mut new_data,
				dst_offset,
				info.ty,
				&mut stream,
				constants,
			)?;

			if stream.remaining != 0 {
				return Err(Error::new(
					Errc::LnkGlobalInitializerOverflow,
					format!(
						"too many initializer values provided for global '{}': {} provided where a maximum of {} is expected",
						self.data.database.name(info.name),
						init_count,
						init_count - stream.remaining
					),
				));
			}
			new_info.push(Field { name: info.name, ty: info.ty, offset: dst_offset });
		}

		let table = DataTable { info: new_info, data: new_data };
		match constants {
			true => self.data.constants = table,
			false => self.data.globals = table,
		}
		Ok(())
	}

	fn initialize_data_recursive(
		&mut self,
		name: NameIdx,
		dst: &mut Vec<u8>,
		dst_offset: usize,
		ty: TypeIdx,
		stream: &mut InitStream,
		is_constant: bool,
	) -> Result<()> {
		let entry = &self.data.types[ty.index()];

		if entry.is_arithmetic() || entry.is_pointer() || ty == TypeIdx::VPTR {
			// Arithmetic and pointer leaves consume one encoded value.
			if stream.remaining > 0 {
				let init_type = stream.read_type_code()?;
				if init_type == TypeIdx::VOID {
					// Identifier initializers are only meaningful for method
					// pointers.
					return Err(Error::new(
						Errc::LnkInvalidMethodInitializer,
						format!(
							"invalid identifier initializer for global '{}'",
							self.data.database.name(name)
						),
					));
				}
				if init_type == TypeIdx::VPTR {
					// Null pointer literal; destination must be pointer-like.
					if !self.data.types[ty.index()].is_pointer() && ty != TypeIdx::VPTR {
						return Err(Error::new(
							Errc::LnkInvalidImplicitConversion,
							format!(
								"invalid null initializer for global '{}'",
								self.data.database.name(name)
							),
						));
					}
					stream.skip(self.ptr_size)?;
				} else {
					let lhs = match self.data.types[ty.index()].is_pointer() || ty == TypeIdx::VPTR {
						true => self.size_type,
						false => ty,
					};
					let value = stream.read_value(base_type_size(init_type))?;
					let size = self.data.types[lhs.index()].total_size;
					let ok = operations::convert(&mut dst[dst_offset..dst_offset + size], lhs, value, init_type);
					if !ok {
						return Err(Error::new(
							Errc::LnkInvalidImplicitConversion,
							format!(
								"invalid initializer conversion for global '{}'",
								self.data.database.name(name)
							),
						));
					}
				}
			}
			return Ok(());
		}

		if entry.is_signature() {
			if is_constant && stream.remaining == 0 {
				return Err(Error::new(
					Errc::LnkUninitializedMethodPtr,
					format!(
						"method pointer constant requires initialization (initialization of global '{}')",
						self.data.database.name(name)
					),
				));
			}
			if stream.remaining > 0 {
				let init_type = stream.read_type_code()?;
				if init_type == TypeIdx::VPTR {
					stream.skip(self.ptr_size)?;
					write_usize(dst, dst_offset, 0);
				} else if init_type == TypeIdx::VOID {
					let identifier = stream.read_name()?;
					let Lookup::Method(method) = self.data.database.lookup(identifier) else {
						return Err(Error::new(
							Errc::LnkUndefinedMethodInitializer,
							format!(
								"failed to find a definition for method '{}' (initialization of global '{}')",
								self.data.database.name(identifier),
								self.data.database.name(name)
							),
						));
					};
					write_usize(dst, dst_offset, method.index() ^ self.runtime_hash as usize);
				} else {
					return Err(Error::new(
						Errc::LnkInvalidMethodInitializer,
						format!(
							"invalid type provided for method pointer initialization (initialization of global '{}')",
							self.data.database.name(name)
						),
					));
				}
			} else {
				write_usize(dst, dst_offset, 0);
			}
			return Ok(());
		}

		if let Some(crate::types::Generated::Array { underlying_type, array_size }) = entry.generated {
			let element_size = self.data.types[underlying_type.index()].total_size;
			for i in 0..array_size {
				self.initialize_data_recursive(
					name,
					dst,
					dst_offset + i * element_size,
					underlying_type,
					stream,
					is_constant,
				)?;
			}
			return Ok(());
		}

		// Struct: fields land at their resolved offsets. A union initializes
		// through its first member only.
		let fields: Vec<(TypeIdx, usize)> = match entry.is_union() {
			true => entry.fields.first().map(|f| (f.ty, f.offset)).into_iter().collect(),
			false => entry.fields.iter().map(|f| (f.ty, f.offset)).collect(),
		};
		for (field_type, field_offset) in fields {
			self.initialize_data_recursive(
				name,
				dst,
				dst_offset + field_offset,
				field_type,
				stream,
				is_constant,
			)?;
		}
		Ok(())
	}

	// Stage (h): entrypoint resolution

	fn find_main(&mut self) {
		let Some(name) = self.data.database.find("main") else { return };
		let Lookup::Method(method) = self.data.database.lookup(name) else { return };
		let signature = self.data.methods[method.index()].signature;
		if !signature.is_valid() {
			return;
		}
		let signature = &self.data.signatures[signature.index()];
		if signature.return_type == TypeIdx::I32 && signature.parameters.is_empty() {
			self.main = method;
		}
	}
}

fn write_usize(dst: &mut [u8], offset: usize, value: usize) {
	let bytes = value.to_le_bytes();
	dst[offset..offset + bytes.len()].copy_from_slice(&bytes);
}

struct InitStream<'l> {
	data: &'l [u8],
	pos: usize,
	remaining: u16,
}

impl<'l> InitStream<'l> {
	fn read_type_code(&mut self) -> Result<TypeIdx> {
		let code = *self
			.data
			.get(self.pos)
			.ok_or_else(|| Error::new(Errc::LnkInvalidIntermediate, "truncated initializer stream"))?;
		self.pos += 1;
		self.remaining -= 1;
		Ok(TypeIdx(u32::from(code)))
	}

	fn read_value(&mut self, size: usize) -> Result<&'l [u8]> {
		let bytes = self
			.data
			.get(self.pos..self.pos + size)
			.ok_or_else(|| Error::new(Errc::LnkInvalidIntermediate, "truncated initializer stream"))?;
		self.pos += size;
		Ok(bytes)
	}

	fn read_name(&mut self) -> Result<NameIdx> {
		let bytes = self.read_value(4)?;
		Ok(NameIdx(u32::from_le_bytes(bytes.try_into().unwrap())))
	}

	fn skip(&mut self, _size: usize) -> Result<()> {
		// Null literals carry no payload in the initializer stream.
		Ok(())
	}
}
