use fxhash::FxHashMap;
use nohash_hasher::IntMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::address::{Address, AddressHeader, AddressModifier, AddressPrefix, AddressType, Payload};
use crate::database::{is_identifier, Lookup};
use crate::errors::{Errc, Error, FileMeta, Result};
use crate::indices::{LabelIdx, MethodIdx, MetaIdx, NameIdx, OffsetIdx, SignatureIdx, TypeIdx};
use crate::intermediate::{
	get_or_create_array, get_or_create_pointer, get_or_create_signature_type, GenData, Intermediate,
};
use crate::method::Method;
use crate::opcodes::Opcode;
use crate::types::{Field, FieldAddress, Metadata, MethodFlags, Signature, StackVar, Type, TypeFlags};

pub(crate) const METHOD_PARAMETER_MAX: usize = 256;
pub(crate) const GLOBAL_INITIALIZER_MAX: usize = 65536;

/// Incremental builder for an [`Intermediate`]. Declarations are idempotent;
/// definitions go through [`TypeWriter`] and [`MethodWriter`] and may happen
/// at most once per index.
#[derive(Debug)]
pub struct Generator {
	data: GenData,
	meta_index: MetaIdx,
	line_number: u32,
	keybuf: Vec<u8>,
}

impl Default for Generator {
	fn default() -> Self {
		let mut data = GenData::default();
		data.initialize_base_types();
		Self { data, meta_index: MetaIdx::INVALID, line_number: 0, keybuf: Vec::with_capacity(32) }
	}
}

impl Generator {
	pub fn new() -> Self {
		Self::default()
	}

	/// `name` is the source file recorded in type/method metadata.
	pub fn with_file(name: &str) -> Self {
		let mut gen = Self::default();
		gen.meta_index = gen.data.metatable.emplace(name);
		gen
	}

	/// Line number recorded in subsequently declared metadata.
	pub fn set_line_number(&mut self, line_number: u32) {
		self.line_number = line_number;
	}

	pub(crate) fn meta(&self) -> FileMeta {
		FileMeta {
			file_name: self.data.metatable.name(self.meta_index).to_owned(),
			line_number: self.line_number,
		}
	}

	fn metadata(&self) -> Metadata {
		Metadata { index: self.meta_index, line_number: self.line_number }
	}

	fn error(&self, code: Errc, message: impl Into<String>) -> Error {
		Error::with_meta(code, message, self.meta())
	}

	fn validate_name(&self, name: NameIdx) -> Result<()> {
		if !name.is_valid() {
			return Err(self.error(Errc::GnrInvalidIndex, "invalid index provided"));
		}
		if !self.data.database.is_valid_index(name) {
			return Err(self.error(
				Errc::GnrIndexOutOfRange,
				format!("name index out of range ({}/{})", name.raw(), self.data.database.len()),
			));
		}
		Ok(())
	}

	fn validate_type(&self, ty: TypeIdx) -> Result<()> {
		if !ty.is_valid() {
			return Err(self.error(Errc::GnrInvalidIndex, "invalid index provided"));
		}
		if ty.index() >= self.data.types.len() {
			return Err(self.error(
				Errc::GnrIndexOutOfRange,
				format!("type index out of range ({}/{})", ty.raw(), self.data.types.len()),
			));
		}
		Ok(())
	}

	fn validate_nonvoid(&self, ty: TypeIdx) -> Result<()> {
		self.validate_type(ty)?;
		if ty == TypeIdx::VOID {
			return Err(self.error(
				Errc::GnrInvalidVoidType,
				"void type is not valid as a parameter or field type",
			));
		}
		Ok(())
	}

	/// Intern a unique identifier; returns the same index when `name` has
	/// been used before.
	pub fn make_identifier(&mut self, name: &str) -> Result<NameIdx> {
		if !is_identifier(name) {
			return Err(self.error(Errc::GnrInvalidIdentifier, format!("invalid identifier: '{name}'")));
		}
		Ok(self.data.database.emplace(name))
	}

	/// Signatures are deduplicated by their canonical key and can back both
	/// method definitions and signature type declarations.
	pub fn make_signature(&mut self, return_type: TypeIdx, parameter_types: &[TypeIdx]) -> Result<SignatureIdx> {
		self.validate_type(return_type)?;
		for &ty in parameter_types {
			self.validate_nonvoid(ty)?;
		}
		if parameter_types.len() > METHOD_PARAMETER_MAX {
			return Err(self.error(
				Errc::GnrParameterOverflow,
				format!(
					"method parameter count exceeds maximum ({}/{})",
					parameter_types.len(),
					METHOD_PARAMETER_MAX
				),
			));
		}

		Signature::make_key(return_type, parameter_types, &mut self.keybuf);
		if let Some(&existing) = self.data.signature_lookup.get(&self.keybuf) {
			return Ok(existing);
		}
		let index = SignatureIdx::new(self.data.signatures.len());
		let mut sig = Signature::new(index, return_type);
		sig.parameters = parameter_types.iter().map(|&ty| StackVar::new(ty)).collect();
		self.data.signature_lookup.insert(self.keybuf.clone(), index);
		self.data.signatures.push(sig);
		Ok(index)
	}

	/// Intern a field path rooted at `ty`. Offsets are the only way bytecode
	/// reaches struct members.
	pub fn make_offset(&mut self, ty: TypeIdx, fields: &[NameIdx]) -> Result<OffsetIdx> {
		self.validate_type(ty)?;
		for &name in fields {
			self.validate_name(name)?;
		}
		if fields.is_empty() {
			return Err(self.error(Errc::GnrEmptyOffset, "empty offset sequence provided"));
		}

		FieldAddress::make_key(ty, fields, &mut self.keybuf);
		if let Some(&existing) = self.data.offset_lookup.get(&self.keybuf) {
			return Ok(existing);
		}
		let index = OffsetIdx::new(self.data.offsets.len());
		self.data.offsets.push(FieldAddress::new(ty, fields.iter().copied().collect()));
		self.data.offset_lookup.insert(self.keybuf.clone(), index);
		Ok(index)
	}

	/// Extend an interned field path with further member names.
	pub fn append_offset(&mut self, offset: OffsetIdx, fields: &[NameIdx]) -> Result<OffsetIdx> {
		if !offset.is_valid() || offset.index() >= self.data.offsets.len() {
			return Err(self.error(Errc::GnrInvalidIndex, "invalid offset index provided"));
		}
		for &name in fields {
			self.validate_name(name)?;
		}
		if fields.is_empty() {
			return Err(self.error(Errc::GnrEmptyOffset, "empty offset sequence provided"));
		}

		let base = &self.data.offsets[offset.index()];
		let object_type = base.object_type;
		let mut names: SmallVec<[NameIdx; 4]> = base.field_names.clone();
		names.extend_from_slice(fields);
		let names_vec: Vec<NameIdx> = names.into_vec();
		self.make_offset_from_path(object_type, names_vec)
	}

	fn make_offset_from_path(&mut self, ty: TypeIdx, fields: Vec<NameIdx>) -> Result<OffsetIdx> {
		FieldAddress::make_key(ty, &fields, &mut self.keybuf);
		if let Some(&existing) = self.data.offset_lookup.get(&self.keybuf) {
			return Ok(existing);
		}
		let index = OffsetIdx::new(self.data.offsets.len());
		self.data.offsets.push(FieldAddress::new(ty, fields.into_iter().collect()));
		self.data.offset_lookup.insert(self.keybuf.clone(), index);
		Ok(index)
	}

	/// Define a global or constant with optional initializer values.
	pub fn define_global(
		&mut self,
		name: NameIdx,
		is_constant: bool,
		ty: TypeIdx,
		values: &[Address],
	) -> Result<()> {
		self.validate_name(name)?;
		self.validate_nonvoid(ty)?;
		if values.len() > GLOBAL_INITIALIZER_MAX {
			return Err(self.error(
				Errc::GnrInitializerOverflow,
				format!(
					"constant initializer count exceeds maximum ({}/{})",
					values.len(),
					GLOBAL_INITIALIZER_MAX
				),
			));
		}

		match self.data.database.lookup(name) {
			Lookup::Identifier => {}
			Lookup::Global(_) | Lookup::Constant(_) => {
				return Err(self.error(
					Errc::GnrGlobalRedeclaration,
					format!("global '{}' has already been declared", self.data.database.name(name)),
				));
			}
			other => {
				return Err(self.error(
					Errc::GnrIdentifierTypeMismatch,
					format!(
						"declaration of identifier '{}' collides with previous {} declaration",
						self.data.database.name(name),
						other.kind_name()
					),
				));
			}
		}

		// Validate initializer values before mutating any table.
		for value in values {
			if value.header.address_type() != AddressType::Constant {
				return Err(self.error(Errc::GnrInvalidConstant, "global initializers must be constants"));
			}
			if let Payload::Identifier(identifier) = value.payload {
				self.validate_name(identifier)?;
			}
		}

		let table = if is_constant { &mut self.data.constants } else { &mut self.data.globals };
		let index = crate::indices::GlobalIdx::new(table.info.len());
		let data_offset = table.data.len();
		table.info.push(Field { name, ty, offset: data_offset });

		table.data.extend_from_slice(&(values.len() as u16).to_le_bytes());
		for value in values {
			let init_type = TypeIdx(value.header.index());
			table.data.push(init_type.raw() as u8);
			match value.payload {
				Payload::Identifier(identifier) => {
					table.data.extend_from_slice(&identifier.raw().to_le_bytes());
				}
				Payload::Nullptr => {}
				_ => append_constant_payload(&mut table.data, value),
			}
		}

		let lookup = match is_constant {
			true => Lookup::Constant(index),
			false => Lookup::Global(index),
		};
		self.data.database.set_lookup(name, lookup);
		Ok(())
	}

	/// Declare a type by name; idempotent for the same identifier.
	pub fn declare_type(&mut self, name: NameIdx) -> Result<TypeIdx> {
		self.validate_name(name)?;
		match self.data.database.lookup(name) {
			Lookup::Identifier => {
				let index = TypeIdx::new(self.data.types.len());
				self.data.database.set_lookup(name, Lookup::Type(index));
				self.data.types.push(Type::new(name, index));
				Ok(index)
			}
			Lookup::Type(existing) => Ok(existing),
			other => Err(self.error(
				Errc::GnrIdentifierTypeMismatch,
				format!(
					"declaration of type '{}' collides with previous {} declaration",
					self.data.database.name(name),
					other.kind_name()
				),
			)),
		}
	}

	/// Open a writer for a declared type; allowed at most once per index.
	pub fn define_type(&mut self, ty: TypeIdx, is_union: bool) -> Result<TypeWriter<'_>> {
		self.validate_type(ty)?;
		let meta = self.metadata();
		let entry = &mut self.data.types[ty.index()];
		if entry.is_defined() {
			let name = self.data.database.name(entry.name).to_owned();
			return Err(self.error(
				Errc::GnrTypeRedeclaration,
				format!("type '{name}' has already been declared"),
			));
		}
		entry.flags |= TypeFlags::DEFINED;
		if is_union {
			entry.flags |= TypeFlags::UNION;
		}
		entry.meta = meta;
		Ok(TypeWriter { gen: self, index: ty })
	}

	/// Pointer types are unique per base type.
	pub fn declare_pointer_type(&mut self, base_type: TypeIdx) -> Result<TypeIdx> {
		self.validate_type(base_type)?;
		Ok(get_or_create_pointer(&mut self.data, base_type))
	}

	/// Array types are unique per `(base, size)`; zero-length arrays are
	/// rejected.
	pub fn declare_array_type(&mut self, base_type: TypeIdx, array_size: usize) -> Result<TypeIdx> {
		self.validate_nonvoid(base_type)?;
		if array_size == 0 {
			return Err(self.error(Errc::GnrArrayLengthZero, "array length cannot be zero"));
		}
		Ok(get_or_create_array(&mut self.data, base_type, array_size))
	}

	/// Signature types are unique per signature.
	pub fn declare_signature_type(&mut self, signature: SignatureIdx) -> Result<TypeIdx> {
		if !signature.is_valid() || signature.index() >= self.data.signatures.len() {
			return Err(self.error(Errc::GnrInvalidIndex, "invalid signature index provided"));
		}
		Ok(get_or_create_signature_type(&mut self.data, signature))
	}

	/// Declare a method by name; idempotent for the same identifier.
	pub fn declare_method(&mut self, name: NameIdx) -> Result<MethodIdx> {
		self.validate_name(name)?;
		match self.data.database.lookup(name) {
			Lookup::Identifier => {
				let index = MethodIdx::new(self.data.methods.len());
				self.data.database.set_lookup(name, Lookup::Method(index));
				self.data.methods.push(Method::new(name, index));
				Ok(index)
			}
			Lookup::Method(existing) => Ok(existing),
			other => Err(self.error(
				Errc::GnrIdentifierTypeMismatch,
				format!(
					"declaration of method '{}' collides with previous {} declaration",
					self.data.database.name(name),
					other.kind_name()
				),
			)),
		}
	}

	/// Open a writer for a declared method; allowed at most once per index.
	pub fn define_method(&mut self, method: MethodIdx, signature: SignatureIdx) -> Result<MethodWriter<'_>> {
		if !method.is_valid() || method.index() >= self.data.methods.len() {
			return Err(self.error(Errc::GnrInvalidIndex, "invalid method index provided"));
		}
		if !signature.is_valid() || signature.index() >= self.data.signatures.len() {
			return Err(self.error(Errc::GnrInvalidIndex, "invalid signature index provided"));
		}
		let meta = self.metadata();
		let expects_return_value = self.data.signatures[signature.index()].has_return_value();
		let parameter_count = self.data.signatures[signature.index()].parameters.len();
		let entry = &mut self.data.methods[method.index()];
		if entry.is_defined() {
			let name = self.data.database.name(entry.name).to_owned();
			return Err(self.error(
				Errc::GnrMethodRedeclaration,
				format!("method '{name}' has already been declared"),
			));
		}
		entry.flags |= MethodFlags::DEFINED;
		entry.signature = signature;
		entry.meta = meta;
		Ok(MethodWriter {
			gen: self,
			index: method,
			state: MethodState {
				parameter_count,
				expects_return_value,
				..Default::default()
			},
		})
	}

	/// Finish generation. All writers must have been finalized; the result
	/// can be merged with other intermediates or linked.
	pub fn finalize(self) -> Result<Intermediate> {
		debug!(
			types = self.data.types.len(),
			methods = self.data.methods.len(),
			signatures = self.data.signatures.len(),
			"finalizing intermediate"
		);
		Ok(self.data.serialize())
	}
}

fn append_constant_payload(buf: &mut Vec<u8>, value: &Address) {
	match value.payload {
		Payload::I8(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::U8(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
		Payload::Nullptr => buf.extend_from_slice(&0usize.to_le_bytes()),
		_ => {}
	}
}

/// Struct/union member writer, opened by [`Generator::define_type`].
#[derive(Debug)]
pub struct TypeWriter<'g> {
	gen: &'g mut Generator,
	index: TypeIdx,
}

impl TypeWriter<'_> {
	pub fn name(&self) -> NameIdx {
		self.gen.data.types[self.index.index()].name
	}

	pub fn index(&self) -> TypeIdx {
		self.index
	}

	pub fn declare_field(&mut self, ty: TypeIdx, name: NameIdx) -> Result<()> {
		self.gen.validate_nonvoid(ty)?;
		self.gen.validate_name(name)?;

		let entry = &self.gen.data.types[self.index.index()];
		if entry.fields.iter().any(|f| f.name == name) {
			let field = self.gen.data.database.name(name).to_owned();
			let type_name = self.gen.data.database.name(entry.name).to_owned();
			return Err(self.gen.error(
				Errc::GnrFieldRedeclaration,
				format!("field '{field}' has already been declared on type '{type_name}'"),
			));
		}
		self.gen.data.types[self.index.index()].fields.push(Field::new(name, ty));
		Ok(())
	}

	pub fn declare_named_field(&mut self, ty: TypeIdx, name: &str) -> Result<NameIdx> {
		let name = self.gen.make_identifier(name)?;
		self.declare_field(ty, name)?;
		Ok(name)
	}

	pub fn fields(&self) -> &[Field] {
		&self.gen.data.types[self.index.index()].fields
	}

	pub fn finalize(self) -> Result<()> {
		Ok(())
	}
}

#[derive(Default)]
struct MethodState {
	call_lookup: FxHashMap<MethodIdx, u32>,
	global_lookup: FxHashMap<NameIdx, u32>,
	offset_lookup: FxHashMap<OffsetIdx, u32>,

	label_locations: IntMap<LabelIdx, u32>,
	unresolved_branches: IntMap<LabelIdx, Vec<u32>>,
	named_labels: FxHashMap<Box<str>, LabelIdx>,
	/// Name per declared label; anonymous labels hold `None`.
	label_declarations: Vec<Option<Box<str>>>,

	parameter_count: usize,
	expects_return_value: bool,
	last_return: usize,
}

/// Bytecode writer, opened by [`Generator::define_method`]. Instructions are
/// emitted with subcode `0`; the linker replaces them after type analysis.
pub struct MethodWriter<'g> {
	gen: &'g mut Generator,
	index: MethodIdx,
	state: MethodState,
}

impl MethodWriter<'_> {
	pub fn name(&self) -> NameIdx {
		self.gen.data.methods[self.index.index()].name
	}

	pub fn index(&self) -> MethodIdx {
		self.index
	}

	/// Append stack variables; may be called repeatedly.
	pub fn push(&mut self, types: &[TypeIdx]) -> Result<()> {
		for &ty in types {
			self.gen.validate_nonvoid(ty)?;
		}
		let method = &mut self.gen.data.methods[self.index.index()];
		method.stackvars.extend(types.iter().map(|&ty| StackVar::new(ty)));
		Ok(())
	}

	pub fn stack(&self) -> &[StackVar] {
		&self.gen.data.methods[self.index.index()].stackvars
	}

	/// Declare a named label; returns the same id for the same name.
	pub fn declare_label(&mut self, label_name: &str) -> Result<LabelIdx> {
		if !is_identifier(label_name) {
			return Err(self
				.gen
				.error(Errc::GnrInvalidIdentifier, format!("invalid identifier: '{label_name}'")));
		}
		if let Some(&existing) = self.state.named_labels.get(label_name) {
			return Ok(existing);
		}
		let next = LabelIdx::new(self.state.label_declarations.len());
		self.state.label_declarations.push(Some(label_name.into()));
		self.state.named_labels.insert(label_name.into(), next);
		Ok(next)
	}

	/// Declare an anonymous label.
	pub fn declare_anonymous_label(&mut self) -> LabelIdx {
		let next = LabelIdx::new(self.state.label_declarations.len());
		self.state.label_declarations.push(None);
		next
	}

	fn label_display(&self, label: LabelIdx) -> String {
		match &self.state.label_declarations[label.index()] {
			Some(name) => name.to_string(),
			None => label.raw().to_string(),
		}
	}

	/// Anchor a declared label at the current bytecode offset; each label may
	/// be anchored once.
	pub fn write_label(&mut self, label: LabelIdx) -> Result<()> {
		self.validate_label(label)?;
		if self.state.label_locations.contains_key(&label) {
			let display = self.label_display(label);
			return Err(self
				.gen
				.error(Errc::GnrLabelRedeclaration, format!("label '{display}' has already been defined")));
		}
		let position = self.bytecode_len();
		self.state.label_locations.insert(label, position);
		Ok(())
	}

	fn validate_label(&self, label: LabelIdx) -> Result<()> {
		if !label.is_valid() || label.index() >= self.state.label_declarations.len() {
			return Err(self.gen.error(Errc::GnrInvalidIndex, "invalid label index provided"));
		}
		Ok(())
	}

	fn bytecode_len(&self) -> u32 {
		self.gen.data.methods[self.index.index()].bytecode.len() as u32
	}

	fn emit(&mut self, bytes: &[u8]) {
		self.gen.data.methods[self.index.index()].bytecode.extend_from_slice(bytes);
	}

	fn emit_opcode(&mut self, op: Opcode) {
		self.emit(&[op as u8]);
	}

	fn emit_subcode_zero(&mut self) {
		self.emit(&[0]);
	}

	/// LHS operands must be mutable storage: stack slot (or the return-value
	/// slot), parameter, or global.
	fn validate_address(&self, addr: Address) -> Result<()> {
		match addr.header.address_type() {
			AddressType::Stackvar => {
				let index = addr.header.index();
				if index != AddressHeader::INDEX_MAX {
					let count = self.gen.data.methods[self.index.index()].stackvars.len();
					if index as usize >= count {
						return Err(self.gen.error(
							Errc::GnrStackOutOfRange,
							format!("stack index out of range ({index}/{count})"),
						));
					}
				}
			}
			AddressType::Parameter => {
				let index = addr.header.index() as usize;
				if index >= self.state.parameter_count {
					return Err(self.gen.error(
						Errc::GnrParamOutOfRange,
						format!("parameter index out of range ({index}/{})", self.state.parameter_count),
					));
				}
			}
			AddressType::Constant => {
				return Err(self
					.gen
					.error(Errc::GnrInvalidConstant, "constant is not valid as left-hand side operand"));
			}
			AddressType::Global => {}
		}
		Ok(())
	}

	/// RHS operands additionally allow constants, which may carry no
	/// modifier or prefix.
	fn validate_operand(&self, addr: Address) -> Result<()> {
		if addr.header.address_type() == AddressType::Constant {
			if addr.header.prefix() != AddressPrefix::None || addr.header.modifier() != AddressModifier::None {
				return Err(self.gen.error(
					Errc::GnrInvalidConstantAddr,
					"constant address cannot have modifiers or prefixes",
				));
			}
			if matches!(addr.payload, Payload::Identifier(_)) {
				return Err(self
					.gen
					.error(Errc::GnrInvalidConstant, "identifier constants are not valid instruction operands"));
			}
			return Ok(());
		}
		self.validate_address(addr)
	}

	fn write_address(&mut self, addr: Address) {
		let mut header = addr.header;
		let mut payload = 0u64;

		if addr.header.address_type() == AddressType::Global {
			// Translate the identifier into a method-local lookup slot.
			let global_name = NameIdx(addr.header.index());
			let local = match self.state.global_lookup.get(&global_name).copied() {
				Some(idx) => idx,
				None => {
					let method = &mut self.gen.data.methods[self.index.index()];
					let idx = method.globals.len() as u32;
					method.globals.push(global_name);
					self.state.global_lookup.insert(global_name, idx);
					idx
				}
			};
			header.set_index(local);
		}

		match addr.header.modifier() {
			AddressModifier::None => {}
			AddressModifier::DirectField | AddressModifier::IndirectField => {
				let Payload::Field(field) = addr.payload else { unreachable!() };
				let local = match self.state.offset_lookup.get(&field).copied() {
					Some(idx) => idx,
					None => {
						let method = &mut self.gen.data.methods[self.index.index()];
						let idx = method.offsets.len() as u32;
						method.offsets.push(field);
						self.state.offset_lookup.insert(field, idx);
						idx
					}
				};
				payload = u64::from(local);
			}
			AddressModifier::Offset => {
				let Payload::Offset(offset) = addr.payload else { unreachable!() };
				payload = offset as i64 as u64;
			}
		}

		self.emit(&header.raw().to_le_bytes());
		let payload_bytes = payload.to_le_bytes();
		self.emit(&payload_bytes);
	}

	fn write_operand(&mut self, addr: Address) {
		if addr.header.address_type() == AddressType::Constant {
			self.emit(&addr.header.raw().to_le_bytes());
			let method = &mut self.gen.data.methods[self.index.index()];
			append_constant_payload(&mut method.bytecode, &addr);
			return;
		}
		self.write_address(addr);
	}

	fn write_branch_target(&mut self, label: LabelIdx) {
		let position = self.bytecode_len();
		self.state.unresolved_branches.entry(label).or_default().push(position);
		self.emit(&0u32.to_le_bytes());
	}

	pub fn write_noop(&mut self) {
		self.emit_opcode(Opcode::noop);
	}

	fn write_sub_expression_unary(&mut self, op: Opcode, lhs: Address) -> Result<()> {
		self.validate_address(lhs)?;
		self.emit_opcode(op);
		self.emit_subcode_zero();
		self.write_address(lhs);
		Ok(())
	}

	fn write_sub_expression(&mut self, op: Opcode, lhs: Address, rhs: Address) -> Result<()> {
		self.validate_address(lhs)?;
		self.validate_operand(rhs)?;
		self.emit_opcode(op);
		self.emit_subcode_zero();
		self.write_address(lhs);
		self.write_operand(rhs);
		Ok(())
	}

	pub fn write_set(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::set, lhs, rhs)
	}

	pub fn write_conv(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::conv, lhs, rhs)
	}

	pub fn write_not(&mut self, lhs: Address) -> Result<()> {
		self.write_sub_expression_unary(Opcode::ari_not, lhs)
	}

	pub fn write_neg(&mut self, lhs: Address) -> Result<()> {
		self.write_sub_expression_unary(Opcode::ari_neg, lhs)
	}

	pub fn write_mul(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_mul, lhs, rhs)
	}

	pub fn write_div(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_div, lhs, rhs)
	}

	pub fn write_mod(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_mod, lhs, rhs)
	}

	pub fn write_add(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_add, lhs, rhs)
	}

	pub fn write_sub(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_sub, lhs, rhs)
	}

	pub fn write_lsh(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_lsh, lhs, rhs)
	}

	pub fn write_rsh(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_rsh, lhs, rhs)
	}

	pub fn write_and(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_and, lhs, rhs)
	}

	pub fn write_xor(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_xor, lhs, rhs)
	}

	pub fn write_or(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ari_or, lhs, rhs)
	}

	pub fn write_padd(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::padd, lhs, rhs)
	}

	pub fn write_psub(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::psub, lhs, rhs)
	}

	/// `pdif` carries no subcode; its operand types fix the evaluator.
	pub fn write_pdif(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.validate_address(lhs)?;
		self.validate_operand(rhs)?;
		self.emit_opcode(Opcode::pdif);
		self.write_address(lhs);
		self.write_operand(rhs);
		Ok(())
	}

	pub fn write_cmp(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::cmp, lhs, rhs)
	}

	pub fn write_ceq(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::ceq, lhs, rhs)
	}

	pub fn write_cne(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::cne, lhs, rhs)
	}

	pub fn write_cgt(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::cgt, lhs, rhs)
	}

	pub fn write_cge(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::cge, lhs, rhs)
	}

	pub fn write_clt(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::clt, lhs, rhs)
	}

	pub fn write_cle(&mut self, lhs: Address, rhs: Address) -> Result<()> {
		self.write_sub_expression(Opcode::cle, lhs, rhs)
	}

	pub fn write_cze(&mut self, lhs: Address) -> Result<()> {
		self.write_sub_expression_unary(Opcode::cze, lhs)
	}

	pub fn write_cnz(&mut self, lhs: Address) -> Result<()> {
		self.write_sub_expression_unary(Opcode::cnz, lhs)
	}

	pub fn write_br(&mut self, label: LabelIdx) -> Result<()> {
		self.validate_label(label)?;
		self.emit_opcode(Opcode::br);
		self.write_branch_target(label);
		Ok(())
	}

	fn write_branch(&mut self, op: Opcode, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.validate_label(label)?;
		self.validate_address(lhs)?;
		self.validate_operand(rhs)?;
		self.emit_opcode(op);
		self.write_branch_target(label);
		self.emit_subcode_zero();
		self.write_address(lhs);
		self.write_operand(rhs);
		Ok(())
	}

	fn write_branch_unary(&mut self, op: Opcode, label: LabelIdx, lhs: Address) -> Result<()> {
		self.validate_label(label)?;
		self.validate_address(lhs)?;
		self.emit_opcode(op);
		self.write_branch_target(label);
		self.emit_subcode_zero();
		self.write_address(lhs);
		Ok(())
	}

	pub fn write_beq(&mut self, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.write_branch(Opcode::beq, label, lhs, rhs)
	}

	pub fn write_bne(&mut self, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.write_branch(Opcode::bne, label, lhs, rhs)
	}

	pub fn write_bgt(&mut self, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.write_branch(Opcode::bgt, label, lhs, rhs)
	}

	pub fn write_bge(&mut self, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.write_branch(Opcode::bge, label, lhs, rhs)
	}

	pub fn write_blt(&mut self, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.write_branch(Opcode::blt, label, lhs, rhs)
	}

	pub fn write_ble(&mut self, label: LabelIdx, lhs: Address, rhs: Address) -> Result<()> {
		self.write_branch(Opcode::ble, label, lhs, rhs)
	}

	pub fn write_bze(&mut self, label: LabelIdx, lhs: Address) -> Result<()> {
		self.write_branch_unary(Opcode::bze, label, lhs)
	}

	pub fn write_bnz(&mut self, label: LabelIdx, lhs: Address) -> Result<()> {
		self.write_branch_unary(Opcode::bnz, label, lhs)
	}

	pub fn write_sw(&mut self, addr: Address, labels: &[LabelIdx]) -> Result<()> {
		if labels.is_empty() {
			return Err(self.gen.error(Errc::GnrArrayLengthZero, "switch label list cannot be empty"));
		}
		for &label in labels {
			self.validate_label(label)?;
		}
		self.validate_address(addr)?;
		self.emit_opcode(Opcode::sw);
		self.write_address(addr);
		self.emit(&(labels.len() as u32).to_le_bytes());
		for &label in labels {
			self.write_branch_target(label);
		}
		Ok(())
	}

	pub fn write_call(&mut self, method: MethodIdx, args: &[Address]) -> Result<()> {
		if !method.is_valid() || method.index() >= self.gen.data.methods.len() {
			return Err(self.gen.error(Errc::GnrInvalidIndex, "invalid method index provided"));
		}
		if args.len() > METHOD_PARAMETER_MAX {
			return Err(self.gen.error(
				Errc::GnrParameterOverflow,
				format!("method parameter count exceeds maximum ({}/{})", args.len(), METHOD_PARAMETER_MAX),
			));
		}
		for &arg in args {
			self.validate_operand(arg)?;
		}

		self.emit_opcode(Opcode::call);
		let local = match self.state.call_lookup.get(&method).copied() {
			Some(idx) => idx,
			None => {
				let entry = &mut self.gen.data.methods[self.index.index()];
				let idx = entry.calls.len() as u32;
				entry.calls.push(method);
				self.state.call_lookup.insert(method, idx);
				idx
			}
		};
		self.emit(&local.to_le_bytes());
		self.emit(&[args.len() as u8]);
		for &arg in args {
			self.emit_subcode_zero();
			self.write_operand(arg);
		}
		Ok(())
	}

	pub fn write_callv(&mut self, addr: Address, args: &[Address]) -> Result<()> {
		if args.len() > METHOD_PARAMETER_MAX {
			return Err(self.gen.error(
				Errc::GnrParameterOverflow,
				format!("method parameter count exceeds maximum ({}/{})", args.len(), METHOD_PARAMETER_MAX),
			));
		}
		self.validate_address(addr)?;
		for &arg in args {
			self.validate_operand(arg)?;
		}

		self.emit_opcode(Opcode::callv);
		self.write_address(addr);
		self.emit(&[args.len() as u8]);
		for &arg in args {
			self.emit_subcode_zero();
			self.write_operand(arg);
		}
		Ok(())
	}

	pub fn write_ret(&mut self) -> Result<()> {
		if self.state.expects_return_value {
			return Err(self.method_return_error());
		}
		self.emit_opcode(Opcode::ret);
		self.state.last_return = self.bytecode_len() as usize;
		Ok(())
	}

	pub fn write_retv(&mut self, addr: Address) -> Result<()> {
		if !self.state.expects_return_value {
			return Err(self.method_return_error());
		}
		self.validate_operand(addr)?;
		self.emit_opcode(Opcode::retv);
		self.emit_subcode_zero();
		self.write_operand(addr);
		self.state.last_return = self.bytecode_len() as usize;
		Ok(())
	}

	pub fn write_dump(&mut self, addr: Address) -> Result<()> {
		self.validate_operand(addr)?;
		self.emit_opcode(Opcode::dump);
		self.write_operand(addr);
		Ok(())
	}

	fn method_return_error(&self) -> Error {
		let method = &self.gen.data.methods[self.index.index()];
		let name = self.gen.data.database.name(method.name).to_owned();
		self.gen.error(
			Errc::GnrInvalidRetVal,
			format!("method return value does not match declaration of '{name}'"),
		)
	}

	/// Patch branch targets, export anchored labels, and enforce the
	/// terminating-return rule.
	pub fn finalize(mut self) -> Result<()> {
		if self.state.expects_return_value {
			let len = self.bytecode_len() as usize;
			if len == 0 || self.state.last_return != len {
				let method = &self.gen.data.methods[self.index.index()];
				let name = self.gen.data.database.name(method.name).to_owned();
				return Err(self.gen.error(
					Errc::GnrMissingRetVal,
					format!("method '{name}' is expecting a return value"),
				));
			}
		}

		// Every referenced label must have been anchored.
		let mut anchored: Vec<u32> = Vec::new();
		let branches = std::mem::take(&mut self.state.unresolved_branches);
		for (label, positions) in &branches {
			let Some(&location) = self.state.label_locations.get(label) else {
				let display = self.label_display(*label);
				return Err(self
					.gen
					.error(Errc::GnrLabelUndefined, format!("undefined label '{display}'")));
			};
			let method = &mut self.gen.data.methods[self.index.index()];
			for &position in positions {
				let range = position as usize..position as usize + 4;
				method.bytecode[range].copy_from_slice(&location.to_le_bytes());
			}
			anchored.push(location);
		}
		anchored.sort_unstable();
		anchored.dedup();

		// A label anchored past the last instruction implies an implicit
		// return for void methods.
		if let Some(&last) = anchored.last() {
			if last as usize >= self.gen.data.methods[self.index.index()].bytecode.len() {
				if self.state.expects_return_value {
					return Err(self.method_return_error());
				}
				self.emit_opcode(Opcode::ret);
			}
		}

		self.gen.data.methods[self.index.index()].labels = anchored;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identifier_validation() {
		let mut gen = Generator::new();
		assert!(gen.make_identifier("main").is_ok());
		let err = gen.make_identifier("3x").unwrap_err();
		assert_eq!(err.code, Errc::GnrInvalidIdentifier);
	}

	#[test]
	fn declare_type_is_idempotent() {
		let mut gen = Generator::new();
		let name = gen.make_identifier("vec").unwrap();
		let a = gen.declare_type(name).unwrap();
		let b = gen.declare_type(name).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn define_type_twice_fails() {
		let mut gen = Generator::new();
		let name = gen.make_identifier("vec").unwrap();
		let ty = gen.declare_type(name).unwrap();
		{
			let mut writer = gen.define_type(ty, false).unwrap();
			writer.declare_named_field(TypeIdx::I32, "x").unwrap();
			writer.finalize().unwrap();
		}
		let err = gen.define_type(ty, false).unwrap_err();
		assert_eq!(err.code, Errc::GnrTypeRedeclaration);
	}

	#[test]
	fn field_redeclaration_fails() {
		let mut gen = Generator::new();
		let name = gen.make_identifier("vec").unwrap();
		let ty = gen.declare_type(name).unwrap();
		let mut writer = gen.define_type(ty, false).unwrap();
		writer.declare_named_field(TypeIdx::I32, "x").unwrap();
		let err = writer.declare_named_field(TypeIdx::I32, "x").unwrap_err();
		assert_eq!(err.code, Errc::GnrFieldRedeclaration);
	}

	#[test]
	fn void_stack_variable_fails() {
		let mut gen = Generator::new();
		let sig = gen.make_signature(TypeIdx::VOID, &[]).unwrap();
		let name = gen.make_identifier("m").unwrap();
		let method = gen.declare_method(name).unwrap();
		let mut writer = gen.define_method(method, sig).unwrap();
		let err = writer.push(&[TypeIdx::VOID]).unwrap_err();
		assert_eq!(err.code, Errc::GnrInvalidVoidType);
	}

	#[test]
	fn derived_types_are_deduplicated() {
		let mut gen = Generator::new();
		let a = gen.declare_pointer_type(TypeIdx::I32).unwrap();
		let b = gen.declare_pointer_type(TypeIdx::I32).unwrap();
		assert_eq!(a, b);
		let c = gen.declare_array_type(TypeIdx::I32, 3).unwrap();
		let d = gen.declare_array_type(TypeIdx::I32, 3).unwrap();
		assert_eq!(c, d);
		assert_ne!(gen.declare_array_type(TypeIdx::I32, 4).unwrap(), c);
		let err = gen.declare_array_type(TypeIdx::I32, 0).unwrap_err();
		assert_eq!(err.code, Errc::GnrArrayLengthZero);
	}

	#[test]
	fn signatures_are_deduplicated() {
		let mut gen = Generator::new();
		let a = gen.make_signature(TypeIdx::I32, &[TypeIdx::I32]).unwrap();
		let b = gen.make_signature(TypeIdx::I32, &[TypeIdx::I32]).unwrap();
		assert_eq!(a, b);
		assert_ne!(gen.make_signature(TypeIdx::I32, &[]).unwrap(), a);
	}

	#[test]
	fn missing_return_value_fails_finalize() {
		let mut gen = Generator::new();
		let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
		let name = gen.make_identifier("main").unwrap();
		let method = gen.declare_method(name).unwrap();
		let writer = gen.define_method(method, sig).unwrap();
		let err = writer.finalize().unwrap_err();
		assert_eq!(err.code, Errc::GnrMissingRetVal);
	}

	#[test]
	fn unanchored_label_fails_finalize() {
		let mut gen = Generator::new();
		let sig = gen.make_signature(TypeIdx::VOID, &[]).unwrap();
		let name = gen.make_identifier("m").unwrap();
		let method = gen.declare_method(name).unwrap();
		let mut writer = gen.define_method(method, sig).unwrap();
		let label = writer.declare_label("exit").unwrap();
		writer.write_br(label).unwrap();
		let err = writer.finalize().unwrap_err();
		assert_eq!(err.code, Errc::GnrLabelUndefined);
	}

	#[test]
	fn label_anchor_twice_fails() {
		let mut gen = Generator::new();
		let sig = gen.make_signature(TypeIdx::VOID, &[]).unwrap();
		let name = gen.make_identifier("m").unwrap();
		let method = gen.declare_method(name).unwrap();
		let mut writer = gen.define_method(method, sig).unwrap();
		let label = writer.declare_label("spot").unwrap();
		writer.write_label(label).unwrap();
		let err = writer.write_label(label).unwrap_err();
		assert_eq!(err.code, Errc::GnrLabelRedeclaration);
	}

	#[test]
	fn constant_lhs_is_rejected() {
		let mut gen = Generator::new();
		let sig = gen.make_signature(TypeIdx::VOID, &[]).unwrap();
		let name = gen.make_identifier("m").unwrap();
		let method = gen.declare_method(name).unwrap();
		let mut writer = gen.define_method(method, sig).unwrap();
		writer.push(&[TypeIdx::I32]).unwrap();
		let err = writer.write_set(Address::from(1i32), Address::stack(0)).unwrap_err();
		assert_eq!(err.code, Errc::GnrInvalidConstant);
	}

	#[test]
	fn offsets_are_deduplicated_and_appendable() {
		let mut gen = Generator::new();
		let vec_name = gen.make_identifier("vec").unwrap();
		let ty = gen.declare_type(vec_name).unwrap();
		let x = gen.make_identifier("x").unwrap();
		let y = gen.make_identifier("y").unwrap();
		let a = gen.make_offset(ty, &[x]).unwrap();
		assert_eq!(gen.make_offset(ty, &[x]).unwrap(), a);
		let appended = gen.append_offset(a, &[y]).unwrap();
		assert_eq!(gen.make_offset(ty, &[x, y]).unwrap(), appended);
		let err = gen.make_offset(ty, &[]).unwrap_err();
		assert_eq!(err.code, Errc::GnrEmptyOffset);
	}
}
