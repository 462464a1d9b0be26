use fxhash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::block::{BlockReader, BlockWriter};
use crate::database::{Database, Lookup, MetaTable};
use crate::errors::{Errc, Error, Result};
use crate::indices::{
	BASE_TYPES, GlobalIdx, MethodIdx, MetaIdx, NameIdx, OffsetIdx, SignatureIdx, TypeIdx,
	offset_type, size_type,
};
use crate::method::Method;
use crate::runtime::CallIdx;
use crate::types::{Field, FieldAddress, Generated, Metadata, MethodFlags, Signature, StackVar, Type, TypeFlags};
use crate::version::ToolchainVersion;

pub(crate) const INTERMEDIATE_HEADER: &[u8] = b"PINT";
pub(crate) const ASSEMBLY_HEADER: &[u8] = b"PASM";
pub(crate) const FOOTER: &[u8] = b"END";

/// Global or constant storage: info entries plus one flat initializer blob.
#[derive(Debug, Default, Clone)]
pub struct DataTable {
	pub info: Vec<Field>,
	pub data: Vec<u8>,
}

/// Unlinked compilation state produced by the generator and consumed by the
/// linker. Lookup maps are rebuilt after deserialization rather than
/// serialized.
#[derive(Debug, Default)]
pub(crate) struct GenData {
	pub database: Database,
	pub metatable: MetaTable,
	pub types: Vec<Type>,
	pub methods: Vec<Method>,
	pub signatures: Vec<Signature>,
	pub offsets: Vec<FieldAddress>,
	pub globals: DataTable,
	pub constants: DataTable,

	pub signature_lookup: FxHashMap<Vec<u8>, SignatureIdx>,
	pub offset_lookup: FxHashMap<Vec<u8>, OffsetIdx>,
	pub array_lookup: FxHashMap<(TypeIdx, usize), TypeIdx>,
}

impl GenData {
	/// Seed the type table with the base types and their database entries,
	/// plus the pointer-width alias names.
	pub fn initialize_base_types(&mut self) {
		debug_assert!(self.types.is_empty());
		for info in BASE_TYPES {
			let name = self.database.emplace(info.name);
			self.database.set_lookup(name, Lookup::Type(info.index));
			let mut ty = Type::new(name, info.index);
			ty.flags |= TypeFlags::DEFINED;
			self.types.push(ty);
		}
		let offset_alias = self.database.emplace("offset");
		self.database.set_lookup(offset_alias, Lookup::Type(offset_type()));
		let size_alias = self.database.emplace("size");
		self.database.set_lookup(size_alias, Lookup::Type(size_type()));
	}

	/// Rebuild the caches that tie generated types to their base: the
	/// pointer/signature back references and the array dedup map.
	pub fn restore_generated_types(&mut self) {
		self.array_lookup.clear();
		for i in 0..self.types.len() {
			let index = self.types[i].index;
			match self.types[i].generated {
				Some(Generated::Pointer { underlying_type, .. }) => {
					self.types[underlying_type.index()].pointer_type = index;
				}
				Some(Generated::Array { underlying_type, array_size }) => {
					self.array_lookup.insert((underlying_type, array_size), index);
				}
				Some(Generated::Signature { index: sig }) => {
					self.signatures[sig.index()].signature_type = index;
				}
				None => {}
			}
		}

		self.signature_lookup.clear();
		let mut keybuf = Vec::new();
		for sig in &self.signatures {
			let params: SmallVec<[TypeIdx; 8]> = sig.parameters.iter().map(|p| p.ty).collect();
			Signature::make_key(sig.return_type, &params, &mut keybuf);
			self.signature_lookup.insert(keybuf.clone(), sig.index);
		}

		self.offset_lookup.clear();
		for (i, offset) in self.offsets.iter().enumerate() {
			FieldAddress::make_key(offset.object_type, &offset.field_names, &mut keybuf);
			self.offset_lookup.insert(keybuf.clone(), OffsetIdx::new(i));
		}
	}

	pub fn serialize(&self) -> Intermediate {
		let mut writer = BlockWriter::new();
		writer.write_bytes(INTERMEDIATE_HEADER);
		writer.write_bytes(&ToolchainVersion::current().to_bytes());
		write_payload(&mut writer, self);
		let mut content = writer.finalize();
		content.extend_from_slice(FOOTER);
		Intermediate { content }
	}

	pub fn deserialize(im: &Intermediate) -> Result<GenData> {
		if !im.is_valid() {
			return Err(Error::new(Errc::LnkInvalidIntermediate, "attempted to link an invalid intermediate"));
		}
		if !im.is_compatible() {
			return Err(Error::new(
				Errc::LnkIncompatibleIntermediate,
				"attempted to link an intermediate that was built using an incompatible toolchain",
			));
		}
		let payload = &im.content[INTERMEDIATE_HEADER.len() + 8..im.content.len() - FOOTER.len()];
		let mut reader = BlockReader::new(payload, Errc::LnkInvalidIntermediate);
		let mut data = read_payload(&mut reader, Errc::LnkInvalidIntermediate)?;
		data.restore_generated_types();
		Ok(data)
	}
}

/// A serialized, not-yet-resolved compilation unit (`"PINT"` framing).
#[derive(Debug, Default, Clone)]
pub struct Intermediate {
	content: Vec<u8>,
}

impl Intermediate {
	pub fn is_valid(&self) -> bool {
		validate_framing(&self.content, INTERMEDIATE_HEADER)
	}

	pub fn version(&self) -> ToolchainVersion {
		frame_version(&self.content, INTERMEDIATE_HEADER)
	}

	pub fn is_compatible(&self) -> bool {
		self.version().is_compatible()
	}

	pub fn data(&self) -> &[u8] {
		&self.content
	}

	/// Adopt previously serialized bytes; fails on bad framing.
	pub fn load(bytes: &[u8]) -> Result<Intermediate> {
		if !validate_framing(bytes, INTERMEDIATE_HEADER) {
			return Err(Error::new(Errc::LnkInvalidIntermediate, "invalid intermediate image"));
		}
		Ok(Intermediate { content: bytes.to_vec() })
	}

	/// Merge another intermediate into this one, returning the combined unit.
	/// Declarations are reconciled by name; colliding definitions fail with
	/// the matching redeclaration error.
	pub fn merge(&self, other: &Intermediate) -> Result<Intermediate> {
		let dst = GenData::deserialize(self)?;
		let src = GenData::deserialize(other)?;
		let merged = merge_data(dst, src)?;
		Ok(merged.serialize())
	}
}

pub(crate) fn validate_framing(content: &[u8], header: &[u8]) -> bool {
	content.len() >= header.len() + 8 + FOOTER.len()
		&& &content[..header.len()] == header
		&& &content[content.len() - FOOTER.len()..] == FOOTER
}

pub(crate) fn frame_version(content: &[u8], header: &[u8]) -> ToolchainVersion {
	if content.len() < header.len() + 8 {
		return ToolchainVersion::default();
	}
	let bytes: [u8; 8] = content[header.len()..header.len() + 8].try_into().unwrap();
	ToolchainVersion::from_bytes(bytes)
}

// Payload serialization. Collections are deferred blocks; scalar fields are
// written directly, indices as u32 and sizes as u64.

fn write_lookup(w: &mut BlockWriter, value: Lookup) {
	match value {
		Lookup::Identifier => {
			w.write_u8(0);
			w.write_u32(crate::indices::INVALID_INDEX);
		}
		Lookup::Type(idx) => {
			w.write_u8(1);
			w.write_u32(idx.raw());
		}
		Lookup::Method(idx) => {
			w.write_u8(2);
			w.write_u32(idx.raw());
		}
		Lookup::Global(idx) => {
			w.write_u8(3);
			w.write_u32(idx.raw());
		}
		Lookup::Constant(idx) => {
			w.write_u8(4);
			w.write_u32(idx.raw());
		}
	}
}

fn read_lookup(r: &mut BlockReader, fail: Errc) -> Result<Lookup> {
	let kind = r.read_u8()?;
	let index = r.read_u32()?;
	Ok(match kind {
		0 => Lookup::Identifier,
		1 => Lookup::Type(TypeIdx(index)),
		2 => Lookup::Method(MethodIdx(index)),
		3 => Lookup::Global(GlobalIdx(index)),
		4 => Lookup::Constant(GlobalIdx(index)),
		_ => return Err(Error::new(fail, "malformed database entry")),
	})
}

pub(crate) fn write_database(w: &mut BlockWriter, db: &Database) {
	w.write_deferred(|entries| {
		let mut count = 0;
		for (offset, length, value) in db.raw_entries() {
			entries.write_u32(offset);
			entries.write_u32(length);
			write_lookup(entries, value);
			count += 1;
		}
		entries.increment_count(count);
	});
	w.write_deferred(|strings| {
		strings.write_bytes(db.string_blob().as_bytes());
		strings.increment_count(db.string_blob().len() as u32);
	});
}

pub(crate) fn read_database(r: &mut BlockReader, fail: Errc) -> Result<Database> {
	let (mut entries_reader, entry_count) = r.read_deferred()?;
	let mut entries = Vec::with_capacity(entry_count);
	for _ in 0..entry_count {
		let offset = entries_reader.read_u32()?;
		let length = entries_reader.read_u32()?;
		let value = read_lookup(&mut entries_reader, fail)?;
		entries.push((offset, length, value));
	}
	let (mut blob_reader, blob_len) = r.read_deferred()?;
	let blob = std::str::from_utf8(blob_reader.read_bytes(blob_len)?)
		.map_err(|_| Error::new(fail, "malformed identifier blob"))?
		.to_owned();
	Ok(Database::from_parts(blob, entries))
}

pub(crate) fn write_metatable(w: &mut BlockWriter, table: &MetaTable) {
	w.write_deferred(|entries| {
		let mut count = 0;
		for name in table.iter() {
			entries.write_u32(name.len() as u32);
			entries.write_bytes(name.as_bytes());
			count += 1;
		}
		entries.increment_count(count);
	});
}

pub(crate) fn read_metatable(r: &mut BlockReader, fail: Errc) -> Result<MetaTable> {
	let (mut entries, count) = r.read_deferred()?;
	let mut table = MetaTable::default();
	for _ in 0..count {
		let length = entries.read_u32()? as usize;
		let name = std::str::from_utf8(entries.read_bytes(length)?)
			.map_err(|_| Error::new(fail, "malformed metadata entry"))?;
		table.emplace(name);
	}
	Ok(table)
}

fn write_meta(w: &mut BlockWriter, meta: Metadata) {
	w.write_u32(meta.index.raw());
	w.write_u32(meta.line_number);
}

fn read_meta(r: &mut BlockReader) -> Result<Metadata> {
	Ok(Metadata { index: MetaIdx(r.read_u32()?), line_number: r.read_u32()? })
}

pub(crate) fn write_types(w: &mut BlockWriter, types: &[Type]) {
	w.write_deferred(|list| {
		for ty in types {
			list.write_u32(ty.name.raw());
			list.write_u32(ty.index.raw());
			list.write_u32(ty.flags.bits());
			list.write_usize(ty.total_size);
			list.write_u32(ty.pointer_type.raw());
			write_meta(list, ty.meta);
			match ty.generated {
				None => list.write_u8(0),
				Some(Generated::Pointer { underlying_type, underlying_size }) => {
					list.write_u8(1);
					list.write_u32(underlying_type.raw());
					list.write_usize(underlying_size);
				}
				Some(Generated::Array { underlying_type, array_size }) => {
					list.write_u8(2);
					list.write_u32(underlying_type.raw());
					list.write_usize(array_size);
				}
				Some(Generated::Signature { index }) => {
					list.write_u8(3);
					list.write_u32(index.raw());
				}
			}
			list.write_deferred(|fields| {
				for field in &ty.fields {
					fields.write_u32(field.name.raw());
					fields.write_u32(field.ty.raw());
					fields.write_usize(field.offset);
				}
				fields.increment_count(ty.fields.len() as u32);
			});
		}
		list.increment_count(types.len() as u32);
	});
}

pub(crate) fn read_types(r: &mut BlockReader, fail: Errc) -> Result<Vec<Type>> {
	let (mut list, count) = r.read_deferred()?;
	let mut types = Vec::with_capacity(count);
	for _ in 0..count {
		let name = NameIdx(list.read_u32()?);
		let index = TypeIdx(list.read_u32()?);
		let flags = TypeFlags::from_bits_retain(list.read_u32()?);
		let total_size = list.read_usize()?;
		let pointer_type = TypeIdx(list.read_u32()?);
		let meta = read_meta(&mut list)?;
		let generated = match list.read_u8()? {
			0 => None,
			1 => Some(Generated::Pointer {
				underlying_type: TypeIdx(list.read_u32()?),
				underlying_size: list.read_usize()?,
			}),
			2 => Some(Generated::Array {
				underlying_type: TypeIdx(list.read_u32()?),
				array_size: list.read_usize()?,
			}),
			3 => Some(Generated::Signature { index: SignatureIdx(list.read_u32()?) }),
			_ => return Err(Error::new(fail, "malformed type entry")),
		};
		let (mut fields_reader, field_count) = list.read_deferred()?;
		let mut fields = Vec::with_capacity(field_count);
		for _ in 0..field_count {
			fields.push(Field {
				name: NameIdx(fields_reader.read_u32()?),
				ty: TypeIdx(fields_reader.read_u32()?),
				offset: fields_reader.read_usize()?,
			});
		}
		let mut ty = Type::new(name, index);
		ty.flags = flags;
		ty.total_size = total_size;
		ty.pointer_type = pointer_type;
		ty.meta = meta;
		ty.generated = generated;
		ty.fields = fields;
		types.push(ty);
	}
	Ok(types)
}

fn write_stackvars(w: &mut BlockWriter, vars: &[StackVar]) {
	w.write_deferred(|list| {
		for var in vars {
			list.write_u32(var.ty.raw());
			list.write_usize(var.offset);
		}
		list.increment_count(vars.len() as u32);
	});
}

fn read_stackvars(r: &mut BlockReader) -> Result<Vec<StackVar>> {
	let (mut list, count) = r.read_deferred()?;
	let mut vars = Vec::with_capacity(count);
	for _ in 0..count {
		vars.push(StackVar { ty: TypeIdx(list.read_u32()?), offset: list.read_usize()? });
	}
	Ok(vars)
}

fn write_index_list(w: &mut BlockWriter, indices: impl ExactSizeIterator<Item = u32>) {
	w.write_deferred(|list| {
		let count = indices.len() as u32;
		for index in indices {
			list.write_u32(index);
		}
		list.increment_count(count);
	});
}

fn read_index_list(r: &mut BlockReader) -> Result<Vec<u32>> {
	let (mut list, count) = r.read_deferred()?;
	let mut indices = Vec::with_capacity(count);
	for _ in 0..count {
		indices.push(list.read_u32()?);
	}
	Ok(indices)
}

pub(crate) fn write_methods(w: &mut BlockWriter, methods: &[Method]) {
	w.write_deferred(|list| {
		for method in methods {
			list.write_u32(method.name.raw());
			list.write_u32(method.index.raw());
			list.write_u32(method.flags.bits());
			list.write_u32(method.signature.raw());
			write_meta(list, method.meta);
			list.write_usize(method.method_stack_size);
			list.write_usize(method.total_stack_size);
			match method.external_call {
				Some(call) => {
					list.write_u32(call.library);
					list.write_u32(call.index);
				}
				None => {
					list.write_u32(crate::indices::INVALID_INDEX);
					list.write_u32(crate::indices::INVALID_INDEX);
				}
			}
			list.write_deferred(|code| {
				code.write_bytes(&method.bytecode);
				code.increment_count(method.bytecode.len() as u32);
			});
			write_index_list(list, method.labels.iter().copied());
			write_stackvars(list, &method.stackvars);
			write_index_list(list, method.calls.iter().map(|c| c.raw()));
			write_index_list(list, method.globals.iter().map(|g| g.raw()));
			write_index_list(list, method.offsets.iter().map(|o| o.raw()));
		}
		list.increment_count(methods.len() as u32);
	});
}

pub(crate) fn read_methods(r: &mut BlockReader) -> Result<Vec<Method>> {
	let (mut list, count) = r.read_deferred()?;
	let mut methods = Vec::with_capacity(count);
	for _ in 0..count {
		let mut method = Method::new(NameIdx(list.read_u32()?), MethodIdx(list.read_u32()?));
		method.flags = MethodFlags::from_bits_retain(list.read_u32()?);
		method.signature = SignatureIdx(list.read_u32()?);
		method.meta = read_meta(&mut list)?;
		method.method_stack_size = list.read_usize()?;
		method.total_stack_size = list.read_usize()?;
		let library = list.read_u32()?;
		let call = list.read_u32()?;
		if library != crate::indices::INVALID_INDEX {
			method.external_call = Some(CallIdx { library, index: call });
		}
		let (mut code, code_len) = list.read_deferred()?;
		method.bytecode = code.read_bytes(code_len)?.to_vec();
		method.labels = read_index_list(&mut list)?;
		method.stackvars = read_stackvars(&mut list)?;
		method.calls = read_index_list(&mut list)?.into_iter().map(MethodIdx).collect();
		method.globals = read_index_list(&mut list)?.into_iter().map(NameIdx).collect();
		method.offsets = read_index_list(&mut list)?.into_iter().map(OffsetIdx).collect();
		methods.push(method);
	}
	Ok(methods)
}

pub(crate) fn write_signatures(w: &mut BlockWriter, signatures: &[Signature]) {
	w.write_deferred(|list| {
		for sig in signatures {
			list.write_u32(sig.index.raw());
			list.write_u32(sig.return_type.raw());
			list.write_usize(sig.parameters_size);
			list.write_u8(sig.is_resolved as u8);
			write_stackvars(list, &sig.parameters);
		}
		list.increment_count(signatures.len() as u32);
	});
}

pub(crate) fn read_signatures(r: &mut BlockReader) -> Result<Vec<Signature>> {
	let (mut list, count) = r.read_deferred()?;
	let mut signatures = Vec::with_capacity(count);
	for _ in 0..count {
		let mut sig = Signature::new(SignatureIdx(list.read_u32()?), TypeIdx(list.read_u32()?));
		sig.parameters_size = list.read_usize()?;
		sig.is_resolved = list.read_u8()? != 0;
		sig.parameters = read_stackvars(&mut list)?.into();
		signatures.push(sig);
	}
	Ok(signatures)
}

pub(crate) fn write_offsets(w: &mut BlockWriter, offsets: &[FieldAddress]) {
	w.write_deferred(|list| {
		for offset in offsets {
			list.write_u32(offset.object_type.raw());
			list.write_u32(offset.ty.raw());
			list.write_usize(offset.offset);
			write_index_list(list, offset.field_names.iter().map(|n| n.raw()));
		}
		list.increment_count(offsets.len() as u32);
	});
}

pub(crate) fn read_offsets(r: &mut BlockReader) -> Result<Vec<FieldAddress>> {
	let (mut list, count) = r.read_deferred()?;
	let mut offsets = Vec::with_capacity(count);
	for _ in 0..count {
		let object_type = TypeIdx(list.read_u32()?);
		let ty = TypeIdx(list.read_u32()?);
		let offset = list.read_usize()?;
		let field_names: SmallVec<[NameIdx; 4]> =
			read_index_list(&mut list)?.into_iter().map(NameIdx).collect();
		let mut addr = FieldAddress::new(object_type, field_names);
		addr.ty = ty;
		addr.offset = offset;
		offsets.push(addr);
	}
	Ok(offsets)
}

pub(crate) fn write_data_table(w: &mut BlockWriter, table: &DataTable) {
	w.write_deferred(|info| {
		for field in &table.info {
			info.write_u32(field.name.raw());
			info.write_u32(field.ty.raw());
			info.write_usize(field.offset);
		}
		info.increment_count(table.info.len() as u32);
	});
	w.write_deferred(|data| {
		data.write_bytes(&table.data);
		data.increment_count(table.data.len() as u32);
	});
}

pub(crate) fn read_data_table(r: &mut BlockReader) -> Result<DataTable> {
	let (mut info_reader, info_count) = r.read_deferred()?;
	let mut info = Vec::with_capacity(info_count);
	for _ in 0..info_count {
		info.push(Field {
			name: NameIdx(info_reader.read_u32()?),
			ty: TypeIdx(info_reader.read_u32()?),
			offset: info_reader.read_usize()?,
		});
	}
	let (mut data_reader, data_len) = r.read_deferred()?;
	let data = data_reader.read_bytes(data_len)?.to_vec();
	Ok(DataTable { info, data })
}

fn write_payload(w: &mut BlockWriter, data: &GenData) {
	write_database(w, &data.database);
	write_metatable(w, &data.metatable);
	write_types(w, &data.types);
	write_methods(w, &data.methods);
	write_signatures(w, &data.signatures);
	write_offsets(w, &data.offsets);
	write_data_table(w, &data.globals);
	write_data_table(w, &data.constants);
}

fn read_payload(r: &mut BlockReader, fail: Errc) -> Result<GenData> {
	let database = read_database(r, fail)?;
	let metatable = read_metatable(r, fail)?;
	let types = read_types(r, fail)?;
	let methods = read_methods(r)?;
	let signatures = read_signatures(r)?;
	let offsets = read_offsets(r)?;
	let globals = read_data_table(r)?;
	let constants = read_data_table(r)?;
	Ok(GenData {
		database,
		metatable,
		types,
		methods,
		signatures,
		offsets,
		globals,
		constants,
		..Default::default()
	})
}

// Intermediate merging. Declarations are reconciled by name; indices from the
// source unit are remapped into the destination.

struct MergeMaps {
	names: Vec<NameIdx>,
	metas: Vec<MetaIdx>,
	types: Vec<TypeIdx>,
	methods: Vec<MethodIdx>,
	signatures: Vec<SignatureIdx>,
	offsets: Vec<OffsetIdx>,
}

fn merge_data(mut dst: GenData, src: GenData) -> Result<GenData> {
	debug!(
		src_types = src.types.len(),
		src_methods = src.methods.len(),
		"merging intermediate"
	);

	let mut maps = MergeMaps {
		names: Vec::with_capacity(src.database.len()),
		metas: Vec::with_capacity(src.metatable.len()),
		types: vec![TypeIdx::INVALID; src.types.len()],
		methods: vec![MethodIdx::INVALID; src.methods.len()],
		signatures: vec![SignatureIdx::INVALID; src.signatures.len()],
		offsets: vec![OffsetIdx::INVALID; src.offsets.len()],
	};

	for (_, name, _) in src.database.iter() {
		maps.names.push(dst.database.emplace(name));
	}
	for name in src.metatable.iter() {
		maps.metas.push(dst.metatable.emplace(name));
	}

	// Declarations of named types. Definitions are adopted afterwards so
	// field type references (which may point forward) can be remapped.
	for src_type in &src.types {
		if src_type.generated.is_some() {
			continue;
		}
		let name = maps.names[src_type.name.index()];
		let mapped = match dst.database.lookup(name) {
			Lookup::Type(existing) => {
				let dst_type = &dst.types[existing.index()];
				if src_type.is_defined() && dst_type.is_defined() && !crate::indices::is_base_type(existing) {
					return Err(Error::new(
						Errc::GnrTypeRedeclaration,
						format!("type '{}' has already been declared", dst.database.name(name)),
					));
				}
				existing
			}
			Lookup::Identifier => {
				let index = TypeIdx::new(dst.types.len());
				dst.database.set_lookup(name, Lookup::Type(index));
				dst.types.push(Type::new(name, index));
				index
			}
			other => {
				return Err(Error::new(
					Errc::GnrIdentifierTypeMismatch,
					format!(
						"declaration of type '{}' collides with previous {} declaration",
						dst.database.name(name),
						other.kind_name()
					),
				));
			}
		};
		maps.types[src_type.index.index()] = mapped;
	}

	// Generated types reference earlier indices only, so one ordered pass can
	// dedup them against the destination caches.
	for src_type in &src.types {
		let Some(generated) = src_type.generated else { continue };
		let mapped = match generated {
			Generated::Pointer { underlying_type, .. } => {
				let base = maps.types[underlying_type.index()];
				get_or_create_pointer(&mut dst, base)
			}
			Generated::Array { underlying_type, array_size } => {
				let base = maps.types[underlying_type.index()];
				get_or_create_array(&mut dst, base, array_size)
			}
			Generated::Signature { index } => {
				let sig = merge_signature(&mut dst, &src, &mut maps, index);
				get_or_create_signature_type(&mut dst, sig)
			}
		};
		maps.types[src_type.index.index()] = mapped;
	}

	// Adopt definitions.
	for src_type in &src.types {
		if src_type.generated.is_some() || !src_type.is_defined() {
			continue;
		}
		let mapped = maps.types[src_type.index.index()];
		if crate::indices::is_base_type(mapped) {
			continue;
		}
		let dst_type = &mut dst.types[mapped.index()];
		if dst_type.is_defined() {
			continue;
		}
		dst_type.flags |= TypeFlags::DEFINED | (src_type.flags & (TypeFlags::UNION | TypeFlags::EXTERNAL));
		dst_type.total_size = src_type.total_size;
		dst_type.meta = Metadata {
			index: maps.metas.get(src_type.meta.index.index()).copied().unwrap_or(MetaIdx::INVALID),
			line_number: src_type.meta.line_number,
		};
		dst_type.fields = src_type
			.fields
			.iter()
			.map(|f| Field {
				name: maps.names[f.name.index()],
				ty: maps.types[f.ty.index()],
				offset: f.offset,
			})
			.collect();
	}

	for index in 0..src.signatures.len() {
		merge_signature(&mut dst, &src, &mut maps, SignatureIdx::new(index));
	}

	let mut keybuf = Vec::new();
	for (i, src_offset) in src.offsets.iter().enumerate() {
		let object_type = maps.types[src_offset.object_type.index()];
		let field_names: SmallVec<[NameIdx; 4]> =
			src_offset.field_names.iter().map(|n| maps.names[n.index()]).collect();
		FieldAddress::make_key(object_type, &field_names, &mut keybuf);
		let mapped = match dst.offset_lookup.get(&keybuf).copied() {
			Some(existing) => existing,
			None => {
				let index = OffsetIdx::new(dst.offsets.len());
				dst.offsets.push(FieldAddress::new(object_type, field_names));
				dst.offset_lookup.insert(keybuf.clone(), index);
				index
			}
		};
		maps.offsets[i] = mapped;
	}

	// Method declarations first; call lists may reference any method.
	for src_method in &src.methods {
		let name = maps.names[src_method.name.index()];
		let mapped = match dst.database.lookup(name) {
			Lookup::Method(existing) => {
				if src_method.is_defined() && dst.methods[existing.index()].is_defined() {
					return Err(Error::new(
						Errc::GnrMethodRedeclaration,
						format!("method '{}' has already been declared", dst.database.name(name)),
					));
				}
				existing
			}
			Lookup::Identifier => {
				let index = MethodIdx::new(dst.methods.len());
				dst.database.set_lookup(name, Lookup::Method(index));
				dst.methods.push(Method::new(name, index));
				index
			}
			other => {
				return Err(Error::new(
					Errc::GnrIdentifierTypeMismatch,
					format!(
						"declaration of method '{}' collides with previous {} declaration",
						dst.database.name(name),
						other.kind_name()
					),
				));
			}
		};
		maps.methods[src_method.index.index()] = mapped;
	}

	for src_method in &src.methods {
		if !src_method.is_defined() {
			continue;
		}
		let mapped = maps.methods[src_method.index.index()];
		let method = &mut dst.methods[mapped.index()];
		method.flags = src_method.flags;
		method.signature = maps.signatures[src_method.signature.index()];
		method.bytecode = src_method.bytecode.clone();
		method.labels = src_method.labels.clone();
		method.stackvars = src_method
			.stackvars
			.iter()
			.map(|sv| StackVar { ty: maps.types[sv.ty.index()], offset: sv.offset })
			.collect();
		method.calls = src_method.calls.iter().map(|c| maps.methods[c.index()]).collect();
		method.globals = src_method.globals.iter().map(|g| maps.names[g.index()]).collect();
		method.offsets = src_method.offsets.iter().map(|o| maps.offsets[o.index()]).collect();
		method.external_call = src_method.external_call;
		method.meta = Metadata {
			index: maps.metas.get(src_method.meta.index.index()).copied().unwrap_or(MetaIdx::INVALID),
			line_number: src_method.meta.line_number,
		};
	}

	merge_data_table(&mut dst, &src, &maps, false)?;
	merge_data_table(&mut dst, &src, &maps, true)?;

	Ok(dst)
}

fn merge_signature(dst: &mut GenData, src: &GenData, maps: &mut MergeMaps, index: SignatureIdx) -> SignatureIdx {
	if maps.signatures[index.index()].is_valid() {
		return maps.signatures[index.index()];
	}
	let src_sig = &src.signatures[index.index()];
	let return_type = maps.types[src_sig.return_type.index()];
	let params: SmallVec<[TypeIdx; 8]> =
		src_sig.parameters.iter().map(|p| maps.types[p.ty.index()]).collect();
	let mut keybuf = Vec::new();
	Signature::make_key(return_type, &params, &mut keybuf);
	let mapped = match dst.signature_lookup.get(&keybuf).copied() {
		Some(existing) => existing,
		None => {
			let new_index = SignatureIdx::new(dst.signatures.len());
			let mut sig = Signature::new(new_index, return_type);
			sig.parameters = params.iter().map(|&ty| StackVar::new(ty)).collect();
			dst.signatures.push(sig);
			dst.signature_lookup.insert(keybuf, new_index);
			new_index
		}
	};
	maps.signatures[index.index()] = mapped;
	mapped
}

pub(crate) fn get_or_create_pointer(dst: &mut GenData, base: TypeIdx) -> TypeIdx {
	let existing = dst.types[base.index()].pointer_type;
	if existing.is_valid() {
		return existing;
	}
	let index = TypeIdx::new(dst.types.len());
	let mut ty = Type::new(NameIdx::INVALID, index);
	ty.make_pointer(base);
	ty.flags |= TypeFlags::DEFINED;
	dst.types[base.index()].pointer_type = index;
	dst.types.push(ty);
	index
}

pub(crate) fn get_or_create_array(dst: &mut GenData, base: TypeIdx, array_size: usize) -> TypeIdx {
	if let Some(&existing) = dst.array_lookup.get(&(base, array_size)) {
		return existing;
	}
	let index = TypeIdx::new(dst.types.len());
	let mut ty = Type::new(NameIdx::INVALID, index);
	ty.make_array(base, array_size);
	ty.flags |= TypeFlags::DEFINED;
	dst.array_lookup.insert((base, array_size), index);
	dst.types.push(ty);
	index
}

pub(crate) fn get_or_create_signature_type(dst: &mut GenData, signature: SignatureIdx) -> TypeIdx {
	let existing = dst.signatures[signature.index()].signature_type;
	if existing.is_valid() {
		return existing;
	}
	let index = TypeIdx::new(dst.types.len());
	let mut ty = Type::new(NameIdx::INVALID, index);
	ty.make_signature(signature);
	ty.flags |= TypeFlags::DEFINED;
	dst.signatures[signature.index()].signature_type = index;
	dst.types.push(ty);
	index
}

fn merge_data_table(dst: &mut GenData, src: &GenData, maps: &MergeMaps, constants: bool) -> Result<()> {
	let src_table = if constants { &src.constants } else { &src.globals };
	for field in &src_table.info {
		let name = maps.names[field.name.index()];
		match dst.database.lookup(name) {
			Lookup::Identifier => {}
			Lookup::Global(_) | Lookup::Constant(_) => {
				return Err(Error::new(
					Errc::GnrGlobalRedeclaration,
					format!("global '{}' has already been declared", dst.database.name(name)),
				));
			}
			other => {
				return Err(Error::new(
					Errc::GnrIdentifierTypeMismatch,
					format!(
						"declaration of global '{}' collides with previous {} declaration",
						dst.database.name(name),
						other.kind_name()
					),
				));
			}
		}

		let dst_table = if constants { &mut dst.constants } else { &mut dst.globals };
		let index = GlobalIdx::new(dst_table.info.len());
		let data_offset = dst_table.data.len();
		dst_table.info.push(Field {
			name,
			ty: maps.types[field.ty.index()],
			offset: data_offset,
		});

		// Re-encode the initializer stream, remapping embedded identifiers.
		let src_data = &src_table.data[field.offset..];
		let mut pos = 0usize;
		let count = u16::from_le_bytes(src_data[pos..pos + 2].try_into().unwrap());
		pos += 2;
		let mut out = Vec::new();
		out.extend_from_slice(&count.to_le_bytes());
		for _ in 0..count {
			let code = src_data[pos];
			pos += 1;
			out.push(code);
			let init_type = TypeIdx(u32::from(code));
			if init_type == TypeIdx::VOID {
				let raw = u32::from_le_bytes(src_data[pos..pos + 4].try_into().unwrap());
				pos += 4;
				out.extend_from_slice(&maps.names[NameIdx(raw).index()].raw().to_le_bytes());
			} else if init_type != TypeIdx::VPTR {
				let size = crate::indices::base_type_size(init_type);
				out.extend_from_slice(&src_data[pos..pos + size]);
				pos += size;
			}
		}
		let dst_table = if constants { &mut dst.constants } else { &mut dst.globals };
		dst_table.data.extend_from_slice(&out);
		dst.database.set_lookup(
			name,
			if constants { Lookup::Constant(index) } else { Lookup::Global(index) },
		);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn seeded() -> GenData {
		let mut data = GenData::default();
		data.initialize_base_types();
		data
	}

	#[test]
	fn empty_round_trip() {
		let data = seeded();
		let im = data.serialize();
		assert!(im.is_valid());
		assert!(im.is_compatible());
		let back = GenData::deserialize(&im).unwrap();
		assert_eq!(back.types.len(), data.types.len());
		assert_eq!(back.database.len(), data.database.len());
	}

	#[test]
	fn load_rejects_bad_framing() {
		assert!(Intermediate::load(b"PASMxxxx").is_err());
		assert!(Intermediate::load(b"PI").is_err());

		let data = seeded();
		let im = data.serialize();
		let mut broken = im.data().to_vec();
		let len = broken.len();
		broken[len - 1] = b'X';
		assert!(Intermediate::load(&broken).is_err());
	}

	#[test]
	fn base_types_resolve_by_name() {
		let data = seeded();
		let int_name = data.database.find("int").unwrap();
		assert_eq!(data.database.lookup(int_name), Lookup::Type(TypeIdx::I32));
		let size_name = data.database.find("size").unwrap();
		assert_eq!(data.database.lookup(size_name), Lookup::Type(size_type()));
	}

	#[test]
	fn restore_rebuilds_generated_caches() {
		let mut data = seeded();
		let ptr = get_or_create_pointer(&mut data, TypeIdx::I32);
		let arr = get_or_create_array(&mut data, TypeIdx::I32, 3);
		let im = data.serialize();
		let back = GenData::deserialize(&im).unwrap();
		assert_eq!(back.types[TypeIdx::I32.index()].pointer_type, ptr);
		assert_eq!(back.array_lookup.get(&(TypeIdx::I32, 3)), Some(&arr));
	}

	#[test]
	fn merge_reconciles_declarations() {
		// Unit A declares `vec` without defining it; unit B defines it.
		let mut a = seeded();
		let vec_name = a.database.emplace("vec");
		let declared = TypeIdx::new(a.types.len());
		a.database.set_lookup(vec_name, Lookup::Type(declared));
		a.types.push(Type::new(vec_name, declared));

		let mut b = seeded();
		let vec_name_b = b.database.emplace("vec");
		let defined = TypeIdx::new(b.types.len());
		b.database.set_lookup(vec_name_b, Lookup::Type(defined));
		let mut ty = Type::new(vec_name_b, defined);
		ty.flags |= TypeFlags::DEFINED;
		let field_name = b.database.emplace("x");
		ty.fields.push(Field::new(field_name, TypeIdx::I32));
		b.types.push(ty);

		let merged = merge_data(a, b).unwrap();
		let name = merged.database.find("vec").unwrap();
		let Lookup::Type(idx) = merged.database.lookup(name) else { panic!() };
		assert!(merged.types[idx.index()].is_defined());
		assert_eq!(merged.types[idx.index()].fields.len(), 1);
	}

	#[test]
	fn merge_rejects_colliding_definitions() {
		let make = || {
			let mut data = seeded();
			let name = data.database.emplace("vec");
			let index = TypeIdx::new(data.types.len());
			data.database.set_lookup(name, Lookup::Type(index));
			let mut ty = Type::new(name, index);
			ty.flags |= TypeFlags::DEFINED;
			let field = data.database.emplace("x");
			ty.fields.push(Field::new(field, TypeIdx::I32));
			data.types.push(ty);
			data
		};
		let err = merge_data(make(), make()).unwrap_err();
		assert_eq!(err.code, Errc::GnrTypeRedeclaration);
	}
}
