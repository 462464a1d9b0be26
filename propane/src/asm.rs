use crate::block::{BlockReader, BlockWriter};
use crate::database::{Database, MetaTable};
use crate::errors::{Errc, Error, Result};
use crate::indices::MethodIdx;
use crate::indices::TypeIdx;
use crate::intermediate::{
	frame_version, read_data_table, read_database, read_metatable, read_methods, read_offsets,
	read_signatures, read_types, validate_framing, write_data_table, write_database, write_metatable,
	write_methods, write_offsets, write_signatures, write_types, DataTable, ASSEMBLY_HEADER, FOOTER,
};
use crate::method::Method;
use crate::types::{FieldAddress, Generated, Signature, Type};
use crate::version::ToolchainVersion;

/// Fully linked, executable state: every size, offset, index and subcode is
/// final and the bytecode references assembly-global tables.
#[derive(Debug, Default)]
pub struct AssemblyData {
	pub database: Database,
	pub metatable: MetaTable,
	pub types: Vec<Type>,
	pub methods: Vec<Method>,
	pub signatures: Vec<Signature>,
	pub offsets: Vec<FieldAddress>,
	pub globals: DataTable,
	pub constants: DataTable,
	pub main: MethodIdx,
	pub runtime_hash: u64,
}

impl AssemblyData {
	pub fn serialize(&self) -> Assembly {
		let mut writer = BlockWriter::new();
		writer.write_bytes(ASSEMBLY_HEADER);
		writer.write_bytes(&ToolchainVersion::current().to_bytes());
		write_database(&mut writer, &self.database);
		write_metatable(&mut writer, &self.metatable);
		write_types(&mut writer, &self.types);
		write_methods(&mut writer, &self.methods);
		write_signatures(&mut writer, &self.signatures);
		write_offsets(&mut writer, &self.offsets);
		write_data_table(&mut writer, &self.globals);
		write_data_table(&mut writer, &self.constants);
		writer.write_u32(self.main.raw());
		writer.write_u64(self.runtime_hash);
		let mut content = writer.finalize();
		content.extend_from_slice(FOOTER);
		Assembly { content }
	}

	pub(crate) fn deserialize_payload(payload: &[u8]) -> Result<AssemblyData> {
		let fail = Errc::RtmInvalidAssembly;
		let mut reader = BlockReader::new(payload, fail);
		let database = read_database(&mut reader, fail)?;
		let metatable = read_metatable(&mut reader, fail)?;
		let types = read_types(&mut reader, fail)?;
		let methods = read_methods(&mut reader)?;
		let signatures = read_signatures(&mut reader)?;
		let offsets = read_offsets(&mut reader)?;
		let globals = read_data_table(&mut reader)?;
		let constants = read_data_table(&mut reader)?;
		let main = MethodIdx(reader.read_u32()?);
		let runtime_hash = reader.read_u64()?;
		Ok(AssemblyData {
			database,
			metatable,
			types,
			methods,
			signatures,
			offsets,
			globals,
			constants,
			main,
			runtime_hash,
		})
	}

	/// Reconstruct a display name for any type, including synthesized
	/// pointer/array/signature types.
	pub fn generate_name(&self, ty: TypeIdx, out: &mut String) {
		out.clear();
		self.generate_name_recursive(ty, out);
	}

	fn generate_name_recursive(&self, ty: TypeIdx, out: &mut String) -> bool {
		generate_type_name(&self.types, &self.signatures, &self.database, ty, out)
	}

	pub fn type_name(&self, ty: TypeIdx) -> String {
		let mut name = String::new();
		self.generate_name(ty, &mut name);
		name
	}
}

/// Shared with the linker, which needs names for diagnostics before an
/// [`AssemblyData`] exists.
pub(crate) fn generate_type_name(
	types: &[Type],
	signatures: &[Signature],
	database: &Database,
	ty: TypeIdx,
	out: &mut String,
) -> bool {
	if ty.index() >= types.len() {
		return false;
	}
	let t = &types[ty.index()];
	match t.generated {
		Some(Generated::Pointer { underlying_type, .. }) => {
			if !generate_type_name(types, signatures, database, underlying_type, out) {
				return false;
			}
			out.push('*');
			true
		}
		Some(Generated::Array { underlying_type, array_size }) => {
			if !generate_type_name(types, signatures, database, underlying_type, out) {
				return false;
			}
			out.push('[');
			out.push_str(&array_size.to_string());
			out.push(']');
			true
		}
		Some(Generated::Signature { index }) => {
			let signature = &signatures[index.index()];
			if !generate_type_name(types, signatures, database, signature.return_type, out) {
				return false;
			}
			out.push('(');
			for (i, param) in signature.parameters.iter().enumerate() {
				if i != 0 {
					out.push(',');
				}
				if !generate_type_name(types, signatures, database, param.ty, out) {
					return false;
				}
			}
			out.push(')');
			true
		}
		None => match database.is_valid_index(t.name) {
			true => {
				out.push_str(database.name(t.name));
				true
			}
			false => false,
		},
	}
}

/// A serialized, resolved, ready-to-execute unit (`"PASM"` framing).
#[derive(Debug, Default, Clone)]
pub struct Assembly {
	content: Vec<u8>,
}

impl Assembly {
	pub fn is_valid(&self) -> bool {
		validate_framing(&self.content, ASSEMBLY_HEADER)
	}

	pub fn version(&self) -> ToolchainVersion {
		frame_version(&self.content, ASSEMBLY_HEADER)
	}

	pub fn is_compatible(&self) -> bool {
		self.version().is_compatible()
	}

	pub fn data(&self) -> &[u8] {
		&self.content
	}

	/// The serialized payload between the version word and the footer.
	pub(crate) fn payload(&self) -> &[u8] {
		&self.content[ASSEMBLY_HEADER.len() + 8..self.content.len() - FOOTER.len()]
	}

	/// Adopt previously serialized bytes; fails on bad framing.
	pub fn load(bytes: &[u8]) -> Result<Assembly> {
		if !validate_framing(bytes, ASSEMBLY_HEADER) {
			return Err(Error::new(Errc::RtmInvalidAssembly, "invalid assembly image"));
		}
		Ok(Assembly { content: bytes.to_vec() })
	}

	pub fn assembly_data(&self) -> Result<AssemblyData> {
		if !self.is_valid() {
			return Err(Error::new(Errc::RtmInvalidAssembly, "attempted to read an invalid assembly"));
		}
		if !self.is_compatible() {
			return Err(Error::new(
				Errc::RtmIncompatibleAssembly,
				"attempted to read an assembly that was built using an incompatible toolchain",
			));
		}
		AssemblyData::deserialize_payload(self.payload())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_assembly_round_trip() {
		let data = AssemblyData { runtime_hash: 0x1234_5678_9ABC_DEF0, ..Default::default() };
		let assembly = data.serialize();
		assert!(assembly.is_valid());
		assert!(assembly.is_compatible());
		let back = assembly.assembly_data().unwrap();
		assert_eq!(back.runtime_hash, data.runtime_hash);
		assert_eq!(back.main, MethodIdx::INVALID);
	}

	#[test]
	fn load_rejects_foreign_magic() {
		assert!(Assembly::load(b"PINTxxxxxxxxEND").is_err());
		let data = AssemblyData::default();
		let assembly = data.serialize();
		assert!(Assembly::load(assembly.data()).is_ok());
	}
}
