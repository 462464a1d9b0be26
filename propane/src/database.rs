use fxhash::FxHashMap;

use crate::indices::{GlobalIdx, MetaIdx, MethodIdx, NameIdx, TypeIdx};

/// What an interned identifier currently resolves to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lookup {
	/// Plain identifier with no declaration attached yet.
	Identifier,
	Type(TypeIdx),
	Method(MethodIdx),
	Global(GlobalIdx),
	Constant(GlobalIdx),
}

impl Lookup {
	pub fn kind_name(self) -> &'static str {
		match self {
			Lookup::Identifier => "identifier",
			Lookup::Type(_) => "type",
			Lookup::Method(_) => "method",
			Lookup::Global(_) => "global",
			Lookup::Constant(_) => "constant",
		}
	}
}

#[derive(Debug, Clone)]
struct Entry {
	/// Range into the shared string blob.
	offset: u32,
	length: u32,
	value: Lookup,
}

/// Interned identifier table. Every distinct string gets a dense [`NameIdx`];
/// the entry also carries what the name currently resolves to.
///
/// Strings live in one shared blob so the table serializes as
/// (entries, blob), matching the intermediate wire format.
#[derive(Debug, Default, Clone)]
pub struct Database {
	strings: String,
	entries: Vec<Entry>,
	lookup: FxHashMap<Box<str>, NameIdx>,
}

impl Database {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn is_valid_index(&self, name: NameIdx) -> bool {
		name.index() < self.entries.len()
	}

	/// Intern `name`, creating a plain identifier entry if absent.
	pub fn emplace(&mut self, name: &str) -> NameIdx {
		if let Some(&idx) = self.lookup.get(name) {
			return idx;
		}
		let idx = NameIdx::new(self.entries.len());
		self.entries.push(Entry {
			offset: self.strings.len() as u32,
			length: name.len() as u32,
			value: Lookup::Identifier,
		});
		self.strings.push_str(name);
		self.lookup.insert(name.into(), idx);
		idx
	}

	pub fn find(&self, name: &str) -> Option<NameIdx> {
		self.lookup.get(name).copied()
	}

	pub fn name(&self, name: NameIdx) -> &str {
		let entry = &self.entries[name.index()];
		&self.strings[entry.offset as usize..(entry.offset + entry.length) as usize]
	}

	pub fn lookup(&self, name: NameIdx) -> Lookup {
		self.entries[name.index()].value
	}

	pub fn set_lookup(&mut self, name: NameIdx, value: Lookup) {
		self.entries[name.index()].value = value;
	}

	pub fn iter(&self) -> impl Iterator<Item = (NameIdx, &str, Lookup)> {
		self.entries.iter().enumerate().map(|(i, entry)| {
			let name = &self.strings[entry.offset as usize..(entry.offset + entry.length) as usize];
			(NameIdx::new(i), name, entry.value)
		})
	}

	pub(crate) fn string_blob(&self) -> &str {
		&self.strings
	}

	pub(crate) fn raw_entries(&self) -> impl Iterator<Item = (u32, u32, Lookup)> + '_ {
		self.entries.iter().map(|e| (e.offset, e.length, e.value))
	}

	pub(crate) fn from_parts(blob: String, entries: Vec<(u32, u32, Lookup)>) -> Self {
		let mut db = Database {
			strings: blob,
			entries: entries
				.into_iter()
				.map(|(offset, length, value)| Entry { offset, length, value })
				.collect(),
			lookup: FxHashMap::default(),
		};
		for i in 0..db.entries.len() {
			let entry = &db.entries[i];
			let name = &db.strings[entry.offset as usize..(entry.offset + entry.length) as usize];
			db.lookup.insert(name.into(), NameIdx::new(i));
		}
		db
	}
}

/// Interned source-file names, keyed by [`MetaIdx`].
#[derive(Debug, Default, Clone)]
pub struct MetaTable {
	names: Vec<String>,
	lookup: FxHashMap<Box<str>, MetaIdx>,
}

impl MetaTable {
	pub fn len(&self) -> usize {
		self.names.len()
	}

	pub fn is_empty(&self) -> bool {
		self.names.is_empty()
	}

	pub fn emplace(&mut self, name: &str) -> MetaIdx {
		if let Some(&idx) = self.lookup.get(name) {
			return idx;
		}
		let idx = MetaIdx::new(self.names.len());
		self.names.push(name.to_owned());
		self.lookup.insert(name.into(), idx);
		idx
	}

	pub fn name(&self, index: MetaIdx) -> &str {
		match index.is_valid() && index.index() < self.names.len() {
			true => &self.names[index.index()],
			false => "",
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.names.iter().map(String::as_str)
	}
}

/// Identifier grammar: `[A-Za-z_$][A-Za-z0-9_$]*`, excluding the reserved
/// null-pointer literal.
pub fn is_identifier(name: &str) -> bool {
	const RESERVED_NULL: &str = "null";
	if name.is_empty() || name == RESERVED_NULL {
		return false;
	}
	let mut chars = name.chars();
	let first = chars.next().unwrap();
	if !(first.is_ascii_alphabetic() || first == '_' || first == '$') {
		return false;
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interning_is_idempotent() {
		let mut db = Database::new();
		let a = db.emplace("main");
		let b = db.emplace("other");
		assert_ne!(a, b);
		assert_eq!(db.emplace("main"), a);
		assert_eq!(db.name(a), "main");
		assert_eq!(db.lookup(a), Lookup::Identifier);
	}

	#[test]
	fn lookup_upgrade() {
		let mut db = Database::new();
		let name = db.emplace("vec3");
		db.set_lookup(name, Lookup::Type(TypeIdx::new(12)));
		assert_eq!(db.lookup(name), Lookup::Type(TypeIdx::new(12)));
		assert_eq!(db.find("vec3"), Some(name));
		assert_eq!(db.find("vec4"), None);
	}

	#[test]
	fn rebuild_from_parts() {
		let mut db = Database::new();
		db.emplace("alpha");
		db.emplace("beta");
		let rebuilt = Database::from_parts(
			db.string_blob().to_owned(),
			db.raw_entries().collect(),
		);
		assert_eq!(rebuilt.find("beta"), db.find("beta"));
		assert_eq!(rebuilt.name(NameIdx::new(0)), "alpha");
	}

	#[test]
	fn identifier_grammar() {
		assert!(is_identifier("main"));
		assert!(is_identifier("_x$1"));
		assert!(!is_identifier("3x"));
		assert!(!is_identifier(""));
		assert!(!is_identifier("a b"));
		assert!(!is_identifier("null"));
	}
}
