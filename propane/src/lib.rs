//! Toolchain for the Propane stack-based bytecode language.
//!
//! The pipeline has three parts: a [`gen::Generator`] builds a serialized
//! [`intermediate::Intermediate`], [`linker::link`] resolves it against a
//! [`runtime::Runtime`] into an executable [`asm::Assembly`], and
//! [`runtime::Runtime::execute`] runs that assembly on a byte-stack
//! interpreter through a [`host::Host`] abstraction.
//!
//! Artifacts are framed binary images (`"PINT"` / `"PASM"` magic, an 8-byte
//! toolchain version, a block-tree payload and an `"END"` footer) and only
//! load on a matching toolchain, endianness and architecture.

pub mod address;
pub mod asm;
pub mod block;
pub mod database;
pub mod errors;
pub mod gen;
pub mod host;
pub mod indices;
mod interp;
pub mod intermediate;
pub mod linker;
pub mod method;
pub mod opcodes;
pub mod operations;
pub mod runtime;
pub mod types;
pub mod version;

pub use address::Address;
pub use asm::Assembly;
pub use errors::{Errc, Error, Result};
pub use gen::Generator;
pub use host::{Host, SystemHost};
pub use indices::TypeIdx;
pub use intermediate::Intermediate;
pub use linker::link;
pub use runtime::{Runtime, RuntimeParameters};
