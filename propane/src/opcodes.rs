use std::fmt::{Debug, Display, Formatter};

use propane_derive::FromRepr;

macro_rules! define_opcodes {
	(
		enum $name: ident {
			$(
				$(#[$attr:meta])*
				$ident: ident = $discriminant: literal
			),* $(,)?
		}
	) => {
		#[repr(u8)]
		#[allow(non_camel_case_types)]
		#[derive(Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
		pub enum $name {
			$(
				$(#[$attr])*
				$ident = $discriminant
			),*
		}

		impl $name {
			pub fn name(self) -> &'static str {
				match self {
					$($name::$ident => stringify!($ident)),*
				}
			}
		}
	};
}

define_opcodes! {
	enum Opcode {
		/// Do nothing.
		noop = 0x00,
		/// Assign RHS to LHS through an implicit conversion.
		set = 0x01,
		/// Assign RHS to LHS through an explicit conversion.
		conv = 0x02,
		/// Bitwise complement in place.
		ari_not = 0x03,
		/// Arithmetic negation in place.
		ari_neg = 0x04,
		ari_mul = 0x05,
		ari_div = 0x06,
		ari_mod = 0x07,
		ari_add = 0x08,
		ari_sub = 0x09,
		ari_lsh = 0x0A,
		ari_rsh = 0x0B,
		ari_and = 0x0C,
		ari_xor = 0x0D,
		ari_or = 0x0E,
		/// Pointer add, scaled by pointee size.
		padd = 0x0F,
		/// Pointer subtract, scaled by pointee size.
		psub = 0x10,
		/// Pointer difference, yields the signed offset type.
		pdif = 0x11,
		/// Three-way compare, yields -1/0/1 as i32.
		cmp = 0x12,
		ceq = 0x13,
		cne = 0x14,
		cgt = 0x15,
		cge = 0x16,
		clt = 0x17,
		cle = 0x18,
		/// Compare against zero.
		cze = 0x19,
		/// Compare against non-zero.
		cnz = 0x1A,
		/// Unconditional branch.
		br = 0x1B,
		beq = 0x1C,
		bne = 0x1D,
		bgt = 0x1E,
		bge = 0x1F,
		blt = 0x20,
		ble = 0x21,
		bze = 0x22,
		bnz = 0x23,
		/// Jump table on an integral operand.
		sw = 0x24,
		/// Direct call by method index.
		call = 0x25,
		/// Virtual call through a method-pointer value.
		callv = 0x26,
		/// Return without a value.
		ret = 0x27,
		/// Return a value through an implicit conversion.
		retv = 0x28,
		/// Write a human-readable rendition of the operand to the dump stream.
		dump = 0x29,
	}
}

impl Opcode {
	/// Branch opcodes reuse the comparison evaluators; `beq - br == ceq - cmp`
	/// and so on for the rest of the family.
	#[inline]
	pub fn branch_comparison(self) -> Opcode {
		debug_assert!(self >= Opcode::beq && self <= Opcode::bnz);
		Opcode::from_repr(self as u8 - (Opcode::br as u8 - Opcode::cmp as u8)).unwrap()
	}

	#[inline]
	pub fn decode(byte: u8) -> Option<Opcode> {
		Opcode::from_repr(byte)
	}
}

impl PartialOrd for Opcode {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Opcode {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(*self as u8).cmp(&(*other as u8))
	}
}

impl Debug for Opcode {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "Opcode::{}", self.name())
	}
}

impl Display for Opcode {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

/// Operand-type variant selector, assigned by the linker.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Subcode(pub u8);

impl Subcode {
	pub const INVALID: Subcode = Subcode(0xFF);

	#[inline]
	pub const fn is_valid(self) -> bool {
		self.0 != 0xFF
	}

	#[inline]
	pub const fn raw(self) -> u8 {
		self.0
	}
}

impl Debug for Subcode {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.is_valid() {
			true => write!(f, "Subcode({})", self.0),
			false => write!(f, "Subcode(invalid)"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_round_trip() {
		for byte in 0x00..=0x29u8 {
			let op = Opcode::decode(byte).unwrap();
			assert_eq!(op as u8, byte);
		}
		assert!(Opcode::decode(0x2A).is_none());
		assert!(Opcode::decode(0xFF).is_none());
	}

	#[test]
	fn branch_maps_onto_comparison() {
		assert_eq!(Opcode::beq.branch_comparison(), Opcode::ceq);
		assert_eq!(Opcode::bnz.branch_comparison(), Opcode::cnz);
	}
}
