use crate::indices::{is_arithmetic_type, TypeIdx};
use crate::opcodes::{Opcode, Subcode};

// Subcode tables keyed by (LHS primitive, RHS primitive), both in the
// canonical order i8 u8 i16 u16 i32 u32 i64 u64 f32 f64. An entry of `__`
// means the pair has no evaluator and the linker reports the matching
// `invalid_*_expression` error.

const PRIM: usize = 10;
const __: u8 = 0xFF;

/// Implicit conversions (`set`, `call` argument passing, `retv`). Only
/// value-preserving widenings are assignable; subcode 45 is the aggregate
/// byte-copy fallback picked directly by the linker.
pub const SET_MEMCPY: Subcode = Subcode(45);

static SET_TABLE: [[u8; PRIM]; PRIM] = [
	//        i8  u8 i16 u16 i32 u32 i64 u64 f32 f64
	/* i8  */ [0, __, __, __, __, __, __, __, __, __],
	/* u8  */ [__, 1, __, __, __, __, __, __, __, __],
	/* i16 */ [2, 3, 4, __, __, __, __, __, __, __],
	/* u16 */ [__, 5, __, 6, __, __, __, __, __, __],
	/* i32 */ [7, 8, 9, 10, 11, __, __, __, __, __],
	/* u32 */ [__, 12, __, 13, __, 14, __, __, __, __],
	/* i64 */ [15, 16, 17, 18, 19, 20, 21, __, __, __],
	/* u64 */ [__, 22, __, 23, __, 24, __, 25, __, __],
	/* f32 */ [26, 27, 28, 29, 30, 31, 32, 33, 34, __],
	/* f64 */ [35, 36, 37, 38, 39, 40, 41, 42, 43, 44],
];

/// Integer-only prefix of the arithmetic table, shared by the shift and
/// bitwise operations.
static INT_TABLE: [[u8; PRIM]; PRIM] = [
	/* i8  */ [0, __, __, __, __, __, __, __, __, __],
	/* u8  */ [__, 1, __, __, __, __, __, __, __, __],
	/* i16 */ [2, 3, 4, __, __, __, __, __, __, __],
	/* u16 */ [__, 5, __, 6, __, __, __, __, __, __],
	/* i32 */ [7, 8, 9, 10, 11, __, __, __, __, __],
	/* u32 */ [__, 12, __, 13, __, 14, __, __, __, __],
	/* i64 */ [15, 16, 17, 18, 19, 20, 21, __, __, __],
	/* u64 */ [__, 22, __, 23, __, 24, __, 25, __, __],
	/* f32 */ [__; PRIM],
	/* f64 */ [__; PRIM],
];

/// Comparisons promote both operands to a common type; signed/u64 pairings
/// have no common type and are rejected.
static CMP_TABLE: [[u8; PRIM]; PRIM] = [
	//        i8  u8 i16 u16 i32 u32 i64 u64 f32 f64
	/* i8  */ [0, 1, 2, 3, 4, 5, 6, __, 7, 8],
	/* u8  */ [9, 10, 11, 12, 13, 14, 15, 16, 17, 18],
	/* i16 */ [19, 20, 21, 22, 23, 24, 25, __, 26, 27],
	/* u16 */ [28, 29, 30, 31, 32, 33, 34, 35, 36, 37],
	/* i32 */ [38, 39, 40, 41, 42, 43, 44, __, 45, 46],
	/* u32 */ [47, 48, 49, 50, 51, 52, 53, 54, 55, 56],
	/* i64 */ [57, 58, 59, 60, 61, 62, 63, __, 64, 65],
	/* u64 */ [__, 66, __, 67, __, 68, __, 69, 70, 71],
	/* f32 */ [72, 73, 74, 75, 76, 77, 78, 79, 80, 81],
	/* f64 */ [82, 83, 84, 85, 86, 87, 88, 89, 90, 91],
];

/// Bitwise complement, integer operands only.
static NOT_TABLE: [u8; PRIM] = [0, 1, 2, 3, 4, 5, 6, 7, __, __];

/// Negation, signed and float operands only.
static NEG_TABLE: [u8; PRIM] = [0, __, 1, __, 2, __, 3, __, 4, 5];

/// Zero / non-zero tests, keyed by the single operand.
static CZE_TABLE: [u8; PRIM] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

/// Pointer add/sub, keyed by the integral RHS.
static PTR_TABLE: [u8; PRIM] = [0, 1, 2, 3, 4, 5, 6, 7, __, __];

#[inline]
fn prim(ty: TypeIdx) -> Option<usize> {
	match is_arithmetic_type(ty) {
		true => Some(ty.index()),
		false => None,
	}
}

#[inline]
fn pair_lookup(table: &[[u8; PRIM]; PRIM], lhs: TypeIdx, rhs: TypeIdx) -> Subcode {
	match (prim(lhs), prim(rhs)) {
		(Some(l), Some(r)) => Subcode(table[l][r]),
		_ => Subcode::INVALID,
	}
}

/// Implicit conversion subcode for `set` and argument/return passing.
pub fn translate_set(lhs: TypeIdx, rhs: TypeIdx) -> Subcode {
	pair_lookup(&SET_TABLE, lhs, rhs)
}

/// Explicit conversion subcode: dense `lhs * 10 + rhs` over the arithmetic
/// primitives.
pub fn translate_conv(lhs: TypeIdx, rhs: TypeIdx) -> Subcode {
	match (prim(lhs), prim(rhs)) {
		(Some(l), Some(r)) => Subcode((l * PRIM + r) as u8),
		_ => Subcode::INVALID,
	}
}

pub fn translate_ari(op: Opcode, lhs: TypeIdx, rhs: TypeIdx) -> Subcode {
	match op {
		Opcode::ari_not => match prim(lhs) {
			Some(l) => Subcode(NOT_TABLE[l]),
			None => Subcode::INVALID,
		},
		Opcode::ari_neg => match prim(lhs) {
			Some(l) => Subcode(NEG_TABLE[l]),
			None => Subcode::INVALID,
		},
		Opcode::ari_mul | Opcode::ari_div | Opcode::ari_mod | Opcode::ari_add | Opcode::ari_sub => {
			pair_lookup(&SET_TABLE, lhs, rhs)
		}
		Opcode::ari_lsh | Opcode::ari_rsh | Opcode::ari_and | Opcode::ari_xor | Opcode::ari_or => {
			pair_lookup(&INT_TABLE, lhs, rhs)
		}
		_ => Subcode::INVALID,
	}
}

pub fn translate_cmp(op: Opcode, lhs: TypeIdx, rhs: TypeIdx) -> Subcode {
	match op {
		Opcode::cze | Opcode::cnz => match prim(lhs) {
			Some(l) => Subcode(CZE_TABLE[l]),
			None => Subcode::INVALID,
		},
		Opcode::cmp
		| Opcode::ceq
		| Opcode::cne
		| Opcode::cgt
		| Opcode::cge
		| Opcode::clt
		| Opcode::cle => pair_lookup(&CMP_TABLE, lhs, rhs),
		_ => Subcode::INVALID,
	}
}

/// Pointer arithmetic subcode, keyed by the integral RHS type.
pub fn translate_ptr(_op: Opcode, _lhs: TypeIdx, rhs: TypeIdx) -> Subcode {
	match prim(rhs) {
		Some(r) => Subcode(PTR_TABLE[r]),
		None => Subcode::INVALID,
	}
}

macro_rules! read_le {
	($ty: ty, $bytes: expr) => {{
		const SIZE: usize = std::mem::size_of::<$ty>();
		<$ty>::from_le_bytes($bytes[..SIZE].try_into().unwrap())
	}};
}

macro_rules! convert_from {
	($src: ty, $bytes: expr, $lhs: expr, $dst: expr) => {{
		let value = read_le!($src, $bytes);
		match $lhs {
			TypeIdx::I8 => $dst[..1].copy_from_slice(&(value as i8).to_le_bytes()),
			TypeIdx::U8 => $dst[..1].copy_from_slice(&(value as u8).to_le_bytes()),
			TypeIdx::I16 => $dst[..2].copy_from_slice(&(value as i16).to_le_bytes()),
			TypeIdx::U16 => $dst[..2].copy_from_slice(&(value as u16).to_le_bytes()),
			TypeIdx::I32 => $dst[..4].copy_from_slice(&(value as i32).to_le_bytes()),
			TypeIdx::U32 => $dst[..4].copy_from_slice(&(value as u32).to_le_bytes()),
			TypeIdx::I64 => $dst[..8].copy_from_slice(&(value as i64).to_le_bytes()),
			TypeIdx::U64 => $dst[..8].copy_from_slice(&(value as u64).to_le_bytes()),
			TypeIdx::F32 => $dst[..4].copy_from_slice(&(value as f32).to_le_bytes()),
			TypeIdx::F64 => $dst[..8].copy_from_slice(&(value as f64).to_le_bytes()),
			_ => return false,
		}
		true
	}};
}

/// Convert an encoded primitive value to a destination primitive, writing the
/// little-endian result. Used while laying out global initializers.
pub fn convert(dst: &mut [u8], lhs: TypeIdx, src: &[u8], rhs: TypeIdx) -> bool {
	match rhs {
		TypeIdx::I8 => convert_from!(i8, src, lhs, dst),
		TypeIdx::U8 => convert_from!(u8, src, lhs, dst),
		TypeIdx::I16 => convert_from!(i16, src, lhs, dst),
		TypeIdx::U16 => convert_from!(u16, src, lhs, dst),
		TypeIdx::I32 => convert_from!(i32, src, lhs, dst),
		TypeIdx::U32 => convert_from!(u32, src, lhs, dst),
		TypeIdx::I64 => convert_from!(i64, src, lhs, dst),
		TypeIdx::U64 => convert_from!(u64, src, lhs, dst),
		TypeIdx::F32 => convert_from!(f32, src, lhs, dst),
		TypeIdx::F64 => convert_from!(f64, src, lhs, dst),
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PRIMS: [TypeIdx; 10] = [
		TypeIdx::I8,
		TypeIdx::U8,
		TypeIdx::I16,
		TypeIdx::U16,
		TypeIdx::I32,
		TypeIdx::U32,
		TypeIdx::I64,
		TypeIdx::U64,
		TypeIdx::F32,
		TypeIdx::F64,
	];

	#[test]
	fn set_table_is_dense_over_valid_pairs() {
		// Every subcode 0..=44 appears exactly once.
		let mut seen = [false; 45];
		for row in SET_TABLE.iter() {
			for &entry in row {
				if entry != __ {
					assert!(!seen[entry as usize]);
					seen[entry as usize] = true;
				}
			}
		}
		assert!(seen.iter().all(|&s| s));
	}

	#[test]
	fn cmp_table_is_dense_over_valid_pairs() {
		let mut seen = [false; 92];
		for row in CMP_TABLE.iter() {
			for &entry in row {
				if entry != __ {
					assert!(!seen[entry as usize]);
					seen[entry as usize] = true;
				}
			}
		}
		assert!(seen.iter().all(|&s| s));
	}

	#[test]
	fn set_rejects_narrowing() {
		assert!(!translate_set(TypeIdx::I8, TypeIdx::I32).is_valid());
		assert!(!translate_set(TypeIdx::U32, TypeIdx::I32).is_valid());
		assert!(translate_set(TypeIdx::I64, TypeIdx::U32).is_valid());
		assert!(translate_set(TypeIdx::F64, TypeIdx::F32).is_valid());
		assert!(!translate_set(TypeIdx::F32, TypeIdx::F64).is_valid());
	}

	#[test]
	fn conv_is_total_over_primitives() {
		for &lhs in &PRIMS {
			for &rhs in &PRIMS {
				let sub = translate_conv(lhs, rhs);
				assert_eq!(sub.raw() as usize, lhs.index() * 10 + rhs.index());
			}
		}
		assert!(!translate_conv(TypeIdx::VPTR, TypeIdx::I32).is_valid());
	}

	#[test]
	fn shift_is_integer_only() {
		assert!(translate_ari(Opcode::ari_lsh, TypeIdx::U64, TypeIdx::U8).is_valid());
		assert!(!translate_ari(Opcode::ari_lsh, TypeIdx::F32, TypeIdx::F32).is_valid());
		assert!(!translate_ari(Opcode::ari_and, TypeIdx::F64, TypeIdx::F64).is_valid());
	}

	#[test]
	fn neg_is_signed_or_float_only() {
		assert!(translate_ari(Opcode::ari_neg, TypeIdx::I32, TypeIdx::I32).is_valid());
		assert!(translate_ari(Opcode::ari_neg, TypeIdx::F64, TypeIdx::F64).is_valid());
		assert!(!translate_ari(Opcode::ari_neg, TypeIdx::U32, TypeIdx::U32).is_valid());
		assert!(!translate_ari(Opcode::ari_not, TypeIdx::F32, TypeIdx::F32).is_valid());
	}

	#[test]
	fn signed_u64_comparisons_are_rejected() {
		assert!(!translate_cmp(Opcode::ceq, TypeIdx::I32, TypeIdx::U64).is_valid());
		assert!(!translate_cmp(Opcode::cmp, TypeIdx::U64, TypeIdx::I8).is_valid());
		assert!(translate_cmp(Opcode::cmp, TypeIdx::U64, TypeIdx::F32).is_valid());
		assert!(translate_cmp(Opcode::clt, TypeIdx::I32, TypeIdx::U32).is_valid());
	}

	#[test]
	fn convert_saturates_float_to_int() {
		let mut dst = [0u8; 8];
		let src = 1e9f32.to_le_bytes();
		assert!(convert(&mut dst, TypeIdx::I16, &src, TypeIdx::F32));
		assert_eq!(i16::from_le_bytes(dst[..2].try_into().unwrap()), i16::MAX);

		let src = (-42i32).to_le_bytes();
		assert!(convert(&mut dst, TypeIdx::F64, &src, TypeIdx::I32));
		assert_eq!(f64::from_le_bytes(dst[..8].try_into().unwrap()), -42.0);
	}
}
