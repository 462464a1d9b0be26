use std::io::Write;

use tracing::{debug, trace};

use crate::address::{AddressHeader, AddressModifier, AddressPrefix, AddressType};
use crate::asm::{Assembly, AssemblyData};
use crate::errors::{Errc, Error, Result};
use crate::host::{Host, LibHandle, ScopedMem, SymbolHandle};
use crate::indices::{base_type_size, offset_type, MethodIdx, TypeIdx};
use crate::opcodes::{Opcode, Subcode};
use crate::runtime::{Runtime, RuntimeParameters};
use crate::types::Generated;

#[inline(always)]
unsafe fn read<T: Copy>(addr: *const u8) -> T {
	(addr as *const T).read_unaligned()
}

#[inline(always)]
unsafe fn write<T: Copy>(addr: *mut u8, value: T) {
	(addr as *mut T).write_unaligned(value)
}

#[inline(always)]
unsafe fn deref(addr: *const u8) -> *mut u8 {
	read::<usize>(addr) as *mut u8
}

#[inline]
fn compare<T: PartialOrd>(lhs: T, rhs: T) -> i32 {
	if lhs < rhs {
		-1
	} else if lhs > rhs {
		1
	} else {
		0
	}
}

/// Saved caller state, written into the byte stack at the frame base.
#[repr(C)]
#[derive(Copy, Clone, Default)]
struct StackFrame {
	/// Caller instruction offset relative to its method body.
	iptr: usize,
	/// Offset of the caller's return-value scratch.
	return_offset: usize,
	frame_offset: usize,
	param_offset: usize,
	stack_offset: usize,
	stack_end: usize,
	method: u32,
	_reserved: u32,
}

const FRAME_SIZE: usize = std::mem::size_of::<StackFrame>();

impl StackFrame {
	fn root() -> Self {
		StackFrame { method: crate::indices::INVALID_INDEX, ..Default::default() }
	}
}

/// Per-library runtime state: the opened handle and resolved symbols, cached
/// after first use and released when execution ends.
struct LibCache<'l> {
	host: &'l dyn Host,
	handles: Vec<Option<LibHandle>>,
	symbols: Vec<Vec<Option<SymbolHandle>>>,
}

impl<'l> LibCache<'l> {
	fn new(host: &'l dyn Host, runtime: &Runtime) -> Result<Self> {
		let mut cache = LibCache {
			host,
			handles: vec![None; runtime.libraries().len()],
			symbols: runtime.libraries().iter().map(|lib| vec![None; lib.calls.len()]).collect(),
		};
		for (index, lib) in runtime.libraries().iter().enumerate() {
			if lib.preload_symbols {
				for call_index in 0..lib.calls.len() {
					cache.resolve(runtime, index as u32, call_index as u32)?;
				}
			}
		}
		Ok(cache)
	}

	fn resolve(&mut self, runtime: &Runtime, library: u32, call: u32) -> Result<SymbolHandle> {
		if let Some(symbol) = self.symbols[library as usize][call as usize] {
			return Ok(symbol);
		}
		let lib = runtime
			.library(library)
			.ok_or_else(|| Error::new(Errc::RtmExternalCallFailure, "invalid library index"))?;
		let handle = match self.handles[library as usize] {
			Some(handle) => handle,
			None => {
				let handle = self.host.openlib(&lib.path).ok_or_else(|| {
					Error::new(Errc::RtmExternalCallFailure, format!("failed to load library '{}'", lib.path))
				})?;
				self.handles[library as usize] = Some(handle);
				handle
			}
		};
		let name = &lib.calls[call as usize].name;
		let symbol = self.host.loadsym(handle, name).ok_or_else(|| {
			Error::new(Errc::RtmExternalCallFailure, format!("failed to find function '{name}'"))
		})?;
		self.symbols[library as usize][call as usize] = Some(symbol);
		Ok(symbol)
	}
}

impl Drop for LibCache<'_> {
	fn drop(&mut self) {
		for handle in self.handles.iter().flatten() {
			self.host.closelib(*handle);
		}
	}
}

/// Executable bytecode copied into a host region and switched read-only; the
/// interpreter fetches instructions exclusively from here.
struct CodeImage<'l> {
	mem: ScopedMem<'l>,
	ranges: Vec<(usize, usize)>,
}

impl<'l> CodeImage<'l> {
	fn new(host: &'l dyn Host, data: &AssemblyData) -> Result<CodeImage<'l>> {
		let total: usize = data.methods.iter().map(|m| m.bytecode.len()).sum();
		let mem = host
			.allocate(total.max(1))
			.ok_or_else(|| Error::new(Errc::RtmStackAllocationFailure, "failed to allocate protected code region"))?;
		let mut mem = ScopedMem::new(host, mem);

		let mut ranges = Vec::with_capacity(data.methods.len());
		let mut offset = 0usize;
		{
			let slice = mem.slice_mut();
			for method in &data.methods {
				slice[offset..offset + method.bytecode.len()].copy_from_slice(&method.bytecode);
				ranges.push((offset, method.bytecode.len()));
				offset += method.bytecode.len();
			}
		}
		if !mem.protect() {
			return Err(Error::new(
				Errc::RtmStackAllocationFailure,
				"failed to switch host memory pages to protected",
			));
		}
		Ok(CodeImage { mem, ranges })
	}

	#[inline]
	fn bytes(&self) -> &[u8] {
		self.mem.slice()
	}
}

struct Interpreter<'l> {
	data: &'l AssemblyData,
	runtime: &'l Runtime,
	parameters: RuntimeParameters,
	libs: LibCache<'l>,
	dump_out: &'l mut dyn Write,

	code: &'l [u8],
	code_ranges: &'l [(usize, usize)],

	stack: *mut u8,
	stack_capacity: usize,
	stack_size: usize,

	// Per-operand scratch, indexed LHS/RHS like the wire format.
	tmp_var: [usize; 2],
	addr_type: [TypeIdx; 2],

	return_value_addr: *mut u8,
	return_value_type: TypeIdx,

	iptr: usize,
	ibeg: usize,
	iend: usize,

	sf: StackFrame,
	callstack_depth: usize,
	current_method: MethodIdx,
	halted: bool,

	globals_data: *mut u8,
	constants_data: *mut u8,
}

macro_rules! malformed {
	($($arg:tt)*) => {
		Error::new(Errc::RtmMalformedBytecode, format!($($arg)*))
	};
}

// Implicit-conversion assignment table; entries mirror the linker's `set`
// subcodes. Entry 45 (aggregate copy) is handled by the caller.
macro_rules! set_eval {
	($sub:expr, $lhs:expr, $rhs:expr) => {
		match $sub.raw() {
			0 => write::<i8>($lhs, read::<i8>($rhs)),
			1 => write::<u8>($lhs, read::<u8>($rhs)),
			2 => write::<i16>($lhs, read::<i8>($rhs) as i16),
			3 => write::<i16>($lhs, read::<u8>($rhs) as i16),
			4 => write::<i16>($lhs, read::<i16>($rhs)),
			5 => write::<u16>($lhs, read::<u8>($rhs) as u16),
			6 => write::<u16>($lhs, read::<u16>($rhs)),
			7 => write::<i32>($lhs, read::<i8>($rhs) as i32),
			8 => write::<i32>($lhs, read::<u8>($rhs) as i32),
			9 => write::<i32>($lhs, read::<i16>($rhs) as i32),
			10 => write::<i32>($lhs, read::<u16>($rhs) as i32),
			11 => write::<i32>($lhs, read::<i32>($rhs)),
			12 => write::<u32>($lhs, read::<u8>($rhs) as u32),
			13 => write::<u32>($lhs, read::<u16>($rhs) as u32),
			14 => write::<u32>($lhs, read::<u32>($rhs)),
			15 => write::<i64>($lhs, read::<i8>($rhs) as i64),
			16 => write::<i64>($lhs, read::<u8>($rhs) as i64),
			17 => write::<i64>($lhs, read::<i16>($rhs) as i64),
			18 => write::<i64>($lhs, read::<u16>($rhs) as i64),
			19 => write::<i64>($lhs, read::<i32>($rhs) as i64),
			20 => write::<i64>($lhs, read::<u32>($rhs) as i64),
			21 => write::<i64>($lhs, read::<i64>($rhs)),
			22 => write::<u64>($lhs, read::<u8>($rhs) as u64),
			23 => write::<u64>($lhs, read::<u16>($rhs) as u64),
			24 => write::<u64>($lhs, read::<u32>($rhs) as u64),
			25 => write::<u64>($lhs, read::<u64>($rhs)),
			26 => write::<f32>($lhs, read::<i8>($rhs) as f32),
			27 => write::<f32>($lhs, read::<u8>($rhs) as f32),
			28 => write::<f32>($lhs, read::<i16>($rhs) as f32),
			29 => write::<f32>($lhs, read::<u16>($rhs) as f32),
			30 => write::<f32>($lhs, read::<i32>($rhs) as f32),
			31 => write::<f32>($lhs, read::<u32>($rhs) as f32),
			32 => write::<f32>($lhs, read::<i64>($rhs) as f32),
			33 => write::<f32>($lhs, read::<u64>($rhs) as f32),
			34 => write::<f32>($lhs, read::<f32>($rhs)),
			35 => write::<f64>($lhs, read::<i8>($rhs) as f64),
			36 => write::<f64>($lhs, read::<u8>($rhs) as f64),
			37 => write::<f64>($lhs, read::<i16>($rhs) as f64),
			38 => write::<f64>($lhs, read::<u16>($rhs) as f64),
			39 => write::<f64>($lhs, read::<i32>($rhs) as f64),
			40 => write::<f64>($lhs, read::<u32>($rhs) as f64),
			41 => write::<f64>($lhs, read::<i64>($rhs) as f64),
			42 => write::<f64>($lhs, read::<u64>($rhs) as f64),
			43 => write::<f64>($lhs, read::<f32>($rhs) as f64),
			44 => write::<f64>($lhs, read::<f64>($rhs)),
			_ => {}
		}
	};
}

// In-place binary arithmetic over the same pair table: `$int` is the
// wrapping method applied to integer entries, `$fop` the float operator.
macro_rules! arith_eval {
	($sub:expr, $lhs:expr, $rhs:expr, $int:ident, $fop:tt) => {
		match $sub.raw() {
			0 => { let v = read::<i8>($lhs).$int(read::<i8>($rhs)); write($lhs, v) }
			1 => { let v = read::<u8>($lhs).$int(read::<u8>($rhs)); write($lhs, v) }
			2 => { let v = read::<i16>($lhs).$int(read::<i8>($rhs) as i16); write($lhs, v) }
			3 => { let v = read::<i16>($lhs).$int(read::<u8>($rhs) as i16); write($lhs, v) }
			4 => { let v = read::<i16>($lhs).$int(read::<i16>($rhs)); write($lhs, v) }
			5 => { let v = read::<u16>($lhs).$int(read::<u8>($rhs) as u16); write($lhs, v) }
			6 => { let v = read::<u16>($lhs).$int(read::<u16>($rhs)); write($lhs, v) }
			7 => { let v = read::<i32>($lhs).$int(read::<i8>($rhs) as i32); write($lhs, v) }
			8 => { let v = read::<i32>($lhs).$int(read::<u8>($rhs) as i32); write($lhs, v) }
			9 => { let v = read::<i32>($lhs).$int(read::<i16>($rhs) as i32); write($lhs, v) }
			10 => { let v = read::<i32>($lhs).$int(read::<u16>($rhs) as i32); write($lhs, v) }
			11 => { let v = read::<i32>($lhs).$int(read::<i32>($rhs)); write($lhs, v) }
			12 => { let v = read::<u32>($lhs).$int(read::<u8>($rhs) as u32); write($lhs, v) }
			13 => { let v = read::<u32>($lhs).$int(read::<u16>($rhs) as u32); write($lhs, v) }
			14 => { let v = read::<u32>($lhs).$int(read::<u32>($rhs)); write($lhs, v) }
			15 => { let v = read::<i64>($lhs).$int(read::<i8>($rhs) as i64); write($lhs, v) }
			16 => { let v = read::<i64>($lhs).$int(read::<u8>($rhs) as i64); write($lhs, v) }
			17 => { let v = read::<i64>($lhs).$int(read::<i16>($rhs) as i64); write($lhs, v) }
			18 => { let v = read::<i64>($lhs).$int(read::<u16>($rhs) as i64); write($lhs, v) }
			19 => { let v = read::<i64>($lhs).$int(read::<i32>($rhs) as i64); write($lhs, v) }
			20 => { let v = read::<i64>($lhs).$int(read::<u32>($rhs) as i64); write($lhs, v) }
			21 => { let v = read::<i64>($lhs).$int(read::<i64>($rhs)); write($lhs, v) }
			22 => { let v = read::<u64>($lhs).$int(read::<u8>($rhs) as u64); write($lhs, v) }
			23 => { let v = read::<u64>($lhs).$int(read::<u16>($rhs) as u64); write($lhs, v) }
			24 => { let v = read::<u64>($lhs).$int(read::<u32>($rhs) as u64); write($lhs, v) }
			25 => { let v = read::<u64>($lhs).$int(read::<u64>($rhs)); write($lhs, v) }
			26 => { let v = read::<f32>($lhs) $fop (read::<i8>($rhs) as f32); write($lhs, v) }
			27 => { let v = read::<f32>($lhs) $fop (read::<u8>($rhs) as f32); write($lhs, v) }
			28 => { let v = read::<f32>($lhs) $fop (read::<i16>($rhs) as f32); write($lhs, v) }
			29 => { let v = read::<f32>($lhs) $fop (read::<u16>($rhs) as f32); write($lhs, v) }
			30 => { let v = read::<f32>($lhs) $fop (read::<i32>($rhs) as f32); write($lhs, v) }
			31 => { let v = read::<f32>($lhs) $fop (read::<u32>($rhs) as f32); write($lhs, v) }
			32 => { let v = read::<f32>($lhs) $fop (read::<i64>($rhs) as f32); write($lhs, v) }
			33 => { let v = read::<f32>($lhs) $fop (read::<u64>($rhs) as f32); write($lhs, v) }
			34 => { let v = read::<f32>($lhs) $fop read::<f32>($rhs); write($lhs, v) }
			35 => { let v = read::<f64>($lhs) $fop (read::<i8>($rhs) as f64); write($lhs, v) }
			36 => { let v = read::<f64>($lhs) $fop (read::<u8>($rhs) as f64); write($lhs, v) }
			37 => { let v = read::<f64>($lhs) $fop (read::<i16>($rhs) as f64); write($lhs, v) }
			38 => { let v = read::<f64>($lhs) $fop (read::<u16>($rhs) as f64); write($lhs, v) }
			39 => { let v = read::<f64>($lhs) $fop (read::<i32>($rhs) as f64); write($lhs, v) }
			40 => { let v = read::<f64>($lhs) $fop (read::<u32>($rhs) as f64); write($lhs, v) }
			41 => { let v = read::<f64>($lhs) $fop (read::<i64>($rhs) as f64); write($lhs, v) }
			42 => { let v = read::<f64>($lhs) $fop (read::<u64>($rhs) as f64); write($lhs, v) }
			43 => { let v = read::<f64>($lhs) $fop (read::<f32>($rhs) as f64); write($lhs, v) }
			44 => { let v = read::<f64>($lhs) $fop read::<f64>($rhs); write($lhs, v) }
			_ => {}
		}
	};
}

// Shift counts are masked to the operand bit width by the wrapping methods.
macro_rules! shift_eval {
	($sub:expr, $lhs:expr, $rhs:expr, $m:ident) => {
		match $sub.raw() {
			0 => { let v = read::<i8>($lhs).$m(read::<i8>($rhs) as u32); write($lhs, v) }
			1 => { let v = read::<u8>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			2 => { let v = read::<i16>($lhs).$m(read::<i8>($rhs) as u32); write($lhs, v) }
			3 => { let v = read::<i16>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			4 => { let v = read::<i16>($lhs).$m(read::<i16>($rhs) as u32); write($lhs, v) }
			5 => { let v = read::<u16>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			6 => { let v = read::<u16>($lhs).$m(read::<u16>($rhs) as u32); write($lhs, v) }
			7 => { let v = read::<i32>($lhs).$m(read::<i8>($rhs) as u32); write($lhs, v) }
			8 => { let v = read::<i32>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			9 => { let v = read::<i32>($lhs).$m(read::<i16>($rhs) as u32); write($lhs, v) }
			10 => { let v = read::<i32>($lhs).$m(read::<u16>($rhs) as u32); write($lhs, v) }
			11 => { let v = read::<i32>($lhs).$m(read::<i32>($rhs) as u32); write($lhs, v) }
			12 => { let v = read::<u32>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			13 => { let v = read::<u32>($lhs).$m(read::<u16>($rhs) as u32); write($lhs, v) }
			14 => { let v = read::<u32>($lhs).$m(read::<u32>($rhs)); write($lhs, v) }
			15 => { let v = read::<i64>($lhs).$m(read::<i8>($rhs) as u32); write($lhs, v) }
			16 => { let v = read::<i64>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			17 => { let v = read::<i64>($lhs).$m(read::<i16>($rhs) as u32); write($lhs, v) }
			18 => { let v = read::<i64>($lhs).$m(read::<u16>($rhs) as u32); write($lhs, v) }
			19 => { let v = read::<i64>($lhs).$m(read::<i32>($rhs) as u32); write($lhs, v) }
			20 => { let v = read::<i64>($lhs).$m(read::<u32>($rhs)); write($lhs, v) }
			21 => { let v = read::<i64>($lhs).$m(read::<i64>($rhs) as u32); write($lhs, v) }
			22 => { let v = read::<u64>($lhs).$m(read::<u8>($rhs) as u32); write($lhs, v) }
			23 => { let v = read::<u64>($lhs).$m(read::<u16>($rhs) as u32); write($lhs, v) }
			24 => { let v = read::<u64>($lhs).$m(read::<u32>($rhs)); write($lhs, v) }
			25 => { let v = read::<u64>($lhs).$m(read::<u64>($rhs) as u32); write($lhs, v) }
			_ => {}
		}
	};
}

macro_rules! bit_eval {
	($sub:expr, $lhs:expr, $rhs:expr, $op:tt) => {
		match $sub.raw() {
			0 => { let v = read::<i8>($lhs) $op read::<i8>($rhs); write($lhs, v) }
			1 => { let v = read::<u8>($lhs) $op read::<u8>($rhs); write($lhs, v) }
			2 => { let v = read::<i16>($lhs) $op (read::<i8>($rhs) as i16); write($lhs, v) }
			3 => { let v = read::<i16>($lhs) $op (read::<u8>($rhs) as i16); write($lhs, v) }
			4 => { let v = read::<i16>($lhs) $op read::<i16>($rhs); write($lhs, v) }
			5 => { let v = read::<u16>($lhs) $op (read::<u8>($rhs) as u16); write($lhs, v) }
			6 => { let v = read::<u16>($lhs) $op read::<u16>($rhs); write($lhs, v) }
			7 => { let v = read::<i32>($lhs) $op (read::<i8>($rhs) as i32); write($lhs, v) }
			8 => { let v = read::<i32>($lhs) $op (read::<u8>($rhs) as i32); write($lhs, v) }
			9 => { let v = read::<i32>($lhs) $op (read::<i16>($rhs) as i32); write($lhs, v) }
			10 => { let v = read::<i32>($lhs) $op (read::<u16>($rhs) as i32); write($lhs, v) }
			11 => { let v = read::<i32>($lhs) $op read::<i32>($rhs); write($lhs, v) }
			12 => { let v = read::<u32>($lhs) $op (read::<u8>($rhs) as u32); write($lhs, v) }
			13 => { let v = read::<u32>($lhs) $op (read::<u16>($rhs) as u32); write($lhs, v) }
			14 => { let v = read::<u32>($lhs) $op read::<u32>($rhs); write($lhs, v) }
			15 => { let v = read::<i64>($lhs) $op (read::<i8>($rhs) as i64); write($lhs, v) }
			16 => { let v = read::<i64>($lhs) $op (read::<u8>($rhs) as i64); write($lhs, v) }
			17 => { let v = read::<i64>($lhs) $op (read::<i16>($rhs) as i64); write($lhs, v) }
			18 => { let v = read::<i64>($lhs) $op (read::<u16>($rhs) as i64); write($lhs, v) }
			19 => { let v = read::<i64>($lhs) $op (read::<i32>($rhs) as i64); write($lhs, v) }
			20 => { let v = read::<i64>($lhs) $op (read::<u32>($rhs) as i64); write($lhs, v) }
			21 => { let v = read::<i64>($lhs) $op read::<i64>($rhs); write($lhs, v) }
			22 => { let v = read::<u64>($lhs) $op (read::<u8>($rhs) as u64); write($lhs, v) }
			23 => { let v = read::<u64>($lhs) $op (read::<u16>($rhs) as u64); write($lhs, v) }
			24 => { let v = read::<u64>($lhs) $op (read::<u32>($rhs) as u64); write($lhs, v) }
			25 => { let v = read::<u64>($lhs) $op read::<u64>($rhs); write($lhs, v) }
			_ => {}
		}
	};
}

// Comparison family: both operands promote to a common type. Signed/u64
// pairs have no entry; the linker never emits them.
macro_rules! cmp_eval {
	($sub:expr, $lhs:expr, $rhs:expr, $op:tt) => {
		match $sub.raw() {
			0 => ((read::<i8>($lhs) as i32) $op (read::<i8>($rhs) as i32)) as i32,
			1 => ((read::<i8>($lhs) as i32) $op (read::<u8>($rhs) as i32)) as i32,
			2 => ((read::<i8>($lhs) as i32) $op (read::<i16>($rhs) as i32)) as i32,
			3 => ((read::<i8>($lhs) as i32) $op (read::<u16>($rhs) as i32)) as i32,
			4 => ((read::<i8>($lhs) as i32) $op read::<i32>($rhs)) as i32,
			5 => ((read::<i8>($lhs) as i64) $op (read::<u32>($rhs) as i64)) as i32,
			6 => ((read::<i8>($lhs) as i64) $op read::<i64>($rhs)) as i32,
			7 => ((read::<i8>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			8 => ((read::<i8>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			9 => ((read::<u8>($lhs) as i32) $op (read::<i8>($rhs) as i32)) as i32,
			10 => ((read::<u8>($lhs) as i32) $op (read::<u8>($rhs) as i32)) as i32,
			11 => ((read::<u8>($lhs) as i32) $op (read::<i16>($rhs) as i32)) as i32,
			12 => ((read::<u8>($lhs) as i32) $op (read::<u16>($rhs) as i32)) as i32,
			13 => ((read::<u8>($lhs) as i32) $op read::<i32>($rhs)) as i32,
			14 => ((read::<u8>($lhs) as i64) $op (read::<u32>($rhs) as i64)) as i32,
			15 => ((read::<u8>($lhs) as i64) $op read::<i64>($rhs)) as i32,
			16 => ((read::<u8>($lhs) as u64) $op read::<u64>($rhs)) as i32,
			17 => ((read::<u8>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			18 => ((read::<u8>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			19 => ((read::<i16>($lhs) as i32) $op (read::<i8>($rhs) as i32)) as i32,
			20 => ((read::<i16>($lhs) as i32) $op (read::<u8>($rhs) as i32)) as i32,
			21 => ((read::<i16>($lhs) as i32) $op (read::<i16>($rhs) as i32)) as i32,
			22 => ((read::<i16>($lhs) as i32) $op (read::<u16>($rhs) as i32)) as i32,
			23 => ((read::<i16>($lhs) as i32) $op read::<i32>($rhs)) as i32,
			24 => ((read::<i16>($lhs) as i64) $op (read::<u32>($rhs) as i64)) as i32,
			25 => ((read::<i16>($lhs) as i64) $op read::<i64>($rhs)) as i32,
			26 => ((read::<i16>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			27 => ((read::<i16>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			28 => ((read::<u16>($lhs) as i32) $op (read::<i8>($rhs) as i32)) as i32,
			29 => ((read::<u16>($lhs) as i32) $op (read::<u8>($rhs) as i32)) as i32,
			30 => ((read::<u16>($lhs) as i32) $op (read::<i16>($rhs) as i32)) as i32,
			31 => ((read::<u16>($lhs) as i32) $op (read::<u16>($rhs) as i32)) as i32,
			32 => ((read::<u16>($lhs) as i32) $op read::<i32>($rhs)) as i32,
			33 => ((read::<u16>($lhs) as i64) $op (read::<u32>($rhs) as i64)) as i32,
			34 => ((read::<u16>($lhs) as i64) $op read::<i64>($rhs)) as i32,
			35 => ((read::<u16>($lhs) as u64) $op read::<u64>($rhs)) as i32,
			36 => ((read::<u16>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			37 => ((read::<u16>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			38 => (read::<i32>($lhs) $op (read::<i8>($rhs) as i32)) as i32,
			39 => (read::<i32>($lhs) $op (read::<u8>($rhs) as i32)) as i32,
			40 => (read::<i32>($lhs) $op (read::<i16>($rhs) as i32)) as i32,
			41 => (read::<i32>($lhs) $op (read::<u16>($rhs) as i32)) as i32,
			42 => (read::<i32>($lhs) $op read::<i32>($rhs)) as i32,
			43 => ((read::<i32>($lhs) as i64) $op (read::<u32>($rhs) as i64)) as i32,
			44 => ((read::<i32>($lhs) as i64) $op read::<i64>($rhs)) as i32,
			45 => ((read::<i32>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			46 => ((read::<i32>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			47 => ((read::<u32>($lhs) as i64) $op (read::<i8>($rhs) as i64)) as i32,
			48 => ((read::<u32>($lhs) as i64) $op (read::<u8>($rhs) as i64)) as i32,
			49 => ((read::<u32>($lhs) as i64) $op (read::<i16>($rhs) as i64)) as i32,
			50 => ((read::<u32>($lhs) as i64) $op (read::<u16>($rhs) as i64)) as i32,
			51 => ((read::<u32>($lhs) as i64) $op (read::<i32>($rhs) as i64)) as i32,
			52 => (read::<u32>($lhs) $op read::<u32>($rhs)) as i32,
			53 => ((read::<u32>($lhs) as i64) $op read::<i64>($rhs)) as i32,
			54 => ((read::<u32>($lhs) as u64) $op read::<u64>($rhs)) as i32,
			55 => ((read::<u32>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			56 => ((read::<u32>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			57 => (read::<i64>($lhs) $op (read::<i8>($rhs) as i64)) as i32,
			58 => (read::<i64>($lhs) $op (read::<u8>($rhs) as i64)) as i32,
			59 => (read::<i64>($lhs) $op (read::<i16>($rhs) as i64)) as i32,
			60 => (read::<i64>($lhs) $op (read::<u16>($rhs) as i64)) as i32,
			61 => (read::<i64>($lhs) $op (read::<i32>($rhs) as i64)) as i32,
			62 => (read::<i64>($lhs) $op (read::<u32>($rhs) as i64)) as i32,
			63 => (read::<i64>($lhs) $op read::<i64>($rhs)) as i32,
			64 => ((read::<i64>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			65 => ((read::<i64>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			66 => (read::<u64>($lhs) $op (read::<u8>($rhs) as u64)) as i32,
			67 => (read::<u64>($lhs) $op (read::<u16>($rhs) as u64)) as i32,
			68 => (read::<u64>($lhs) $op (read::<u32>($rhs) as u64)) as i32,
			69 => (read::<u64>($lhs) $op read::<u64>($rhs)) as i32,
			70 => ((read::<u64>($lhs) as f32) $op read::<f32>($rhs)) as i32,
			71 => ((read::<u64>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			72 => (read::<f32>($lhs) $op (read::<i8>($rhs) as f32)) as i32,
			73 => (read::<f32>($lhs) $op (read::<u8>($rhs) as f32)) as i32,
			74 => (read::<f32>($lhs) $op (read::<i16>($rhs) as f32)) as i32,
			75 => (read::<f32>($lhs) $op (read::<u16>($rhs) as f32)) as i32,
			76 => (read::<f32>($lhs) $op (read::<i32>($rhs) as f32)) as i32,
			77 => (read::<f32>($lhs) $op (read::<u32>($rhs) as f32)) as i32,
			78 => (read::<f32>($lhs) $op (read::<i64>($rhs) as f32)) as i32,
			79 => (read::<f32>($lhs) $op (read::<u64>($rhs) as f32)) as i32,
			80 => (read::<f32>($lhs) $op read::<f32>($rhs)) as i32,
			81 => ((read::<f32>($lhs) as f64) $op read::<f64>($rhs)) as i32,
			82 => (read::<f64>($lhs) $op (read::<i8>($rhs) as f64)) as i32,
			83 => (read::<f64>($lhs) $op (read::<u8>($rhs) as f64)) as i32,
			84 => (read::<f64>($lhs) $op (read::<i16>($rhs) as f64)) as i32,
			85 => (read::<f64>($lhs) $op (read::<u16>($rhs) as f64)) as i32,
			86 => (read::<f64>($lhs) $op (read::<i32>($rhs) as f64)) as i32,
			87 => (read::<f64>($lhs) $op (read::<u32>($rhs) as f64)) as i32,
			88 => (read::<f64>($lhs) $op (read::<i64>($rhs) as f64)) as i32,
			89 => (read::<f64>($lhs) $op (read::<u64>($rhs) as f64)) as i32,
			90 => (read::<f64>($lhs) $op (read::<f32>($rhs) as f64)) as i32,
			91 => (read::<f64>($lhs) $op read::<f64>($rhs)) as i32,
			_ => 0,
		}
	};
}

macro_rules! cmp3_eval {
	($sub:expr, $lhs:expr, $rhs:expr) => {
		match $sub.raw() {
			0 => compare(read::<i8>($lhs) as i32, read::<i8>($rhs) as i32),
			1 => compare(read::<i8>($lhs) as i32, read::<u8>($rhs) as i32),
			2 => compare(read::<i8>($lhs) as i32, read::<i16>($rhs) as i32),
			3 => compare(read::<i8>($lhs) as i32, read::<u16>($rhs) as i32),
			4 => compare(read::<i8>($lhs) as i32, read::<i32>($rhs)),
			5 => compare(read::<i8>($lhs) as i64, read::<u32>($rhs) as i64),
			6 => compare(read::<i8>($lhs) as i64, read::<i64>($rhs)),
			7 => compare(read::<i8>($lhs) as f32, read::<f32>($rhs)),
			8 => compare(read::<i8>($lhs) as f64, read::<f64>($rhs)),
			9 => compare(read::<u8>($lhs) as i32, read::<i8>($rhs) as i32),
			10 => compare(read::<u8>($lhs) as i32, read::<u8>($rhs) as i32),
			11 => compare(read::<u8>($lhs) as i32, read::<i16>($rhs) as i32),
			12 => compare(read::<u8>($lhs) as i32, read::<u16>($rhs) as i32),
			13 => compare(read::<u8>($lhs) as i32, read::<i32>($rhs)),
			14 => compare(read::<u8>($lhs) as i64, read::<u32>($rhs) as i64),
			15 => compare(read::<u8>($lhs) as i64, read::<i64>($rhs)),
			16 => compare(read::<u8>($lhs) as u64, read::<u64>($rhs)),
			17 => compare(read::<u8>($lhs) as f32, read::<f32>($rhs)),
			18 => compare(read::<u8>($lhs) as f64, read::<f64>($rhs)),
			19 => compare(read::<i16>($lhs) as i32, read::<i8>($rhs) as i32),
			20 => compare(read::<i16>($lhs) as i32, read::<u8>($rhs) as i32),
			21 => compare(read::<i16>($lhs) as i32, read::<i16>($rhs) as i32),
			22 => compare(read::<i16>($lhs) as i32, read::<u16>($rhs) as i32),
			23 => compare(read::<i16>($lhs) as i32, read::<i32>($rhs)),
			24 => compare(read::<i16>($lhs) as i64, read::<u32>($rhs) as i64),
			25 => compare(read::<i16>($lhs) as i64, read::<i64>($rhs)),
			26 => compare(read::<i16>($lhs) as f32, read::<f32>($rhs)),
			27 => compare(read::<i16>($lhs) as f64, read::<f64>($rhs)),
			28 => compare(read::<u16>($lhs) as i32, read::<i8>($rhs) as i32),
			29 => compare(read::<u16>($lhs) as i32, read::<u8>($rhs) as i32),
			30 => compare(read::<u16>($lhs) as i32, read::<i16>($rhs) as i32),
			31 => compare(read::<u16>($lhs) as i32, read::<u16>($rhs) as i32),
			32 => compare(read::<u16>($lhs) as i32, read::<i32>($rhs)),
			33 => compare(read::<u16>($lhs) as i64, read::<u32>($rhs) as i64),
			34 => compare(read::<u16>($lhs) as i64, read::<i64>($rhs)),
			35 => compare(read::<u16>($lhs) as u64, read::<u64>($rhs)),
			36 => compare(read::<u16>($lhs) as f32, read::<f32>($rhs)),
			37 => compare(read::<u16>($lhs) as f64, read::<f64>($rhs)),
			38 => compare(read::<i32>($lhs), read::<i8>($rhs) as i32),
			39 => compare(read::<i32>($lhs), read::<u8>($rhs) as i32),
			40 => compare(read::<i32>($lhs), read::<i16>($rhs) as i32),
			41 => compare(read::<i32>($lhs), read::<u16>($rhs) as i32),
			42 => compare(read::<i32>($lhs), read::<i32>($rhs)),
			43 => compare(read::<i32>($lhs) as i64, read::<u32>($rhs) as i64),
			44 => compare(read::<i32>($lhs) as i64, read::<i64>($rhs)),
			45 => compare(read::<i32>($lhs) as f32, read::<f32>($rhs)),
			46 => compare(read::<i32>($lhs) as f64, read::<f64>($rhs)),
			47 => compare(read::<u32>($lhs) as i64, read::<i8>($rhs) as i64),
			48 => compare(read::<u32>($lhs) as i64, read::<u8>($rhs) as i64),
			49 => compare(read::<u32>($lhs) as i64, read::<i16>($rhs) as i64),
			50 => compare(read::<u32>($lhs) as i64, read::<u16>($rhs) as i64),
			51 => compare(read::<u32>($lhs) as i64, read::<i32>($rhs) as i64),
			52 => compare(read::<u32>($lhs), read::<u32>($rhs)),
			53 => compare(read::<u32>($lhs) as i64, read::<i64>($rhs)),
			54 => compare(read::<u32>($lhs) as u64, read::<u64>($rhs)),
			55 => compare(read::<u32>($lhs) as f32, read::<f32>($rhs)),
			56 => compare(read::<u32>($lhs) as f64, read::<f64>($rhs)),
			57 => compare(read::<i64>($lhs), read::<i8>($rhs) as i64),
			58 => compare(read::<i64>($lhs), read::<u8>($rhs) as i64),
			59 => compare(read::<i64>($lhs), read::<i16>($rhs) as i64),
			60 => compare(read::<i64>($lhs), read::<u16>($rhs) as i64),
			61 => compare(read::<i64>($lhs), read::<i32>($rhs) as i64),
			62 => compare(read::<i64>($lhs), read::<u32>($rhs) as i64),
			63 => compare(read::<i64>($lhs), read::<i64>($rhs)),
			64 => compare(read::<i64>($lhs) as f32, read::<f32>($rhs)),
			65 => compare(read::<i64>($lhs) as f64, read::<f64>($rhs)),
			66 => compare(read::<u64>($lhs), read::<u8>($rhs) as u64),
			67 => compare(read::<u64>($lhs), read::<u16>($rhs) as u64),
			68 => compare(read::<u64>($lhs), read::<u32>($rhs) as u64),
			69 => compare(read::<u64>($lhs), read::<u64>($rhs)),
			70 => compare(read::<u64>($lhs) as f32, read::<f32>($rhs)),
			71 => compare(read::<u64>($lhs) as f64, read::<f64>($rhs)),
			72 => compare(read::<f32>($lhs), read::<i8>($rhs) as f32),
			73 => compare(read::<f32>($lhs), read::<u8>($rhs) as f32),
			74 => compare(read::<f32>($lhs), read::<i16>($rhs) as f32),
			75 => compare(read::<f32>($lhs), read::<u16>($rhs) as f32),
			76 => compare(read::<f32>($lhs), read::<i32>($rhs) as f32),
			77 => compare(read::<f32>($lhs), read::<u32>($rhs) as f32),
			78 => compare(read::<f32>($lhs), read::<i64>($rhs) as f32),
			79 => compare(read::<f32>($lhs), read::<u64>($rhs) as f32),
			80 => compare(read::<f32>($lhs), read::<f32>($rhs)),
			81 => compare(read::<f32>($lhs) as f64, read::<f64>($rhs)),
			82 => compare(read::<f64>($lhs), read::<i8>($rhs) as f64),
			83 => compare(read::<f64>($lhs), read::<u8>($rhs) as f64),
			84 => compare(read::<f64>($lhs), read::<i16>($rhs) as f64),
			85 => compare(read::<f64>($lhs), read::<u16>($rhs) as f64),
			86 => compare(read::<f64>($lhs), read::<i32>($rhs) as f64),
			87 => compare(read::<f64>($lhs), read::<u32>($rhs) as f64),
			88 => compare(read::<f64>($lhs), read::<i64>($rhs) as f64),
			89 => compare(read::<f64>($lhs), read::<u64>($rhs) as f64),
			90 => compare(read::<f64>($lhs), read::<f32>($rhs) as f64),
			91 => compare(read::<f64>($lhs), read::<f64>($rhs)),
			_ => 0,
		}
	};
}

macro_rules! zero_eval {
	($sub:expr, $lhs:expr, $op:tt) => {
		match $sub.raw() {
			0 => (read::<i8>($lhs) $op 0) as i32,
			1 => (read::<u8>($lhs) $op 0) as i32,
			2 => (read::<i16>($lhs) $op 0) as i32,
			3 => (read::<u16>($lhs) $op 0) as i32,
			4 => (read::<i32>($lhs) $op 0) as i32,
			5 => (read::<u32>($lhs) $op 0) as i32,
			6 => (read::<i64>($lhs) $op 0) as i32,
			7 => (read::<u64>($lhs) $op 0) as i32,
			8 => (read::<f32>($lhs) $op 0.0) as i32,
			9 => (read::<f64>($lhs) $op 0.0) as i32,
			_ => 0,
		}
	};
}

impl<'l> Interpreter<'l> {
	#[inline]
	fn read_opcode(&mut self) -> Result<Opcode> {
		if self.iptr < self.ibeg || self.iptr >= self.iend {
			return Err(malformed!("instruction pointer out of range"));
		}
		let byte = self.code[self.iptr];
		self.iptr += 1;
		Opcode::decode(byte).ok_or_else(|| malformed!("malformed opcode: {byte:#04X}"))
	}

	#[inline]
	fn read_subcode(&mut self) -> Subcode {
		let sub = Subcode(self.code[self.iptr]);
		self.iptr += 1;
		sub
	}

	#[inline]
	fn read_u8(&mut self) -> u8 {
		let value = self.code[self.iptr];
		self.iptr += 1;
		value
	}

	#[inline]
	fn read_u32(&mut self) -> u32 {
		let value = u32::from_le_bytes(self.code[self.iptr..self.iptr + 4].try_into().unwrap());
		self.iptr += 4;
		value
	}

	#[inline]
	fn read_u64(&mut self) -> u64 {
		let value = u64::from_le_bytes(self.code[self.iptr..self.iptr + 8].try_into().unwrap());
		self.iptr += 8;
		value
	}

	#[inline]
	fn get_type(&self, ty: TypeIdx) -> &crate::types::Type {
		&self.data.types[ty.index()]
	}

	#[inline]
	fn addr_type(&self, rhs: bool) -> &crate::types::Type {
		self.get_type(self.addr_type[rhs as usize])
	}

	/// Decode one operand, returning the resolved memory address. The side
	/// flag selects the scratch slot used for `&` and `!` prefixes.
	unsafe fn read_address(&mut self, rhs: bool) -> *mut u8 {
		let slot = rhs as usize;
		let header = AddressHeader::from_raw(self.read_u32());
		let index = header.index();

		let mut result: *mut u8;
		match header.address_type() {
			AddressType::Stackvar => {
				if index == AddressHeader::INDEX_MAX {
					result = self.return_value_addr;
					self.addr_type[slot] = self.return_value_type;
				} else {
					let var = &self.data.methods[self.current_method.index()].stackvars[index as usize];
					result = self.stack.add(self.sf.stack_offset + var.offset);
					self.addr_type[slot] = var.ty;
				}
			}
			AddressType::Parameter => {
				let signature = self.data.methods[self.current_method.index()].signature;
				let param = &self.data.signatures[signature.index()].parameters[index as usize];
				result = self.stack.add(self.sf.param_offset + param.offset);
				self.addr_type[slot] = param.ty;
			}
			AddressType::Global => {
				let global = crate::indices::GlobalIdx(index);
				let (info, base) = match global.is_constant() {
					true => (&self.data.constants.info[global.table_index()], self.constants_data),
					false => (&self.data.globals.info[global.table_index()], self.globals_data),
				};
				result = base.add(info.offset);
				self.addr_type[slot] = info.ty;
			}
			AddressType::Constant => {
				let ty = TypeIdx(index);
				let value = self.code.as_ptr().add(self.iptr) as *mut u8;
				self.iptr += base_type_size(ty);
				self.addr_type[slot] = ty;
				// Constants carry no modifier or prefix.
				return value;
			}
		}

		match header.modifier() {
			AddressModifier::None => {
				self.iptr += 8;
			}
			AddressModifier::DirectField => {
				let field_index = self.read_u64() as usize;
				let field = &self.data.offsets[field_index];
				result = result.add(field.offset);
				self.addr_type[slot] = field.ty;
			}
			AddressModifier::IndirectField => {
				let field_index = self.read_u64() as usize;
				let field = &self.data.offsets[field_index];
				result = deref(result).add(field.offset);
				self.addr_type[slot] = field.ty;
			}
			AddressModifier::Offset => {
				let offset = self.read_u64() as i64 as isize;
				match self.addr_type(rhs).generated {
					Some(Generated::Pointer { underlying_type, underlying_size }) => {
						result = deref(result).wrapping_offset(underlying_size as isize * offset);
						self.addr_type[slot] = underlying_type;
					}
					Some(Generated::Array { underlying_type, .. }) => {
						let size = self.get_type(underlying_type).total_size;
						result = result.wrapping_offset(size as isize * offset);
						self.addr_type[slot] = underlying_type;
					}
					_ => {}
				}
			}
		}

		match header.prefix() {
			AddressPrefix::None => {}
			AddressPrefix::Indirection => {
				let pointee = self.addr_type(rhs).pointee();
				result = deref(result);
				self.addr_type[slot] = pointee;
			}
			AddressPrefix::AddressOf => {
				self.tmp_var[slot] = result as usize;
				let pointer_type = self.addr_type(rhs).pointer_type;
				self.addr_type[slot] = match pointer_type.is_valid() {
					true => pointer_type,
					false => TypeIdx::VPTR,
				};
				result = (&mut self.tmp_var[slot]) as *mut usize as *mut u8;
			}
			AddressPrefix::SizeOf => {
				self.tmp_var[slot] = self.addr_type(rhs).total_size;
				self.addr_type[slot] = crate::indices::size_type();
				result = (&mut self.tmp_var[slot]) as *mut usize as *mut u8;
			}
		}

		result
	}

	unsafe fn eval_set(&mut self, sub: Subcode, lhs: *mut u8, rhs: *const u8) {
		if sub == crate::operations::SET_MEMCPY {
			let size = self.addr_type(true).total_size;
			std::ptr::copy_nonoverlapping(rhs, lhs, size);
			return;
		}
		set_eval!(sub, lhs, rhs);
	}

	// Explicit conversions are dense over the primitive pairs: the subcode
	// decomposes into `(destination, source)`.
	unsafe fn eval_conv(&mut self, sub: Subcode, lhs: *mut u8, rhs: *const u8) {
		macro_rules! conv_to {
			($dst:ty, $r:expr, $lhs:expr, $rhs:expr) => {
				match $r {
					0 => write($lhs, read::<i8>($rhs) as $dst),
					1 => write($lhs, read::<u8>($rhs) as $dst),
					2 => write($lhs, read::<i16>($rhs) as $dst),
					3 => write($lhs, read::<u16>($rhs) as $dst),
					4 => write($lhs, read::<i32>($rhs) as $dst),
					5 => write($lhs, read::<u32>($rhs) as $dst),
					6 => write($lhs, read::<i64>($rhs) as $dst),
					7 => write($lhs, read::<u64>($rhs) as $dst),
					8 => write($lhs, read::<f32>($rhs) as $dst),
					9 => write($lhs, read::<f64>($rhs) as $dst),
					_ => {}
				}
			};
		}
		let source = sub.raw() % 10;
		match sub.raw() / 10 {
			0 => conv_to!(i8, source, lhs, rhs),
			1 => conv_to!(u8, source, lhs, rhs),
			2 => conv_to!(i16, source, lhs, rhs),
			3 => conv_to!(u16, source, lhs, rhs),
			4 => conv_to!(i32, source, lhs, rhs),
			5 => conv_to!(u32, source, lhs, rhs),
			6 => conv_to!(i64, source, lhs, rhs),
			7 => conv_to!(u64, source, lhs, rhs),
			8 => conv_to!(f32, source, lhs, rhs),
			9 => conv_to!(f64, source, lhs, rhs),
			_ => {}
		}
	}

	#[inline]
	fn push_return_value(&mut self, ty: TypeIdx) -> *mut u8 {
		self.return_value_addr = unsafe { self.stack.add(self.sf.stack_end) };
		self.return_value_type = ty;
		self.return_value_addr
	}

	#[inline]
	fn clear_return_value(&mut self) {
		self.return_value_addr = std::ptr::null_mut();
		self.return_value_type = TypeIdx::VOID;
	}

	#[inline]
	fn jump(&mut self, target: u32) {
		self.iptr = self.ibeg + target as usize;
		self.clear_return_value();
	}

	fn execute(&mut self) -> Result<()> {
		while !self.halted {
			let op = self.read_opcode()?;
			unsafe {
				match op {
					Opcode::noop => {}

					Opcode::set => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						self.eval_set(sub, lhs, rhs);
					}
					Opcode::conv => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						self.eval_conv(sub, lhs, rhs);
					}

					Opcode::ari_not => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						match sub.raw() {
							0 => write(lhs, !read::<i8>(lhs)),
							1 => write(lhs, !read::<u8>(lhs)),
							2 => write(lhs, !read::<i16>(lhs)),
							3 => write(lhs, !read::<u16>(lhs)),
							4 => write(lhs, !read::<i32>(lhs)),
							5 => write(lhs, !read::<u32>(lhs)),
							6 => write(lhs, !read::<i64>(lhs)),
							7 => write(lhs, !read::<u64>(lhs)),
							_ => {}
						}
					}
					Opcode::ari_neg => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						match sub.raw() {
							0 => write(lhs, read::<i8>(lhs).wrapping_neg()),
							1 => write(lhs, read::<i16>(lhs).wrapping_neg()),
							2 => write(lhs, read::<i32>(lhs).wrapping_neg()),
							3 => write(lhs, read::<i64>(lhs).wrapping_neg()),
							4 => write(lhs, -read::<f32>(lhs)),
							5 => write(lhs, -read::<f64>(lhs)),
							_ => {}
						}
					}
					Opcode::ari_mul => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						arith_eval!(sub, lhs, rhs, wrapping_mul, *);
					}
					Opcode::ari_div => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						arith_eval!(sub, lhs, rhs, wrapping_div, /);
					}
					Opcode::ari_mod => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						arith_eval!(sub, lhs, rhs, wrapping_rem, %);
					}
					Opcode::ari_add => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						arith_eval!(sub, lhs, rhs, wrapping_add, +);
					}
					Opcode::ari_sub => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						arith_eval!(sub, lhs, rhs, wrapping_sub, -);
					}
					Opcode::ari_lsh => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						shift_eval!(sub, lhs, rhs, wrapping_shl);
					}
					Opcode::ari_rsh => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						shift_eval!(sub, lhs, rhs, wrapping_shr);
					}
					Opcode::ari_and => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						bit_eval!(sub, lhs, rhs, &);
					}
					Opcode::ari_xor => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						bit_eval!(sub, lhs, rhs, ^);
					}
					Opcode::ari_or => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						bit_eval!(sub, lhs, rhs, |);
					}

					Opcode::padd => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let delta = self.pointer_delta(sub, rhs);
						write::<usize>(lhs, read::<usize>(lhs).wrapping_add(delta));
					}
					Opcode::psub => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let delta = self.pointer_delta(sub, rhs);
						write::<usize>(lhs, read::<usize>(lhs).wrapping_sub(delta));
					}
					Opcode::pdif => {
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let size = self.addr_type(false).pointee_size() as isize;
						let diff = (read::<usize>(lhs) as isize).wrapping_sub(read::<usize>(rhs) as isize) / size;
						let out = self.push_return_value(offset_type());
						write::<isize>(out, diff);
					}

					Opcode::cmp => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp3_eval!(sub, lhs, rhs);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::ceq => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp_eval!(sub, lhs, rhs, ==);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::cne => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp_eval!(sub, lhs, rhs, !=);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::cgt => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp_eval!(sub, lhs, rhs, >);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::cge => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp_eval!(sub, lhs, rhs, >=);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::clt => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp_eval!(sub, lhs, rhs, <);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::cle => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let result = cmp_eval!(sub, lhs, rhs, <=);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::cze => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let result = zero_eval!(sub, lhs, ==);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}
					Opcode::cnz => {
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let result = zero_eval!(sub, lhs, !=);
						let out = self.push_return_value(TypeIdx::I32);
						write::<i32>(out, result);
					}

					Opcode::br => {
						let target = self.read_u32();
						self.jump(target);
					}
					Opcode::beq | Opcode::bne | Opcode::bgt | Opcode::bge | Opcode::blt | Opcode::ble => {
						let target = self.read_u32();
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let rhs = self.read_address(true);
						let taken = match op {
							Opcode::beq => cmp_eval!(sub, lhs, rhs, ==),
							Opcode::bne => cmp_eval!(sub, lhs, rhs, !=),
							Opcode::bgt => cmp_eval!(sub, lhs, rhs, >),
							Opcode::bge => cmp_eval!(sub, lhs, rhs, >=),
							Opcode::blt => cmp_eval!(sub, lhs, rhs, <),
							_ => cmp_eval!(sub, lhs, rhs, <=),
						};
						match taken != 0 {
							true => self.jump(target),
							false => self.clear_return_value(),
						}
					}
					Opcode::bze | Opcode::bnz => {
						let target = self.read_u32();
						let sub = self.read_subcode();
						let lhs = self.read_address(false);
						let taken = match op {
							Opcode::bze => zero_eval!(sub, lhs, ==),
							_ => zero_eval!(sub, lhs, !=),
						};
						match taken != 0 {
							true => self.jump(target),
							false => self.clear_return_value(),
						}
					}

					Opcode::sw => {
						let idx_addr = self.read_address(false);
						let index: u32 = match self.addr_type[0] {
							TypeIdx::I8 => read::<i8>(idx_addr) as u32,
							TypeIdx::U8 => read::<u8>(idx_addr) as u32,
							TypeIdx::I16 => read::<i16>(idx_addr) as u32,
							TypeIdx::U16 => read::<u16>(idx_addr) as u32,
							TypeIdx::I32 => read::<i32>(idx_addr) as u32,
							TypeIdx::U32 => read::<u32>(idx_addr),
							TypeIdx::I64 => read::<i64>(idx_addr) as u32,
							TypeIdx::U64 => read::<u64>(idx_addr) as u32,
							_ => 0,
						};
						let label_count = self.read_u32();
						let labels_at = self.iptr;
						self.iptr += 4 * label_count as usize;
						match index < label_count {
							true => {
								let target = u32::from_le_bytes(
									self.code[labels_at + index as usize * 4..labels_at + index as usize * 4 + 4]
										.try_into()
										.unwrap(),
								);
								self.jump(target);
							}
							false => self.clear_return_value(),
						}
					}

					Opcode::call => {
						let method = MethodIdx(self.read_u32());
						if method.index() >= self.data.methods.len() {
							return Err(malformed!("attempted to invoke an invalid method"));
						}
						let signature = self.data.methods[method.index()].signature;
						self.push_stack_frame(method, signature)?;
					}
					Opcode::callv => {
						let method_ptr = self.read_address(false);
						let handle = read::<usize>(method_ptr);
						if handle == 0 {
							return Err(Error::new(
								Errc::RtmInvalidMethodPointer,
								"attempted to invoke a null method pointer",
							));
						}
						let index = handle ^ self.data.runtime_hash as usize;
						if index >= self.data.methods.len() {
							return Err(Error::new(
								Errc::RtmInvalidMethodPointer,
								"attempted to invoke an invalid method pointer",
							));
						}
						let Some(Generated::Signature { index: calling_signature }) =
							self.addr_type(false).generated
						else {
							return Err(malformed!("callv through a non-signature operand"));
						};
						self.push_stack_frame(MethodIdx::new(index), calling_signature)?;
					}
					Opcode::ret => {
						self.clear_return_value();
						self.pop_stack_frame();
					}
					Opcode::retv => {
						let sub = self.read_subcode();
						let value = self.read_address(true);

						let return_offset = self.sf.return_offset;
						let signature = self.data.methods[self.current_method.index()].signature;
						self.return_value_addr = self.stack.add(return_offset);
						self.return_value_type = self.data.signatures[signature.index()].return_type;
						let out = self.return_value_addr;
						self.eval_set(sub, out, value);
						self.pop_stack_frame();
					}

					Opcode::dump => {
						let addr = self.read_address(true);
						let ty = self.addr_type[1];
						self.dump_value(addr, ty)?;
						self.dump_out
							.write_all(b"\n")
							.map_err(|_| malformed!("dump stream failure"))?;
					}
				}
			}
		}
		Ok(())
	}

	unsafe fn pointer_delta(&mut self, sub: Subcode, rhs: *const u8) -> usize {
		let size = self.addr_type(false).pointee_size();
		match sub.raw() {
			0 => size.wrapping_mul(read::<i8>(rhs) as isize as usize),
			1 => size.wrapping_mul(read::<u8>(rhs) as usize),
			2 => size.wrapping_mul(read::<i16>(rhs) as isize as usize),
			3 => size.wrapping_mul(read::<u16>(rhs) as usize),
			4 => size.wrapping_mul(read::<i32>(rhs) as isize as usize),
			5 => size.wrapping_mul(read::<u32>(rhs) as usize),
			6 => size.wrapping_mul(read::<i64>(rhs) as isize as usize),
			7 => size.wrapping_mul(read::<u64>(rhs) as usize),
			_ => 0,
		}
	}

	unsafe fn push_stack_frame(&mut self, method: MethodIdx, calling_signature: crate::indices::SignatureIdx) -> Result<()> {
		if self.data.methods[method.index()].signature != calling_signature {
			return Err(malformed!("call signature mismatch"));
		}
		let is_external = self.data.methods[method.index()].is_external();
		let method_stack_size = self.data.methods[method.index()].method_stack_size;
		let total_stack_size = self.data.methods[method.index()].total_stack_size;
		let parameter_count = self.data.signatures[calling_signature.index()].parameters.len();
		let parameters_size = self.data.signatures[calling_signature.index()].parameters_size;
		let return_type = self.data.signatures[calling_signature.index()].return_type;

		let frame_offset = self.stack_size;
		let return_offset = self.sf.stack_end;

		if !is_external {
			self.callstack_depth += 1;
			if self.callstack_depth > self.parameters.max_callstack_depth {
				return Err(Error::new(
					Errc::RtmCallstackLimitReached,
					format!("maximum callstack depth of {} exceeded", self.parameters.max_callstack_depth),
				));
			}

			let param_offset = frame_offset + FRAME_SIZE;
			let stack_offset = param_offset + parameters_size;
			let stack_end = self.stack_size + FRAME_SIZE + method_stack_size;
			let new_stack_size = self.stack_size + FRAME_SIZE + total_stack_size;
			if new_stack_size > self.stack_capacity {
				return Err(Error::new(
					Errc::RtmStackOverflow,
					format!("runtime stack overflow ({new_stack_size}/{})", self.stack_capacity),
				));
			}
			self.stack_size = new_stack_size;

			// Copy arguments into the parameter area. The root entry carries
			// no argument list.
			if self.current_method.is_valid() {
				let arg_count = self.read_u8() as usize;
				if arg_count != parameter_count {
					return Err(malformed!("invalid argument count"));
				}
				for i in 0..parameter_count {
					let parameter = self.data.signatures[calling_signature.index()].parameters[i];
					let sub = self.read_subcode();
					let arg_addr = self.read_address(true);
					let param_addr = self.stack.add(param_offset + parameter.offset);
					self.eval_set(sub, param_addr, arg_addr);
				}
			}

			// Save the caller frame inside the stack itself.
			let mut saved = self.sf;
			saved.iptr = self.iptr - self.ibeg;
			write::<StackFrame>(self.stack.add(frame_offset), saved);

			let (code_offset, code_len) = self.code_ranges[method.index()];
			self.sf = StackFrame {
				iptr: 0,
				return_offset,
				frame_offset,
				param_offset,
				stack_offset,
				stack_end,
				method: method.raw(),
				_reserved: 0,
			};
			self.current_method = method;
			self.ibeg = code_offset;
			self.iend = code_offset + code_len;
			self.iptr = code_offset;

			self.clear_return_value();
			trace!(method = method.raw(), depth = self.callstack_depth, "call");
		} else {
			let call_idx = self.data.methods[method.index()]
				.external_call
				.ok_or_else(|| malformed!("external method without a call descriptor"))?;
			let symbol = self.libs.resolve(self.runtime, call_idx.library, call_idx.index)?;
			let forward = self
				.runtime
				.call(call_idx)
				.ok_or_else(|| malformed!("invalid external call index"))?
				.forward;

			// Externals only push their parameter area.
			let param_offset = self.stack_size;
			if total_stack_size > 0 {
				let new_stack_size = self.stack_size + total_stack_size;
				if new_stack_size > self.stack_capacity {
					return Err(Error::new(
						Errc::RtmStackOverflow,
						format!("runtime stack overflow ({new_stack_size}/{})", self.stack_capacity),
					));
				}
				self.stack_size = new_stack_size;
			}

			if self.current_method.is_valid() {
				let arg_count = self.read_u8() as usize;
				if arg_count != parameter_count {
					return Err(malformed!("invalid argument count"));
				}
				for i in 0..parameter_count {
					let parameter = self.data.signatures[calling_signature.index()].parameters[i];
					let sub = self.read_subcode();
					let arg_addr = self.read_address(true);
					let param_addr = self.stack.add(param_offset + parameter.offset);
					self.eval_set(sub, param_addr, arg_addr);
				}
			}

			let return_addr = self.stack.add(return_offset);
			let param_addr = self.stack.add(param_offset);
			forward(symbol, return_addr, param_addr);

			// The callee returned immediately; expose its return value.
			self.return_value_addr = return_addr;
			self.return_value_type = return_type;
			self.stack_size = frame_offset;
		}
		Ok(())
	}

	unsafe fn pop_stack_frame(&mut self) {
		let frame_offset = self.sf.frame_offset;
		let saved = read::<StackFrame>(self.stack.add(frame_offset));
		self.stack_size = frame_offset;
		self.sf = saved;
		if saved.method != crate::indices::INVALID_INDEX {
			let method = MethodIdx(saved.method);
			let (code_offset, code_len) = self.code_ranges[method.index()];
			self.current_method = method;
			self.ibeg = code_offset;
			self.iend = code_offset + code_len;
			self.iptr = code_offset + saved.iptr;
		} else {
			self.current_method = MethodIdx::INVALID;
			self.halted = true;
		}
		self.callstack_depth -= 1;
	}

	unsafe fn dump_value(&mut self, addr: *const u8, ty: TypeIdx) -> Result<()> {
		let mut out = String::new();
		self.format_value(addr, ty, &mut out);
		self.dump_out
			.write_all(out.as_bytes())
			.map_err(|_| malformed!("dump stream failure"))
	}

	unsafe fn format_value(&self, addr: *const u8, ty: TypeIdx, out: &mut String) {
		use std::fmt::Write as _;

		let mut name = String::new();
		self.data.generate_name(ty, &mut name);
		out.push_str(&name);

		match ty {
			TypeIdx::I8 => { let _ = write!(out, "({})", read::<i8>(addr) as i32); }
			TypeIdx::U8 => { let _ = write!(out, "({})", read::<u8>(addr) as u32); }
			TypeIdx::I16 => { let _ = write!(out, "({})", read::<i16>(addr)); }
			TypeIdx::U16 => { let _ = write!(out, "({})", read::<u16>(addr)); }
			TypeIdx::I32 => { let _ = write!(out, "({})", read::<i32>(addr)); }
			TypeIdx::U32 => { let _ = write!(out, "({})", read::<u32>(addr)); }
			TypeIdx::I64 => { let _ = write!(out, "({})", read::<i64>(addr)); }
			TypeIdx::U64 => { let _ = write!(out, "({})", read::<u64>(addr)); }
			TypeIdx::F32 => { let _ = write!(out, "({})", read::<f32>(addr)); }
			TypeIdx::F64 => { let _ = write!(out, "({})", read::<f64>(addr)); }
			_ => {
				let entry = self.get_type(ty);
				if entry.is_pointer() || entry.is_signature() || ty == TypeIdx::VPTR {
					let _ = write!(out, "({:#x})", read::<usize>(addr));
				} else if let Some(Generated::Array { underlying_type, array_size }) = entry.generated {
					let element_size = self.get_type(underlying_type).total_size;
					out.push('{');
					for i in 0..array_size {
						out.push_str(if i == 0 { " " } else { ", " });
						self.format_value(addr.add(element_size * i), underlying_type, out);
					}
					out.push_str(" }");
				} else if !entry.fields.is_empty() {
					out.push('{');
					for (i, field) in entry.fields.iter().enumerate() {
						out.push_str(if i == 0 { " " } else { ", " });
						out.push_str(self.data.database.name(field.name));
						out.push_str(" = ");
						self.format_value(addr.add(field.offset), field.ty, out);
					}
					out.push_str(" }");
				} else {
					out.push_str("(?)");
				}
			}
		}
	}
}

impl Runtime {
	/// Execute a linked assembly against this runtime with default stack and
	/// callstack limits, writing `dump` output to stdout.
	pub fn execute(&self, assembly: &Assembly, host: &dyn Host) -> Result<i32> {
		self.execute_with(assembly, host, RuntimeParameters::default(), &mut std::io::stdout())
	}

	/// Execute with explicit parameters and dump sink. The exit code is the
	/// value `main` returned.
	pub fn execute_with(
		&self,
		assembly: &Assembly,
		host: &dyn Host,
		parameters: RuntimeParameters,
		dump: &mut dyn Write,
	) -> Result<i32> {
		if !assembly.is_valid() {
			return Err(Error::new(Errc::RtmInvalidAssembly, "attempted to execute an invalid assembly"));
		}
		if !assembly.is_compatible() {
			return Err(Error::new(
				Errc::RtmIncompatibleAssembly,
				"attempted to execute an assembly that was built using an incompatible toolchain",
			));
		}

		// Re-read the image through a protected host region; the interpreter
		// never touches the caller's buffer afterwards.
		let image = host
			.allocate(assembly.data().len())
			.ok_or_else(|| Error::new(Errc::RtmStackAllocationFailure, "failed to allocate assembly image"))?;
		let mut image = ScopedMem::new(host, image);
		image.slice_mut().copy_from_slice(assembly.data());
		if !image.protect() {
			return Err(Error::new(
				Errc::RtmStackAllocationFailure,
				"failed to switch host memory pages to protected",
			));
		}
		let bytes = image.slice();
		let header_len = crate::intermediate::ASSEMBLY_HEADER.len() + 8;
		let payload = &bytes[header_len..bytes.len() - crate::intermediate::FOOTER.len()];
		let data = AssemblyData::deserialize_payload(payload)?;

		if data.runtime_hash != self.hash() {
			return Err(Error::new(Errc::RtmRuntimeHashMismatch, "runtime hash value mismatch"));
		}
		if !data.main.is_valid() || data.main.index() >= data.methods.len() {
			return Err(Error::new(
				Errc::RtmEntrypointNotFound,
				"failed to find main entrypoint in assembly",
			));
		}

		let code = CodeImage::new(host, &data)?;
		let libs = LibCache::new(host, self)?;

		// Largest power of two within bounds that the host grants.
		let mut stack_mem = None;
		for bit in (0..usize::BITS).rev() {
			let capacity = 1usize << bit;
			if capacity >= parameters.min_stack_size && capacity <= parameters.max_stack_size {
				if let Some(mem) = host.allocate(capacity) {
					stack_mem = Some(ScopedMem::new(host, mem));
					break;
				}
			}
		}
		let mut stack_mem = stack_mem.ok_or_else(|| {
			Error::new(Errc::RtmStackAllocationFailure, "failed to allocate sufficient memory for runtime stack")
		})?;

		// Globals are writable at runtime; constants stay as linked.
		let mut globals_data = data.globals.data.clone();
		let mut constants_data = data.constants.data.clone();

		let stack_capacity = stack_mem.size();
		let stack_ptr = stack_mem.slice_mut().as_mut_ptr();
		debug!(
			stack = stack_capacity,
			methods = data.methods.len(),
			entry = data.main.raw(),
			"starting execution"
		);

		let mut interpreter = Interpreter {
			data: &data,
			runtime: self,
			parameters,
			libs,
			dump_out: dump,
			code: code.bytes(),
			code_ranges: &code.ranges,
			stack: stack_ptr,
			stack_capacity,
			stack_size: base_type_size(TypeIdx::I32),
			tmp_var: [0; 2],
			addr_type: [TypeIdx::VOID; 2],
			return_value_addr: std::ptr::null_mut(),
			return_value_type: TypeIdx::VOID,
			iptr: 0,
			ibeg: 0,
			iend: 0,
			sf: StackFrame::root(),
			callstack_depth: 0,
			current_method: MethodIdx::INVALID,
			halted: false,
			globals_data: globals_data.as_mut_ptr(),
			constants_data: constants_data.as_mut_ptr(),
		};

		let main_signature = data.methods[data.main.index()].signature;
		unsafe {
			interpreter.push_stack_frame(data.main, main_signature)?;
			interpreter.execute()?;
		}

		if interpreter.callstack_depth != 0 || interpreter.stack_size != base_type_size(TypeIdx::I32) {
			return Err(malformed!("unbalanced stack at exit"));
		}
		let exit_code = unsafe { read::<i32>(stack_ptr) };
		debug!(exit_code, "execution finished");
		Ok(exit_code)
	}
}
