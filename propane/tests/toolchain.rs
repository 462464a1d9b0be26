use propane::address::Address;
use propane::errors::Errc;
use propane::gen::Generator;
use propane::host::{Host, LibHandle, SymbolHandle, SystemHost};
use propane::indices::{MethodIdx, TypeIdx};
use propane::intermediate::Intermediate;
use propane::runtime::{ExternalCall, Library, NativeParameter, Runtime, RuntimeParameters, TypeDecl};
use propane::{link, Assembly};

fn run(assembly: &Assembly) -> i32 {
	let runtime = Runtime::new();
	runtime
		.execute_with(assembly, &SystemHost, RuntimeParameters::default(), &mut Vec::new())
		.unwrap()
}

fn run_captured(assembly: &Assembly) -> (i32, String) {
	let runtime = Runtime::new();
	let mut dump = Vec::new();
	let code = runtime
		.execute_with(assembly, &SystemHost, RuntimeParameters::default(), &mut dump)
		.unwrap();
	(code, String::from_utf8(dump).unwrap())
}

fn link_default(im: &Intermediate) -> Assembly {
	link(im, &Runtime::new()).unwrap()
}

fn declare_main(gen: &mut Generator) -> MethodIdx {
	let name = gen.make_identifier("main").unwrap();
	gen.declare_method(name).unwrap()
}

/// `main: retv 41 + 1`
fn arithmetic_program() -> Intermediate {
	let mut gen = Generator::with_file("arith.ptf");
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[TypeIdx::I32]).unwrap();
	writer.write_set(Address::stack(0), Address::from(41i32)).unwrap();
	writer.write_add(Address::stack(0), Address::from(1i32)).unwrap();
	writer.write_retv(Address::stack(0)).unwrap();
	writer.finalize().unwrap();
	gen.finalize().unwrap()
}

#[test]
fn exit_code_from_arithmetic() {
	let assembly = link_default(&arithmetic_program());
	assert_eq!(run(&assembly), 42);
}

fn define_point(gen: &mut Generator) -> TypeIdx {
	let name = gen.make_identifier("P").unwrap();
	let p = gen.declare_type(name).unwrap();
	let mut writer = gen.define_type(p, false).unwrap();
	writer.declare_named_field(TypeIdx::I32, "x").unwrap();
	writer.declare_named_field(TypeIdx::I32, "y").unwrap();
	writer.finalize().unwrap();
	p
}

fn offset_of(gen: &mut Generator, ty: TypeIdx, field: &str) -> propane::indices::OffsetIdx {
	let name = gen.make_identifier(field).unwrap();
	gen.make_offset(ty, &[name]).unwrap()
}

#[test]
fn struct_fields_and_size_of() {
	// struct P { int x, int y }; main writes both fields and returns !P.
	let mut gen = Generator::with_file("structs.ptf");
	let p = define_point(&mut gen);
	let off_x = offset_of(&mut gen, p, "x");
	let off_y = offset_of(&mut gen, p, "y");

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[p, TypeIdx::I32]).unwrap();
	writer.write_set(Address::stack(0).field(off_x), Address::from(3i32)).unwrap();
	writer.write_set(Address::stack(0).field(off_y), Address::from(4i32)).unwrap();
	writer.write_conv(Address::stack(1), Address::stack(0).size_of()).unwrap();
	writer.write_retv(Address::stack(1)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 8);
}

#[test]
fn struct_field_sum() {
	let mut gen = Generator::with_file("structs.ptf");
	let p = define_point(&mut gen);
	let off_x = offset_of(&mut gen, p, "x");
	let off_y = offset_of(&mut gen, p, "y");

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[p, TypeIdx::I32]).unwrap();
	writer.write_set(Address::stack(0).field(off_x), Address::from(3i32)).unwrap();
	writer.write_set(Address::stack(0).field(off_y), Address::from(4i32)).unwrap();
	writer.write_set(Address::stack(1), Address::stack(0).field(off_x)).unwrap();
	writer.write_add(Address::stack(1), Address::stack(0).field(off_y)).unwrap();
	writer.write_retv(Address::stack(1)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 7);
}

/// `main` pushes `int[3] = {10, 20, 30}` and returns `a[index]`.
fn array_program(index: isize) -> Result<Assembly, propane::Error> {
	let mut gen = Generator::with_file("arrays.ptf");
	let arr = gen.declare_array_type(TypeIdx::I32, 3).unwrap();
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[arr]).unwrap();
	writer.write_set(Address::stack(0).at(0), Address::from(10i32)).unwrap();
	writer.write_set(Address::stack(0).at(1), Address::from(20i32)).unwrap();
	writer.write_set(Address::stack(0).at(2), Address::from(30i32)).unwrap();
	writer.write_retv(Address::stack(0).at(index)).unwrap();
	writer.finalize().unwrap();
	link(&gen.finalize().unwrap(), &Runtime::new())
}

#[test]
fn array_subscript() {
	let assembly = array_program(2).unwrap();
	assert_eq!(run(&assembly), 30);
}

#[test]
fn array_subscript_out_of_range_fails_link() {
	let err = array_program(3).unwrap_err();
	assert_eq!(err.code, Errc::LnkArrayIndexOutOfRange);
}

fn define_add(gen: &mut Generator) -> MethodIdx {
	let sig = gen.make_signature(TypeIdx::I32, &[TypeIdx::I32, TypeIdx::I32]).unwrap();
	let name = gen.make_identifier("add").unwrap();
	let add = gen.declare_method(name).unwrap();
	let mut writer = gen.define_method(add, sig).unwrap();
	writer.push(&[TypeIdx::I32]).unwrap();
	writer.write_set(Address::stack(0), Address::param(0)).unwrap();
	writer.write_add(Address::stack(0), Address::param(1)).unwrap();
	writer.write_retv(Address::stack(0)).unwrap();
	writer.finalize().unwrap();
	add
}

#[test]
fn direct_call() {
	let mut gen = Generator::with_file("calls.ptf");
	let add = define_add(&mut gen);

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_call(add, &[Address::from(20i32), Address::from(22i32)]).unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 42);
}

#[test]
fn method_pointer_constant_call() {
	// Global constant `fp = add`; main returns `callv fp(19, 23)`.
	let mut gen = Generator::with_file("calls.ptf");
	define_add(&mut gen);
	let add_name = gen.make_identifier("add").unwrap();

	let add_sig = gen.make_signature(TypeIdx::I32, &[TypeIdx::I32, TypeIdx::I32]).unwrap();
	let fp_type = gen.declare_signature_type(add_sig).unwrap();
	let fp_name = gen.make_identifier("fp").unwrap();
	gen.define_global(fp_name, true, fp_type, &[Address::identifier(add_name)]).unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer
		.write_callv(Address::global(fp_name), &[Address::from(19i32), Address::from(23i32)])
		.unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 42);
}

#[test]
fn callv_through_non_signature_type_fails_link() {
	let mut gen = Generator::with_file("calls.ptf");
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[TypeIdx::I32]).unwrap();
	writer.write_callv(Address::stack(0), &[]).unwrap();
	writer.write_retv(Address::from(0i32)).unwrap();
	writer.finalize().unwrap();

	let err = link(&gen.finalize().unwrap(), &Runtime::new()).unwrap_err();
	assert_eq!(err.code, Errc::LnkNonSignatureTypeInvoke);
}

#[test]
fn callv_through_null_method_pointer_fails_at_runtime() {
	let mut gen = Generator::with_file("calls.ptf");
	define_add(&mut gen);
	let add_sig = gen.make_signature(TypeIdx::I32, &[TypeIdx::I32, TypeIdx::I32]).unwrap();
	let fp_type = gen.declare_signature_type(add_sig).unwrap();
	let fp_name = gen.make_identifier("fp").unwrap();
	gen.define_global(fp_name, false, fp_type, &[]).unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer
		.write_callv(Address::global(fp_name), &[Address::from(1i32), Address::from(2i32)])
		.unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	let runtime = Runtime::new();
	let err = runtime
		.execute_with(&assembly, &SystemHost, RuntimeParameters::default(), &mut Vec::new())
		.unwrap_err();
	assert_eq!(err.code, Errc::RtmInvalidMethodPointer);
}

fn switch_program(selector: i32) -> Assembly {
	let mut gen = Generator::with_file("switch.ptf");
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[TypeIdx::I32]).unwrap();
	let l0 = writer.declare_label("case0").unwrap();
	let l1 = writer.declare_label("case1").unwrap();
	let l2 = writer.declare_label("case2").unwrap();
	writer.write_set(Address::stack(0), Address::from(selector)).unwrap();
	writer.write_sw(Address::stack(0), &[l0, l1, l2]).unwrap();
	writer.write_retv(Address::from(99i32)).unwrap();
	writer.write_label(l0).unwrap();
	writer.write_retv(Address::from(5i32)).unwrap();
	writer.write_label(l1).unwrap();
	writer.write_retv(Address::from(7i32)).unwrap();
	writer.write_label(l2).unwrap();
	writer.write_retv(Address::from(9i32)).unwrap();
	writer.finalize().unwrap();
	link_default(&gen.finalize().unwrap())
}

#[test]
fn switch_routes_to_label() {
	assert_eq!(run(&switch_program(1)), 7);
}

#[test]
fn switch_boundaries() {
	// Index n-1 jumps, index n falls through, negative indices fall through.
	assert_eq!(run(&switch_program(2)), 9);
	assert_eq!(run(&switch_program(3)), 99);
	assert_eq!(run(&switch_program(-1)), 99);
}

#[test]
fn branch_loop_accumulates() {
	// Sum 1..=5 with a conditional backward branch.
	let mut gen = Generator::with_file("loops.ptf");
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[TypeIdx::I32, TypeIdx::I32]).unwrap();
	let top = writer.declare_label("top").unwrap();
	writer.write_set(Address::stack(0), Address::from(0i32)).unwrap();
	writer.write_set(Address::stack(1), Address::from(0i32)).unwrap();
	writer.write_label(top).unwrap();
	writer.write_add(Address::stack(1), Address::from(1i32)).unwrap();
	writer.write_add(Address::stack(0), Address::stack(1)).unwrap();
	writer.write_blt(top, Address::stack(1), Address::from(5i32)).unwrap();
	writer.write_retv(Address::stack(0)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 15);
}

#[test]
fn union_fields_alias_at_offset_zero() {
	// union U { int a; short b }: writing `a` and reading `b` reinterprets
	// the low bytes.
	let mut gen = Generator::with_file("unions.ptf");
	let u_name = gen.make_identifier("U").unwrap();
	let u = gen.declare_type(u_name).unwrap();
	{
		let mut writer = gen.define_type(u, true).unwrap();
		writer.declare_named_field(TypeIdx::I32, "a").unwrap();
		writer.declare_named_field(TypeIdx::I16, "b").unwrap();
		writer.finalize().unwrap();
	}
	let off_a = offset_of(&mut gen, u, "a");
	let off_b = offset_of(&mut gen, u, "b");

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[u, TypeIdx::I32]).unwrap();
	writer.write_set(Address::stack(0).field(off_a), Address::from(0x0001_0203i32)).unwrap();
	writer.write_set(Address::stack(1), Address::stack(0).field(off_b)).unwrap();
	writer.write_retv(Address::stack(1)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 0x0203);
}

#[test]
fn pointer_arithmetic_walks_array() {
	let mut gen = Generator::with_file("pointers.ptf");
	let arr = gen.declare_array_type(TypeIdx::I32, 3).unwrap();
	let ptr = gen.declare_pointer_type(TypeIdx::I32).unwrap();
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[arr, ptr]).unwrap();
	writer.write_set(Address::stack(0).at(0), Address::from(10i32)).unwrap();
	writer.write_set(Address::stack(0).at(1), Address::from(20i32)).unwrap();
	writer.write_set(Address::stack(0).at(2), Address::from(30i32)).unwrap();
	writer.write_set(Address::stack(1), Address::stack(0).at(0).address_of()).unwrap();
	writer.write_padd(Address::stack(1), Address::from(2i32)).unwrap();
	writer.write_retv(Address::stack(1).deref()).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 30);
}

#[test]
fn pointer_difference_scales_by_element_size() {
	let mut gen = Generator::with_file("pointers.ptf");
	let arr = gen.declare_array_type(TypeIdx::I32, 3).unwrap();
	let ptr = gen.declare_pointer_type(TypeIdx::I32).unwrap();
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[arr, ptr, ptr, TypeIdx::I32]).unwrap();
	writer.write_set(Address::stack(1), Address::stack(0).at(0).address_of()).unwrap();
	writer.write_set(Address::stack(2), Address::stack(0).at(2).address_of()).unwrap();
	writer.write_pdif(Address::stack(2), Address::stack(1)).unwrap();
	writer.write_conv(Address::stack(3), Address::retval()).unwrap();
	writer.write_retv(Address::stack(3)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 2);
}

#[test]
fn field_type_mismatch_fails_link() {
	let mut gen = Generator::with_file("structs.ptf");
	let p = define_point(&mut gen);
	let off_x = offset_of(&mut gen, p, "x");
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[p]).unwrap();
	// Narrowing f64 into an int field is not implicitly convertible.
	writer.write_set(Address::stack(0).field(off_x), Address::from(1.5f64)).unwrap();
	writer.write_retv(Address::from(0i32)).unwrap();
	writer.finalize().unwrap();

	let err = link(&gen.finalize().unwrap(), &Runtime::new()).unwrap_err();
	assert_eq!(err.code, Errc::LnkInvalidImplicitConversion);
}

#[test]
fn return_slot_without_producer_fails_link() {
	let mut gen = Generator::with_file("retval.ptf");
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();

	let err = link(&gen.finalize().unwrap(), &Runtime::new()).unwrap_err();
	assert_eq!(err.code, Errc::LnkInvalidReturnAddress);
}

#[test]
fn mutable_global_state() {
	let mut gen = Generator::with_file("globals.ptf");
	let counter = gen.make_identifier("counter").unwrap();
	gen.define_global(counter, false, TypeIdx::I32, &[Address::from(40i32)]).unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_add(Address::global(counter), Address::from(2i32)).unwrap();
	writer.write_retv(Address::global(counter)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	assert_eq!(run(&assembly), 42);
}

#[test]
fn initializer_overflow_fails_link() {
	let mut gen = Generator::with_file("globals.ptf");
	let g = gen.make_identifier("g").unwrap();
	gen.define_global(g, false, TypeIdx::I32, &[Address::from(1i32), Address::from(2i32)]).unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_retv(Address::global(g)).unwrap();
	writer.finalize().unwrap();

	let err = link(&gen.finalize().unwrap(), &Runtime::new()).unwrap_err();
	assert_eq!(err.code, Errc::LnkGlobalInitializerOverflow);
}

#[test]
fn callstack_limit_stops_unbounded_recursion() {
	let mut gen = Generator::with_file("recurse.ptf");
	let void_sig = gen.make_signature(TypeIdx::VOID, &[]).unwrap();
	let f_name = gen.make_identifier("f").unwrap();
	let f = gen.declare_method(f_name).unwrap();
	let mut writer = gen.define_method(f, void_sig).unwrap();
	writer.write_call(f, &[]).unwrap();
	writer.write_ret().unwrap();
	writer.finalize().unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_call(f, &[]).unwrap();
	writer.write_retv(Address::from(0i32)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	let runtime = Runtime::new();
	let parameters = RuntimeParameters { max_callstack_depth: 64, ..Default::default() };
	let err = runtime
		.execute_with(&assembly, &SystemHost, parameters, &mut Vec::new())
		.unwrap_err();
	assert_eq!(err.code, Errc::RtmCallstackLimitReached);
}

#[test]
fn missing_entrypoint_fails_at_execution() {
	let mut gen = Generator::with_file("empty.ptf");
	let sig = gen.make_signature(TypeIdx::VOID, &[]).unwrap();
	let name = gen.make_identifier("helper").unwrap();
	let f = gen.declare_method(name).unwrap();
	let mut writer = gen.define_method(f, sig).unwrap();
	writer.write_ret().unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	let runtime = Runtime::new();
	let err = runtime
		.execute_with(&assembly, &SystemHost, RuntimeParameters::default(), &mut Vec::new())
		.unwrap_err();
	assert_eq!(err.code, Errc::RtmEntrypointNotFound);
}

#[test]
fn artifact_round_trips() {
	let im = arithmetic_program();
	let reloaded = Intermediate::load(im.data()).unwrap();
	assert_eq!(reloaded.data(), im.data());

	let assembly = link_default(&reloaded);
	let reloaded_assembly = Assembly::load(assembly.data()).unwrap();
	assert_eq!(reloaded_assembly.data(), assembly.data());
	assert_eq!(run(&reloaded_assembly), 42);
}

#[test]
fn artifacts_persist_to_disk() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("program.pasm");
	let assembly = link_default(&arithmetic_program());
	std::fs::write(&path, assembly.data()).unwrap();
	let bytes = std::fs::read(&path).unwrap();
	let reloaded = Assembly::load(&bytes).unwrap();
	assert_eq!(run(&reloaded), 42);
}

#[test]
fn corrupted_headers_are_rejected() {
	let im = arithmetic_program();
	let mut bytes = im.data().to_vec();
	bytes[0] = b'X';
	assert!(Intermediate::load(&bytes).is_err());

	let assembly = link_default(&im);
	let mut bytes = assembly.data().to_vec();
	bytes[1] = b'X';
	assert!(Assembly::load(&bytes).is_err());
}

#[test]
fn execution_is_deterministic() {
	// Identical dump streams and exit codes across repeated executions.
	let mut gen = Generator::with_file("dump.ptf");
	let p = define_point(&mut gen);
	let off_x = offset_of(&mut gen, p, "x");
	let off_y = offset_of(&mut gen, p, "y");

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[p]).unwrap();
	writer.write_set(Address::stack(0).field(off_x), Address::from(3i32)).unwrap();
	writer.write_set(Address::stack(0).field(off_y), Address::from(4i32)).unwrap();
	writer.write_dump(Address::stack(0)).unwrap();
	writer.write_dump(Address::stack(0).field(off_y)).unwrap();
	writer.write_retv(Address::from(0i32)).unwrap();
	writer.finalize().unwrap();

	let assembly = link_default(&gen.finalize().unwrap());
	let (code_a, dump_a) = run_captured(&assembly);
	let (code_b, dump_b) = run_captured(&assembly);
	assert_eq!(code_a, code_b);
	assert_eq!(dump_a, dump_b);
	assert!(dump_a.contains("P{ x = int(3), y = int(4) }"));
	assert!(dump_a.contains("int(4)"));
}

#[test]
fn merged_units_link_across_boundaries() {
	// Unit A defines `add`; unit B calls it through a declaration only.
	let mut unit_a = Generator::with_file("a.ptf");
	define_add(&mut unit_a);
	let unit_a = unit_a.finalize().unwrap();

	let mut unit_b = Generator::with_file("b.ptf");
	let add_name = unit_b.make_identifier("add").unwrap();
	let add = unit_b.declare_method(add_name).unwrap();
	let sig = unit_b.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut unit_b);
	let mut writer = unit_b.define_method(main, sig).unwrap();
	writer.write_call(add, &[Address::from(40i32), Address::from(2i32)]).unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();
	let unit_b = unit_b.finalize().unwrap();

	let merged = unit_a.merge(&unit_b).unwrap();
	let assembly = link_default(&merged);
	assert_eq!(run(&assembly), 42);
}

#[test]
fn unmerged_declaration_fails_link() {
	let mut gen = Generator::with_file("b.ptf");
	let add_name = gen.make_identifier("add").unwrap();
	let add = gen.declare_method(add_name).unwrap();
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_call(add, &[Address::from(40i32), Address::from(2i32)]).unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();

	let err = link(&gen.finalize().unwrap(), &Runtime::new()).unwrap_err();
	assert_eq!(err.code, Errc::LnkUndefinedMethod);
}

// External call plumbing: the host supplies symbols and the trampoline, the
// core guarantees the argument layout.

struct RegistryHost;

impl Host for RegistryHost {
	fn allocate(&self, size: usize) -> Option<propane::host::HostMem> {
		SystemHost.allocate(size)
	}

	fn free(&self, mem: propane::host::HostMem) {
		SystemHost.free(mem)
	}

	fn protect(&self, mem: &mut propane::host::HostMem) -> bool {
		SystemHost.protect(mem)
	}

	fn openlib(&self, path: &str) -> Option<LibHandle> {
		match path {
			"libnative" => Some(LibHandle(1)),
			_ => None,
		}
	}

	fn closelib(&self, _lib: LibHandle) {}

	fn loadsym(&self, lib: LibHandle, name: &str) -> Option<SymbolHandle> {
		match (lib, name) {
			(LibHandle(1), "native_sum") => Some(SymbolHandle(1)),
			_ => None,
		}
	}
}

unsafe fn native_sum_forward(_: SymbolHandle, ret: *mut u8, args: *const u8) {
	let a = (args as *const i32).read_unaligned();
	let b = (args.add(4) as *const i32).read_unaligned();
	(ret as *mut i32).write_unaligned(a.wrapping_add(b));
}

fn native_runtime() -> Runtime {
	let mut lib = Library::new("libnative");
	lib.calls.push(ExternalCall {
		name: "native_sum".into(),
		return_type: TypeDecl::new("int", 4),
		parameters: vec![
			NativeParameter { decl: TypeDecl::new("int", 4), offset: 0 },
			NativeParameter { decl: TypeDecl::new("int", 4), offset: 4 },
		],
		parameters_size: 8,
		forward: native_sum_forward,
	});
	Runtime::with_libraries(vec![lib])
}

fn external_call_program() -> Intermediate {
	let mut gen = Generator::with_file("native.ptf");
	// Declared but never defined: the linker binds it to the runtime.
	let name = gen.make_identifier("native_sum").unwrap();
	let native_sum = gen.declare_method(name).unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_call(native_sum, &[Address::from(20i32), Address::from(22i32)]).unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();
	gen.finalize().unwrap()
}

#[test]
fn external_call_through_trampoline() {
	let runtime = native_runtime();
	let assembly = link(&external_call_program(), &runtime).unwrap();
	let code = runtime
		.execute_with(&assembly, &RegistryHost, RuntimeParameters::default(), &mut Vec::new())
		.unwrap();
	assert_eq!(code, 42);
}

#[test]
fn runtime_hash_mismatch_fails_execution() {
	let link_runtime = native_runtime();
	let assembly = link(&external_call_program(), &link_runtime).unwrap();

	let foreign = Runtime::new();
	let err = foreign
		.execute_with(&assembly, &RegistryHost, RuntimeParameters::default(), &mut Vec::new())
		.unwrap_err();
	assert_eq!(err.code, Errc::RtmRuntimeHashMismatch);
}

#[test]
fn undefined_external_method_fails_link() {
	let runtime = native_runtime();
	let mut gen = Generator::with_file("native.ptf");
	let name = gen.make_identifier("native_missing").unwrap();
	let missing = gen.declare_method(name).unwrap();
	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main = declare_main(&mut gen);
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.write_call(missing, &[]).unwrap();
	writer.write_retv(Address::retval()).unwrap();
	writer.finalize().unwrap();

	let err = link(&gen.finalize().unwrap(), &runtime).unwrap_err();
	assert_eq!(err.code, Errc::LnkUndefinedMethod);
}
