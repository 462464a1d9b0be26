use std::time::SystemTime;

use propane::address::Address;
use propane::gen::Generator;
use propane::host::SystemHost;
use propane::indices::TypeIdx;
use propane::runtime::{Runtime, RuntimeParameters};

fn main() {
	tracing_subscriber::fmt()
		.with_max_level(tracing::Level::DEBUG)
		.init();

	let mut start = SystemTime::now();

	// fib(10) computed iteratively, plus a dump of the accumulator struct.
	let mut gen = Generator::with_file("fib.ptf");
	let state_name = gen.make_identifier("State").unwrap();
	let state = gen.declare_type(state_name).unwrap();
	{
		let mut writer = gen.define_type(state, false).unwrap();
		writer.declare_named_field(TypeIdx::I32, "previous").unwrap();
		writer.declare_named_field(TypeIdx::I32, "current").unwrap();
		writer.finalize().unwrap();
	}
	let previous = gen.make_identifier("previous").unwrap();
	let current = gen.make_identifier("current").unwrap();
	let off_previous = gen.make_offset(state, &[previous]).unwrap();
	let off_current = gen.make_offset(state, &[current]).unwrap();

	let sig = gen.make_signature(TypeIdx::I32, &[]).unwrap();
	let main_name = gen.make_identifier("main").unwrap();
	let main = gen.declare_method(main_name).unwrap();
	let mut writer = gen.define_method(main, sig).unwrap();
	writer.push(&[state, TypeIdx::I32, TypeIdx::I32]).unwrap();
	let top = writer.declare_label("top").unwrap();
	writer.write_set(Address::stack(0).field(off_previous), Address::from(0i32)).unwrap();
	writer.write_set(Address::stack(0).field(off_current), Address::from(1i32)).unwrap();
	writer.write_set(Address::stack(1), Address::from(0i32)).unwrap();
	writer.write_label(top).unwrap();
	writer.write_set(Address::stack(2), Address::stack(0).field(off_current)).unwrap();
	writer.write_add(Address::stack(2), Address::stack(0).field(off_previous)).unwrap();
	writer
		.write_set(Address::stack(0).field(off_previous), Address::stack(0).field(off_current))
		.unwrap();
	writer.write_set(Address::stack(0).field(off_current), Address::stack(2)).unwrap();
	writer.write_add(Address::stack(1), Address::from(1i32)).unwrap();
	writer.write_blt(top, Address::stack(1), Address::from(10i32)).unwrap();
	writer.write_dump(Address::stack(0)).unwrap();
	writer.write_retv(Address::stack(0).field(off_current)).unwrap();
	writer.finalize().unwrap();

	let intermediate = gen.finalize().unwrap();
	println!("generation time: {:?}", start.elapsed().unwrap());

	start = SystemTime::now();
	let runtime = Runtime::new();
	let assembly = propane::link(&intermediate, &runtime).unwrap();
	println!(
		"link time: {:?}, assembly size: {} bytes",
		start.elapsed().unwrap(),
		assembly.data().len()
	);

	start = SystemTime::now();
	let exit_code = runtime
		.execute_with(&assembly, &SystemHost, RuntimeParameters::default(), &mut std::io::stdout())
		.unwrap();
	println!("execution time: {:?}", start.elapsed().unwrap());
	println!("exit code: {exit_code}");
}
