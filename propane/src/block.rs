use crate::errors::{Errc, Error, Result};

const BLOCK_ALIGNMENT: usize = std::mem::size_of::<u32>();

/// Serializer for the length-prefixed block tree used by both artifact
/// formats. Direct writes land in the current block; `write_deferred` opens a
/// child block whose content is emitted after the parent, leaving an
/// 8-byte `(content offset, element count)` header at the reference site.
#[derive(Default)]
pub struct BlockWriter {
	binary: Vec<u8>,
	element_count: u32,
	children: Vec<(usize, BlockWriter)>,
}

impl BlockWriter {
	pub fn new() -> Self {
		Self::default()
	}

	#[inline]
	pub fn write_bytes(&mut self, bytes: &[u8]) {
		self.binary.extend_from_slice(bytes);
	}

	#[inline]
	pub fn write_u8(&mut self, value: u8) {
		self.binary.push(value);
	}

	#[inline]
	pub fn write_u16(&mut self, value: u16) {
		self.write_bytes(&value.to_le_bytes());
	}

	#[inline]
	pub fn write_u32(&mut self, value: u32) {
		self.write_bytes(&value.to_le_bytes());
	}

	#[inline]
	pub fn write_u64(&mut self, value: u64) {
		self.write_bytes(&value.to_le_bytes());
	}

	#[inline]
	pub fn write_usize(&mut self, value: usize) {
		self.write_u64(value as u64);
	}

	pub fn increment_count(&mut self, count: u32) {
		self.element_count += count;
	}

	/// Open a deferred child block, fill it inside `f`, and record how many
	/// elements it holds.
	pub fn write_deferred<F>(&mut self, f: F)
	where
		F: FnOnce(&mut BlockWriter),
	{
		let header_offset = self.binary.len();
		self.binary.extend_from_slice(&[0u8; 8]);
		let mut child = BlockWriter::new();
		f(&mut child);
		self.children.push((header_offset, child));
	}

	/// Combine the block tree into one contiguous byte vector.
	pub fn finalize(mut self) -> Vec<u8> {
		for (header_offset, child) in std::mem::take(&mut self.children) {
			let mut write_offset = self.binary.len();
			let remaining = write_offset & (BLOCK_ALIGNMENT - 1);
			if remaining != 0 {
				write_offset += BLOCK_ALIGNMENT - remaining;
				self.binary.resize(write_offset, 0);
			}

			let element_count = child.element_count;
			let content = child.finalize();
			self.binary.extend_from_slice(&content);

			let relative = (write_offset - header_offset) as u32;
			self.binary[header_offset..header_offset + 4].copy_from_slice(&relative.to_le_bytes());
			self.binary[header_offset + 4..header_offset + 8].copy_from_slice(&element_count.to_le_bytes());
		}
		self.binary
	}
}

/// Cursor over a serialized block tree. Every read failure maps onto the
/// single error code given at construction, so intermediate readers report
/// `LNK_INVALID_INTERMEDIATE` and assembly readers `RTM_INVALID_ASSEMBLY`.
#[derive(Copy, Clone)]
pub struct BlockReader<'l> {
	data: &'l [u8],
	pos: usize,
	fail_code: Errc,
}

impl<'l> BlockReader<'l> {
	pub fn new(data: &'l [u8], fail_code: Errc) -> Self {
		Self { data, pos: 0, fail_code }
	}

	fn fail(&self) -> Error {
		Error::new(self.fail_code, "truncated or malformed payload block")
	}

	pub fn read_bytes(&mut self, count: usize) -> Result<&'l [u8]> {
		let end = self.pos.checked_add(count).ok_or_else(|| self.fail())?;
		if end > self.data.len() {
			return Err(self.fail());
		}
		let bytes = &self.data[self.pos..end];
		self.pos = end;
		Ok(bytes)
	}

	pub fn read_u8(&mut self) -> Result<u8> {
		Ok(self.read_bytes(1)?[0])
	}

	pub fn read_u16(&mut self) -> Result<u16> {
		Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
	}

	pub fn read_u32(&mut self) -> Result<u32> {
		Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
	}

	pub fn read_u64(&mut self) -> Result<u64> {
		Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
	}

	pub fn read_usize(&mut self) -> Result<usize> {
		let value = self.read_u64()?;
		usize::try_from(value).map_err(|_| self.fail())
	}

	/// Read a deferred block header and return a cursor positioned at its
	/// content, along with the element count.
	pub fn read_deferred(&mut self) -> Result<(BlockReader<'l>, usize)> {
		let header_offset = self.pos;
		let relative = self.read_u32()? as usize;
		let element_count = self.read_u32()? as usize;
		let content = header_offset.checked_add(relative).ok_or_else(|| self.fail())?;
		if content > self.data.len() {
			return Err(self.fail());
		}
		let reader = BlockReader { data: self.data, pos: content, fail_code: self.fail_code };
		Ok((reader, element_count))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn direct_and_deferred_round_trip() {
		let mut writer = BlockWriter::new();
		writer.write_u32(0xDEADBEEF);
		writer.write_deferred(|w| {
			w.write_u16(7);
			w.write_u16(8);
			w.increment_count(2);
		});
		writer.write_u8(0x55);
		let bytes = writer.finalize();

		let mut reader = BlockReader::new(&bytes, Errc::LnkInvalidIntermediate);
		assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
		let (mut child, count) = reader.read_deferred().unwrap();
		assert_eq!(count, 2);
		assert_eq!(reader.read_u8().unwrap(), 0x55);
		assert_eq!(child.read_u16().unwrap(), 7);
		assert_eq!(child.read_u16().unwrap(), 8);
	}

	#[test]
	fn deferred_content_is_aligned() {
		let mut writer = BlockWriter::new();
		writer.write_u8(1);
		writer.write_deferred(|w| {
			w.write_u32(42);
			w.increment_count(1);
		});
		let bytes = writer.finalize();

		let mut reader = BlockReader::new(&bytes, Errc::LnkInvalidIntermediate);
		let _ = reader.read_u8().unwrap();
		let header_offset = 1;
		let relative = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
		assert_eq!((header_offset + relative) % 4, 0);
		let (mut child, _) = reader.read_deferred().unwrap();
		assert_eq!(child.read_u32().unwrap(), 42);
	}

	#[test]
	fn truncated_read_fails_with_reader_code() {
		let mut reader = BlockReader::new(&[1, 2], Errc::RtmInvalidAssembly);
		let err = reader.read_u32().unwrap_err();
		assert_eq!(err.code, Errc::RtmInvalidAssembly);
	}

	#[test]
	fn nested_deferred_blocks() {
		let mut writer = BlockWriter::new();
		writer.write_deferred(|outer| {
			outer.write_u32(1);
			outer.write_deferred(|inner| {
				inner.write_u32(2);
				inner.increment_count(1);
			});
			outer.increment_count(1);
		});
		let bytes = writer.finalize();

		let mut reader = BlockReader::new(&bytes, Errc::LnkInvalidIntermediate);
		let (mut outer, _) = reader.read_deferred().unwrap();
		assert_eq!(outer.read_u32().unwrap(), 1);
		let (mut inner, count) = outer.read_deferred().unwrap();
		assert_eq!(count, 1);
		assert_eq!(inner.read_u32().unwrap(), 2);
	}
}
