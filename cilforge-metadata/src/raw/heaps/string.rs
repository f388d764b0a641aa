use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind};

use crate::raw::heaps::{SizeDebugWrapper, StringIndex};
use crate::utilities::read_compressed_u32;

#[derive(Copy, Clone)]
pub struct StringHeap<'l> {
	data: &'l [u8],
}

impl<'l> TryFrom<&'l [u8]> for StringHeap<'l> {
	type Error = Error;
	fn try_from(data: &'l [u8]) -> Result<Self, Self::Error> {
		match data.as_ref() {
			[0, ..] => Ok(Self { data }),
			_ => Err(ErrorKind::InvalidData.into()),
		}
	}
}

impl<'l> StringHeap<'l> {
	pub fn get(&self, idx: StringIndex) -> Option<&'l str> {
		let slice = self.data.as_ref().get(idx.0..)?;
		let end = slice.iter().position(|c| *c == 0)?;
		std::str::from_utf8(&slice[..end]).ok()
	}
}

impl Debug for StringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("StringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}

pub struct UserStringHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for UserStringHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> UserStringHeap<'l> {
	/// `offset` is the raw byte offset into the `#US` heap carried by a `ldstr` instruction's
	/// metadata token, not an index into a logical entry list. Entries are a compressed-uint byte
	/// length followed by that many bytes of UTF-16LE text plus a trailing flag byte that is not
	/// part of the string (ECMA-335 §II.24.2.4).
	pub fn get(&self, offset: usize) -> Option<std::string::String> {
		let slice = self.data.get(offset..)?;
		let mut stream = Cursor::new(slice);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		if len == 0 {
			return Some(std::string::String::new());
		}
		let start = stream.position() as usize;
		let text_len = len - 1;
		let bytes = slice.get(start..start + text_len)?;
		let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
		std::string::String::from_utf16(&units).ok()
	}
}

impl Debug for UserStringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("UserStringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}
