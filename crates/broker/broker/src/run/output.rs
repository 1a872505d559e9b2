//! Splitting raw pipe bytes into output messages.

/// Accumulates bytes read from a pipe and yields text messages.
///
/// Complete lines are emitted one per message, newline included. Whatever
/// remains after a read is emitted as a partial message so prompts without a
/// trailing newline reach the client immediately. A multi-byte UTF-8 sequence
/// cut by a read boundary is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct LineSplitter {
	pending: Vec<u8>,
}

impl LineSplitter {
	/// Feeds one read's worth of bytes.
	pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
		self.pending.extend_from_slice(bytes);
		let mut out = Vec::new();

		while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
			let line: Vec<u8> = self.pending.drain(..=pos).collect();
			out.push(String::from_utf8_lossy(&line).into_owned());
		}

		if !self.pending.is_empty() {
			let keep = incomplete_utf8_tail(&self.pending);
			let cut = self.pending.len() - keep;
			if cut > 0 {
				let partial: Vec<u8> = self.pending.drain(..cut).collect();
				out.push(String::from_utf8_lossy(&partial).into_owned());
			}
		}
		out
	}

	/// Flushes whatever is left at end of stream.
	pub fn finish(&mut self) -> Option<String> {
		if self.pending.is_empty() {
			return None;
		}
		let rest = std::mem::take(&mut self.pending);
		Some(String::from_utf8_lossy(&rest).into_owned())
	}
}

/// Length of a trailing, possibly valid but unfinished UTF-8 sequence.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
	match std::str::from_utf8(bytes) {
		Ok(_) => 0,
		Err(err) if err.error_len().is_none() => bytes.len() - err.valid_up_to(),
		Err(_) => 0,
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn splits_complete_lines() {
		let mut splitter = LineSplitter::default();
		assert_eq!(splitter.push(b"a\nbb\n"), vec!["a\n", "bb\n"]);
		assert_eq!(splitter.finish(), None);
	}

	#[test]
	fn emits_partial_prompt() {
		let mut splitter = LineSplitter::default();
		assert_eq!(splitter.push(b"line\nEnter a number: "), vec!["line\n", "Enter a number: "]);
		assert_eq!(splitter.push(b"42\n"), vec!["42\n"]);
	}

	#[test]
	fn holds_back_split_multibyte_char() {
		let mut splitter = LineSplitter::default();
		let bytes = "é\n".as_bytes();
		assert_eq!(splitter.push(&bytes[..1]), Vec::<String>::new());
		assert_eq!(splitter.push(&bytes[1..]), vec!["é\n"]);
	}

	#[test]
	fn finish_flushes_truncated_sequence_lossily() {
		let mut splitter = LineSplitter::default();
		splitter.push(&"€".as_bytes()[..2]);
		assert_eq!(splitter.finish(), Some("\u{FFFD}".to_string()));
	}
}
