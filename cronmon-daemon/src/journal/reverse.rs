//! Reverse line scanning: reads a seekable byte source from end to start.
//!
//! The journal reader uses this to decode records newest-first without
//! touching more of the file than the recovery scan needs.

use std::io::{Read, Seek, SeekFrom};

use crate::errors::{CronmonError, Result};

/// Reads tokens delimited by a byte, starting from the last token in the
/// stream and working backwards.
///
/// The buffer capacity bounds the longest token that can be returned; a scan
/// that fills the whole buffer without finding a delimiter fails with
/// [`CronmonError::LineTooLong`]. The start of the stream acts as an implicit
/// delimiter, so the first line is returned as a token too and leading blank
/// lines are preserved. Reversing the yielded tokens reassembles the stream
/// split by the delimiter.
pub struct ReverseLineScanner<R> {
    source: R,
    /// Buffered, not-yet-returned prefix of the stream. `None` until the
    /// first fill establishes the stream length.
    buf: Option<Vec<u8>>,
    /// Offset of the first byte not yet read from the source.
    end: u64,
    capacity: usize,
    /// Set once the first line of the stream has been returned.
    done: bool,
}

impl<R: Read + Seek> ReverseLineScanner<R> {
    pub const DEFAULT_CAPACITY: usize = 64 * 1024;

    pub fn new(source: R) -> Self {
        Self::with_capacity(source, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(source: R, capacity: usize) -> Self {
        Self {
            source,
            buf: None,
            end: 0,
            capacity,
            done: false,
        }
    }

    /// Return the next token moving backwards, without its trailing
    /// delimiter. `Ok(None)` once the first byte of the stream has been
    /// returned.
    pub fn read_until(&mut self, delim: u8) -> Result<Option<Vec<u8>>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(buf) = self.buf.as_mut() {
                if let Some(i) = buf.iter().rposition(|&b| b == delim) {
                    let token = buf.split_off(i + 1);
                    buf.pop();
                    return Ok(Some(token));
                }

                // No delimiter left in the buffer. At the start of the
                // stream the remainder is the first line; otherwise refill,
                // unless the buffer is already at capacity.
                if self.end == 0 {
                    self.done = true;
                    return Ok(Some(std::mem::take(buf)));
                }

                if buf.len() == self.capacity {
                    return Err(CronmonError::LineTooLong {
                        limit: self.capacity,
                    });
                }
            }

            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Pull the next chunk of the source into the buffer, preserving the
    /// already-buffered suffix. Returns `false` for an empty stream.
    fn fill(&mut self) -> Result<bool> {
        if self.buf.is_none() {
            self.end = self.source.seek(SeekFrom::End(0))?;
            self.buf = Some(Vec::with_capacity(self.capacity));
        }

        let Some(buf) = self.buf.as_mut() else {
            return Ok(false);
        };

        if self.end == 0 {
            return Ok(false);
        }

        let available = (self.capacity - buf.len()) as u64;
        let read_len = available.min(self.end) as usize;
        let seek_to = self.end - read_len as u64;

        self.source.seek(SeekFrom::Start(seek_to))?;
        self.end = seek_to;

        let mut chunk = vec![0u8; read_len];
        self.source.read_exact(&mut chunk)?;

        chunk.extend_from_slice(buf);
        *buf = chunk;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &str, capacity: usize) -> Result<Vec<String>> {
        let mut scanner =
            ReverseLineScanner::with_capacity(Cursor::new(input.as_bytes().to_vec()), capacity);
        let mut tokens = Vec::new();
        while let Some(token) = scanner.read_until(b'\n')? {
            tokens.push(String::from_utf8(token).unwrap());
        }
        Ok(tokens)
    }

    #[test]
    fn scans_lines_backwards() {
        // Tiny capacity exercises refills at every token boundary.
        let cases: &[(&str, &str, &[&str])] = &[
            ("enough", "aa\nbb\ncc\ndd\n", &["", "dd", "cc", "bb", "aa"]),
            ("enough both", "\naa\nbb\n", &["", "bb", "aa", ""]),
            ("enough prefix", "\naa\nbb", &["bb", "aa", ""]),
            ("short", "a\nb\nc\nd\n", &["", "d", "c", "b", "a"]),
            ("short both", "\na\nb\n", &["", "b", "a", ""]),
            ("short prefix", "\na\nb", &["b", "a", ""]),
            ("consecutive blanks", "\n\nx\n", &["", "x", "", ""]),
        ];

        for (name, input, expect) in cases {
            let tokens = collect(input, 3).unwrap();
            assert_eq!(tokens, *expect, "case {name}");
        }
    }

    #[test]
    fn empty_stream_is_immediately_done() {
        assert_eq!(collect("", 3).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn overlong_line_fails() {
        let err = collect("aaaaa\nbbbbb", 3).unwrap_err();
        assert!(matches!(err, CronmonError::LineTooLong { limit: 3 }));
    }

    #[test]
    fn default_capacity_handles_many_lines() {
        let mut input = String::new();
        for i in 0..2000 {
            input.push_str(&format!("line {i:05} {}\n", "x".repeat(80)));
        }

        let tokens =
            collect(&input, ReverseLineScanner::<Cursor<Vec<u8>>>::DEFAULT_CAPACITY).unwrap();
        // The trailing newline yields a final empty line, read first.
        assert_eq!(tokens.len(), 2001);
        assert_eq!(tokens[0], "");
        assert!(tokens[1].starts_with("line 01999"));
        assert!(tokens[2000].starts_with("line 00000"));
    }

    #[test]
    fn reversed_tokens_reassemble_the_stream() {
        for input in ["aa\nbb\ncc", "\n\nx\n", "single", "\n", "a\n\nb", "ab\n"] {
            let mut tokens = collect(input, 4).unwrap();
            tokens.reverse();
            assert_eq!(
                tokens,
                input.split('\n').collect::<Vec<_>>(),
                "input {input:?}"
            );
        }
    }
}
