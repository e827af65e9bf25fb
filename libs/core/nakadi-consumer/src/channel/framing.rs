//! Splits a chunked response body into response units.

use crate::error::{ConsumerError, ConsumerResult};

/// How a response body is cut into units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One unit per non-empty line (newline-delimited JSON streams)
    Lines,
    /// The complete body is a single unit
    WholeBody,
}

#[derive(Debug)]
pub(crate) struct Framer {
    framing: Framing,
    buffer: Vec<u8>,
}

impl Framer {
    pub(crate) fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
        }
    }

    /// Feed a chunk and return every unit it completes.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> ConsumerResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);
        if self.framing == Framing::WholeBody {
            return Ok(Vec::new());
        }

        let mut units = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(unit) = to_unit(&line[..line.len() - 1])? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    /// Flush whatever is left once the body ends.
    pub(crate) fn finish(self) -> ConsumerResult<Option<String>> {
        to_unit(&self.buffer)
    }
}

fn to_unit(bytes: &[u8]) -> ConsumerResult<Option<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ConsumerError::Serialization(format!("response is not UTF-8: {e}")))?;
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_across_chunks() {
        let mut framer = Framer::new(Framing::Lines);

        assert_eq!(framer.push(b"{\"a\":").unwrap(), Vec::<String>::new());
        assert_eq!(framer.push(b"1}\r\n\n{\"b\"").unwrap(), vec!["{\"a\":1}"]);
        assert_eq!(framer.push(b":2}\n").unwrap(), vec!["{\"b\":2}"]);
        assert_eq!(framer.finish().unwrap(), None);
    }

    #[test]
    fn test_trailing_line_without_newline() {
        let mut framer = Framer::new(Framing::Lines);
        assert!(framer.push(b"{\"c\":3}").unwrap().is_empty());
        assert_eq!(framer.finish().unwrap().as_deref(), Some("{\"c\":3}"));
    }

    #[test]
    fn test_whole_body() {
        let mut framer = Framer::new(Framing::WholeBody);
        assert!(framer.push(b"[{\"partition\":\"0\"},\n").unwrap().is_empty());
        assert!(framer.push(b"{\"partition\":\"1\"}]").unwrap().is_empty());
        assert_eq!(
            framer.finish().unwrap().as_deref(),
            Some("[{\"partition\":\"0\"},\n{\"partition\":\"1\"}]")
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut framer = Framer::new(Framing::Lines);
        assert!(framer.push(&[0xff, 0xfe, b'\n']).is_err());
    }
}
