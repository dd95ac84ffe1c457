// Incremental NDJSON decoding
//
// Network chunks split lines arbitrarily (including inside multi-byte UTF-8
// sequences), so bytes are buffered until a '\n' is seen and only complete
// lines are handed out.

use super::types::StreamMetadata;
use crate::models::{TestRecord, WireRecord};
use serde_json::Value;

/// Reserved discriminator field marking the metadata frame
pub const METADATA_TAG_FIELD: &str = "_type";
pub const METADATA_TAG_VALUE: &str = "metadata";

/// Lines longer than this are dropped rather than buffered
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// A complete line and its 1-based position in the stream.
///
/// `oversized` lines carry no bytes; they exceeded the decoder's limit and
/// were discarded while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    pub number: u64,
    pub bytes: Vec<u8>,
    pub oversized: bool,
}

#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    // Everything before this index is known to contain no '\n'
    scan_from: usize,
    line_number: u64,
    max_line_bytes: usize,
    // Skipping the rest of an oversized line until its terminator
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scan_from: 0,
            line_number: 0,
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Feed one network chunk, returning every line it completed.
    /// Blank lines are counted but not returned.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut scan = self.scan_from;
        while let Some(pos) = self.buffer[scan..].iter().position(|&b| b == b'\n') {
            let end = scan + pos;
            if self.discarding {
                // Reported when it crossed the limit
                self.discarding = false;
            } else {
                self.emit(start, end, &mut lines);
            }
            start = end + 1;
            scan = start;
        }

        self.buffer.drain(..start);
        self.scan_from = self.buffer.len();

        if self.discarding {
            self.buffer.clear();
            self.scan_from = 0;
        } else if self.buffer.len() > self.max_line_bytes {
            self.line_number += 1;
            lines.push(self.oversized_line());
            self.buffer.clear();
            self.scan_from = 0;
            self.discarding = true;
        }

        lines
    }

    fn emit(&mut self, start: usize, end: usize, lines: &mut Vec<DecodedLine>) {
        let mut line = &self.buffer[start..end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        self.line_number += 1;
        if line.len() > self.max_line_bytes {
            lines.push(self.oversized_line());
        } else if !line.iter().all(u8::is_ascii_whitespace) {
            lines.push(DecodedLine {
                number: self.line_number,
                bytes: line.to_vec(),
                oversized: false,
            });
        }
    }

    fn oversized_line(&self) -> DecodedLine {
        DecodedLine {
            number: self.line_number,
            bytes: Vec::new(),
            oversized: true,
        }
    }

    /// Take whatever is left after the stream ended without a final newline
    pub fn finish(&mut self) -> Option<DecodedLine> {
        let rest = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        if std::mem::take(&mut self.discarding) || rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        self.line_number += 1;
        Some(DecodedLine {
            number: self.line_number,
            bytes: rest,
            oversized: false,
        })
    }

    /// Bytes held back waiting for a line terminator
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// A parsed NDJSON line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Metadata(StreamMetadata),
    Record(TestRecord),
}

pub fn parse_frame(line: &[u8]) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_slice(line)?;

    if value.get(METADATA_TAG_FIELD).and_then(Value::as_str) == Some(METADATA_TAG_VALUE) {
        return Ok(Frame::Metadata(serde_json::from_value(value)?));
    }

    let wire: WireRecord = serde_json::from_value(value)?;
    Ok(Frame::Record(wire.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = LineDecoder::new();

        assert!(decoder.push(b"{\"a\":").is_empty());
        assert_eq!(decoder.pending_bytes(), 5);

        let lines = decoder.push(b"1}\n{\"b\":2}\r\n{\"c\"");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].bytes, b"{\"a\":1}");
        assert_eq!(lines[1].bytes, b"{\"b\":2}");
        assert_eq!(lines[1].number, 2);

        let lines = decoder.push(b":3}\n");
        assert_eq!(lines[0].bytes, b"{\"c\":3}");
        assert_eq!(decoder.pending_bytes(), 0);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_character_split() {
        let text = "{\"isn\":\"Ω1\"}\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xCE).unwrap() + 1;

        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&text[..split]).is_empty());
        let lines = decoder.push(&text[split..]);
        assert_eq!(std::str::from_utf8(&lines[0].bytes).unwrap(), "{\"isn\":\"Ω1\"}");
    }

    #[test]
    fn test_blank_lines_are_skipped_but_counted() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"\n  \n{}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 3);
    }

    #[test]
    fn test_trailing_line_without_terminator() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{}\n{\"partial\"");
        let rest = decoder.finish().unwrap();
        assert_eq!(rest.bytes, b"{\"partial\"");
        assert_eq!(rest.number, 2);
    }

    #[test]
    fn test_long_line_in_small_chunks() {
        let line = format!("{{\"isn\":\"{}\"}}\n", "x".repeat(10_000));
        let mut decoder = LineDecoder::new();

        let mut lines = Vec::new();
        for chunk in line.as_bytes().chunks(7) {
            lines.extend(decoder.push(chunk));
            assert!(decoder.scan_from <= decoder.pending_bytes());
        }

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].bytes.len(), line.len() - 1);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_oversized_line_is_reported_and_skipped() {
        let mut decoder = LineDecoder::with_max_line_bytes(16);

        let lines = decoder.push(b"{\"a\":1}\n{\"big\":\"0123456789abcdef");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].oversized && lines[1].bytes.is_empty());
        assert_eq!(lines[1].number, 2);
        assert_eq!(decoder.pending_bytes(), 0);

        // The tail of the oversized line is dropped up to its terminator
        let lines = decoder.push(b"more tail\"}\n{\"b\":2}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].bytes, b"{\"b\":2}");
        assert_eq!(lines[0].number, 3);

        // A complete line over the limit inside one chunk
        let lines = decoder.push(b"{\"c\":\"0123456789abcdef\"}\n");
        assert!(lines[0].oversized);
        assert_eq!(lines[0].number, 4);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_parse_metadata_frame() {
        let frame = parse_frame(
            br#"{"_type":"metadata","totalRecords":250,"possiblyTruncated":true,"chunksFetched":1,"totalChunks":3}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            Frame::Metadata(StreamMetadata {
                total_records: Some(250),
                possibly_truncated: true,
                chunks_fetched: Some(1),
                total_chunks: Some(3),
            })
        );
    }

    #[test]
    fn test_parse_record_frame() {
        let frame = parse_frame(
            br#"{"isn":"X1","testStartTime":"2024-05-01T10:00:00Z","station":"FCT","testStatus":"PASS"}"#,
        )
        .unwrap();
        match frame {
            Frame::Record(record) => assert_eq!(record.id, "X1|2024-05-01T10:00:00Z"),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_frame(b"{not json").is_err());
        assert!(parse_frame(b"[1,2,3]").is_err());
        assert!(parse_frame(br#"{"station":"FCT"}"#).is_err());
    }
}
