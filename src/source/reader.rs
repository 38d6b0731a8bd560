use super::{RawLine, SourceError};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Result of a single bounded line read.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    TooLong,
    Eof,
}

/// Reads one line of at most `limit` bytes (newline excluded) into `buf`.
///
/// Bytes of an unterminated line stay in `buf` at EOF unless `flush_partial`
/// is set, so a tailing caller can resume the same line once more data is
/// appended. Trailing `\r` is stripped and invalid UTF-8 replaced.
pub async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
    flush_partial: bool,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if flush_partial && !buf.is_empty() {
                return Ok(LineRead::Line(take_line(buf)));
            }
            return Ok(LineRead::Eof);
        }

        let (chunk_len, consumed, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos, pos + 1, true),
            None => (available.len(), available.len(), false),
        };

        // A trailing `\r` is stripped later and does not count
        let chunk = &available[..chunk_len];
        let pending = buf.len() + chunk_len;
        let ends_with_cr = chunk.last().or(buf.last()) == Some(&b'\r');
        if pending > limit + usize::from(ends_with_cr) {
            buf.clear();
            return Ok(LineRead::TooLong);
        }

        buf.extend_from_slice(chunk);
        reader.consume(consumed);

        if complete {
            return Ok(LineRead::Line(take_line(buf)));
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

/// Line source over an arbitrary buffered reader, normally stdin.
pub struct ReaderSource {
    name: Arc<str>,
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    buf: Vec<u8>,
    limit: usize,
    next_seq: u64,
}

impl ReaderSource {
    pub fn new(name: &str, reader: Box<dyn AsyncBufRead + Send + Unpin>, limit: usize) -> Self {
        Self {
            name: Arc::from(name),
            reader,
            buf: Vec::new(),
            limit,
            next_seq: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next_line(&mut self) -> Result<Option<RawLine>, SourceError> {
        let seq = self.next_seq;
        match read_line_bounded(&mut self.reader, &mut self.buf, self.limit, true).await? {
            LineRead::Line(text) => {
                self.next_seq += 1;
                Ok(Some(RawLine {
                    source: Arc::clone(&self.name),
                    seq,
                    text,
                }))
            }
            LineRead::TooLong => Err(SourceError::LineTooLong {
                seq,
                limit: self.limit,
            }),
            LineRead::Eof => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn source(input: &'static str, limit: usize) -> ReaderSource {
        ReaderSource::new("test", Box::new(BufReader::new(input.as_bytes())), limit)
    }

    #[tokio::test]
    async fn test_reads_lines_in_order() {
        let mut source = source("first\r\nsecond\nthird", 64);

        let line = source.next_line().await.unwrap().unwrap();
        assert_eq!(line.text, "first");
        assert_eq!(line.seq, 0);
        assert_eq!(&*line.source, "test");

        assert_eq!(source.next_line().await.unwrap().unwrap().text, "second");

        // Unterminated final line is still emitted
        let last = source.next_line().await.unwrap().unwrap();
        assert_eq!(last.text, "third");
        assert_eq!(last.seq, 2);

        assert!(source.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_lines_are_kept() {
        let mut source = source("\n\nx\n", 64);
        assert_eq!(source.next_line().await.unwrap().unwrap().text, "");
        assert_eq!(source.next_line().await.unwrap().unwrap().text, "");
        assert_eq!(source.next_line().await.unwrap().unwrap().text, "x");
        assert!(source.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_exactly_at_limit_is_accepted() {
        let mut source = source("abcd\nabcde\n", 4);
        assert_eq!(source.next_line().await.unwrap().unwrap().text, "abcd");

        let err = source.next_line().await.unwrap_err();
        assert!(matches!(err, SourceError::LineTooLong { seq: 1, limit: 4 }));
    }

    #[tokio::test]
    async fn test_crlf_line_at_limit_is_accepted() {
        let mut source = source("abcd\r\nabcd\rx\n", 4);
        assert_eq!(source.next_line().await.unwrap().unwrap().text, "abcd");

        // A carriage return inside the line still counts
        let err = source.next_line().await.unwrap_err();
        assert!(matches!(err, SourceError::LineTooLong { seq: 1, limit: 4 }));
    }

    #[tokio::test]
    async fn test_crlf_split_across_buffer_refills() {
        let reader = BufReader::with_capacity(5, std::io::Cursor::new(b"abcd\r\nnext\n".to_vec()));
        let mut source = ReaderSource::new("test", Box::new(reader), 4);

        assert_eq!(source.next_line().await.unwrap().unwrap().text, "abcd");
        assert_eq!(source.next_line().await.unwrap().unwrap().text, "next");
    }

    #[tokio::test]
    async fn test_long_line_across_buffer_refills() {
        // A tiny BufReader capacity forces several fill_buf rounds per line
        let input = format!("{}\n", "x".repeat(100));
        let reader = BufReader::with_capacity(8, std::io::Cursor::new(input.into_bytes()));
        let mut source = ReaderSource::new("test", Box::new(reader), 99);

        let err = source.next_line().await.unwrap_err();
        assert!(matches!(err, SourceError::LineTooLong { limit: 99, .. }));
    }

    #[tokio::test]
    async fn test_partial_line_kept_without_flush() {
        let mut reader = BufReader::new("abc".as_bytes());
        let mut buf = Vec::new();

        let read = read_line_bounded(&mut reader, &mut buf, 16, false).await.unwrap();
        assert_eq!(read, LineRead::Eof);
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let reader = BufReader::new(std::io::Cursor::new(vec![b'o', b'k', 0xff, b'\n']));
        let mut source = ReaderSource::new("test", Box::new(reader), 16);
        let line = source.next_line().await.unwrap().unwrap();
        assert_eq!(line.text, "ok\u{fffd}");
    }
}
