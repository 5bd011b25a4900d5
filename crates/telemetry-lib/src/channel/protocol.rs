//! Guest channel request framing
//!
//! A request is the line `GET /metrics/XML` followed by one blank line.
//! Lines may end in `\n` or `\r\n`.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const REQUEST_METHOD: &str = "GET";
pub const REQUEST_PATH: &str = "/metrics/XML";

/// Longest accepted line, terminator included
pub const MAX_LINE_LEN: usize = 4096;

pub const INVALID_RESPONSE: &[u8] = b"INVALID REQUEST\n\n";

/// Sent in place of a report that could not be produced
pub const PLACEHOLDER: &str =
    "<metrics><!-- host metrics not available --><!-- VM metrics not available --></metrics>";

const RESPONSE_TERMINATOR: &[u8] = b"\n\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request line exceeds {} bytes", MAX_LINE_LEN)]
    LineTooLong,

    #[error("request is not valid UTF-8")]
    NotUtf8,

    #[error("request has no method")]
    MissingMethod,

    #[error("unsupported method {0:?}")]
    Method(String),

    #[error("unsupported path {0:?}")]
    Path(String),

    #[error("malformed request line {0:?}")]
    Malformed(String),

    #[error("request not terminated by a blank line")]
    MissingBlankLine,
}

/// What one framed read produced
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Request,
    Invalid(RequestError),
    Closed,
}

/// Check a request line with its terminator already stripped
pub fn parse_request_line(line: &str) -> Result<(), RequestError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    match tokens.as_slice() {
        [method, path] => {
            if *method != REQUEST_METHOD {
                return Err(RequestError::Method(method.to_string()));
            }
            if !path.starts_with('/') {
                return Err(RequestError::Malformed(line.to_string()));
            }
            if *path != REQUEST_PATH {
                return Err(RequestError::Path(path.to_string()));
            }
            Ok(())
        }
        [path] if path.starts_with('/') => Err(RequestError::MissingMethod),
        _ => Err(RequestError::Malformed(line.to_string())),
    }
}

enum Line {
    Text(String),
    TooLong,
    NotUtf8,
    Eof,
}

async fn read_line<R>(reader: &mut R) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut raw)
        .await?;

    if n == 0 {
        return Ok(Line::Eof);
    }
    if raw.last() != Some(&b'\n') {
        // a full buffer without terminator is oversized, anything shorter hit EOF
        return Ok(if n >= MAX_LINE_LEN {
            Line::TooLong
        } else {
            Line::Eof
        });
    }

    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }

    Ok(match String::from_utf8(raw) {
        Ok(text) => Line::Text(text),
        Err(_) => Line::NotUtf8,
    })
}

/// Drop input through the next `\n`. Returns false when EOF came first.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (found, used) = {
            let buf = reader.fill_buf().await?;
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (true, pos + 1),
                None => (false, buf.len()),
            }
        };
        if used == 0 {
            return Ok(false);
        }
        reader.consume(used);
        if found {
            return Ok(true);
        }
    }
}

/// Read one request line plus its blank line
///
/// An oversized request line is skipped through its terminator and the
/// line after it, so the guest sees a single invalid response for it.
pub async fn read_request<R>(reader: &mut R) -> std::io::Result<ReadOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let request = match read_line(reader).await? {
        Line::Text(text) => text,
        Line::TooLong => {
            if !discard_line(reader).await? {
                return Ok(ReadOutcome::Closed);
            }
            return Ok(match read_line(reader).await? {
                Line::Eof => ReadOutcome::Closed,
                _ => ReadOutcome::Invalid(RequestError::LineTooLong),
            });
        }
        Line::NotUtf8 => return Ok(ReadOutcome::Invalid(RequestError::NotUtf8)),
        Line::Eof => return Ok(ReadOutcome::Closed),
    };

    match read_line(reader).await? {
        Line::Text(blank) if blank.is_empty() => {}
        Line::Eof => return Ok(ReadOutcome::Closed),
        _ => return Ok(ReadOutcome::Invalid(RequestError::MissingBlankLine)),
    }

    Ok(match parse_request_line(&request) {
        Ok(()) => ReadOutcome::Request,
        Err(e) => ReadOutcome::Invalid(e),
    })
}

/// Terminate a response body for the guest
pub fn frame_response(mut body: Vec<u8>) -> Vec<u8> {
    body.extend_from_slice(RESPONSE_TERMINATOR);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn read_all(input: &[u8]) -> Vec<ReadOutcome> {
        let mut reader = BufReader::new(input);
        let mut outcomes = Vec::new();
        loop {
            let outcome = read_request(&mut reader).await.unwrap();
            let closed = outcome == ReadOutcome::Closed;
            outcomes.push(outcome);
            if closed {
                return outcomes;
            }
        }
    }

    #[test]
    fn test_parse_request_line() {
        assert_eq!(parse_request_line("GET /metrics/XML"), Ok(()));
        assert_eq!(parse_request_line("  GET   /metrics/XML "), Ok(()));
        assert_eq!(
            parse_request_line("GET /foo"),
            Err(RequestError::Path("/foo".to_string()))
        );
        assert_eq!(
            parse_request_line("POST /metrics/XML"),
            Err(RequestError::Method("POST".to_string()))
        );
        assert_eq!(
            parse_request_line("/metrics/XML"),
            Err(RequestError::MissingMethod)
        );
        assert!(matches!(
            parse_request_line("GET metrics/XML"),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            parse_request_line("GET /metrics/XML HTTP/1.1"),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            parse_request_line(""),
            Err(RequestError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_requests_in_sequence() {
        let outcomes = read_all(b"GET /metrics/XML\n\nGET /metrics/XML\r\n\r\n").await;
        assert_eq!(
            outcomes,
            vec![ReadOutcome::Request, ReadOutcome::Request, ReadOutcome::Closed]
        );
    }

    #[tokio::test]
    async fn test_header_lines_rejected() {
        let outcomes = read_all(b"GET /metrics/XML\nHost: guest\n\n").await;
        assert_eq!(
            outcomes[0],
            ReadOutcome::Invalid(RequestError::MissingBlankLine)
        );
    }

    #[tokio::test]
    async fn test_oversized_line() {
        let mut input = vec![b'A'; MAX_LINE_LEN + 10];
        input.extend_from_slice(b"\n\n");

        let mut reader = BufReader::new(input.as_slice());
        assert_eq!(
            read_request(&mut reader).await.unwrap(),
            ReadOutcome::Invalid(RequestError::LineTooLong)
        );
    }

    #[tokio::test]
    async fn test_oversized_line_yields_one_invalid_outcome() {
        let mut input = vec![b'A'; 20_000];
        input.extend_from_slice(b"\n\nGET /metrics/XML\n\n");

        assert_eq!(
            read_all(&input).await,
            vec![
                ReadOutcome::Invalid(RequestError::LineTooLong),
                ReadOutcome::Request,
                ReadOutcome::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_line_without_terminator_is_closed() {
        let input = vec![b'A'; MAX_LINE_LEN * 3];
        assert_eq!(read_all(&input).await, vec![ReadOutcome::Closed]);
    }

    #[tokio::test]
    async fn test_truncated_request_is_closed() {
        assert_eq!(read_all(b"GET /metr").await, vec![ReadOutcome::Closed]);
        assert_eq!(read_all(b"GET /metrics/XML\n").await, vec![ReadOutcome::Closed]);
    }

    #[test]
    fn test_frame_response() {
        assert_eq!(frame_response(b"<metrics/>".to_vec()), b"<metrics/>\n\n");
    }
}
