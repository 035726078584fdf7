//! HTTP/1 response-head parsing
//!
//! The only HTTP/1 the session speaks is the reply to its CONNECT request
//! towards a forward proxy, so this parser stops at the end of the header
//! block and only surfaces the status code. It is feed-style: hand it
//! whatever bytes arrived, ask again later if the head is not complete.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid status line: {0}")]
    InvalidStatusLine(String),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(String),
    #[error("response head exceeds {0} bytes")]
    HeadTooLarge(usize),
}

const MAX_HEAD: usize = 8 * 1024;

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    StatusLine,
    Headers,
    Complete,
}

/// Incremental parser for one HTTP/1 response head.
pub struct ResponseHeadParser {
    state: ParserState,
    buffer: Vec<u8>,
    status: Option<u16>,
}

impl ResponseHeadParser {
    pub fn new() -> Self {
        ResponseHeadParser {
            state: ParserState::StatusLine,
            buffer: Vec::new(),
            status: None,
        }
    }

    /// Feeds bytes in; returns the status code once the head (status line
    /// plus headers, terminated by an empty line) is complete, `None` if
    /// more bytes are needed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<u16>, ParseError> {
        if self.state == ParserState::Complete {
            return Ok(self.status);
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_HEAD {
            return Err(ParseError::HeadTooLarge(MAX_HEAD));
        }

        loop {
            let Some(crlf) = find_crlf(&self.buffer) else {
                return Ok(None);
            };
            let line = String::from_utf8_lossy(&self.buffer[..crlf]).to_string();
            self.buffer.drain(..crlf + 2);

            match self.state {
                ParserState::StatusLine => {
                    self.status = Some(parse_status_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    if line.is_empty() {
                        self.state = ParserState::Complete;
                        return Ok(self.status);
                    }
                    // Header values are irrelevant to the tunnel outcome,
                    // but malformed lines still fail the attempt.
                    if !line.contains(':') && !line.starts_with([' ', '\t']) {
                        return Err(ParseError::InvalidHeaderLine(line));
                    }
                }
                ParserState::Complete => return Ok(self.status),
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

impl Default for ResponseHeadParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `HTTP/1.x CODE [reason]`.
fn parse_status_line(line: &str) -> Result<u16, ParseError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ParseError::InvalidStatusLine(line.to_string()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidStatusLine(line.to_string()));
    }
    let code = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| ParseError::InvalidStatusLine(line.to_string()))?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_200_in_one_feed() {
        let mut p = ResponseHeadParser::new();
        let res = p
            .feed(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .unwrap();
        assert_eq!(res, Some(200));
        assert!(p.is_complete());
    }

    #[test]
    fn test_parse_across_feeds() {
        let mut p = ResponseHeadParser::new();
        assert_eq!(p.feed(b"HTTP/1.1 40").unwrap(), None);
        assert_eq!(p.feed(b"7 Proxy Authentication Required\r\n").unwrap(), None);
        assert_eq!(p.feed(b"Proxy-Authenticate: Basic\r\n").unwrap(), None);
        assert_eq!(p.feed(b"\r\n").unwrap(), Some(407));
    }

    #[test]
    fn test_headers_are_skipped() {
        let mut p = ResponseHeadParser::new();
        let res = p
            .feed(b"HTTP/1.0 200 OK\r\nServer: px\r\nVia: 1.1 px\r\n\r\n")
            .unwrap();
        assert_eq!(res, Some(200));
    }

    #[test]
    fn test_garbage_status_line() {
        let mut p = ResponseHeadParser::new();
        assert!(p.feed(b"SSH-2.0-OpenSSH\r\n").is_err());
    }

    #[test]
    fn test_bad_status_code() {
        let mut p = ResponseHeadParser::new();
        assert!(p.feed(b"HTTP/1.1 abc OK\r\n").is_err());
    }
}
