// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Minimal HTTP/1.1 framing for the IPP and status ports.
//
// Parses just enough of a request head to route it (method, path and the
// headers that decide how the body is delimited) and decodes the body
// incrementally so chunk framing never leaks into the IPP parser or into a
// stored job.

use std::fmt;

/// Status line + blank line sent before every IPP response.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Malformed HTTP framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingError(pub String);

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FramingError {}

/// Request line plus the headers this server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub expect_continue: bool,
    /// Bytes of the head including the terminating blank line.
    pub head_len: usize,
}

impl RequestHead {
    /// How the body following this head is delimited.
    pub fn body_decoder(&self) -> BodyDecoder {
        if self.chunked {
            BodyDecoder::Chunked(ChunkState::Size { size: 0, digits: 0 })
        } else if let Some(len) = self.content_length {
            BodyDecoder::Length { remaining: len }
        } else {
            BodyDecoder::UntilClose
        }
    }
}

/// Find the first occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse a request head from the start of `buf`.
///
/// Returns `Ok(None)` while the terminating blank line has not arrived yet.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, FramingError> {
    let Some(header_end) = find_subsequence(buf, b"\r\n\r\n") else {
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Err(FramingError(format!("malformed request line {request_line:?}")));
    };
    let version = parts.next().unwrap_or("HTTP/1.0");

    let mut content_length = None;
    let mut chunked = false;
    let mut expect_continue = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<u64>()
                .map_err(|_| FramingError(format!("bad Content-Length {value:?}")))?;
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("expect") {
            expect_continue = value.eq_ignore_ascii_case("100-continue");
        }
    }

    Ok(Some(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        content_length,
        chunked,
        expect_continue,
        head_len: header_end + 4,
    }))
}

// ---------------------------------------------------------------------------
// Body decoding
// ---------------------------------------------------------------------------

/// Position inside a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Size { size: u64, digits: u32 },
    Extension { size: u64 },
    SizeLf { size: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line_empty: bool },
    Done,
}

/// Incremental body decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDecoder {
    Length { remaining: u64 },
    Chunked(ChunkState),
    /// No length given: the body ends when the client closes.
    UntilClose,
}

impl BodyDecoder {
    /// True once the declared end of the body has been reached.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            BodyDecoder::Length { remaining: 0 } | BodyDecoder::Chunked(ChunkState::Done)
        )
    }

    /// True when connection close is the normal end of the body.
    pub fn ends_on_close(&self) -> bool {
        matches!(self, BodyDecoder::UntilClose)
    }

    /// Decode as much of `input` as belongs to the body into `out`.
    ///
    /// Returns the number of input bytes consumed; anything after the end of
    /// the body is left unconsumed.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, FramingError> {
        match self {
            BodyDecoder::UntilClose => {
                out.extend_from_slice(input);
                Ok(input.len())
            }
            BodyDecoder::Length { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                Ok(take)
            }
            BodyDecoder::Chunked(state) => decode_chunked(state, input, out),
        }
    }
}

fn decode_chunked(
    state: &mut ChunkState,
    input: &[u8],
    out: &mut Vec<u8>,
) -> Result<usize, FramingError> {
    let mut pos = 0;
    while pos < input.len() {
        if let ChunkState::Data { remaining } = state {
            let take = (*remaining).min((input.len() - pos) as u64) as usize;
            out.extend_from_slice(&input[pos..pos + take]);
            pos += take;
            *remaining -= take as u64;
            if *remaining == 0 {
                *state = ChunkState::DataCr;
            }
            continue;
        }

        let byte = input[pos];
        *state = match *state {
            ChunkState::Done => break,
            ChunkState::Size { size, digits } => match byte {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    let digit = (byte as char).to_digit(16).unwrap_or(0);
                    let size = size
                        .checked_mul(16)
                        .and_then(|s| s.checked_add(u64::from(digit)))
                        .ok_or_else(|| FramingError("chunk size overflow".into()))?;
                    ChunkState::Size {
                        size,
                        digits: digits + 1,
                    }
                }
                _ if digits == 0 => {
                    return Err(FramingError(format!("expected chunk size, got {byte:#04x}")));
                }
                b';' | b' ' | b'\t' => ChunkState::Extension { size },
                b'\r' => ChunkState::SizeLf { size },
                b'\n' => after_size_line(size),
                _ => return Err(FramingError(format!("bad chunk size byte {byte:#04x}"))),
            },
            ChunkState::Extension { size } => match byte {
                b'\r' => ChunkState::SizeLf { size },
                b'\n' => after_size_line(size),
                _ => ChunkState::Extension { size },
            },
            ChunkState::SizeLf { size } => match byte {
                b'\n' => after_size_line(size),
                _ => return Err(FramingError("missing LF after chunk size".into())),
            },
            ChunkState::Data { remaining } => ChunkState::Data { remaining },
            ChunkState::DataCr => match byte {
                b'\r' => ChunkState::DataLf,
                b'\n' => ChunkState::Size { size: 0, digits: 0 },
                _ => return Err(FramingError("missing CRLF after chunk data".into())),
            },
            ChunkState::DataLf => match byte {
                b'\n' => ChunkState::Size { size: 0, digits: 0 },
                _ => return Err(FramingError("missing LF after chunk data".into())),
            },
            ChunkState::Trailer { line_empty } => match byte {
                b'\r' => ChunkState::Trailer { line_empty },
                b'\n' if line_empty => ChunkState::Done,
                b'\n' => ChunkState::Trailer { line_empty: true },
                _ => ChunkState::Trailer { line_empty: false },
            },
        };
        pos += 1;
    }
    Ok(pos)
}

fn after_size_line(size: u64) -> ChunkState {
    if size == 0 {
        ChunkState::Trailer { line_empty: true }
    } else {
        ChunkState::Data { remaining: size }
    }
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

/// `200 OK` head framing an IPP response body of `body_len` bytes.
pub fn ipp_response_head(body_len: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/ipp\r\n\
         Content-Length: {body_len}\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// `200 OK` head announcing a static asset of `len` bytes; the answer to a
/// `HEAD` request.
pub fn asset_head(content_type: &str, len: usize) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Complete `200 OK` response carrying a static asset.
pub fn asset_response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = asset_head(content_type, body.len());
    out.extend_from_slice(body);
    out
}

/// `301 Moved Permanently` to `location`.
pub fn redirect_response(location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 301 Moved Permanently\r\n\
         Location: {location}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Body-less response with the given status line.
pub fn status_response(code: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_is_incomplete_until_blank_line() {
        let partial = b"POST /kitchen HTTP/1.1\r\nHost: x\r\n";
        assert_eq!(parse_request_head(partial), Ok(None));
    }

    #[test]
    fn head_extracts_routing_and_framing() {
        let raw = b"POST /kitchen HTTP/1.1\r\n\
                    Host: 192.168.1.5:631\r\n\
                    Content-Type: application/ipp\r\n\
                    content-length: 42\r\n\
                    Expect: 100-continue\r\n\
                    \r\n\
                    <ipp body>";
        let head = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/kitchen");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.content_length, Some(42));
        assert!(head.expect_continue);
        assert!(!head.chunked);
        assert_eq!(&raw[head.head_len..], b"<ipp body>");
        assert_eq!(head.body_decoder(), BodyDecoder::Length { remaining: 42 });
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        assert!(parse_request_head(b"GARBAGE\r\n\r\n").is_err());
        assert!(parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n").is_err());
    }

    #[test]
    fn length_body_stops_at_declared_end() {
        let mut decoder = BodyDecoder::Length { remaining: 5 };
        let mut out = Vec::new();
        assert_eq!(decoder.decode(b"abc", &mut out), Ok(3));
        assert!(!decoder.is_complete());
        assert_eq!(decoder.decode(b"defgh", &mut out), Ok(2));
        assert!(decoder.is_complete());
        assert_eq!(out, b"abcde");
    }

    #[test]
    fn chunked_body_strips_framing_across_splits() {
        let wire = b"5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\nX-Trailer: y\r\n\r\nNEXT";
        // Feed one byte at a time to exercise every state boundary.
        let mut decoder = BodyDecoder::Chunked(ChunkState::Size { size: 0, digits: 0 });
        let mut out = Vec::new();
        let mut consumed = 0;
        for byte in wire.iter() {
            if decoder.is_complete() {
                break;
            }
            consumed += decoder.decode(std::slice::from_ref(byte), &mut out).unwrap();
        }
        assert!(decoder.is_complete());
        assert_eq!(out, b"hello, world");
        assert_eq!(&wire[consumed..], b"NEXT");
    }

    #[test]
    fn chunked_body_rejects_garbage_size() {
        let mut decoder = BodyDecoder::Chunked(ChunkState::Size { size: 0, digits: 0 });
        let mut out = Vec::new();
        assert!(decoder.decode(b"zz\r\n", &mut out).is_err());
    }

    #[test]
    fn asset_response_has_computed_length() {
        let response = asset_response("image/png", &[1, 2, 3]);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(response.ends_with(&[1, 2, 3]));
        assert_eq!(asset_head("image/png", 3), response[..response.len() - 3]);
    }
}
