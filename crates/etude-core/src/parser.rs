// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! The parser never rewrites the buffer: every parsed field is a range into
//! the [`ReadBuffer`], so it can be re-entered after each receive and reach
//! the same result however the bytes were split across reads.

use std::ops::Range;

use memchr::{memchr, memchr2};
use tracing::debug;

use crate::buffer::ReadBuffer;
use crate::http::{HTTP_VERSION, Method};

/// Result of scanning for one line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line; the range excludes the terminator.
    Complete(Range<usize>),
    /// No terminator yet.
    Open,
    /// Stray CR or LF.
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Header,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Incomplete,
    Complete,
    BadRequest,
    InternalError,
}

/// Parsed request fields, all borrowed from the read buffer by range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub content_length: usize,
    pub keep_alive: bool,
    pub state: CheckState,
    /// POST requests are candidates for the credential handlers.
    pub dynamic: bool,
    target: Range<usize>,
    version: Range<usize>,
    host: Option<Range<usize>>,
    body: Range<usize>,
}

impl Request {
    /// Request target with any `http://host` prefix removed.
    pub fn target<'a>(&self, buf: &'a ReadBuffer) -> &'a str {
        text(buf, &self.target)
    }

    pub fn version<'a>(&self, buf: &'a ReadBuffer) -> &'a str {
        text(buf, &self.version)
    }

    pub fn host<'a>(&self, buf: &'a ReadBuffer) -> Option<&'a str> {
        self.host.as_ref().map(|r| text(buf, r))
    }

    pub fn body<'a>(&self, buf: &'a ReadBuffer) -> &'a [u8] {
        buf.filled().get(self.body.clone()).unwrap_or_default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn text<'a>(buf: &'a ReadBuffer, range: &Range<usize>) -> &'a str {
    buf.filled()
        .get(range.clone())
        .and_then(|b| std::str::from_utf8(b).ok())
        .unwrap_or_default()
}

/// Scan the unchecked region for the end of the current line.
pub fn scan_line(buf: &mut ReadBuffer) -> LineStatus {
    let read_idx = buf.read_idx();
    let checked = buf.checked_idx();
    let start = buf.start_line();
    let filled = buf.filled();

    let Some(offset) = memchr2(b'\r', b'\n', &filled[checked..read_idx]) else {
        buf.set_checked(read_idx);
        return LineStatus::Open;
    };
    let pos = checked + offset;

    let (next_checked, status) = if filled[pos] == b'\r' {
        if pos + 1 == read_idx {
            // Leave the CR unchecked so the next scan sees it with its LF.
            (pos, LineStatus::Open)
        } else if filled[pos + 1] == b'\n' {
            (pos + 2, LineStatus::Complete(start..pos))
        } else {
            return LineStatus::Bad;
        }
    } else if pos > start && filled[pos - 1] == b'\r' {
        (pos + 1, LineStatus::Complete(start..pos - 1))
    } else {
        return LineStatus::Bad;
    };

    buf.set_checked(next_checked);
    status
}

enum Step {
    Continue,
    Done(ParseStatus),
}

/// Run the request state machine over everything buffered so far.
pub fn parse(buf: &mut ReadBuffer, req: &mut Request) -> ParseStatus {
    loop {
        if req.state == CheckState::Content {
            let checked = buf.checked_idx();
            let end = checked.saturating_add(req.content_length);
            if buf.read_idx() >= end {
                req.body = checked..end;
                return ParseStatus::Complete;
            }
            return ParseStatus::Incomplete;
        }

        let line = match scan_line(buf) {
            LineStatus::Complete(line) => line,
            LineStatus::Open => return ParseStatus::Incomplete,
            LineStatus::Bad => return ParseStatus::BadRequest,
        };
        buf.begin_line();

        let step = match req.state {
            CheckState::RequestLine => match parse_request_line(buf.filled(), line, req) {
                Some(()) => Step::Continue,
                None => Step::Done(ParseStatus::BadRequest),
            },
            CheckState::Header => parse_header(buf.filled(), line, req),
            CheckState::Content => Step::Done(ParseStatus::InternalError),
        };
        if let Step::Done(status) = step {
            return status;
        }
    }
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn skip_blanks(text: &[u8], mut i: usize) -> usize {
    while i < text.len() && is_blank(text[i]) {
        i += 1;
    }
    i
}

fn parse_request_line(filled: &[u8], line: Range<usize>, req: &mut Request) -> Option<()> {
    let base = line.start;
    let text = &filled[line];

    let method_end = memchr2(b' ', b'\t', text)?;
    let method = Method::from_bytes(&text[..method_end])?;

    let mut target_start = skip_blanks(text, method_end);
    let target_end = target_start + memchr2(b' ', b'\t', &text[target_start..])?;

    let version_start = skip_blanks(text, target_end);
    if !text[version_start..].eq_ignore_ascii_case(HTTP_VERSION) {
        return None;
    }

    let target = &text[target_start..target_end];
    if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
        target_start += 7 + memchr(b'/', &target[7..])?;
    }
    let target = &text[target_start..target_end];
    if target.first() != Some(&b'/') {
        return None;
    }
    std::str::from_utf8(target).ok()?;

    req.method = method;
    req.dynamic = method == Method::Post;
    req.target = base + target_start..base + target_end;
    req.version = base + version_start..base + text.len();
    req.state = CheckState::Header;
    Some(())
}

fn header_value<'a>(text: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if text.len() < name.len() || !text[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let rest = &text[name.len()..];
    Some(&rest[skip_blanks(rest, 0)..])
}

/// Leading decimal digits, saturating; anything else counts as zero.
fn parse_length(value: &[u8]) -> usize {
    value
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0usize, |acc, b| {
            acc.saturating_mul(10).saturating_add(usize::from(b - b'0'))
        })
}

fn parse_header(filled: &[u8], line: Range<usize>, req: &mut Request) -> Step {
    let base = line.start;
    let text = &filled[line];

    if text.is_empty() {
        if req.content_length != 0 {
            req.state = CheckState::Content;
            return Step::Continue;
        }
        return Step::Done(ParseStatus::Complete);
    }

    if let Some(value) = header_value(text, b"Connection:") {
        if value.eq_ignore_ascii_case(b"keep-alive") {
            req.keep_alive = true;
        }
    } else if let Some(value) = header_value(text, b"Content-Length:") {
        req.content_length = parse_length(value);
    } else if let Some(value) = header_value(text, b"Host:") {
        let start = base + (text.len() - value.len());
        req.host = Some(start..base + text.len());
    } else {
        debug!(header = %String::from_utf8_lossy(text), "unknown header");
    }
    Step::Continue
}
