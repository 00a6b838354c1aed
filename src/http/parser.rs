//! Push-mode HTTP/1.1 request parsing over a connection's ring buffer.
//!
//! Wraps `httparse` (the assumed-available tokenizer) and adds the one
//! thing it doesn't do: deciding whether the *body* has fully arrived,
//! using `Content-Length`. Chunked transfer is out of scope, so the
//! absence of `Content-Length` means an empty body.

const MAX_HEADERS: usize = 100;

/// Outcome of attempting to parse a request out of the buffer's readable
/// bytes.
pub enum ParseOutcome<'a> {
    /// A full request was parsed; `consumed` bytes (request line, headers,
    /// blank line, and body) should be consumed from the ring buffer.
    Complete {
        request: ParsedRequest<'a>,
        consumed: usize,
    },
    /// Not enough bytes yet; keep reading into the same buffer.
    Incomplete,
    /// Malformed request line/headers, or more headers than the parser's
    /// fixed capacity allows.
    Invalid,
}

/// A parsed request: all spans borrow directly from the ring buffer's
/// readable slice and are valid only until the next `consume`/`reset`.
pub struct ParsedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub version_minor: u8,
    header_storage: [httparse::Header<'a>; MAX_HEADERS],
    header_count: usize,
    pub body: &'a [u8],
}

impl<'a> ParsedRequest<'a> {
    pub fn headers(&self) -> &[httparse::Header<'a>] {
        &self.header_storage[..self.header_count]
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }
}

/// Parse one request out of `buf`. Never allocates: the header array is
/// fixed-size stack storage.
pub fn parse(buf: &[u8]) -> ParseOutcome<'_> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);

    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseOutcome::Incomplete,
        Err(_) => return ParseOutcome::Invalid,
    };

    let (method, path, version_minor) = match (req.method, req.path, req.version) {
        (Some(m), Some(p), Some(v)) => (m, p, v),
        _ => return ParseOutcome::Invalid,
    };

    let content_length = match content_length(req.headers) {
        Ok(len) => len,
        Err(()) => return ParseOutcome::Invalid,
    };

    let total_len = header_len + content_length;
    if buf.len() < total_len {
        return ParseOutcome::Incomplete;
    }

    let header_count = req.headers.len();
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    header_storage[..header_count].copy_from_slice(req.headers);

    ParseOutcome::Complete {
        request: ParsedRequest {
            method,
            path,
            version_minor,
            header_storage,
            header_count,
            body: &buf[header_len..total_len],
        },
        consumed: total_len,
    }
}

/// Reads `Content-Length` case-insensitively; absent means no body.
/// A present-but-unparseable value is a malformed request.
fn content_length(headers: &[httparse::Header<'_>]) -> Result<usize, ()> {
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let text = std::str::from_utf8(header.value).map_err(|_| ())?;
            return text.trim().parse::<usize>().map_err(|_| ());
        }
    }
    Ok(0)
}
