//! Response status text and wire serialization.

/// Maps a status code to its reason phrase. Unknown codes render as
/// "Unknown" rather than an empty phrase.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Serializes a status line, headers, a mandatory `Content-Length`, and
/// the body into `out`. `out` is expected to be a connection's write
/// buffer, cleared (not reallocated) between requests.
pub fn serialize(
    out: &mut Vec<u8>,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(status).as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(body);
}

/// Serializes a bodiless, headerless error response for the given status,
/// using the reason phrase as the body (matching the end-to-end 404
/// scenario: `Content-Length: 9\r\n\r\nNot Found`).
pub fn serialize_status_body(out: &mut Vec<u8>, status: u16) {
    let body = reason_phrase(status);
    serialize(out, status, &[], body.as_bytes());
}
