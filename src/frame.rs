//! Wire framing for the device protocol: a token-routed, line-oriented
//! format with raw binary trailers.
//!
//! A frame is an ordered sequence of byte fields. The first field is the
//! token, the second is the verb, the rest are verb-specific arguments.
//! Fields that are safe to put inline (printable ASCII, no `|`, don't start
//! with `&`) are written directly into the header line, separated by `|`.
//! Anything else is replaced in the header by a `&<len>` placeholder and
//! appended afterwards as a raw trailer terminated by `\n`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// One decoded or to-be-encoded frame: an ordered list of binary fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fields: Vec<Bytes>,
}

impl Frame {
    pub fn new(fields: Vec<Bytes>) -> Self {
        Frame { fields }
    }

    /// Build a frame from a token and a list of verb/argument fields.
    pub fn with_token<T, I, F>(token: T, rest: I) -> Self
    where
        T: Into<Bytes>,
        I: IntoIterator<Item = F>,
        F: Into<Bytes>,
    {
        let mut fields = vec![token.into()];
        fields.extend(rest.into_iter().map(Into::into));
        Frame { fields }
    }

    pub fn token(&self) -> &[u8] {
        self.fields.first().map(|b| b.as_ref()).unwrap_or(b"")
    }

    pub fn verb(&self) -> Option<&[u8]> {
        self.fields.get(1).map(|b| b.as_ref())
    }
}

/// Errors from decoding a byte stream into frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough data buffered yet to parse a complete frame.
    #[error("incomplete frame")]
    Incomplete,

    /// A `&N` placeholder did not parse as a non-negative decimal integer.
    #[error("malformed raw-field length placeholder: {0:?}")]
    BadLength(Vec<u8>),

    /// The underlying transport returned EOF or an I/O error mid-frame.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// A field is clean — safe to inline in the header line — iff it is
/// non-empty, every byte is in 0x20..=0x7E except `|`, and it doesn't start
/// with `&`.
pub fn is_clean(field: &[u8]) -> bool {
    if field.is_empty() {
        return false;
    }
    if field[0] == b'&' {
        return false;
    }
    field.iter().all(|&b| (0x20..=0x7E).contains(&b) && b != b'|')
}

/// Encode one field into either an inline header token or a `(placeholder,
/// raw trailer)` pair.
///
/// `escape_arg(b"123") == (b"123", None)`
/// `escape_arg(b"1\t3") == (b"&3", Some(b"1\t3"))`
pub fn escape_arg(field: &[u8]) -> (Bytes, Option<Bytes>) {
    if is_clean(field) {
        (Bytes::copy_from_slice(field), None)
    } else {
        let placeholder = format!("&{}", field.len());
        (Bytes::from(placeholder), Some(Bytes::copy_from_slice(field)))
    }
}

/// Encode a full frame (token + fields) onto the wire.
pub fn encode(frame: &Frame, buf: &mut BytesMut) {
    let mut header_parts: Vec<Bytes> = Vec::with_capacity(frame.fields.len());
    let mut trailers: Vec<Bytes> = Vec::new();

    for field in &frame.fields {
        let (header_field, trailer) = escape_arg(field);
        header_parts.push(header_field);
        if let Some(raw) = trailer {
            trailers.push(raw);
        }
    }

    for (i, part) in header_parts.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'|');
        }
        buf.put_slice(part);
    }
    buf.put_u8(b'\n');

    for trailer in trailers {
        buf.put_slice(&trailer);
        buf.put_u8(b'\n');
    }
}

/// Try to parse one frame out of the front of `buf`.
///
/// Returns `Ok(Some(frame))` and advances `buf` past the consumed bytes on
/// success, `Ok(None)` if not enough data is buffered yet (caller should
/// read more and retry), or `Err` on a malformed `&N` placeholder.
pub fn try_parse(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let Some(header_end) = find_byte(&buf[..], b'\n') else {
        return Ok(None);
    };

    // Walk the header splitting on '|', reading trailers out of the buffer
    // as we encounter '&N' placeholders. `cursor` tracks how many bytes of
    // `buf` (header + trailers) we've consumed so far.
    let mut fields: Vec<Bytes> = Vec::new();
    let mut cursor = header_end + 1;

    for raw_field in buf[..header_end].split(|&b| b == b'|') {
        if raw_field.first() == Some(&b'&') {
            let n = parse_decimal(&raw_field[1..])
                .ok_or_else(|| FrameError::BadLength(raw_field.to_vec()))?;
            // Need n bytes + a trailing '\n' beyond what's already consumed.
            if buf.len() < cursor + n + 1 {
                return Ok(None);
            }
            let start = cursor;
            let end = start + n;
            fields.push(Bytes::copy_from_slice(&buf[start..end]));
            cursor = end + 1; // skip the trailer's terminating '\n'
        } else {
            fields.push(Bytes::copy_from_slice(raw_field));
        }
    }

    buf.advance(cursor);
    Ok(Some(Frame { fields }))
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Parse a run of ASCII decimal digits into a `usize`. No leading zeros are
/// required; an empty or non-digit run is rejected.
fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(fields: &[&[u8]]) -> BytesMut {
        let frame = Frame::new(fields.iter().map(|f| Bytes::copy_from_slice(f)).collect());
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf);
        buf
    }

    #[test]
    fn clean_classification() {
        assert_eq!(escape_arg(b"123"), (Bytes::from_static(b"123"), None));
        assert_eq!(
            escape_arg(b"1\t3"),
            (Bytes::from_static(b"&3"), Some(Bytes::from_static(b"1\t3")))
        );
        assert_eq!(
            escape_arg(b"&x"),
            (Bytes::from_static(b"&2"), Some(Bytes::from_static(b"&x")))
        );
        assert_eq!(
            escape_arg(b""),
            (Bytes::from_static(b"&0"), Some(Bytes::from_static(b"")))
        );
    }

    #[test]
    fn round_trip_basic_fields() {
        let cases: Vec<Vec<&[u8]>> = vec![
            vec![b"tok", b"ret", b"42"],
            vec![b"tok", b""],
            vec![b"tok", b"&weird"],
            vec![b"tok", b"has|pipe"],
            vec![b"tok", b"has\nnewline"],
            vec![b"tok", b"\xff\x00high bytes"],
        ];
        for fields in cases {
            let mut buf = encode_frame(&fields);
            let frame = try_parse(&mut buf).unwrap().expect("complete frame");
            assert_eq!(buf.len(), 0, "entire encoded frame should be consumed");
            let got: Vec<&[u8]> = frame.fields.iter().map(|b| b.as_ref()).collect();
            assert_eq!(got, fields);
        }
    }

    #[test]
    fn known_wire_bytes_for_long_trailer() {
        // fire_and_forget("load", "foo", b"a|b\nc") -> noret|load|foo|&5\na|b\nc\n
        let frame = Frame::new(vec![
            Bytes::from_static(b"noret"),
            Bytes::from_static(b"load"),
            Bytes::from_static(b"foo"),
            Bytes::from_static(b"a|b\nc"),
        ]);
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf);
        assert_eq!(&buf[..], b"noret|load|foo|&5\na|b\nc\n".as_slice());
    }

    #[test]
    fn incomplete_header_returns_none() {
        let mut buf = BytesMut::from(&b"tok|ret|4"[..]);
        assert!(try_parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_trailer_returns_none() {
        let mut buf = BytesMut::from(&b"tok|&5\nab"[..]);
        assert!(try_parse(&mut buf).unwrap().is_none());
        // now complete it
        buf.extend_from_slice(b"cde\n");
        let frame = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.fields[1].as_ref(), b"abcde");
    }

    #[test]
    fn malformed_length_is_an_error() {
        let mut buf = BytesMut::from(&b"tok|&-3\nxxx\n"[..]);
        assert!(matches!(try_parse(&mut buf), Err(FrameError::BadLength(_))));
    }

    #[test]
    fn buffer_retains_bytes_past_one_frame() {
        let mut buf = encode_frame(&[b"tok1", b"ret", b"a"]);
        buf.extend_from_slice(&encode_frame(&[b"tok2", b"ret", b"b"]));
        let f1 = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(f1.fields[0].as_ref(), b"tok1");
        let f2 = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(f2.fields[0].as_ref(), b"tok2");
        assert!(buf.is_empty());
    }
}
