//! Delimiter-framed text codec.

use bytes::{Buf, BytesMut};

use crate::config::{TextlineDelimiter, TransportConfig};
use crate::error::TransportError;
use crate::exchange::Payload;
use crate::pipeline::Codec;

/// Character encodings the textline path understands.
///
/// Rust strings are UTF-8; the recognized names are the UTF-8 family plus
/// its ASCII subset. Anything else is rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Ascii,
}

/// Map a configured charset name onto a supported encoding.
pub fn normalize_charset(name: &str) -> Result<Charset, TransportError> {
    match name.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => Ok(Charset::Utf8),
        "us-ascii" | "ascii" => Ok(Charset::Ascii),
        _ => Err(TransportError::config_error(
            "charset_name",
            format!("unsupported charset '{}'", name),
        )),
    }
}

/// Convert an outbound payload to its textline representation, appending
/// the delimiter per the auto-append policy. Used by the producer before
/// the body reaches the pipeline.
pub fn textline_body(
    payload: Payload,
    delimiter: TextlineDelimiter,
    auto_append: bool,
) -> Result<Payload, TransportError> {
    let mut text = payload.into_text()?;
    if auto_append && !text.as_bytes().ends_with(delimiter.as_bytes()) {
        text.push_str(match delimiter {
            TextlineDelimiter::Line => "\n",
            TextlineDelimiter::Null => "\0",
        });
    }
    Ok(Payload::Text(text))
}

/// Frames text payloads with the configured delimiter.
///
/// Encoding appends the delimiter only when auto-append is on and the text
/// does not already end with it, so running after [`textline_body`] never
/// doubles the terminator. Decoding strips the delimiter (and a trailing
/// carriage return in line mode).
#[derive(Debug)]
pub struct TextlineCodec {
    delimiter: TextlineDelimiter,
    auto_append: bool,
    charset: Charset,
}

impl TextlineCodec {
    pub fn new(delimiter: TextlineDelimiter, auto_append: bool, charset: Charset) -> Self {
        Self {
            delimiter,
            auto_append,
            charset,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        let charset = config
            .charset_name
            .as_deref()
            .and_then(|name| normalize_charset(name).ok())
            .unwrap_or(Charset::Utf8);
        Self::new(config.delimiter, config.auto_append_delimiter, charset)
    }

    fn check_charset(&self, text: &str) -> Result<(), TransportError> {
        if self.charset == Charset::Ascii && !text.is_ascii() {
            return Err(TransportError::conversion_error(
                "payload contains non-ASCII characters",
            ));
        }
        Ok(())
    }
}

impl Codec for TextlineCodec {
    fn encode(&mut self, payload: Payload, dst: &mut BytesMut) -> Result<(), TransportError> {
        let text = payload.into_text()?;
        self.check_charset(&text)?;
        dst.extend_from_slice(text.as_bytes());
        if self.auto_append && !text.as_bytes().ends_with(self.delimiter.as_bytes()) {
            dst.extend_from_slice(self.delimiter.as_bytes());
        }
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Payload>, TransportError> {
        let delim = self.delimiter.as_bytes()[0];
        let pos = match src.iter().position(|&b| b == delim) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let mut frame = src.split_to(pos);
        src.advance(1);
        if self.delimiter == TextlineDelimiter::Line && frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }

        let text = String::from_utf8(frame.to_vec()).map_err(|e| {
            TransportError::conversion_error(format!("inbound frame is not valid UTF-8: {}", e))
        })?;
        self.check_charset(&text)?;
        Ok(Some(Payload::Text(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_delimiter_once() {
        let mut codec = TextlineCodec::new(TextlineDelimiter::Line, true, Charset::Utf8);
        let mut dst = BytesMut::new();
        codec.encode(Payload::from("ping"), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"ping\n");

        dst.clear();
        codec.encode(Payload::from("ping\n"), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"ping\n");
    }

    #[test]
    fn auto_append_off_leaves_the_body_alone() {
        let mut codec = TextlineCodec::new(TextlineDelimiter::Line, false, Charset::Utf8);
        let mut dst = BytesMut::new();
        codec.encode(Payload::from("ping"), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"ping");
    }

    #[test]
    fn decode_strips_carriage_return() {
        let mut codec = TextlineCodec::new(TextlineDelimiter::Line, true, Charset::Utf8);
        let mut src = BytesMut::from(&b"pong\r\nrest"[..]);
        let payload = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(payload, Payload::from("pong"));
        assert_eq!(src.as_ref(), b"rest");
    }

    #[test]
    fn null_delimited_frames() {
        let mut codec = TextlineCodec::new(TextlineDelimiter::Null, true, Charset::Utf8);
        let mut dst = BytesMut::new();
        codec.encode(Payload::from("abc"), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"abc\0");

        let mut src = BytesMut::from(&dst[..]);
        let payload = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(payload, Payload::from("abc"));
    }

    #[test]
    fn ascii_charset_rejects_non_ascii() {
        let mut codec = TextlineCodec::new(TextlineDelimiter::Line, true, Charset::Ascii);
        let mut dst = BytesMut::new();
        let err = codec.encode(Payload::from("héllo"), &mut dst).unwrap_err();
        assert!(matches!(err, TransportError::Conversion { .. }));
    }

    #[test]
    fn textline_body_respects_auto_append() {
        let body = textline_body(Payload::from("hi"), TextlineDelimiter::Line, true).unwrap();
        assert_eq!(body, Payload::from("hi\n"));

        let body = textline_body(Payload::from("hi"), TextlineDelimiter::Line, false).unwrap();
        assert_eq!(body, Payload::from("hi"));
    }

    #[test]
    fn textline_body_fails_on_binary_payloads() {
        let err = textline_body(
            Payload::from(vec![0xff, 0x00]),
            TextlineDelimiter::Line,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Conversion { .. }));
    }
}
