//! Pass-through byte codec, the default when no framing is configured.

use bytes::BytesMut;

use crate::error::TransportError;
use crate::exchange::Payload;
use crate::pipeline::Codec;

/// Writes payload bytes unchanged and surfaces whatever the transport
/// delivered as one frame. Stream transports hand over each read as it
/// arrives; datagram transports hand over one datagram at a time.
#[derive(Debug, Default)]
pub struct RawCodec;

impl RawCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for RawCodec {
    fn encode(&mut self, payload: Payload, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.extend_from_slice(&payload.to_bytes());
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Payload>, TransportError> {
        if src.is_empty() {
            return Ok(None);
        }
        let frame = src.split_to(src.len());
        Ok(Some(Payload::Bytes(frame.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_pass_through_unchanged() {
        let mut codec = RawCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Payload::from(vec![0x00, 0xff, 0x10]), &mut dst)
            .unwrap();
        assert_eq!(dst.as_ref(), &[0x00, 0xff, 0x10]);

        let mut src = BytesMut::from(&dst[..]);
        let payload = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(payload.to_bytes().as_ref(), &[0x00, 0xff, 0x10]);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }
}
