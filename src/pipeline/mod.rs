//! Codec chains bound to channels.
//!
//! A pipeline is an ordered list of stages created once per channel at
//! channel-open time and never shared. Stage 0 sits next to the
//! application, the last stage next to the wire: outbound payloads run the
//! stages front to back, inbound bytes run back to front, each stage
//! buffering partial input independently.

pub mod raw;
pub mod textline;

use bytes::{Bytes, BytesMut};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::exchange::{DoneCallback, ExchangeRef, Payload};

pub use raw::RawCodec;
pub use textline::TextlineCodec;

/// One encode/decode stage of a channel pipeline.
pub trait Codec: Send {
    /// Transform one outbound payload into bytes for the next stage.
    fn encode(&mut self, payload: Payload, dst: &mut BytesMut) -> Result<(), TransportError>;

    /// Extract the next complete inbound frame, or `None` when more bytes
    /// are needed. Partial input stays in `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Payload>, TransportError>;
}

struct Slot {
    codec: Box<dyn Codec>,
    /// Inbound bytes handed down from the stage closer to the wire
    inbound: BytesMut,
}

/// Ordered codec chain owned by exactly one channel.
pub struct Pipeline {
    slots: Vec<Slot>,
}

impl Pipeline {
    /// Build a pipeline from application-most to wire-most stage.
    pub fn new(stages: Vec<Box<dyn Codec>>) -> Self {
        assert!(!stages.is_empty(), "a pipeline needs at least one stage");
        Self {
            slots: stages
                .into_iter()
                .map(|codec| Slot {
                    codec,
                    inbound: BytesMut::new(),
                })
                .collect(),
        }
    }

    pub fn single(codec: Box<dyn Codec>) -> Self {
        Self::new(vec![codec])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run an outbound payload through every stage and return the wire
    /// bytes.
    pub fn encode(&mut self, payload: Payload) -> Result<Bytes, TransportError> {
        let mut current = payload;
        for slot in &mut self.slots {
            let mut buf = BytesMut::new();
            slot.codec.encode(current, &mut buf)?;
            current = Payload::Bytes(buf.freeze());
        }
        Ok(current.to_bytes())
    }

    /// Feed wire bytes in and pull the next fully decoded payload out.
    ///
    /// Call repeatedly until `None`: one read may carry several frames, and
    /// every stage keeps its own partial-input buffer between calls.
    pub fn decode(&mut self, wire: &mut BytesMut) -> Result<Option<Payload>, TransportError> {
        let wire_most = self.slots.len() - 1;
        self.decode_at(wire_most, wire)
    }

    fn decode_at(
        &mut self,
        idx: usize,
        src: &mut BytesMut,
    ) -> Result<Option<Payload>, TransportError> {
        loop {
            let frame = match self.slots[idx].codec.decode(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            if idx == 0 {
                return Ok(Some(frame));
            }
            // hand the frame down to the stage nearer the application
            let bytes = frame.to_bytes();
            let mut inner = std::mem::take(&mut self.slots[idx - 1].inbound);
            inner.extend_from_slice(&bytes);
            let result = self.decode_at(idx - 1, &mut inner);
            self.slots[idx - 1].inbound = inner;
            if let Some(payload) = result? {
                return Ok(Some(payload));
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.slots.len())
            .finish()
    }
}

/// Builds pipelines for consumer-side channels.
pub trait ServerPipelineFactory: Send + Sync {
    fn pipeline(&self, config: &TransportConfig) -> Pipeline;
}

/// Builds pipelines for producer-side channels.
///
/// The owning exchange and its completion callback are explicit parameters
/// so custom stages can reach back into the exchange under construction;
/// there is no mutate-then-read-back step.
pub trait ClientPipelineFactory: Send + Sync {
    fn pipeline(
        &self,
        config: &TransportConfig,
        exchange: &ExchangeRef,
        done: &DoneCallback,
    ) -> Pipeline;
}

fn default_pipeline(config: &TransportConfig) -> Pipeline {
    if config.textline {
        Pipeline::single(Box::new(TextlineCodec::from_config(config)))
    } else {
        Pipeline::single(Box::new(RawCodec::new()))
    }
}

/// Pipeline for a new consumer channel: the user factory when configured,
/// the default chain otherwise.
pub fn server_pipeline(config: &TransportConfig) -> Pipeline {
    match &config.server_pipeline_factory {
        Some(factory) => factory.pipeline(config),
        None => default_pipeline(config),
    }
}

/// Pipeline for a new producer channel, bound to the exchange it serves.
pub fn client_pipeline(
    config: &TransportConfig,
    exchange: &ExchangeRef,
    done: &DoneCallback,
) -> Pipeline {
    match &config.client_pipeline_factory {
        Some(factory) => factory.pipeline(config, exchange, done),
        None => default_pipeline(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TextlineDelimiter;
    use crate::pipeline::textline::Charset;

    /// Reverses frame bytes; paired with itself it round-trips.
    struct ReverseCodec;

    impl Codec for ReverseCodec {
        fn encode(&mut self, payload: Payload, dst: &mut BytesMut) -> Result<(), TransportError> {
            let mut bytes = payload.to_bytes().to_vec();
            bytes.reverse();
            dst.extend_from_slice(&bytes);
            Ok(())
        }

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Payload>, TransportError> {
            if src.is_empty() {
                return Ok(None);
            }
            let mut bytes = src.split_to(src.len()).to_vec();
            bytes.reverse();
            Ok(Some(Payload::from(bytes)))
        }
    }

    #[test]
    fn single_stage_round_trip() {
        let mut pipeline = Pipeline::single(Box::new(RawCodec::new()));
        let wire = pipeline.encode(Payload::from("abc")).unwrap();

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = pipeline.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.to_bytes().as_ref(), b"abc");
        assert!(pipeline.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn stages_chain_in_order() {
        // application-most reverse stage under a wire-most textline framer
        let make = || {
            Pipeline::new(vec![
                Box::new(ReverseCodec) as Box<dyn Codec>,
                Box::new(TextlineCodec::new(TextlineDelimiter::Line, true, Charset::Utf8)),
            ])
        };

        let wire = make().encode(Payload::from("abc")).unwrap();
        assert_eq!(wire.as_ref(), b"cba\n");

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = make().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.to_bytes().as_ref(), b"abc");
    }

    #[test]
    fn decode_yields_every_buffered_frame() {
        let mut pipeline =
            Pipeline::single(Box::new(TextlineCodec::new(TextlineDelimiter::Line, true, Charset::Utf8)));
        let mut buf = BytesMut::from(&b"one\ntwo\nthr"[..]);

        assert_eq!(
            pipeline.decode(&mut buf).unwrap(),
            Some(Payload::from("one"))
        );
        assert_eq!(
            pipeline.decode(&mut buf).unwrap(),
            Some(Payload::from("two"))
        );
        assert_eq!(pipeline.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ee\n");
        assert_eq!(
            pipeline.decode(&mut buf).unwrap(),
            Some(Payload::from("three"))
        );
    }
}
