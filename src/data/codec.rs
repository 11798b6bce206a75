//! Byte-order aware encoding of headers, sample blocks and events.
//!
//! These layouts are shared by the network protocol and the on-disk journal
//! of the saving store, so a record written to disk is byte-for-byte the
//! record a client would receive.

use crate::data::types::{
    BufferCounts, ByteOrder, DataType, Event, EventField, Header, SampleBlock,
};
use crate::error::{AppResult, BufferError};
use bytes::{Buf, BufMut};

/// Size of a fixed header definition (before the chunk payload).
pub const HEADER_DEF_SIZE: usize = 24;
/// Size of a fixed data definition (before the sample payload).
pub const DATA_DEF_SIZE: usize = 16;
/// Size of a fixed event definition (before the type and value payload).
pub const EVENT_DEF_SIZE: usize = 32;

/// Appends integers in a fixed byte order.
pub struct Encoder {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Encoder {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.buf.put_u16_le(value),
            ByteOrder::Big => self.buf.put_u16(value),
        }
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.buf.put_u32_le(value),
            ByteOrder::Big => self.buf.put_u32(value),
        }
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.buf.put_i32_le(value),
            ByteOrder::Big => self.buf.put_i32(value),
        }
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.buf.put_f32_le(value),
            ByteOrder::Big => self.buf.put_f32(value),
        }
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads integers in a fixed byte order, failing on truncated input.
pub struct Decoder<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, order }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> AppResult<()> {
        if self.buf.remaining() < n {
            return Err(BufferError::Protocol(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u32(&mut self, what: &str) -> AppResult<u32> {
        self.need(4, what)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u32_le(),
            ByteOrder::Big => self.buf.get_u32(),
        })
    }

    pub fn i32(&mut self, what: &str) -> AppResult<i32> {
        self.need(4, what)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_i32_le(),
            ByteOrder::Big => self.buf.get_i32(),
        })
    }

    pub fn f32(&mut self, what: &str) -> AppResult<f32> {
        self.need(4, what)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_f32_le(),
            ByteOrder::Big => self.buf.get_f32(),
        })
    }

    pub fn bytes(&mut self, n: usize, what: &str) -> AppResult<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

pub fn encode_header(enc: &mut Encoder, header: &Header, counts: BufferCounts) {
    enc.u32(header.nchans)
        .u32(counts.samples as u32)
        .u32(counts.events as u32)
        .f32(header.fsample)
        .u32(header.data_type.code())
        .u32(header.chunks.len() as u32)
        .bytes(&header.chunks);
}

/// Decodes a header definition written in `dec`'s byte order.
///
/// Unknown data type codes are reported as `InvalidHeader` so the client gets
/// an error response instead of losing its connection.
pub fn decode_header(dec: &mut Decoder<'_>) -> AppResult<(Header, BufferCounts)> {
    let nchans = dec.u32("header nchans")?;
    let nsamples = dec.u32("header nsamples")?;
    let nevents = dec.u32("header nevents")?;
    let fsample = dec.f32("header fsample")?;
    let code = dec.u32("header data_type")?;
    let bufsize = dec.u32("header bufsize")? as usize;
    let chunks = dec.bytes(bufsize, "header chunks")?.to_vec();
    let data_type = DataType::from_code(code)
        .ok_or_else(|| BufferError::InvalidHeader(format!("unknown data type code {code}")))?;
    let header = Header::new(nchans, fsample, data_type, dec.order).with_chunks(chunks);
    Ok((
        header,
        BufferCounts::new(u64::from(nsamples), u64::from(nevents)),
    ))
}

/// Encodes `block` in the encoder's byte order, swapping the payload if needed.
pub fn encode_block(enc: &mut Encoder, block: &SampleBlock) {
    let block = block.clone().into_order(enc.order);
    enc.u32(block.nchans)
        .u32(block.nsamples)
        .u32(block.data_type.code())
        .u32(block.data.len() as u32)
        .bytes(&block.data);
}

pub fn decode_block(dec: &mut Decoder<'_>) -> AppResult<SampleBlock> {
    let nchans = dec.u32("data nchans")?;
    let nsamples = dec.u32("data nsamples")?;
    let code = dec.u32("data data_type")?;
    let bufsize = dec.u32("data bufsize")? as usize;
    let data = dec.bytes(bufsize, "sample data")?.to_vec();
    let data_type = DataType::from_code(code)
        .ok_or_else(|| BufferError::ShapeMismatch(format!("unknown data type code {code}")))?;
    Ok(SampleBlock::new(nchans, nsamples, data_type, dec.order, data))
}

pub fn encode_event(enc: &mut Encoder, event: &Event) {
    let event = event.clone().into_order(enc.order);
    let bufsize = event.event_type.bytes.len() + event.value.bytes.len();
    enc.u32(event.event_type.data_type.code())
        .u32(event.event_type.numel)
        .u32(event.value.data_type.code())
        .u32(event.value.numel)
        .i32(event.sample)
        .i32(event.offset)
        .i32(event.duration)
        .u32(bufsize as u32)
        .bytes(&event.event_type.bytes)
        .bytes(&event.value.bytes);
}

/// Decodes one event definition.
///
/// The whole record is consumed before any content check, so a malformed
/// event never desynchronises the events that follow it.
pub fn decode_event(dec: &mut Decoder<'_>) -> AppResult<Event> {
    let type_code = dec.u32("event type_type")?;
    let type_numel = dec.u32("event type_numel")?;
    let value_code = dec.u32("event value_type")?;
    let value_numel = dec.u32("event value_numel")?;
    let sample = dec.i32("event sample")?;
    let offset = dec.i32("event offset")?;
    let duration = dec.i32("event duration")?;
    let bufsize = dec.u32("event bufsize")? as usize;
    let payload = dec.bytes(bufsize, "event payload")?;

    let type_type = DataType::from_code(type_code)
        .ok_or_else(|| BufferError::InvalidEvent(format!("unknown type code {type_code}")))?;
    let value_type = DataType::from_code(value_code)
        .ok_or_else(|| BufferError::InvalidEvent(format!("unknown value code {value_code}")))?;
    let type_len = type_numel as usize * type_type.size();
    let value_len = value_numel as usize * value_type.size();
    if type_len + value_len > payload.len() {
        return Err(BufferError::InvalidEvent(format!(
            "type and value need {} bytes, event carries {}",
            type_len + value_len,
            payload.len()
        )));
    }

    Ok(Event {
        event_type: EventField {
            data_type: type_type,
            numel: type_numel,
            bytes: payload[..type_len].to_vec(),
        },
        value: EventField {
            data_type: value_type,
            numel: value_numel,
            bytes: payload[type_len..type_len + value_len].to_vec(),
        },
        sample,
        offset,
        duration,
        byte_order: dec.order,
    })
}

/// Decodes events until the input is exhausted.
pub fn decode_events(dec: &mut Decoder<'_>) -> AppResult<Vec<Event>> {
    let mut events = Vec::new();
    while dec.remaining() > 0 {
        events.push(decode_event(dec)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_matches_wire_definition() {
        let header = Header::new(3, 250.0, DataType::Int16, ByteOrder::Big)
            .with_chunks(vec![9, 9]);
        let mut enc = Encoder::new(ByteOrder::Big);
        encode_header(&mut enc, &header, BufferCounts::new(5, 1));
        let bytes = enc.finish();

        assert_eq!(bytes.len(), HEADER_DEF_SIZE + 2);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 3]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 5]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 6]);

        let (decoded, counts) = decode_header(&mut Decoder::new(&bytes, ByteOrder::Big)).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(counts, BufferCounts::new(5, 1));
    }

    #[test]
    fn unknown_header_type_is_a_store_error() {
        let mut enc = Encoder::new(ByteOrder::Little);
        enc.u32(1).u32(0).u32(0).f32(10.0).u32(42).u32(0);
        let bytes = enc.finish();
        let err = decode_header(&mut Decoder::new(&bytes, ByteOrder::Little)).unwrap_err();
        assert!(matches!(err, BufferError::InvalidHeader(_)));
    }

    #[test]
    fn truncated_block_is_a_protocol_error() {
        let mut enc = Encoder::new(ByteOrder::Little);
        enc.u32(1).u32(4).u32(DataType::Float32.code()).u32(16).bytes(&[0; 8]);
        let bytes = enc.finish();
        let err = decode_block(&mut Decoder::new(&bytes, ByteOrder::Little)).unwrap_err();
        assert!(matches!(err, BufferError::Protocol(_)));
    }

    #[test]
    fn block_is_swapped_into_encoder_order() {
        let block = SampleBlock::new(1, 1, DataType::Int32, ByteOrder::Little, vec![1, 0, 0, 0]);
        let mut enc = Encoder::new(ByteOrder::Big);
        encode_block(&mut enc, &block);
        let bytes = enc.finish();
        assert_eq!(&bytes[DATA_DEF_SIZE..], &[0, 0, 0, 1]);
    }

    #[test]
    fn consecutive_events_decode_in_order() {
        let mut enc = Encoder::new(ByteOrder::Little);
        encode_event(&mut enc, &Event::new("button", "up", 3).into_order(ByteOrder::Little));
        encode_event(&mut enc, &Event::new("button", "down", 7).into_order(ByteOrder::Little));
        let bytes = enc.finish();

        let events = decode_events(&mut Decoder::new(&bytes, ByteOrder::Little)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].value.as_text().as_deref(), Some("up"));
        assert_eq!(events[1].sample, 7);
    }

    #[test]
    fn event_with_short_payload_is_rejected_after_consuming_it() {
        let mut enc = Encoder::new(ByteOrder::Little);
        enc.u32(0).u32(10).u32(0).u32(0).i32(0).i32(0).i32(0).u32(2).bytes(b"ab");
        encode_event(&mut enc, &Event::new("ok", "ok", 1).into_order(ByteOrder::Little));
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes, ByteOrder::Little);
        assert!(matches!(decode_event(&mut dec), Err(BufferError::InvalidEvent(_))));
        assert_eq!(decode_event(&mut dec).unwrap().sample, 1);
    }
}
