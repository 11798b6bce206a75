//! Binary request/response protocol spoken with acquisition clients.
//!
//! Every message is an 8-byte definition (`version: u16`, `command: u16`,
//! `bufsize: u32`) followed by `bufsize` payload bytes. Integers use the
//! sender's byte order, which the server detects from the version field and
//! mirrors in its reply.

use crate::data::codec::{
    decode_block, decode_events, decode_header, encode_block, encode_event, encode_header,
    Decoder, Encoder,
};
use crate::data::store::WaitThreshold;
use crate::data::types::{BufferCounts, ByteOrder, Event, Header, HeaderSnapshot, SampleBlock};
use crate::error::{AppResult, BufferError};
use std::ops::Range;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u16 = 1;

/// Size of the message definition preceding every payload.
pub const MESSAGE_DEF_SIZE: usize = 8;

/// Request commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestType {
    PutHeader = 0x101,
    PutData = 0x102,
    PutEvents = 0x103,
    GetHeader = 0x201,
    GetData = 0x202,
    GetEvents = 0x203,
    FlushHeader = 0x301,
    FlushData = 0x302,
    FlushEvents = 0x303,
    Wait = 0x402,
}

impl RequestType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x101 => Some(RequestType::PutHeader),
            0x102 => Some(RequestType::PutData),
            0x103 => Some(RequestType::PutEvents),
            0x201 => Some(RequestType::GetHeader),
            0x202 => Some(RequestType::GetData),
            0x203 => Some(RequestType::GetEvents),
            0x301 => Some(RequestType::FlushHeader),
            0x302 => Some(RequestType::FlushData),
            0x303 => Some(RequestType::FlushEvents),
            0x402 => Some(RequestType::Wait),
            _ => None,
        }
    }

    /// Status code of a successful reply to this request.
    pub fn ok_code(self) -> u16 {
        match self {
            RequestType::PutHeader | RequestType::PutData | RequestType::PutEvents => 0x104,
            RequestType::GetHeader | RequestType::GetData | RequestType::GetEvents => 0x204,
            RequestType::FlushHeader | RequestType::FlushData | RequestType::FlushEvents => 0x304,
            RequestType::Wait => 0x404,
        }
    }

    /// Status code of a failed reply to this request.
    pub fn err_code(self) -> u16 {
        self.ok_code() + 1
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    PutHeader(Header),
    PutData(SampleBlock),
    PutEvents(Vec<Event>),
    GetHeader,
    /// Half-open sample range; `None` asks for the resident window.
    GetData(Option<Range<u64>>),
    GetEvents(Option<Range<u64>>),
    FlushHeader,
    FlushData,
    FlushEvents,
    Wait(WaitThreshold),
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::PutHeader(_) => RequestType::PutHeader,
            Request::PutData(_) => RequestType::PutData,
            Request::PutEvents(_) => RequestType::PutEvents,
            Request::GetHeader => RequestType::GetHeader,
            Request::GetData(_) => RequestType::GetData,
            Request::GetEvents(_) => RequestType::GetEvents,
            Request::FlushHeader => RequestType::FlushHeader,
            Request::FlushData => RequestType::FlushData,
            Request::FlushEvents => RequestType::FlushEvents,
            Request::Wait(_) => RequestType::Wait,
        }
    }

    /// Decodes the payload of a `kind` request sent in `order`.
    pub fn decode(kind: RequestType, order: ByteOrder, payload: &[u8]) -> AppResult<Self> {
        let mut dec = Decoder::new(payload, order);
        let request = match kind {
            RequestType::PutHeader => Request::PutHeader(decode_header(&mut dec)?.0),
            RequestType::PutData => Request::PutData(decode_block(&mut dec)?),
            RequestType::PutEvents => Request::PutEvents(decode_events(&mut dec)?),
            RequestType::GetHeader => Request::GetHeader,
            RequestType::GetData => Request::GetData(decode_selection(&mut dec)?),
            RequestType::GetEvents => Request::GetEvents(decode_selection(&mut dec)?),
            RequestType::FlushHeader => Request::FlushHeader,
            RequestType::FlushData => Request::FlushData,
            RequestType::FlushEvents => Request::FlushEvents,
            RequestType::Wait => {
                let samples = dec.u32("wait nsamples")?;
                let events = dec.u32("wait nevents")?;
                let millis = dec.u32("wait milliseconds")?;
                Request::Wait(WaitThreshold {
                    samples: u64::from(samples),
                    events: u64::from(events),
                    timeout: Duration::from_millis(u64::from(millis)),
                })
            }
        };
        Ok(request)
    }

    /// Encodes the complete message, definition included.
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut body = Encoder::new(order);
        match self {
            Request::PutHeader(header) => encode_header(&mut body, header, BufferCounts::default()),
            Request::PutData(block) => encode_block(&mut body, block),
            Request::PutEvents(events) => {
                for event in events {
                    encode_event(&mut body, event);
                }
            }
            Request::GetData(Some(range)) | Request::GetEvents(Some(range)) => {
                encode_selection(&mut body, range);
            }
            Request::Wait(threshold) => {
                body.u32(clamp_u32(threshold.samples))
                    .u32(clamp_u32(threshold.events))
                    .u32(clamp_u32(threshold.timeout.as_millis() as u64));
            }
            _ => {}
        }
        frame(order, self.request_type() as u16, body.finish())
    }
}

/// A reply to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Totals after a put; a header put reports zeros.
    PutOk(BufferCounts),
    Header(HeaderSnapshot),
    Data(SampleBlock),
    Events(Vec<Event>),
    FlushOk,
    WaitOk(BufferCounts),
    /// Failure reply for a request of the given type.
    Error(RequestType),
}

impl Response {
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut body = Encoder::new(order);
        let code = match self {
            Response::PutOk(counts) => {
                encode_counts(&mut body, *counts);
                RequestType::PutData.ok_code()
            }
            Response::Header(snapshot) => {
                encode_header(&mut body, &snapshot.header, snapshot.counts);
                RequestType::GetHeader.ok_code()
            }
            Response::Data(block) => {
                encode_block(&mut body, block);
                RequestType::GetData.ok_code()
            }
            Response::Events(events) => {
                for event in events {
                    encode_event(&mut body, event);
                }
                RequestType::GetEvents.ok_code()
            }
            Response::FlushOk => RequestType::FlushHeader.ok_code(),
            Response::WaitOk(counts) => {
                encode_counts(&mut body, *counts);
                RequestType::Wait.ok_code()
            }
            Response::Error(kind) => kind.err_code(),
        };
        frame(order, code, body.finish())
    }

    /// Decodes the reply to a `kind` request.
    pub fn decode(kind: RequestType, code: u16, order: ByteOrder, payload: &[u8]) -> AppResult<Self> {
        if code == kind.err_code() {
            return Ok(Response::Error(kind));
        }
        if code != kind.ok_code() {
            return Err(BufferError::Protocol(format!(
                "unexpected reply 0x{code:03x} to {kind:?}"
            )));
        }
        let mut dec = Decoder::new(payload, order);
        let response = match kind {
            RequestType::PutHeader | RequestType::PutData | RequestType::PutEvents => {
                Response::PutOk(decode_counts(&mut dec)?)
            }
            RequestType::GetHeader => {
                let (header, counts) = decode_header(&mut dec)?;
                Response::Header(HeaderSnapshot { header, counts })
            }
            RequestType::GetData => Response::Data(decode_block(&mut dec)?),
            RequestType::GetEvents => Response::Events(decode_events(&mut dec)?),
            RequestType::FlushHeader | RequestType::FlushData | RequestType::FlushEvents => {
                Response::FlushOk
            }
            RequestType::Wait => Response::WaitOk(decode_counts(&mut dec)?),
        };
        Ok(response)
    }
}

/// Message definition of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDef {
    pub order: ByteOrder,
    pub command: u16,
    pub bufsize: u32,
}

impl MessageDef {
    /// Parses a definition, detecting the sender's byte order from the version.
    pub fn parse(raw: [u8; MESSAGE_DEF_SIZE]) -> AppResult<Self> {
        let order = if u16::from_le_bytes([raw[0], raw[1]]) == VERSION {
            ByteOrder::Little
        } else if u16::from_be_bytes([raw[0], raw[1]]) == VERSION {
            ByteOrder::Big
        } else {
            return Err(BufferError::Protocol(format!(
                "unsupported protocol version bytes {:02x}{:02x}",
                raw[0], raw[1]
            )));
        };
        let (command, bufsize) = match order {
            ByteOrder::Little => (
                u16::from_le_bytes([raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ),
            ByteOrder::Big => (
                u16::from_be_bytes([raw[2], raw[3]]),
                u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ),
        };
        Ok(Self {
            order,
            command,
            bufsize,
        })
    }
}

/// A complete frame read from a socket.
#[derive(Debug)]
pub struct Frame {
    pub def: MessageDef,
    pub payload: Vec<u8>,
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the connection
/// before sending a definition.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> AppResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; MESSAGE_DEF_SIZE];
    let mut filled = 0;
    while filled < MESSAGE_DEF_SIZE {
        match reader.read(&mut raw[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(BufferError::Protocol(format!(
                    "connection closed after {filled} of {MESSAGE_DEF_SIZE} definition bytes"
                )))
            }
            n => filled += n,
        }
    }
    let def = MessageDef::parse(raw)?;
    let size = def.bufsize as usize;
    if size > max_payload {
        return Err(BufferError::Protocol(format!(
            "payload of {size} bytes exceeds limit of {max_payload}"
        )));
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { def, payload }))
}

pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}

fn frame(order: ByteOrder, command: u16, body: Vec<u8>) -> Vec<u8> {
    let mut enc = Encoder::new(order);
    enc.u16(VERSION).u16(command).u32(body.len() as u32).bytes(&body);
    enc.finish()
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn encode_counts(enc: &mut Encoder, counts: BufferCounts) {
    enc.u32(clamp_u32(counts.samples)).u32(clamp_u32(counts.events));
}

fn decode_counts(dec: &mut Decoder<'_>) -> AppResult<BufferCounts> {
    let samples = dec.u32("nsamples")?;
    let events = dec.u32("nevents")?;
    Ok(BufferCounts::new(u64::from(samples), u64::from(events)))
}

/// Wire selections are inclusive `begin..=end`; the store uses half-open ranges.
fn decode_selection(dec: &mut Decoder<'_>) -> AppResult<Option<Range<u64>>> {
    if dec.remaining() == 0 {
        return Ok(None);
    }
    let begin = u64::from(dec.u32("selection begin")?);
    let end = u64::from(dec.u32("selection end")?);
    Ok(Some(begin..end + 1))
}

fn encode_selection(enc: &mut Encoder, range: &Range<u64>) {
    enc.u32(clamp_u32(range.start))
        .u32(clamp_u32(range.end.saturating_sub(1)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::DataType;

    fn split(message: &[u8]) -> (MessageDef, &[u8]) {
        let mut raw = [0u8; MESSAGE_DEF_SIZE];
        raw.copy_from_slice(&message[..MESSAGE_DEF_SIZE]);
        (MessageDef::parse(raw).unwrap(), &message[MESSAGE_DEF_SIZE..])
    }

    #[test]
    fn byte_order_is_detected_from_version() {
        let little = Request::FlushData.encode(ByteOrder::Little);
        let big = Request::FlushData.encode(ByteOrder::Big);
        assert_eq!(&little[..4], &[1, 0, 0x02, 0x03]);
        assert_eq!(&big[..4], &[0, 1, 0x03, 0x02]);
        assert_eq!(split(&little).0.order, ByteOrder::Little);
        assert_eq!(split(&big).0.order, ByteOrder::Big);
    }

    #[test]
    fn bad_version_is_rejected() {
        let err = MessageDef::parse([7, 7, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, BufferError::Protocol(_)));
    }

    #[test]
    fn data_selection_is_inclusive_on_the_wire() {
        let message = Request::GetData(Some(2..7)).encode(ByteOrder::Big);
        let (def, payload) = split(&message);
        assert_eq!(payload, &[0, 0, 0, 2, 0, 0, 0, 6]);

        let kind = RequestType::from_u16(def.command).unwrap();
        let decoded = Request::decode(kind, def.order, payload).unwrap();
        assert_eq!(decoded, Request::GetData(Some(2..7)));
    }

    #[test]
    fn empty_selection_means_whole_window() {
        let decoded = Request::decode(RequestType::GetEvents, ByteOrder::Little, &[]).unwrap();
        assert_eq!(decoded, Request::GetEvents(None));
    }

    #[test]
    fn wait_request_carries_threshold() {
        let threshold = WaitThreshold {
            samples: 10,
            events: u64::from(u32::MAX),
            timeout: Duration::from_millis(250),
        };
        let message = Request::Wait(threshold).encode(ByteOrder::Little);
        let (def, payload) = split(&message);
        assert_eq!(def.command, 0x402);
        let decoded = Request::decode(RequestType::Wait, def.order, payload).unwrap();
        assert_eq!(decoded, Request::Wait(threshold));
    }

    #[test]
    fn error_reply_uses_request_category() {
        let message = Response::Error(RequestType::GetData).encode(ByteOrder::Little);
        let (def, payload) = split(&message);
        assert_eq!(def.command, 0x205);
        assert!(payload.is_empty());

        let decoded =
            Response::decode(RequestType::GetData, def.command, def.order, payload).unwrap();
        assert_eq!(decoded, Response::Error(RequestType::GetData));
    }

    #[test]
    fn header_reply_reports_running_totals() {
        let snapshot = HeaderSnapshot {
            header: Header::new(4, 512.0, DataType::Float64, ByteOrder::Big),
            counts: BufferCounts::new(1024, 3),
        };
        let message = Response::Header(snapshot.clone()).encode(ByteOrder::Big);
        let (def, payload) = split(&message);
        let decoded =
            Response::decode(RequestType::GetHeader, def.command, def.order, payload).unwrap();
        assert_eq!(decoded, Response::Header(snapshot));
    }

    #[tokio::test]
    async fn read_frame_distinguishes_clean_close_from_oversize() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 1024).await.unwrap().is_none());

        let message = Request::PutData(SampleBlock::from_f32(1, &[0.0; 64])).encode(ByteOrder::native());
        let mut reader: &[u8] = &message;
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, BufferError::Protocol(_)));

        let mut reader: &[u8] = &message;
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(frame.def.command, RequestType::PutData as u16);
        assert_eq!(frame.payload.len(), message.len() - MESSAGE_DEF_SIZE);
    }

    #[tokio::test]
    async fn truncated_definition_is_a_protocol_error() {
        let message = Request::FlushData.encode(ByteOrder::native());
        let mut reader: &[u8] = &message[..3];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, BufferError::Protocol(_)));
    }

    #[tokio::test]
    async fn definition_split_across_reads_is_reassembled() {
        let message = Request::FlushData.encode(ByteOrder::Big);
        let mut reader = tokio_test::io::Builder::new()
            .read(&message[..3])
            .read(&message[3..])
            .build();
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(frame.def.command, RequestType::FlushData as u16);
        assert_eq!(frame.def.order, ByteOrder::Big);
    }
}
