//! Stream format and payload types held by the buffer.

use crate::error::{AppResult, BufferError};
use serde::{Deserialize, Serialize};

/// Numeric element kinds understood by the buffer.
///
/// The discriminants are the wire codes used by acquisition clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DataType {
    /// Single byte characters; only valid inside event type/value fields.
    Char = 0,
    Uint8 = 1,
    Uint16 = 2,
    Uint32 = 3,
    Uint64 = 4,
    Int8 = 5,
    Int16 = 6,
    Int32 = 7,
    Int64 = 8,
    Float32 = 9,
    Float64 = 10,
}

impl DataType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(DataType::Char),
            1 => Some(DataType::Uint8),
            2 => Some(DataType::Uint16),
            3 => Some(DataType::Uint32),
            4 => Some(DataType::Uint64),
            5 => Some(DataType::Int8),
            6 => Some(DataType::Int16),
            7 => Some(DataType::Int32),
            8 => Some(DataType::Int64),
            9 => Some(DataType::Float32),
            10 => Some(DataType::Float64),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Char | DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Uint64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }

    /// Whether the type may describe sample data (everything except `Char`).
    pub fn is_numeric(self) -> bool {
        self != DataType::Char
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DataType::Char => "char",
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Single byte tag used in persisted files.
    pub fn marker(self) -> u8 {
        match self {
            ByteOrder::Little => b'L',
            ByteOrder::Big => b'B',
        }
    }

    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'L' => Some(ByteOrder::Little),
            b'B' => Some(ByteOrder::Big),
            _ => None,
        }
    }
}

/// Reverses every `width`-byte element of `bytes` in place.
pub fn swap_elements(bytes: &mut [u8], width: usize) {
    if width > 1 {
        for element in bytes.chunks_exact_mut(width) {
            element.reverse();
        }
    }
}

/// Stream format descriptor.
///
/// A header is replaced wholesale; the store never mutates one in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub nchans: u32,
    pub fsample: f32,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    /// Opaque extended header chunks (channel names, resolutions, ...).
    pub chunks: Vec<u8>,
}

impl Header {
    pub fn new(nchans: u32, fsample: f32, data_type: DataType, byte_order: ByteOrder) -> Self {
        Self {
            nchans,
            fsample,
            data_type,
            byte_order,
            chunks: Vec::new(),
        }
    }

    pub fn with_chunks(mut self, chunks: Vec<u8>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.nchans == 0 {
            return Err(BufferError::InvalidHeader(
                "channel count must be positive".into(),
            ));
        }
        if !(self.fsample.is_finite() && self.fsample > 0.0) {
            return Err(BufferError::InvalidHeader(format!(
                "sample rate must be positive, got {}",
                self.fsample
            )));
        }
        if !self.data_type.is_numeric() {
            return Err(BufferError::InvalidHeader(format!(
                "{} is not a sample data type",
                self.data_type
            )));
        }
        if self.checked_sample_bytes().is_none() {
            return Err(BufferError::InvalidHeader(format!(
                "{} channels of {} do not fit in memory",
                self.nchans, self.data_type
            )));
        }
        Ok(())
    }

    /// Bytes occupied by one multi-channel sample.
    ///
    /// Saturates for headers that [`validate`](Self::validate) would reject.
    pub fn sample_bytes(&self) -> usize {
        self.checked_sample_bytes().unwrap_or(usize::MAX)
    }

    fn checked_sample_bytes(&self) -> Option<usize> {
        usize::try_from(self.nchans)
            .ok()?
            .checked_mul(self.data_type.size())
    }
}

/// Current header together with the running sample and event totals.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderSnapshot {
    pub header: Header,
    pub counts: BufferCounts,
}

/// Total samples and events appended since the last header or flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCounts {
    pub samples: u64,
    pub events: u64,
}

impl BufferCounts {
    pub fn new(samples: u64, events: u64) -> Self {
        Self { samples, events }
    }
}

/// One or more consecutive multi-channel samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub nchans: u32,
    pub nsamples: u32,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    pub data: Vec<u8>,
}

impl SampleBlock {
    pub fn new(
        nchans: u32,
        nsamples: u32,
        data_type: DataType,
        byte_order: ByteOrder,
        data: Vec<u8>,
    ) -> Self {
        Self {
            nchans,
            nsamples,
            data_type,
            byte_order,
            data,
        }
    }

    /// Builds a native-order `float32` block from row-major samples.
    pub fn from_f32(nchans: u32, samples: &[f32]) -> Self {
        let data = samples.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let nsamples = (samples.len() / nchans.max(1) as usize) as u32;
        Self::new(nchans, nsamples, DataType::Float32, ByteOrder::native(), data)
    }

    /// Checks the block against the current header.
    pub fn check_shape(&self, header: &Header) -> AppResult<()> {
        if self.nchans != header.nchans {
            return Err(BufferError::ShapeMismatch(format!(
                "block has {} channels, header has {}",
                self.nchans, header.nchans
            )));
        }
        if self.data_type != header.data_type {
            return Err(BufferError::ShapeMismatch(format!(
                "block is {}, header is {}",
                self.data_type, header.data_type
            )));
        }
        let expected = usize::try_from(self.nsamples)
            .ok()
            .and_then(|n| n.checked_mul(header.sample_bytes()))
            .ok_or_else(|| {
                BufferError::ShapeMismatch(format!(
                    "{} samples of {} channels exceed the addressable size",
                    self.nsamples, self.nchans
                ))
            })?;
        if self.data.len() != expected {
            return Err(BufferError::ShapeMismatch(format!(
                "{} samples need {} bytes, block carries {}",
                self.nsamples,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Re-encodes the payload in `order`.
    pub fn into_order(mut self, order: ByteOrder) -> Self {
        if self.byte_order != order {
            swap_elements(&mut self.data, self.data_type.size());
            self.byte_order = order;
        }
        self
    }

    /// Decodes the payload as native `f32` values, if the block is `float32`.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.data_type != DataType::Float32 {
            return None;
        }
        let native = self.clone().into_order(ByteOrder::native());
        Some(
            native
                .data
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// Typed array carried in an event's type or value slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EventField {
    pub data_type: DataType,
    pub numel: u32,
    pub bytes: Vec<u8>,
}

impl EventField {
    pub fn text(text: &str) -> Self {
        Self {
            data_type: DataType::Char,
            numel: text.len() as u32,
            bytes: text.as_bytes().to_vec(),
        }
    }

    pub fn empty() -> Self {
        Self::text("")
    }

    pub fn as_text(&self) -> Option<String> {
        (self.data_type == DataType::Char).then(|| String::from_utf8_lossy(&self.bytes).into_owned())
    }

    fn validate(&self, slot: &str) -> AppResult<()> {
        let expected = self.numel as usize * self.data_type.size();
        if self.bytes.len() != expected {
            return Err(BufferError::InvalidEvent(format!(
                "{slot} declares {} x {} but carries {} bytes",
                self.numel,
                self.data_type,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

/// A discrete marker anchored to a sample index.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventField,
    pub value: EventField,
    pub sample: i32,
    pub offset: i32,
    /// Duration in samples; zero when the event is instantaneous.
    pub duration: i32,
    pub byte_order: ByteOrder,
}

impl Event {
    pub fn new(event_type: &str, value: &str, sample: i32) -> Self {
        Self {
            event_type: EventField::text(event_type),
            value: EventField::text(value),
            sample,
            offset: 0,
            duration: 0,
            byte_order: ByteOrder::native(),
        }
    }

    pub fn with_duration(mut self, duration: i32) -> Self {
        self.duration = duration;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.sample < 0 {
            return Err(BufferError::InvalidEvent(format!(
                "anchoring sample {} is negative",
                self.sample
            )));
        }
        self.event_type.validate("type")?;
        self.value.validate("value")
    }

    pub fn into_order(mut self, order: ByteOrder) -> Self {
        if self.byte_order != order {
            swap_elements(&mut self.event_type.bytes, self.event_type.data_type.size());
            swap_elements(&mut self.value.bytes, self.value.data_type.size());
            self.byte_order = order;
        }
        self
    }
}
