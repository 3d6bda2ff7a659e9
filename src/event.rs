//! Events sent to the consumer and their wire encoding.
//!
//! Every record starts with a `{type: u32, length: u32}` header, where
//! `length` covers the whole record including the header, so a consumer can
//! frame messages without any other metadata. All integers are
//! little-endian.

use crate::error::{RelayError, RelayResult};
use crate::framework::SurfaceId;
use crate::region::{ClipRect, DirtyFlags};

pub const HEADER_LEN: usize = 8;
const SURFACE_EVENT_LEN: usize = HEADER_LEN + 4;
const DIRTY_FIXED_LEN: usize = HEADER_LEN + 16;
const CLIP_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EventType {
    PipeEnable = 1,
    PipeDisable = 2,
    SurfaceCreated = 3,
    SurfaceDestroyed = 4,
    SurfaceDirty = 5,
}

impl TryFrom<u32> for EventType {
    type Error = RelayError;

    fn try_from(raw: u32) -> RelayResult<Self> {
        match raw {
            1 => Ok(Self::PipeEnable),
            2 => Ok(Self::PipeDisable),
            3 => Ok(Self::SurfaceCreated),
            4 => Ok(Self::SurfaceDestroyed),
            5 => Ok(Self::SurfaceDirty),
            other => Err(RelayError::InvalidArgument(format!(
                "unknown event type {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    PipeEnable,
    PipeDisable,
    SurfaceCreated {
        id: SurfaceId,
    },
    SurfaceDestroyed {
        id: SurfaceId,
    },
    SurfaceDirty {
        id: SurfaceId,
        flags: DirtyFlags,
        color: u32,
        clips: Vec<ClipRect>,
    },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PipeEnable => EventType::PipeEnable,
            Self::PipeDisable => EventType::PipeDisable,
            Self::SurfaceCreated { .. } => EventType::SurfaceCreated,
            Self::SurfaceDestroyed { .. } => EventType::SurfaceDestroyed,
            Self::SurfaceDirty { .. } => EventType::SurfaceDirty,
        }
    }

    /// Size of the encoded record in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::PipeEnable | Self::PipeDisable => HEADER_LEN,
            Self::SurfaceCreated { .. } | Self::SurfaceDestroyed { .. } => SURFACE_EVENT_LEN,
            Self::SurfaceDirty { clips, .. } => DIRTY_FIXED_LEN + clips.len() * CLIP_LEN,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let length = u32::try_from(self.encoded_len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&(self.event_type() as u32).to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        match self {
            Self::PipeEnable | Self::PipeDisable => {}
            Self::SurfaceCreated { id } | Self::SurfaceDestroyed { id } => {
                out.extend_from_slice(&id.0.to_le_bytes());
            }
            Self::SurfaceDirty {
                id,
                flags,
                color,
                clips,
            } => {
                let num_clips = u32::try_from(clips.len()).unwrap_or(u32::MAX);
                out.extend_from_slice(&id.0.to_le_bytes());
                out.extend_from_slice(&flags.bits().to_le_bytes());
                out.extend_from_slice(&color.to_le_bytes());
                out.extend_from_slice(&num_clips.to_le_bytes());
                for clip in clips {
                    for coordinate in [clip.x1, clip.y1, clip.x2, clip.y2] {
                        out.extend_from_slice(&coordinate.to_le_bytes());
                    }
                }
            }
        }
    }

    /// Decode exactly one record. Truncated input, trailing bytes and a
    /// header length that disagrees with the payload are all rejected.
    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let mut reader = Reader { bytes, offset: 0 };
        let event_type = EventType::try_from(reader.u32()?)?;
        let length = reader.u32()? as usize;
        if length != bytes.len() {
            return Err(RelayError::InvalidArgument(format!(
                "record length {length} does not match {} bytes",
                bytes.len()
            )));
        }

        let event = match event_type {
            EventType::PipeEnable => Self::PipeEnable,
            EventType::PipeDisable => Self::PipeDisable,
            EventType::SurfaceCreated => Self::SurfaceCreated {
                id: SurfaceId(reader.u32()?),
            },
            EventType::SurfaceDestroyed => Self::SurfaceDestroyed {
                id: SurfaceId(reader.u32()?),
            },
            EventType::SurfaceDirty => {
                let id = SurfaceId(reader.u32()?);
                let flags = DirtyFlags::from_bits_retain(reader.u32()?);
                let color = reader.u32()?;
                let num_clips = reader.u32()? as usize;
                if num_clips > (bytes.len() - reader.offset) / CLIP_LEN {
                    return Err(RelayError::InvalidArgument(format!(
                        "record announces {num_clips} clips but is {} bytes",
                        bytes.len()
                    )));
                }
                let mut clips = Vec::with_capacity(num_clips);
                for _ in 0..num_clips {
                    clips.push(ClipRect::new(
                        reader.u16()?,
                        reader.u16()?,
                        reader.u16()?,
                        reader.u16()?,
                    ));
                }
                Self::SurfaceDirty {
                    id,
                    flags,
                    color,
                    clips,
                }
            }
        };

        if reader.offset != bytes.len() {
            return Err(RelayError::InvalidArgument(format!(
                "{} trailing bytes after {:?} record",
                bytes.len() - reader.offset,
                event_type
            )));
        }
        Ok(event)
    }

    /// Total record length announced by the header at the start of `bytes`.
    pub fn peek_len(bytes: &[u8]) -> Option<usize> {
        let raw: [u8; 4] = bytes.get(4..HEADER_LEN)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw) as usize)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> RelayResult<[u8; N]> {
        let chunk = self
            .bytes
            .get(self.offset..self.offset + N)
            .and_then(|slice| <[u8; N]>::try_from(slice).ok())
            .ok_or_else(|| {
                RelayError::InvalidArgument(format!(
                    "record truncated at byte {} of {}",
                    self.offset,
                    self.bytes.len()
                ))
            })?;
        self.offset += N;
        Ok(chunk)
    }

    fn u32(&mut self) -> RelayResult<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u16(&mut self) -> RelayResult<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }
}
