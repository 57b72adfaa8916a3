use crate::{error::H2Error, flags::*, settings, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use num_traits::{FromPrimitive, ToPrimitive};

/// Dependency information from a PRIORITY frame or a HEADERS frame with the
/// PRIORITY flag. Stored on the stream, never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// One HTTP/2 frame with its payload already in typed form. Padding has been
/// stripped by the codec; fragments are raw HPACK bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
        /// Pad length octet when the frame arrived PADDED. Flow control
        /// charges padding too, so the stripped bytes must stay accounted.
        pad_len: Option<u8>,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    /// `stream` 0 targets the session window.
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Data { .. } => FrameType::Data,
            Self::Headers { .. } => FrameType::Headers,
            Self::Priority { .. } => FrameType::Priority,
            Self::ResetStream { .. } => FrameType::ResetStream,
            Self::Settings { .. } => FrameType::Settings,
            Self::PushPromise { .. } => FrameType::PushPromise,
            Self::Ping { .. } => FrameType::Ping,
            Self::GoAway { .. } => FrameType::GoAway,
            Self::WindowUpdate { .. } => FrameType::WindowUpdate,
            Self::Continuation { .. } => FrameType::Continuation,
        }
    }

    /// Bytes this frame charges against flow-control windows: the declared
    /// DATA payload length, padding included. Zero for every other type.
    pub fn flow_len(&self) -> usize {
        match self {
            Self::Data { data, pad_len, .. } => {
                data.len() + pad_len.map_or(0, |pad| 1 + pad as usize)
            }
            _ => 0,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data { stream, .. }
            | Self::Headers { stream, .. }
            | Self::Priority { stream, .. }
            | Self::ResetStream { stream, .. }
            | Self::PushPromise { stream, .. }
            | Self::Continuation { stream, .. } => stream.get(),
            Self::WindowUpdate { stream, .. } => *stream,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => 0,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            Self::Data { flags, .. } => Flags::Data(*flags),
            Self::Headers { flags, .. } => Flags::Headers(*flags),
            Self::Settings { flags, .. } => Flags::Settings(*flags),
            Self::PushPromise { flags, .. } => Flags::PushPromise(*flags),
            Self::Ping { flags, .. } => Flags::Ping(*flags),
            Self::Continuation { flags, .. } => Flags::Continuation(*flags),
            Self::Priority { .. }
            | Self::ResetStream { .. }
            | Self::GoAway { .. }
            | Self::WindowUpdate { .. } => Flags::None,
        }
    }

    fn flag_bits(&self) -> u8 {
        match self.flags() {
            Flags::Data(flags) => flags.bits(),
            Flags::Headers(flags) => flags.bits(),
            Flags::Settings(flags) => flags.bits(),
            Flags::PushPromise(flags) => flags.bits(),
            Flags::Ping(flags) => flags.bits(),
            Flags::Continuation(flags) => flags.bits(),
            Flags::None => 0,
        }
    }
}

/// Sans-io frame codec: feed it a byte buffer, get whole frames back out.
/// `max_frame_size` is the limit this endpoint advertised (parse side) or the
/// peer advertised (encode side); the session keeps both codecs updated as
/// SETTINGS arrive.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    pub max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MIN_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Consume exactly one complete frame from the front of `buf`, leaving
    /// any tail for the next call. Returns `None` when more bytes are
    /// needed. Frames of unknown type are discarded, per RFC 7540 §4.1.
    pub fn parse(&self, buf: &mut BytesMut) -> Result<Option<Frame>, H2Error> {
        loop {
            if buf.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
            if length > self.max_frame_size as usize {
                return Err(H2Error::connection(
                    ErrorType::FrameSizeError,
                    format!(
                        "frame of {length} bytes exceeds SETTINGS_MAX_FRAME_SIZE {}",
                        self.max_frame_size
                    ),
                ));
            }
            if buf.len() < FRAME_HEADER_LEN + length {
                return Ok(None);
            }

            let typ = buf[3];
            let flag_bits = buf[4];
            // unwrap: the slice is always 4 bytes
            let stream_id =
                u32::from_be_bytes(buf[5..9].try_into().unwrap()) & (u32::MAX >> 1);
            buf.advance(FRAME_HEADER_LEN);
            let payload = buf.split_to(length).freeze();

            match FrameType::from_u8(typ) {
                Some(typ) => {
                    return Self::decode(typ, flag_bits, stream_id, payload).map(Some);
                }
                None => {
                    // implementations must ignore frames of unknown type
                    trace!("discarding unknown frame type {typ:#x} ({length} bytes)");
                }
            }
        }
    }

    fn decode(
        typ: FrameType,
        flag_bits: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<Frame, H2Error> {
        match typ {
            FrameType::Data => {
                let stream = require_stream(typ, stream_id)?;
                let flags = DataFlags::from_bits_truncate(flag_bits);
                let padded = flags.contains(DataFlags::PADDED);
                let pad_len = if padded { payload.first().copied() } else { None };
                let data = strip_padding(padded, payload)?;
                Ok(Frame::Data {
                    stream,
                    flags,
                    data,
                    pad_len,
                })
            }
            FrameType::Headers => {
                let stream = require_stream(typ, stream_id)?;
                let flags = HeadersFlags::from_bits_truncate(flag_bits);
                let mut fragment =
                    strip_padding(flags.contains(HeadersFlags::PADDED), payload)?;
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    if fragment.len() < 5 {
                        return Err(H2Error::connection(
                            ErrorType::FrameSizeError,
                            "HEADERS too short for its priority fields",
                        ));
                    }
                    Some(read_priority(&mut fragment))
                } else {
                    None
                };
                Ok(Frame::Headers {
                    stream,
                    flags,
                    priority,
                    fragment,
                })
            }
            FrameType::Priority => {
                let stream = require_stream(typ, stream_id)?;
                if payload.len() != 5 {
                    // stream-scoped per RFC 7540 §6.3
                    return Err(H2Error::stream(
                        stream.get(),
                        ErrorType::FrameSizeError,
                        "PRIORITY length must be 5",
                    ));
                }
                let mut payload = payload;
                Ok(Frame::Priority {
                    stream,
                    priority: read_priority(&mut payload),
                })
            }
            FrameType::ResetStream => {
                let stream = require_stream(typ, stream_id)?;
                if payload.len() != 4 {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "RST_STREAM length must be 4",
                    ));
                }
                let mut payload = payload;
                Ok(Frame::ResetStream {
                    stream,
                    error: read_error(payload.get_u32()),
                })
            }
            FrameType::Settings => {
                require_session(typ, stream_id)?;
                let flags = SettingsFlags::from_bits_truncate(flag_bits);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "SETTINGS ACK must carry an empty payload",
                    ));
                }
                if payload.len() % 6 != 0 {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "SETTINGS payload not a multiple of 6",
                    ));
                }
                Ok(Frame::Settings {
                    flags,
                    params: settings::parse_params(&payload),
                })
            }
            FrameType::PushPromise => {
                let stream = require_stream(typ, stream_id)?;
                let flags = PushPromiseFlags::from_bits_truncate(flag_bits);
                let mut fragment =
                    strip_padding(flags.contains(PushPromiseFlags::PADDED), payload)?;
                if fragment.len() < 4 {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "PUSH_PROMISE too short for its promised stream id",
                    ));
                }
                let promised = NonZeroStreamId::new(fragment.get_u32() & (u32::MAX >> 1))
                    .ok_or_else(|| {
                        H2Error::connection(
                            ErrorType::ProtocolError,
                            "PUSH_PROMISE promised stream id 0",
                        )
                    })?;
                Ok(Frame::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment,
                })
            }
            FrameType::Ping => {
                require_session(typ, stream_id)?;
                if payload.len() != 8 {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "PING length must be 8",
                    ));
                }
                // unwrap: length checked above
                Ok(Frame::Ping {
                    flags: PingFlags::from_bits_truncate(flag_bits),
                    data: payload.as_ref().try_into().unwrap(),
                })
            }
            FrameType::GoAway => {
                require_session(typ, stream_id)?;
                if payload.len() < 8 {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "GOAWAY too short",
                    ));
                }
                let mut payload = payload;
                let last_stream = payload.get_u32() & (u32::MAX >> 1);
                let error = read_error(payload.get_u32());
                Ok(Frame::GoAway {
                    last_stream,
                    error,
                    debug: payload,
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(H2Error::connection(
                        ErrorType::FrameSizeError,
                        "WINDOW_UPDATE length must be 4",
                    ));
                }
                let mut payload = payload;
                // a zero increment is validated by the session, which knows
                // whether the error is stream- or connection-scoped
                Ok(Frame::WindowUpdate {
                    stream: stream_id,
                    increment: payload.get_u32() & (u32::MAX >> 1),
                })
            }
            FrameType::Continuation => {
                let stream = require_stream(typ, stream_id)?;
                Ok(Frame::Continuation {
                    stream,
                    flags: ContinuationFlags::from_bits_truncate(flag_bits),
                    fragment: payload,
                })
            }
        }
    }

    /// Serialize one frame. The caller is responsible for keeping payloads
    /// within the peer's MAX_FRAME_SIZE; DATA is fragmented by the output
    /// scheduler and header blocks by [`FrameCodec::encode_header_block`].
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        match frame {
            Frame::Data { data, .. } => payload.put_slice(data),
            Frame::Headers {
                priority, fragment, ..
            } => {
                if let Some(priority) = priority {
                    put_priority(&mut payload, *priority);
                }
                payload.put_slice(fragment);
            }
            Frame::Priority { priority, .. } => put_priority(&mut payload, *priority),
            // unwrap: ErrorType is repr(u32)
            Frame::ResetStream { error, .. } => payload.put_u32(error.to_u32().unwrap()),
            Frame::Settings { params, .. } => {
                payload.put_slice(&settings::encode_params(params));
            }
            Frame::PushPromise {
                promised, fragment, ..
            } => {
                payload.put_u32(promised.get());
                payload.put_slice(fragment);
            }
            Frame::Ping { data, .. } => payload.put_slice(data),
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => {
                payload.put_u32(*last_stream);
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(error.to_u32().unwrap());
                payload.put_slice(debug);
            }
            Frame::WindowUpdate { increment, .. } => payload.put_u32(*increment),
            Frame::Continuation { fragment, .. } => payload.put_slice(fragment),
        }

        buf.put_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        // unwrap: FrameType is repr(u8)
        buf.put_u8(frame.frame_type().to_u8().unwrap());
        buf.put_u8(frame.flag_bits());
        buf.put_u32(frame.stream_id());
        buf.put_slice(&payload);
    }

    /// Serialize a complete header block for `stream`: one HEADERS frame plus
    /// as many CONTINUATION frames as `max_frame_size` forces, appended to
    /// `buf` as one contiguous run so no other frame can interleave.
    pub fn encode_header_block(
        &self,
        buf: &mut BytesMut,
        stream: NonZeroStreamId,
        end_stream: bool,
        fragment: &[u8],
    ) {
        let limit = self.max_frame_size as usize;
        let first_len = fragment.len().min(limit);
        let (first, mut rest) = fragment.split_at(first_len);

        let mut flags = if end_stream {
            HeadersFlags::END_STREAM
        } else {
            HeadersFlags::empty()
        };
        if rest.is_empty() {
            flags |= HeadersFlags::END_HEADERS;
        }
        self.encode(
            &Frame::Headers {
                stream,
                flags,
                priority: None,
                fragment: Bytes::copy_from_slice(first),
            },
            buf,
        );

        while !rest.is_empty() {
            let chunk_len = rest.len().min(limit);
            let (chunk, tail) = rest.split_at(chunk_len);
            rest = tail;
            self.encode(
                &Frame::Continuation {
                    stream,
                    flags: if rest.is_empty() {
                        ContinuationFlags::END_HEADERS
                    } else {
                        ContinuationFlags::empty()
                    },
                    fragment: Bytes::copy_from_slice(chunk),
                },
                buf,
            );
        }
    }
}

fn require_stream(typ: FrameType, stream_id: StreamId) -> Result<NonZeroStreamId, H2Error> {
    NonZeroStreamId::new(stream_id).ok_or_else(|| {
        H2Error::connection(
            ErrorType::ProtocolError,
            format!("{typ:?} frame on stream 0"),
        )
    })
}

fn require_session(typ: FrameType, stream_id: StreamId) -> Result<(), H2Error> {
    if stream_id == 0 {
        Ok(())
    } else {
        Err(H2Error::connection(
            ErrorType::ProtocolError,
            format!("{typ:?} frame on stream {stream_id}"),
        ))
    }
}

fn read_priority(payload: &mut Bytes) -> Priority {
    let word = payload.get_u32();
    Priority {
        dependency: word & (u32::MAX >> 1),
        exclusive: word & (1 << 31) != 0,
        weight: payload.get_u8(),
    }
}

fn put_priority(payload: &mut BytesMut, priority: Priority) {
    let mut word = priority.dependency;
    if priority.exclusive {
        word |= 1 << 31;
    }
    payload.put_u32(word);
    payload.put_u8(priority.weight);
}

/// Unknown error codes carry no special semantics; fold them into
/// INTERNAL_ERROR rather than failing the parse.
fn read_error(raw: u32) -> ErrorType {
    ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError)
}

/// Drop the padding-length octet and the trailing padding it describes.
fn strip_padding(padded: bool, mut payload: Bytes) -> Result<Bytes, H2Error> {
    if !padded {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::connection(
            ErrorType::FrameSizeError,
            "padded frame missing its pad length octet",
        ));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(H2Error::connection(
            ErrorType::ProtocolError,
            "padding longer than the remaining payload",
        ));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}
