use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

/// The fixed 24-byte client greeting that opens every HTTP/2 connection.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest legal flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: i64 = (u32::MAX >> 1) as i64;

/// Smallest and largest values SETTINGS_MAX_FRAME_SIZE may take.
pub const MIN_FRAME_SIZE: u32 = 1 << 14;
pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

pub type StreamId = u32;
pub type NonZeroStreamId = NonZeroU32;

/// Header fields in the order they were written or decoded. Pseudo-headers
/// come first; names are kept lowercase as HTTP/2 requires.
pub type Headers = Vec<(String, String)>;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// Not an error; used by GOAWAY for graceful shutdown.
    NoError = 0x0,
    /// Unspecific protocol violation.
    ProtocolError = 0x1,
    /// Unexpected internal failure.
    InternalError = 0x2,
    /// Peer violated flow control.
    FlowControlError = 0x3,
    /// SETTINGS was not acknowledged in time.
    SettingsTimeout = 0x4,
    /// Frame received after the stream was half-closed.
    StreamClosed = 0x5,
    /// Frame with an invalid size.
    FrameSizeError = 0x6,
    /// Stream refused before any processing; safe to retry elsewhere.
    RefusedStream = 0x7,
    /// Stream no longer needed.
    Cancel = 0x8,
    /// Header compression context can no longer be maintained.
    CompressionError = 0x9,
    /// CONNECT tunnel was reset or closed abnormally.
    ConnectError = 0xa,
    /// Peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// Transport does not meet minimum security requirements.
    InadequateSecurity = 0xc,
    /// Peer requires HTTP/1.1.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size of the peer's HPACK dynamic table, in octets.
    HeaderTableSize = 0x1,
    /// 1 if the sender accepts PUSH_PROMISE frames, 0 otherwise. Any other
    /// value is a connection error.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams the sender permits the receiver
    /// to create.
    MaxConcurrentStreams = 0x3,
    /// Initial stream-level flow-control window, in octets. Values above
    /// 2^31-1 are a connection error of type FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive. Must stay
    /// within 2^14 .. 2^24-1.
    MaxFrameSize = 0x5,
    /// Advisory limit on the uncompressed size of a header list.
    MaxHeaderListSize = 0x6,
}
