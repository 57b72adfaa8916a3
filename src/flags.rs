use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Last frame the sender will emit for this stream.
        const END_STREAM = 0x1;
        /// Pad Length field and padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// This header block is the last thing the sender will emit for the
        /// stream. CONTINUATION frames may still follow; they belong to the
        /// same block.
        const END_STREAM = 0x1;
        /// The entire header block is in this frame; no CONTINUATION follows.
        const END_HEADERS = 0x4;
        /// Pad Length field and padding are present.
        const PADDED = 0x8;
        /// Exclusive flag, stream dependency, and weight are present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges receipt and application of the peer's SETTINGS. The
        /// payload must be empty when set.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        /// The entire promised header block is in this frame.
        const END_HEADERS = 0x4;
        /// Pad Length field and padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// This PING is a response; never respond to it again.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// This frame ends the header block; otherwise another CONTINUATION
        /// for the same stream must follow.
        const END_HEADERS = 0x4;
    }
}

/// Flag set of a frame, tagged by the frame type it belongs to. Frame types
/// without defined flags carry `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From, derive_more::TryInto)]
pub enum Flags {
    Data(DataFlags),
    Headers(HeadersFlags),
    Settings(SettingsFlags),
    PushPromise(PushPromiseFlags),
    Ping(PingFlags),
    Continuation(ContinuationFlags),
    None,
}
