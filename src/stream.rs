use crate::{
    error::H2Error,
    flags::*,
    flow::{ReceiveWindow, SendWindow},
    frame::Priority,
    response::Response,
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::{trace, warn};
use tokio::sync::oneshot;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// What kind of header block is still waiting for CONTINUATION frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuing {
    Headers,
    PushPromise,
}

/// State-machine inputs, one per RFC 7540 §5.1 edge we can take as a client.
/// END_STREAM and END_HEADERS are logical events: for a fragmented block
/// they fire when the final CONTINUATION completes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    SendHeaders,
    RecvHeaders,
    SendEndStream,
    RecvEndStream,
    SendReset,
    RecvReset,
}

/// A header block fully reassembled from HEADERS/PUSH_PROMISE plus any
/// CONTINUATION frames, ready for HPACK decoding by the session.
#[derive(Debug)]
pub enum HeaderBlock {
    Response { end_stream: bool, block: Bytes },
    Promise { promised: NonZeroStreamId, block: Bytes },
}

/// Outcome of feeding an inbound DATA frame to a stream.
#[derive(Debug, Default)]
pub struct DataOutcome {
    /// Stream-scope WINDOW_UPDATE increment to emit now, per policy.
    pub replenish: Option<u32>,
    /// END_STREAM was applied and the response has been delivered.
    pub finished: bool,
}

/// One HTTP/2 exchange. Owned by the session's stream table; holds no
/// reference back to the session (the session passes itself into the calls
/// that need shared state).
pub struct Stream {
    pub id: NonZeroStreamId,
    state: StreamState,
    continuing: Option<Continuing>,
    /// END_STREAM carried by a HEADERS frame whose block is still open.
    deferred_end_stream: bool,
    /// Promised id carried by a PUSH_PROMISE whose block is still open.
    pending_promise: Option<NonZeroStreamId>,
    /// Completed inbound header blocks; the second one is trailers.
    header_blocks: u32,
    headers_buffer: BytesMut,
    body_buffer: BytesMut,
    response_headers: Headers,
    trailers: Headers,
    pub send_window: SendWindow,
    pub recv_window: ReceiveWindow,
    pub priority: Option<Priority>,
    /// Created by a peer PUSH_PROMISE rather than a local request.
    pub pushed: bool,
    pub request_headers: Headers,
    pub response_tx: Option<oneshot::Sender<Result<Response, H2Error>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pushed", &self.pushed)
            .finish()
    }
}

impl Stream {
    pub fn new(id: NonZeroStreamId, send_initial: u32, recv_limit: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            continuing: None,
            deferred_end_stream: false,
            pending_promise: None,
            header_blocks: 0,
            headers_buffer: BytesMut::new(),
            body_buffer: BytesMut::new(),
            response_headers: Headers::new(),
            trailers: Headers::new(),
            send_window: SendWindow::new(send_initial),
            recv_window: ReceiveWindow::new(recv_limit),
            priority: None,
            pushed: false,
            request_headers: Headers::new(),
            response_tx: None,
        }
    }

    /// A stream created by a peer PUSH_PROMISE starts out reserved.
    pub fn reserved_remote(id: NonZeroStreamId, send_initial: u32, recv_limit: u32) -> Self {
        let mut stream = Self::new(id, send_initial, recv_limit);
        stream.state = StreamState::ReservedRemote;
        stream.pushed = true;
        stream
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// True while the stream counts against SETTINGS_MAX_CONCURRENT_STREAMS.
    pub fn counts_against_limit(&self) -> bool {
        matches!(
            self.state,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// True while a HEADERS or PUSH_PROMISE block on this stream is waiting
    /// for CONTINUATION frames.
    pub fn expects_continuation(&self) -> bool {
        self.continuing.is_some()
    }

    /// Walk one edge of the RFC 7540 §5.1 state machine. Receive-side
    /// violations surface as connection PROTOCOL_ERROR; send-side events are
    /// generated by this crate and cannot be illegal.
    pub fn transition(&mut self, event: StreamEvent) -> Result<StreamState, H2Error> {
        use {StreamEvent::*, StreamState::*};
        let next = match (self.state, event) {
            (Idle, SendHeaders) => Open,
            (Idle, RecvHeaders) => Open,
            (ReservedRemote, RecvHeaders) => HalfClosedLocal,
            // interim or trailing header blocks; no state change
            (Open | HalfClosedLocal, RecvHeaders) => self.state,
            (Open, SendEndStream) => HalfClosedLocal,
            (Open, RecvEndStream) => HalfClosedRemote,
            (HalfClosedRemote, SendEndStream) => Closed,
            (HalfClosedLocal, RecvEndStream) => Closed,
            (state, SendReset | RecvReset) if state != Idle => Closed,
            (state, event) => {
                return Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    format!("stream {}: {event:?} illegal in {state:?}", self.id),
                ));
            }
        };
        if next != self.state {
            trace!("stream {} {:?} -> {next:?}", self.id, self.state);
            self.state = next;
        }
        Ok(next)
    }

    /// Inbound DATA. Charges the stream receive window (the session charges
    /// its own), buffers the payload, and applies END_STREAM.
    pub fn recv_data(&mut self, flags: DataFlags, data: Bytes, flow_len: usize) -> Result<DataOutcome, H2Error> {
        // RFC 7540 §6.1: DATA outside open / half-closed (local) is a
        // stream error of type STREAM_CLOSED
        if !matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal) {
            return Err(H2Error::stream(
                self.id.get(),
                ErrorType::StreamClosed,
                format!("DATA in {:?}", self.state),
            ));
        }
        self.recv_window.consume(flow_len).map_err(|_| {
            H2Error::stream(
                self.id.get(),
                ErrorType::FlowControlError,
                "peer overran the stream receive window",
            )
        })?;

        self.body_buffer.extend_from_slice(&data);
        let mut outcome = DataOutcome::default();
        if flags.contains(DataFlags::END_STREAM) {
            self.transition(StreamEvent::RecvEndStream)?;
            outcome.finished = self.deliver();
        } else {
            outcome.replenish = self.recv_window.replenish();
        }
        Ok(outcome)
    }

    /// Inbound HEADERS: starts (and possibly completes) a header block.
    pub fn recv_headers(
        &mut self,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    ) -> Result<Option<HeaderBlock>, H2Error> {
        self.transition(StreamEvent::RecvHeaders)?;
        if let Some(priority) = priority {
            self.priority = Some(priority);
        }
        self.headers_buffer.extend_from_slice(&fragment);
        let end_stream = flags.contains(HeadersFlags::END_STREAM);
        if flags.contains(HeadersFlags::END_HEADERS) {
            Ok(Some(HeaderBlock::Response {
                end_stream,
                block: self.take_block(),
            }))
        } else {
            self.continuing = Some(Continuing::Headers);
            self.deferred_end_stream = end_stream;
            Ok(None)
        }
    }

    /// Inbound PUSH_PROMISE riding on this (parent) stream. The promised
    /// stream itself is created by the session.
    pub fn recv_push_promise(
        &mut self,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    ) -> Result<Option<HeaderBlock>, H2Error> {
        // RFC 7540 §6.6: the parent must be peer-writable
        if !matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal) {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                format!("PUSH_PROMISE on stream {} in {:?}", self.id, self.state),
            ));
        }
        self.headers_buffer.extend_from_slice(&fragment);
        if flags.contains(PushPromiseFlags::END_HEADERS) {
            Ok(Some(HeaderBlock::Promise {
                promised,
                block: self.take_block(),
            }))
        } else {
            self.continuing = Some(Continuing::PushPromise);
            self.pending_promise = Some(promised);
            Ok(None)
        }
    }

    /// Inbound CONTINUATION; the session has already verified one was
    /// expected on this stream.
    pub fn recv_continuation(
        &mut self,
        flags: ContinuationFlags,
        fragment: Bytes,
    ) -> Result<Option<HeaderBlock>, H2Error> {
        self.headers_buffer.extend_from_slice(&fragment);
        if !flags.contains(ContinuationFlags::END_HEADERS) {
            return Ok(None);
        }
        let block = self.take_block();
        match self.continuing.take() {
            Some(Continuing::Headers) => Ok(Some(HeaderBlock::Response {
                end_stream: std::mem::take(&mut self.deferred_end_stream),
                block,
            })),
            Some(Continuing::PushPromise) => {
                let promised = self.pending_promise.take().ok_or_else(|| {
                    H2Error::connection(ErrorType::InternalError, "promise block without an id")
                })?;
                Ok(Some(HeaderBlock::Promise { promised, block }))
            }
            None => Err(H2Error::connection(
                ErrorType::InternalError,
                "continuation completed with no open block",
            )),
        }
    }

    /// Store a decoded response header block: leading headers or trailers.
    /// Returns true when the exchange finished. Trailers must carry
    /// END_STREAM; the violation is detected only here, after the block has
    /// advanced the shared HPACK state.
    pub fn apply_response_headers(
        &mut self,
        headers: Headers,
        end_stream: bool,
    ) -> Result<bool, H2Error> {
        self.header_blocks += 1;
        if self.header_blocks == 1 {
            self.response_headers = headers;
        } else if !end_stream {
            return Err(H2Error::stream(
                self.id.get(),
                ErrorType::ProtocolError,
                "second header block without END_STREAM",
            ));
        } else {
            self.trailers = headers;
        }
        if end_stream {
            self.transition(StreamEvent::RecvEndStream)?;
            return Ok(self.deliver());
        }
        Ok(false)
    }

    /// Inbound WINDOW_UPDATE for this stream.
    pub fn recv_window_update(&mut self, increment: u32) -> Result<(), H2Error> {
        if increment == 0 {
            return Err(H2Error::stream(
                self.id.get(),
                ErrorType::ProtocolError,
                "WINDOW_UPDATE with a zero increment",
            ));
        }
        self.send_window.widen(increment).map_err(|_| {
            H2Error::stream(
                self.id.get(),
                ErrorType::FlowControlError,
                "send window grew past 2^31-1",
            )
        })
    }

    /// Peer RST_STREAM: the exchange is over, successfully or not.
    pub fn recv_reset(&mut self, error: ErrorType) -> Result<(), H2Error> {
        if self.state == StreamState::Idle {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                "RST_STREAM on an idle stream",
            ));
        }
        warn!("stream {} reset by peer: {error:?}", self.id);
        self.transition(StreamEvent::RecvReset)?;
        self.fail(H2Error::stream(
            self.id.get(),
            error,
            "reset by peer",
        ));
        Ok(())
    }

    /// Fail the pending exchange and drop buffered payloads.
    pub fn fail(&mut self, error: H2Error) {
        self.body_buffer = BytesMut::new();
        self.headers_buffer = BytesMut::new();
        if let Some(tx) = self.response_tx.take() {
            // a caller that dropped its future is not an error
            tx.send(Err(error)).ok();
        }
    }

    fn take_block(&mut self) -> Bytes {
        self.headers_buffer.split().freeze()
    }

    /// Hand the finished response to whoever is waiting. Pushed streams
    /// without an upstream subscriber simply drop it.
    fn deliver(&mut self) -> bool {
        let response = Response {
            headers: std::mem::take(&mut self.response_headers),
            body: self.body_buffer.split().freeze(),
            trailers: std::mem::take(&mut self.trailers),
        };
        trace!("stream {} finished: {response:?}", self.id);
        if let Some(tx) = self.response_tx.take() {
            tx.send(Ok(response)).ok();
        }
        true
    }
}
