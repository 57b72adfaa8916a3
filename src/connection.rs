use crate::{
    config::Config,
    error::{H2Error, LocalError},
    flags::*,
    flow::{ReceiveWindow, SendWindow},
    frame::{Frame, FrameCodec},
    hpack::HeaderCodec,
    request::Request,
    response::Response,
    scheduler::{run_writer, Outbound},
    settings::Settings,
    stream::{HeaderBlock, Stream, StreamEvent},
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, Mutex, Notify},
};

/// Connection-level lifecycle. The client walks it left to right: the
/// preface and first SETTINGS go out, the server's SETTINGS comes back,
/// requests flow, then GOAWAY winds things down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingPreface,
    SettingsPending,
    Ready,
    GoingAway,
    Closed,
}

/// A server push surfaced to the application: the promised request's header
/// list and a future for the pushed response.
#[derive(Debug)]
pub struct PushedExchange {
    pub request: Headers,
    pub response: oneshot::Receiver<Result<Response, H2Error>>,
}

/// An in-flight exchange: the stream id (usable with [`Connection::cancel`])
/// and the response future.
#[derive(Debug)]
pub struct ResponseHandle {
    pub stream: StreamId,
    rx: oneshot::Receiver<Result<Response, H2Error>>,
}

impl ResponseHandle {
    pub(crate) fn new(
        stream: StreamId,
        rx: oneshot::Receiver<Result<Response, H2Error>>,
    ) -> Self {
        Self { stream, rx }
    }

    pub async fn response(self) -> Result<Response, H2Error> {
        self.rx
            .await
            .map_err(|_| H2Error::from(LocalError::ConnectionClosed))?
    }
}

/// The half of an upgraded HTTP/1.1 request that becomes implicit stream 1.
pub(crate) struct UpgradedExchange {
    pub request_headers: Headers,
    pub response_tx: oneshot::Sender<Result<Response, H2Error>>,
}

type Allowance = Option<usize>;

/// One HTTP/2 connection. Cheap to clone-share via the handles it holds;
/// all session state lives behind one async mutex, mutated either by the
/// inbound demux task or by request callers holding the lock across
/// stream-id allocation and HEADERS commit.
pub struct Connection {
    inner: Arc<Mutex<SessionInner>>,
    outbound: Outbound,
    writable: Arc<Notify>,
    ready: Arc<Notify>,
    slots: Arc<Notify>,
    push_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PushedExchange>>>,
    ping_seq: AtomicU64,
}

struct SessionInner {
    config: Config,
    state: SessionState,
    local_settings: Settings,
    remote_settings: Settings,
    local_settings_acked: bool,
    /// Next locally allocated (odd) stream id.
    next_stream_id: StreamId,
    /// Highest peer-initiated stream id observed (even; pushes).
    last_peer_stream: StreamId,
    highest_promised: StreamId,
    /// Highest peer stream fully processed; goes into GOAWAY.
    highest_processed: StreamId,
    streams: HashMap<StreamId, Stream>,
    /// Stream id with a header block waiting for CONTINUATION frames. While
    /// set, nothing else may arrive on the connection.
    expect_continuation: Option<StreamId>,
    send_window: SendWindow,
    recv_window: ReceiveWindow,
    header_codec: HeaderCodec,
    /// Parses inbound frames; its limit is what this endpoint advertised.
    parse_codec: FrameCodec,
    /// Encodes outbound frames; its limit is what the peer advertised.
    encode_codec: FrameCodec,
    goaway_sent: Option<StreamId>,
    remote_goaway: Option<StreamId>,
    pending_pings: VecDeque<([u8; 8], oneshot::Sender<()>)>,
    outbound: Outbound,
    writable: Arc<Notify>,
    ready: Arc<Notify>,
    slots: Arc<Notify>,
    push_tx: Option<mpsc::UnboundedSender<PushedExchange>>,
    /// Terminal error, kept for callers that show up late.
    error: Option<H2Error>,
}

impl Connection {
    /// Establish an HTTP/2 session on a transport where HTTP/2 is already
    /// agreed on (ALPN "h2" or prior knowledge): write the preface and the
    /// first SETTINGS, then start the demux and writer tasks.
    pub async fn handshake<T>(io: T, config: Config) -> Result<Self, H2Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::install(io, config, Bytes::new(), None).await
    }

    pub(crate) async fn install<T>(
        mut io: T,
        config: Config,
        residual: Bytes,
        upgraded: Option<UpgradedExchange>,
    ) -> Result<Self, H2Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let (outbound, control_rx, data_rx) = Outbound::new(config.write_queue_frames);
        let writable = Arc::new(Notify::new());
        let ready = Arc::new(Notify::new());
        let slots = Arc::new(Notify::new());
        let (push_tx, push_rx) = if config.send_push_request_upstream {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut local_settings = Settings::default();
        for (param, value) in config.local_settings() {
            local_settings.set(param, value);
        }

        let mut session = SessionInner {
            state: SessionState::AwaitingPreface,
            local_settings,
            remote_settings: Settings::default(),
            local_settings_acked: false,
            next_stream_id: if upgraded.is_some() { 3 } else { 1 },
            last_peer_stream: 0,
            highest_promised: 0,
            highest_processed: 0,
            streams: HashMap::new(),
            expect_continuation: None,
            send_window: SendWindow::new(65_535),
            recv_window: ReceiveWindow::new(65_535),
            header_codec: HeaderCodec::new(config.max_header_list_size),
            parse_codec: FrameCodec {
                max_frame_size: config.max_frame_size,
            },
            encode_codec: FrameCodec::default(),
            goaway_sent: None,
            remote_goaway: None,
            pending_pings: VecDeque::new(),
            outbound: outbound.clone(),
            writable: writable.clone(),
            ready: ready.clone(),
            slots: slots.clone(),
            push_tx,
            error: None,
            config,
        };

        // the upgraded request rides on implicit stream 1, already fully
        // sent on the HTTP/1.1 side of the wire
        if let Some(exchange) = upgraded {
            let id = NonZeroStreamId::new(1).expect("1 is nonzero");
            let mut stream = Stream::new(
                id,
                session
                    .remote_settings
                    .get(SettingsParameter::InitialWindowSize),
                session.config.initial_window_size,
            );
            stream.request_headers = exchange.request_headers;
            stream.response_tx = Some(exchange.response_tx);
            stream.transition(StreamEvent::SendHeaders)?;
            stream.transition(StreamEvent::SendEndStream)?;
            session.streams.insert(1, stream);
        }

        // the preface precedes every other outbound byte, and the first
        // SETTINGS follows it immediately
        let mut greeting = BytesMut::from(PREFACE);
        session.parse_codec.encode(
            &Frame::Settings {
                flags: SettingsFlags::empty(),
                params: session.config.local_settings(),
            },
            &mut greeting,
        );
        io.write_all(&greeting)
            .await
            .map_err(|_| H2Error::from(LocalError::ClosedBeforePreface))?;
        io.flush()
            .await
            .map_err(|_| H2Error::from(LocalError::ClosedBeforePreface))?;
        session.state = SessionState::SettingsPending;

        let inner = Arc::new(Mutex::new(session));
        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(run_writer(write_half, control_rx, data_rx));
        tokio::spawn(run_demux(
            read_half,
            inner.clone(),
            BytesMut::from(residual.as_ref()),
        ));

        Ok(Self {
            inner,
            outbound,
            writable,
            ready,
            slots,
            push_rx: std::sync::Mutex::new(push_rx),
            ping_seq: AtomicU64::new(1),
        })
    }

    /// Run one request/response exchange to completion.
    pub async fn request(&self, request: Request) -> Result<Response, H2Error> {
        let handle = self.execute(request).await?;
        handle.response().await
    }

    /// Send a request (headers and body, suspending on flow control) and
    /// return a handle to await or cancel the response.
    pub async fn execute(&self, request: Request) -> Result<ResponseHandle, H2Error> {
        let (id, rx) = self.open_stream(&request).await?;
        if !request.body.is_empty() {
            self.send_body(id, request.body.clone()).await?;
        }
        Ok(ResponseHandle { stream: id, rx })
    }

    /// Abort a live exchange with RST_STREAM(CANCEL); its buffers are
    /// released and its response future resolves to the cancellation error.
    pub async fn cancel(&self, stream: StreamId) -> Result<(), H2Error> {
        let mut session = self.inner.lock().await;
        session
            .reset_stream(stream, ErrorType::Cancel, "cancelled locally".to_owned())
            .await
    }

    /// Round-trip a PING through the peer. Resolves when the matching ACK
    /// arrives; the ACK preempts any queued DATA on both sides.
    pub async fn ping(&self) -> Result<(), H2Error> {
        let data = self.ping_seq.fetch_add(1, Ordering::Relaxed).to_be_bytes();
        let (tx, rx) = oneshot::channel();
        {
            let mut session = self.inner.lock().await;
            if let Some(err) = &session.error {
                return Err(err.clone());
            }
            session.pending_pings.push_back((data, tx));
            session
                .outbound
                .control(&Frame::Ping {
                    flags: PingFlags::empty(),
                    data,
                })
                .await?;
        }
        rx.await
            .map_err(|_| H2Error::from(LocalError::ConnectionClosed))
    }

    /// Graceful two-phase shutdown: advertise GOAWAY(NO_ERROR), let live
    /// exchanges finish, then close the transport.
    pub async fn close(&self) -> Result<(), H2Error> {
        {
            let mut session = self.inner.lock().await;
            if session.state == SessionState::Closed {
                return Ok(());
            }
            if session.goaway_sent.is_none() {
                let last_stream = session.last_peer_stream;
                session.goaway_sent = Some(last_stream);
                session.state = SessionState::GoingAway;
                session
                    .outbound
                    .data(&Frame::GoAway {
                        last_stream,
                        error: ErrorType::NoError,
                        debug: Bytes::new(),
                    })
                    .await?;
                session.ready.notify_waiters();
            }
        }
        loop {
            let drained = self.slots.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let mut session = self.inner.lock().await;
                if session.state == SessionState::Closed {
                    return Ok(());
                }
                if session.streams.is_empty() {
                    session.state = SessionState::Closed;
                    session
                        .error
                        .get_or_insert(H2Error::Local(LocalError::ConnectionClosed));
                    session.outbound.shutdown().await.ok();
                    return Ok(());
                }
            }
            drained.await;
        }
    }

    /// Channel of pushes the server initiates, when
    /// `send_push_request_upstream` is on. Yields `None` after the first
    /// call took the receiver.
    pub fn pushed_exchanges(&self) -> Option<mpsc::UnboundedReceiver<PushedExchange>> {
        self.push_rx.lock().expect("push receiver lock").take()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Whether the peer has acknowledged this endpoint's SETTINGS yet.
    pub async fn settings_acknowledged(&self) -> bool {
        self.inner.lock().await.local_settings_acked
    }

    pub async fn active_streams(&self) -> usize {
        self.inner.lock().await.streams.len()
    }

    pub async fn last_error(&self) -> Option<H2Error> {
        self.inner.lock().await.error.clone()
    }

    async fn open_stream(
        &self,
        request: &Request,
    ) -> Result<(StreamId, oneshot::Receiver<Result<Response, H2Error>>), H2Error> {
        loop {
            // register before checking so a wakeup between the check and the
            // await cannot be lost
            let ready = self.ready.notified();
            let slots = self.slots.notified();
            tokio::pin!(ready, slots);
            ready.as_mut().enable();
            slots.as_mut().enable();
            {
                let mut session = self.inner.lock().await;
                if let Some(err) = &session.error {
                    return Err(err.clone());
                }
                match session.state {
                    // suspended until the server's SETTINGS arrives
                    SessionState::AwaitingPreface | SessionState::SettingsPending => {}
                    SessionState::Ready => {
                        if session.remote_goaway.is_some() {
                            return Err(LocalError::ConnectionClosed.into());
                        }
                        if session.has_stream_slot() {
                            return session.open_stream(request).await;
                        }
                    }
                    SessionState::GoingAway | SessionState::Closed => {
                        return Err(LocalError::ConnectionClosed.into());
                    }
                }
            }
            tokio::select! {
                _ = &mut ready => {}
                _ = &mut slots => {}
            }
        }
    }

    async fn send_body(&self, id: StreamId, body: Bytes) -> Result<(), H2Error> {
        let mut remaining = body;
        while !remaining.is_empty() {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();
            let allowance = {
                let mut session = self.inner.lock().await;
                if let Some(err) = &session.error {
                    return Err(err.clone());
                }
                match session.take_send_allowance(id, remaining.len())? {
                    Some(n) => Some(n),
                    None if session.streams.contains_key(&id) => None,
                    // stream was reset; the response future tells the story
                    None => return Ok(()),
                }
            };
            match allowance {
                Some(n) => {
                    let data = remaining.split_to(n);
                    let end_stream = remaining.is_empty();
                    let stream = NonZeroStreamId::new(id).expect("stream ids are nonzero");
                    self.outbound
                        .data(&Frame::Data {
                            stream,
                            flags: if end_stream {
                                DataFlags::END_STREAM
                            } else {
                                DataFlags::empty()
                            },
                            data,
                            pad_len: None,
                        })
                        .await?;
                }
                None => writable.await,
            }
        }
        Ok(())
    }
}

impl SessionInner {
    fn has_stream_slot(&self) -> bool {
        let live = self
            .streams
            .values()
            .filter(|stream| stream.id.get() % 2 == 1 && stream.counts_against_limit())
            .count() as u64;
        live < u64::from(
            self.remote_settings
                .get(SettingsParameter::MaxConcurrentStreams),
        )
    }

    /// The "new-stream lock" sequence: allocate the next odd id and commit
    /// the initial header block in one critical section, so stream ids reach
    /// the wire strictly increasing.
    async fn open_stream(
        &mut self,
        request: &Request,
    ) -> Result<(StreamId, oneshot::Receiver<Result<Response, H2Error>>), H2Error> {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        let stream_id = NonZeroStreamId::new(id).expect("stream id wrapped");

        let mut stream = Stream::new(
            stream_id,
            self.remote_settings
                .get(SettingsParameter::InitialWindowSize),
            self.config.initial_window_size,
        );
        stream.request_headers = request.headers.clone();
        stream.transition(StreamEvent::SendHeaders)?;
        let end_stream = request.body.is_empty();
        if end_stream {
            stream.transition(StreamEvent::SendEndStream)?;
        }
        let (tx, rx) = oneshot::channel();
        stream.response_tx = Some(tx);

        let block = self.header_codec.encode(&request.headers);
        let mut buf = BytesMut::new();
        self.encode_codec
            .encode_header_block(&mut buf, stream_id, end_stream, &block);
        self.outbound.commit(buf.freeze()).await?;
        trace!("opened stream {id} for request {}", request.id);
        self.streams.insert(id, stream);
        Ok((id, rx))
    }

    /// DATA allowance for one frame on `id`: bounded by the session window, the
    /// stream window, and the peer's MAX_FRAME_SIZE. `Ok(None)` means
    /// blocked; a vanished stream also yields `Ok(None)` and the caller
    /// distinguishes via the stream table.
    fn take_send_allowance(&mut self, id: StreamId, want: usize) -> Result<Allowance, H2Error> {
        let frame_cap = self.encode_codec.max_frame_size as usize;
        let session_avail = self.send_window.available().max(0) as usize;
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Ok(None),
        };
        let stream_avail = stream.send_window.available().max(0) as usize;
        let n = want.min(frame_cap).min(session_avail).min(stream_avail);
        if n == 0 {
            return Ok(None);
        }
        stream.send_window.consume(n);
        if n == want {
            stream.transition(StreamEvent::SendEndStream)?;
        }
        let closed = stream.is_closed();
        self.send_window.consume(n);
        if closed {
            self.finish_stream(id);
        }
        Ok(Some(n))
    }

    /// Demux entry point: dispatch a frame, turning stream-scoped failures
    /// into RST_STREAM. Only connection errors escape.
    async fn process_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        trace!(
            "recv {:?} stream={} flags={:?}",
            frame.frame_type(),
            frame.stream_id(),
            frame.flags()
        );
        match self.dispatch(frame).await {
            Err(H2Error::Stream { id, code, reason }) => {
                debug!("stream {id} error {code:?}: {reason}");
                self.reset_stream(id, code, reason).await
            }
            other => other,
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), H2Error> {
        // while a header block is open, nothing but its CONTINUATION frames
        // may arrive on the connection
        if let Some(expected) = self.expect_continuation {
            match &frame {
                Frame::Continuation { stream, .. } if stream.get() == expected => {}
                other => {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        format!(
                            "{:?} while a header block on stream {expected} is open",
                            other.frame_type()
                        ),
                    ));
                }
            }
        }
        // the server preface is a SETTINGS frame; anything else first is fatal
        if self.state == SessionState::SettingsPending && !matches!(frame, Frame::Settings { .. })
        {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                format!("{:?} before the server SETTINGS", frame.frame_type()),
            ));
        }

        match frame {
            Frame::Settings { flags, params } => self.on_settings(flags, params).await,
            Frame::Ping { flags, data } => self.on_ping(flags, data).await,
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => self.on_goaway(last_stream, error, &debug),
            Frame::WindowUpdate { stream: 0, increment } => {
                if increment == 0 {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "session WINDOW_UPDATE with a zero increment",
                    ));
                }
                self.send_window.widen(increment).map_err(|_| {
                    H2Error::connection(
                        ErrorType::FlowControlError,
                        "session send window grew past 2^31-1",
                    )
                })?;
                self.writable.notify_waiters();
                Ok(())
            }
            Frame::WindowUpdate { stream, increment } => {
                let retired = self.is_retired(stream);
                match self.streams.get_mut(&stream) {
                    Some(live) => live.recv_window_update(increment)?,
                    // grace window after local closure
                    None if retired => return Ok(()),
                    None => {
                        return Err(H2Error::connection(
                            ErrorType::ProtocolError,
                            format!("WINDOW_UPDATE on idle stream {stream}"),
                        ));
                    }
                }
                self.writable.notify_waiters();
                Ok(())
            }
            Frame::Priority { stream, priority } => {
                // legal in every state, including idle and closed
                if let Some(live) = self.streams.get_mut(&stream.get()) {
                    live.priority = Some(priority);
                }
                Ok(())
            }
            Frame::ResetStream { stream, error } => {
                let id = stream.get();
                let retired = self.is_retired(id);
                match self.streams.get_mut(&id) {
                    Some(live) => live.recv_reset(error)?,
                    None if retired => return Ok(()),
                    None => {
                        return Err(H2Error::connection(
                            ErrorType::ProtocolError,
                            format!("RST_STREAM on idle stream {id}"),
                        ));
                    }
                }
                self.streams.remove(&id);
                self.slots.notify_waiters();
                Ok(())
            }
            Frame::Data {
                stream,
                flags,
                data,
                pad_len,
            } => {
                self.on_data(stream, flags, data, pad_len).await
            }
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                let id = stream.get();
                let retired = self.is_retired(id);
                let block = match self.streams.get_mut(&id) {
                    Some(live) => live.recv_headers(flags, priority, fragment)?,
                    // the block would have to be decoded to keep HPACK in
                    // sync, so a dead target promotes to a connection error
                    None if retired => {
                        return Err(H2Error::connection(
                            ErrorType::StreamClosed,
                            format!("HEADERS on closed stream {id}"),
                        ));
                    }
                    None => {
                        return Err(H2Error::connection(
                            ErrorType::ProtocolError,
                            format!("HEADERS on unopened stream {id}"),
                        ));
                    }
                };
                match block {
                    Some(block) => self.complete_block(id, block).await,
                    None => {
                        self.expect_continuation = Some(id);
                        Ok(())
                    }
                }
            }
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => {
                let id = stream.get();
                if self.expect_continuation != Some(id) {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "CONTINUATION without a preceding header block",
                    ));
                }
                let live = self.streams.get_mut(&id).ok_or_else(|| {
                    H2Error::connection(
                        ErrorType::InternalError,
                        "continuation target vanished mid-block",
                    )
                })?;
                match live.recv_continuation(flags, fragment)? {
                    Some(block) => {
                        self.expect_continuation = None;
                        self.complete_block(id, block).await
                    }
                    None => Ok(()),
                }
            }
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => self.on_push_promise(stream, flags, promised, fragment).await,
        }
    }

    async fn on_settings(
        &mut self,
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    ) -> Result<(), H2Error> {
        if flags.contains(SettingsFlags::ACK) {
            trace!("peer acknowledged our SETTINGS");
            self.local_settings_acked = true;
            // our advertised decoder limits are binding from here on
            self.header_codec.set_local_table_size(
                self.local_settings.get(SettingsParameter::HeaderTableSize),
            );
            return Ok(());
        }

        let old_window = self
            .remote_settings
            .get(SettingsParameter::InitialWindowSize);
        let old_table = self.remote_settings.get(SettingsParameter::HeaderTableSize);
        self.remote_settings.apply(&params)?;

        let new_window = self
            .remote_settings
            .get(SettingsParameter::InitialWindowSize);
        if new_window != old_window {
            // retroactive for every open stream, RFC 7540 §6.9.2
            let delta = i64::from(new_window) - i64::from(old_window);
            for stream in self.streams.values_mut() {
                stream.send_window.adjust(delta).map_err(|_| {
                    H2Error::connection(
                        ErrorType::FlowControlError,
                        format!(
                            "stream {} send window overflowed applying INITIAL_WINDOW_SIZE",
                            stream.id
                        ),
                    )
                })?;
            }
            if delta > 0 {
                self.writable.notify_waiters();
            }
        }
        let new_table = self.remote_settings.get(SettingsParameter::HeaderTableSize);
        if new_table != old_table {
            self.header_codec.set_remote_table_size(new_table);
        }
        self.encode_codec.max_frame_size =
            self.remote_settings.get(SettingsParameter::MaxFrameSize);

        // every SETTINGS is acknowledged exactly once, in arrival order
        self.outbound
            .control(&Frame::Settings {
                flags: SettingsFlags::ACK,
                params: Vec::new(),
            })
            .await?;

        if self.state == SessionState::SettingsPending {
            debug!("server SETTINGS received; session ready");
            self.state = SessionState::Ready;
            self.ready.notify_waiters();
        }
        self.slots.notify_waiters();
        Ok(())
    }

    async fn on_ping(&mut self, flags: PingFlags, data: [u8; 8]) -> Result<(), H2Error> {
        if flags.contains(PingFlags::ACK) {
            if let Some(position) = self
                .pending_pings
                .iter()
                .position(|(payload, _)| *payload == data)
            {
                if let Some((_, tx)) = self.pending_pings.remove(position) {
                    tx.send(()).ok();
                }
            }
            return Ok(());
        }
        // echo ahead of any queued DATA
        self.outbound
            .control(&Frame::Ping {
                flags: PingFlags::ACK,
                data,
            })
            .await
    }

    fn on_goaway(
        &mut self,
        last_stream: StreamId,
        error: ErrorType,
        debug_data: &Bytes,
    ) -> Result<(), H2Error> {
        if error == ErrorType::NoError {
            debug!("peer going away after stream {last_stream}");
        } else {
            error!("peer GOAWAY {error:?}, last stream {last_stream}");
        }
        if !debug_data.is_empty() {
            debug!("GOAWAY debug: {}", String::from_utf8_lossy(debug_data));
        }
        self.remote_goaway = Some(last_stream);
        if self.state != SessionState::Closed {
            self.state = SessionState::GoingAway;
        }

        // streams the peer never processed are safe to retry elsewhere
        let refused: Vec<StreamId> = self
            .streams
            .keys()
            .copied()
            .filter(|id| id % 2 == 1 && *id > last_stream)
            .collect();
        for id in refused {
            if let Some(mut stream) = self.streams.remove(&id) {
                warn!("stream {id} refused by GOAWAY");
                stream.fail(H2Error::stream(
                    id,
                    ErrorType::RefusedStream,
                    "connection is going away; retry on another connection",
                ));
            }
        }
        self.ready.notify_waiters();
        self.slots.notify_waiters();
        Ok(())
    }

    async fn on_data(
        &mut self,
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
        pad_len: Option<u8>,
    ) -> Result<(), H2Error> {
        let flow_len = data.len() + pad_len.map_or(0, |pad| 1 + pad as usize);
        // the session window is spent regardless of stream state
        self.recv_window.consume(flow_len).map_err(|_| {
            H2Error::connection(
                ErrorType::FlowControlError,
                "peer overran the session receive window",
            )
        })?;
        if let Some(increment) = self.recv_window.replenish() {
            self.outbound
                .control(&Frame::WindowUpdate {
                    stream: 0,
                    increment,
                })
                .await?;
        }

        let id = stream.get();
        let retired = self.is_retired(id);
        let outcome = match self.streams.get_mut(&id) {
            Some(live) => live.recv_data(flags, data, flow_len)?,
            None if retired => {
                return Err(H2Error::stream(
                    id,
                    ErrorType::StreamClosed,
                    "DATA on a closed stream",
                ));
            }
            None => {
                return Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    format!("DATA on idle stream {id}"),
                ));
            }
        };
        if let Some(increment) = outcome.replenish {
            self.outbound
                .control(&Frame::WindowUpdate {
                    stream: id,
                    increment,
                })
                .await?;
        }
        if outcome.finished {
            self.finish_stream(id);
        }
        Ok(())
    }

    async fn on_push_promise(
        &mut self,
        parent: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    ) -> Result<(), H2Error> {
        if !self.config.push_enabled {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                "PUSH_PROMISE while SETTINGS_ENABLE_PUSH is 0",
            ));
        }
        let promised_id = promised.get();
        if promised_id % 2 != 0 || promised_id <= self.highest_promised {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                format!("promised stream id {promised_id} is not even and increasing"),
            ));
        }
        let parent_id = parent.get();
        let block = match self.streams.get_mut(&parent_id) {
            Some(live) => live.recv_push_promise(flags, promised, fragment)?,
            None => {
                return Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    format!("PUSH_PROMISE on unknown stream {parent_id}"),
                ));
            }
        };

        self.highest_promised = promised_id;
        self.last_peer_stream = self.last_peer_stream.max(promised_id);
        let reserved = Stream::reserved_remote(
            promised,
            self.remote_settings
                .get(SettingsParameter::InitialWindowSize),
            self.config.initial_window_size,
        );
        self.streams.insert(promised_id, reserved);

        match block {
            Some(block) => self.complete_block(parent_id, block).await,
            None => {
                self.expect_continuation = Some(parent_id);
                Ok(())
            }
        }
    }

    /// A header block finished reassembly: decode it and route the result.
    async fn complete_block(&mut self, id: StreamId, block: HeaderBlock) -> Result<(), H2Error> {
        match block {
            HeaderBlock::Response { end_stream, block } => {
                let headers = self.header_codec.decode(&block)?;
                let live = self.streams.get_mut(&id).ok_or_else(|| {
                    H2Error::connection(ErrorType::InternalError, "header block for a lost stream")
                })?;
                if live.apply_response_headers(headers, end_stream)? {
                    self.finish_stream(id);
                }
                Ok(())
            }
            HeaderBlock::Promise { promised, block } => {
                let request = self.header_codec.decode(&block)?;
                let promised_id = promised.get();
                // a session on the way out refuses the push outright
                if self.state == SessionState::GoingAway || self.goaway_sent.is_some() {
                    self.streams.remove(&promised_id);
                    return self
                        .outbound
                        .data(&Frame::ResetStream {
                            stream: promised,
                            error: ErrorType::RefusedStream,
                        })
                        .await;
                }
                let surface = self.config.send_push_request_upstream;
                let live = self.streams.get_mut(&promised_id).ok_or_else(|| {
                    H2Error::connection(ErrorType::InternalError, "promised stream lost")
                })?;
                trace!("peer promised stream {promised_id}: {request:?}");
                live.request_headers = request.clone();
                if surface {
                    if let Some(push_tx) = &self.push_tx {
                        let (tx, rx) = oneshot::channel();
                        live.response_tx = Some(tx);
                        push_tx
                            .send(PushedExchange {
                                request,
                                response: rx,
                            })
                            .ok();
                    }
                }
                Ok(())
            }
        }
    }

    /// RST a stream locally: fail its future, drop its buffers, tell the
    /// peer. The frame rides the ordered lane so it cannot overtake the
    /// stream's own HEADERS.
    async fn reset_stream(
        &mut self,
        id: StreamId,
        code: ErrorType,
        reason: String,
    ) -> Result<(), H2Error> {
        if let Some(mut stream) = self.streams.remove(&id) {
            stream.fail(H2Error::stream(id, code, reason));
        }
        self.slots.notify_waiters();
        if let Some(stream) = NonZeroStreamId::new(id) {
            self.outbound
                .data(&Frame::ResetStream { stream, error: code })
                .await?;
        }
        Ok(())
    }

    fn finish_stream(&mut self, id: StreamId) {
        let closed = self
            .streams
            .get(&id)
            .map_or(true, |stream| stream.is_closed());
        if closed {
            self.streams.remove(&id);
        }
        if id % 2 == 0 {
            self.highest_processed = self.highest_processed.max(id);
        }
        self.slots.notify_waiters();
    }

    /// True for ids this endpoint has seen and since released: frames on
    /// them get the RFC's post-closure grace instead of a protocol error.
    fn is_retired(&self, id: StreamId) -> bool {
        if id % 2 == 1 {
            id < self.next_stream_id
        } else {
            id != 0 && id <= self.highest_promised
        }
    }

    /// Tear the session down. Connection errors announce themselves with
    /// GOAWAY first; local errors just close.
    async fn fail_session(&mut self, err: H2Error) {
        if self.state == SessionState::Closed {
            return;
        }
        if let H2Error::Connection { code, reason } = &err {
            error!("connection error {code:?}: {reason}");
            if self.goaway_sent.is_none() {
                self.goaway_sent = Some(self.highest_processed);
                self.outbound
                    .control(&Frame::GoAway {
                        last_stream: self.highest_processed,
                        error: *code,
                        debug: Bytes::copy_from_slice(reason.as_bytes()),
                    })
                    .await
                    .ok();
            }
        }
        self.state = SessionState::Closed;
        self.error = Some(err.clone());
        for (_, mut stream) in self.streams.drain() {
            stream.fail(err.clone());
        }
        self.expect_continuation = None;
        self.pending_pings.clear();
        self.outbound.shutdown().await.ok();
        self.ready.notify_waiters();
        self.writable.notify_waiters();
        self.slots.notify_waiters();
    }

    async fn handle_eof(&mut self) {
        debug!("transport reached EOF in {:?}", self.state);
        let err = match self.state {
            SessionState::Closed => return,
            SessionState::AwaitingPreface | SessionState::SettingsPending => {
                LocalError::ClosedBeforePreface
            }
            _ => LocalError::ConnectionClosed,
        };
        self.fail_session(err.into()).await;
    }
}

/// Inbound demux: the single task that reads, parses, and dispatches every
/// frame for one connection.
async fn run_demux<R>(mut reader: R, inner: Arc<Mutex<SessionInner>>, mut buf: BytesMut)
where
    R: AsyncRead + Unpin,
{
    loop {
        loop {
            let mut session = inner.lock().await;
            match session.parse_codec.parse(&mut buf) {
                Ok(Some(frame)) => {
                    if let Err(err) = session.process_frame(frame).await {
                        session.fail_session(err).await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    session.fail_session(err).await;
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                inner.lock().await.handle_eof().await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!("transport read failed: {err}");
                inner
                    .lock()
                    .await
                    .fail_session(LocalError::ConnectionClosed.into())
                    .await;
                return;
            }
        }
    }
}
