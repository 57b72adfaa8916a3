//! Scripted HTTP/2 peer for driving a client session over an in-memory
//! duplex pipe.
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use h2client::{
    flags::*,
    frame::{Frame, FrameCodec},
    hpack::HeaderCodec,
    types::*,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakePeer {
    io: DuplexStream,
    buf: BytesMut,
    codec: FrameCodec,
    headers: HeaderCodec,
}

impl FakePeer {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
            codec: FrameCodec::default(),
            headers: HeaderCodec::new(u32::MAX),
        }
    }

    /// Read and check the 24-byte client greeting.
    pub async fn expect_preface(&mut self) {
        while self.buf.len() < PREFACE.len() {
            self.read_more().await;
        }
        let greeting = self.buf.split_to(PREFACE.len());
        assert_eq!(greeting.as_ref(), PREFACE, "client preface mismatch");
    }

    /// Next frame from the client, waiting as needed.
    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.codec.parse(&mut self.buf).expect("peer-side parse") {
                return frame;
            }
            self.read_more().await;
        }
    }

    /// Standard opening: preface, client SETTINGS, our SETTINGS with
    /// `params`, then the client's ACK.
    pub async fn handshake(&mut self, params: &[(SettingsParameter, u32)]) {
        self.expect_preface().await;
        match self.recv_frame().await {
            Frame::Settings { flags, .. } => {
                assert!(!flags.contains(SettingsFlags::ACK), "client preface SETTINGS was an ACK");
            }
            other => panic!("expected client SETTINGS, got {other:?}"),
        }
        self.send_settings(params).await;
        match self.recv_frame().await {
            Frame::Settings { flags, .. } => {
                assert!(flags.contains(SettingsFlags::ACK), "expected SETTINGS ACK");
            }
            other => panic!("expected SETTINGS ACK, got {other:?}"),
        }
        // acknowledge the client's SETTINGS in turn
        self.send(&Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        })
        .await;
    }

    pub async fn send(&mut self, frame: &Frame) {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out);
        self.send_raw(&out).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        tokio::time::timeout(STEP_TIMEOUT, self.io.write_all(bytes))
            .await
            .expect("peer write timed out")
            .expect("peer write");
        self.io.flush().await.expect("peer flush");
    }

    pub async fn send_settings(&mut self, params: &[(SettingsParameter, u32)]) {
        self.send(&Frame::Settings {
            flags: SettingsFlags::empty(),
            params: params.to_vec(),
        })
        .await;
    }

    /// HEADERS carrying `fields`, encoded with this peer's HPACK context.
    pub async fn send_headers(&mut self, stream: u32, fields: &[(&str, &str)], end_stream: bool) {
        let fragment = self.encode_fields(fields);
        let mut flags = HeadersFlags::END_HEADERS;
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        self.send(&Frame::Headers {
            stream: nonzero(stream),
            flags,
            priority: None,
            fragment,
        })
        .await;
    }

    pub async fn send_data(&mut self, stream: u32, data: &[u8], end_stream: bool) {
        self.send(&Frame::Data {
            stream: nonzero(stream),
            flags: if end_stream {
                DataFlags::END_STREAM
            } else {
                DataFlags::empty()
            },
            data: Bytes::copy_from_slice(data),
            pad_len: None,
        })
        .await;
    }

    pub fn encode_fields(&mut self, fields: &[(&str, &str)]) -> Bytes {
        let list: Headers = fields
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self.headers.encode(&list)
    }

    pub fn decode_fields(&mut self, block: &[u8]) -> Headers {
        self.headers.decode(block).expect("peer-side HPACK decode")
    }

    async fn read_more(&mut self) {
        let n = tokio::time::timeout(STEP_TIMEOUT, self.io.read_buf(&mut self.buf))
            .await
            .expect("peer read timed out")
            .expect("peer read");
        assert!(n > 0, "client closed the transport unexpectedly");
    }
}

pub fn nonzero(id: u32) -> NonZeroStreamId {
    NonZeroStreamId::new(id).expect("stream id must be nonzero")
}

/// Field lookup in a decoded header list.
pub fn field<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}
