use crate::{
    error::{H2Error, LocalError},
    frame::{Frame, FrameCodec},
};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

/// One unit of outbound work: a contiguous run of pre-encoded frames. A
/// chunk is written to the transport in full before the next one starts,
/// which is what keeps HEADERS + CONTINUATION runs free of interleaving.
#[derive(Debug)]
pub enum WriteOp {
    Chunk(Bytes),
    /// Flush and close the transport after everything queued before it.
    Shutdown,
}

/// Handle for committing frames to the writer task. Two lanes: `control`
/// preempts `data`, so PING ACK, SETTINGS ACK and WINDOW_UPDATE never sit
/// behind a DATA backlog. Order-sensitive frames (header blocks, DATA,
/// RST_STREAM, graceful GOAWAY) go through the data lane in commit order.
#[derive(Debug, Clone)]
pub struct Outbound {
    control_tx: mpsc::Sender<WriteOp>,
    data_tx: mpsc::Sender<WriteOp>,
    codec: FrameCodec,
}

impl Outbound {
    pub fn new(queue_frames: usize) -> (Self, mpsc::Receiver<WriteOp>, mpsc::Receiver<WriteOp>) {
        let (control_tx, control_rx) = mpsc::channel(queue_frames);
        let (data_tx, data_rx) = mpsc::channel(queue_frames);
        (
            Self {
                control_tx,
                data_tx,
                codec: FrameCodec::default(),
            },
            control_rx,
            data_rx,
        )
    }

    /// Commit a frame to the preempting lane.
    pub async fn control(&self, frame: &Frame) -> Result<(), H2Error> {
        trace!("control lane: {:?}", frame.frame_type());
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf);
        self.send(&self.control_tx, WriteOp::Chunk(buf.freeze())).await
    }

    /// Commit a frame to the ordered lane.
    pub async fn data(&self, frame: &Frame) -> Result<(), H2Error> {
        trace!("data lane: {:?}", frame.frame_type());
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf);
        self.send(&self.data_tx, WriteOp::Chunk(buf.freeze())).await
    }

    /// Commit an already-encoded contiguous run (a header block) to the
    /// ordered lane.
    pub async fn commit(&self, chunk: Bytes) -> Result<(), H2Error> {
        self.send(&self.data_tx, WriteOp::Chunk(chunk)).await
    }

    /// Ask the writer to flush what is queued and close the transport.
    pub async fn shutdown(&self) -> Result<(), H2Error> {
        self.send(&self.data_tx, WriteOp::Shutdown).await
    }

    async fn send(&self, lane: &mpsc::Sender<WriteOp>, op: WriteOp) -> Result<(), H2Error> {
        lane.send(op)
            .await
            .map_err(|_| LocalError::ConnectionClosed.into())
    }
}

/// Single writer task: serializes every outbound byte onto the transport.
/// `biased` keeps the control lane ahead of queued DATA whenever it has
/// something to say.
pub async fn run_writer<W>(
    mut writer: W,
    mut control_rx: mpsc::Receiver<WriteOp>,
    mut data_rx: mpsc::Receiver<WriteOp>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let op = tokio::select! {
            biased;
            op = control_rx.recv() => op,
            op = data_rx.recv() => op,
        };
        let op = match op {
            Some(op) => op,
            // both senders gone
            None => break,
        };
        match op {
            WriteOp::Chunk(chunk) => {
                if let Err(err) = writer.write_all(&chunk).await {
                    debug!("transport write failed: {err}");
                    return;
                }
                if let Err(err) = writer.flush().await {
                    debug!("transport flush failed: {err}");
                    return;
                }
            }
            WriteOp::Shutdown => {
                writer.flush().await.ok();
                writer.shutdown().await.ok();
                return;
            }
        }
    }
    writer.flush().await.ok();
}
