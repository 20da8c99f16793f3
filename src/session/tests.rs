//! Session behaviour against a hand-driven raw peer.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc as tokio_mpsc;

use super::*;
use crate::protocol::{flags, Header, StreamData, StreamWndInc};
use crate::writer::{write_frame, OutboundFrame};

const STEP: Duration = Duration::from_secs(2);

struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    async fn send(&mut self, frame: OutboundFrame) {
        write_frame(&mut self.writer, &frame).await.unwrap();
    }

    async fn recv(&mut self) -> FrameKind {
        let frame = tokio::time::timeout(STEP, self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        frame.classify().unwrap()
    }

    async fn expect_silence(&mut self) {
        let read = tokio::time::timeout(Duration::from_millis(100), self.reader.read_frame()).await;
        assert!(read.is_err(), "unexpected frame: {:?}", read);
    }

    async fn expect_eof(&mut self) {
        let read = tokio::time::timeout(STEP, self.reader.read_frame())
            .await
            .expect("timed out waiting for EOF");
        assert!(matches!(read, Err(MuxError::ConnectionClosed)), "{:?}", read);
    }
}

fn connect<S: MuxStream>(builder: SessionBuilder<S>) -> (Session<S>, Peer) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let session = builder.start(local);
    let (reader, writer) = tokio::io::split(remote);
    (
        session,
        Peer {
            reader: FrameReader::new(reader),
            writer,
        },
    )
}

fn syn(id: StreamId) -> OutboundFrame {
    StreamSyn::new(id).encode().unwrap()
}

fn data(id: StreamId, payload: &'static [u8], fin: bool) -> OutboundFrame {
    StreamData::new(id, Bytes::from_static(payload), fin)
        .encode()
        .unwrap()
}

async fn terminated<S: MuxStream>(session: &Session<S>) -> Termination {
    tokio::time::timeout(STEP, session.wait())
        .await
        .expect("session did not terminate")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_server_rejects_even_syn() {
    let (session, mut peer) = connect(SessionBuilder::new().server());

    // only servers open even ids
    peer.send(syn(300)).await;

    let termination = terminated(&session).await;
    assert_eq!(termination.code, ErrorCode::ProtocolError);
    assert!(matches!(termination.error, MuxError::Protocol(_)));

    match peer.recv().await {
        FrameKind::GoAway(go_away) => assert_eq!(go_away.error_code, ErrorCode::ProtocolError),
        other => panic!("unexpected {:?}", other),
    }
    peer.expect_eof().await;
}

#[tokio::test]
async fn test_client_rejects_odd_syn() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    // only clients open odd ids
    peer.send(syn(301)).await;

    assert_eq!(terminated(&session).await.code, ErrorCode::ProtocolError);
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_accept_stream() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(syn(300)).await;

    let stream = tokio::time::timeout(STEP, session.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.id(), 300);
    assert_eq!(stream.state(), crate::StreamState::Idle);
    assert!(session.contains_stream(300));
}

#[tokio::test]
async fn test_concurrent_accepts_served_in_order() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    let first = session.clone();
    let first = tokio::spawn(async move { first.accept().await.map(|s| s.id()) });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = session.clone();
    let second = tokio::spawn(async move { second.accept().await.map(|s| s.id()) });
    tokio::time::sleep(Duration::from_millis(20)).await;

    peer.send(syn(2)).await;
    peer.send(syn(4)).await;

    let first = tokio::time::timeout(STEP, first).await.unwrap().unwrap();
    let second = tokio::time::timeout(STEP, second).await.unwrap().unwrap();
    assert_eq!(first.unwrap(), 2);
    assert_eq!(second.unwrap(), 4);
}

#[tokio::test]
async fn test_syn_ids_must_increase() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(syn(302)).await;
    let stream = tokio::time::timeout(STEP, session.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.id(), 302);

    peer.send(syn(300)).await;
    assert_eq!(terminated(&session).await.code, ErrorCode::ProtocolError);
}

#[tokio::test]
async fn test_data_for_unknown_stream_gets_rst() {
    let (_session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(data(2, b"who?", false)).await;

    match peer.recv().await {
        FrameKind::Rst(rst) => {
            assert_eq!(rst.stream_id, 2);
            assert_eq!(rst.error_code, ErrorCode::StreamClosed);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_wnd_inc_and_rst_for_unknown_stream_ignored() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(StreamWndInc::new(2, 100).encode().unwrap()).await;
    peer.send(StreamRst::new(4, ErrorCode::Cancel).encode().unwrap()).await;

    peer.expect_silence().await;
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_data_after_remote_rst_gets_stream_closed() {
    let (_session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(syn(300)).await;
    peer.send(StreamRst::new(300, ErrorCode::Cancel).encode().unwrap())
        .await;
    peer.send(data(300, b"late", false)).await;

    match peer.recv().await {
        FrameKind::Rst(rst) => {
            assert_eq!(rst.stream_id, 300);
            assert_eq!(rst.error_code, ErrorCode::StreamClosed);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_flow_control_violation_resets_stream() {
    let (session, mut peer) = connect(SessionBuilder::new().client().window_size(10));

    peer.send(syn(300)).await;
    peer.send(data(300, b"0123456789A", false)).await;

    match peer.recv().await {
        FrameKind::Rst(rst) => {
            assert_eq!(rst.stream_id, 300);
            assert_eq!(rst.error_code, ErrorCode::FlowControlError);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_late_frames_after_local_reset_are_dropped() {
    let (session, mut peer) = connect(SessionBuilder::new().server());

    let stream = session.open().unwrap();
    stream.reset(ErrorCode::Cancel);

    assert!(matches!(peer.recv().await, FrameKind::Syn(s) if s.stream_id == 2));
    assert!(matches!(peer.recv().await, FrameKind::Rst(r) if r.error_code == ErrorCode::Cancel));

    peer.send(data(2, b"in flight", false)).await;
    peer.send(StreamWndInc::new(2, 10).encode().unwrap()).await;
    peer.expect_silence().await;
    assert!(!session.contains_stream(2));
}

#[tokio::test]
async fn test_mutual_half_close_removes_stream() {
    let (session, mut peer) = connect(SessionBuilder::new().server());

    let stream = session.open().unwrap();
    assert_eq!(stream.id(), 2);
    peer.send(data(2, b"", true)).await;

    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    stream.half_close(b"").await.unwrap();

    eventually(|| !session.contains_stream(2)).await;
    assert_eq!(session.num_streams(), 0);
}

#[tokio::test]
async fn test_half_close_with_exhausted_window() {
    let (session, mut peer) = connect(SessionBuilder::new().server().window_size(10));

    let stream = session.open().unwrap();
    stream.write(&[1u8; 10]).await.unwrap();
    stream.half_close(b"").await.unwrap();

    assert!(matches!(peer.recv().await, FrameKind::Syn(_)));
    match peer.recv().await {
        FrameKind::Data(d) => {
            assert_eq!(d.data.len(), 10);
            assert!(!d.fin);
        }
        other => panic!("unexpected {:?}", other),
    }
    match peer.recv().await {
        FrameKind::Data(d) => {
            assert!(d.data.is_empty());
            assert!(d.fin);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_open_stream_with_options() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    let stream = session.open_stream(Some(5), Some(9), true).unwrap();
    assert_eq!(stream.priority(), 5);
    assert_eq!(stream.stream_type(), 9);
    assert!(matches!(stream.write(b"x").await, Err(MuxError::StreamClosed)));

    match peer.recv().await {
        FrameKind::Syn(s) => {
            assert_eq!(s.stream_id, 1);
            assert_eq!(s.priority, Some(5));
            assert_eq!(s.stream_type, Some(9));
            assert!(s.fin);
        }
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(session.open().unwrap().id(), 3);
}

#[tokio::test]
async fn test_close_sends_go_away_and_ends_session() {
    let (session, mut peer) = connect(SessionBuilder::new().client());
    let stream = session.open().unwrap();

    session.close();

    let termination = terminated(&session).await;
    assert_eq!(termination.code, ErrorCode::NoError);
    assert!(matches!(peer.recv().await, FrameKind::Syn(_)));
    match peer.recv().await {
        FrameKind::GoAway(go_away) => assert_eq!(go_away.error_code, ErrorCode::NoError),
        other => panic!("unexpected {:?}", other),
    }
    peer.expect_eof().await;

    assert!(matches!(
        stream.write(b"x").await,
        Err(MuxError::SessionClosed(ErrorCode::NoError))
    ));
    assert!(matches!(session.open(), Err(MuxError::SessionClosed(_))));
    assert!(matches!(session.accept().await, Err(MuxError::SessionClosed(_))));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_kill_skips_go_away() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    session.kill();

    assert_eq!(terminated(&session).await.code, ErrorCode::Cancel);
    peer.expect_eof().await;
}

#[tokio::test]
async fn test_dropping_last_handle_kills_session() {
    let (session, mut peer) = connect(SessionBuilder::new().client());
    let stream = session.open().unwrap();
    let listener = session.listener();
    assert!(matches!(peer.recv().await, FrameKind::Syn(_)));

    drop(session);
    peer.expect_silence().await;
    assert_ne!(stream.state(), crate::StreamState::Reset);

    drop(listener);
    peer.expect_eof().await;

    let mut buf = [0u8; 4];
    assert!(matches!(
        stream.read(&mut buf).await,
        Err(MuxError::SessionClosed(ErrorCode::Cancel))
    ));
}

#[tokio::test]
async fn test_close_fails_pending_accept() {
    let (session, _peer) = connect(SessionBuilder::new().client());

    let accepting = session.clone();
    let pending = tokio::spawn(async move { accepting.accept().await });
    tokio::task::yield_now().await;

    session.close();
    let result = tokio::time::timeout(STEP, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(MuxError::SessionClosed(ErrorCode::NoError))));
}

#[tokio::test]
async fn test_remote_go_away_stops_new_streams() {
    let (session, mut peer) = connect(SessionBuilder::new().client());
    let kept = session.open().unwrap();
    let orphaned = session.open().unwrap();

    peer.send(
        GoAway::new(1, ErrorCode::NoError, Bytes::from_static(b"draining"))
            .encode()
            .unwrap(),
    )
    .await;

    eventually(|| session.remote_go_away().is_some()).await;
    assert!(matches!(session.open(), Err(MuxError::RemoteGoneAway)));
    assert!(session.contains_stream(kept.id()));
    assert!(!session.contains_stream(orphaned.id()));
    assert!(matches!(orphaned.write(b"x").await, Err(MuxError::RemoteGoneAway)));
    assert_eq!(&session.remote_go_away().unwrap().debug[..], b"draining");
}

#[tokio::test]
async fn test_local_go_away_refuses_new_streams() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(syn(2)).await;
    let stream = tokio::time::timeout(STEP, session.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.id(), 2);

    session.go_away(ErrorCode::NoError, b"done").unwrap();
    assert_eq!(session.state(), SessionState::Closing);
    match peer.recv().await {
        FrameKind::GoAway(go_away) => {
            assert_eq!(go_away.last_stream_id, 2);
            assert_eq!(&go_away.debug[..], b"done");
        }
        other => panic!("unexpected {:?}", other),
    }

    peer.send(syn(4)).await;
    match peer.recv().await {
        FrameKind::Rst(rst) => {
            assert_eq!(rst.stream_id, 4);
            assert_eq!(rst.error_code, ErrorCode::RefusedStream);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_full_accept_backlog_refuses_stream() {
    let (session, mut peer) = connect(SessionBuilder::new().client().accept_backlog(1));

    peer.send(syn(2)).await;
    peer.send(syn(4)).await;

    match peer.recv().await {
        FrameKind::Rst(rst) => {
            assert_eq!(rst.stream_id, 4);
            assert_eq!(rst.error_code, ErrorCode::RefusedStream);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(session.accept().await.unwrap().id(), 2);
    assert!(!session.contains_stream(4));
}

#[tokio::test]
async fn test_unknown_extension_stream_type_refused() {
    let (_session, mut peer) = connect(SessionBuilder::new().client());

    let mut frame = StreamSyn::new(2);
    frame.stream_type = Some(MIN_EXTENSION_STREAM_TYPE);
    peer.send(frame.encode().unwrap()).await;

    assert!(matches!(
        peer.recv().await,
        FrameKind::Rst(r) if r.error_code == ErrorCode::RefusedStream
    ));
}

#[tokio::test]
async fn test_malformed_syn_is_fatal() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    // HAS_PRIORITY without the priority bytes
    let header = Header::new(FrameType::StreamSyn.as_raw(), 0, 2, flags::HAS_PRIORITY).unwrap();
    peer.send(OutboundFrame::new(&header, Bytes::new())).await;

    assert_eq!(terminated(&session).await.code, ErrorCode::ProtocolError);
}

#[tokio::test]
async fn test_malformed_rst_resets_only_its_stream() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(syn(2)).await;
    let stream = tokio::time::timeout(STEP, session.accept())
        .await
        .unwrap()
        .unwrap();

    let header = Header::new(FrameType::StreamRst.as_raw(), 2, 2, 0).unwrap();
    peer.send(OutboundFrame::new(&header, Bytes::from_static(&[0, 1])))
        .await;

    match peer.recv().await {
        FrameKind::Rst(rst) => assert_eq!(rst.error_code, ErrorCode::FrameSizeError),
        other => panic!("unexpected {:?}", other),
    }
    let mut buf = [0u8; 1];
    assert!(matches!(stream.read(&mut buf).await, Err(MuxError::Protocol(_))));
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_eof_terminates_with_internal_error() {
    let (session, peer) = connect(SessionBuilder::new().client());
    drop(peer);

    let termination = terminated(&session).await;
    assert_eq!(termination.code, ErrorCode::InternalError);
    assert!(matches!(termination.error, MuxError::ConnectionClosed));
    assert!(termination.remote_go_away.is_none());
}

#[tokio::test]
async fn test_eof_after_remote_go_away_uses_its_code() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    peer.send(
        GoAway::new(0, ErrorCode::ProtocolError, Bytes::new())
            .encode()
            .unwrap(),
    )
    .await;
    eventually(|| session.remote_go_away().is_some()).await;
    drop(peer);

    let termination = terminated(&session).await;
    assert_eq!(termination.code, ErrorCode::ProtocolError);
    assert_eq!(
        termination.remote_go_away.map(|g| g.error_code),
        Some(ErrorCode::ProtocolError)
    );
}

#[tokio::test]
async fn test_unregistered_frame_type_ignored() {
    let (session, mut peer) = connect(SessionBuilder::new().client());

    let header = Header::new(0x11, 3, 0, 0).unwrap();
    peer.send(OutboundFrame::new(&header, Bytes::from_static(b"ext")))
        .await;

    peer.expect_silence().await;
    assert!(!session.is_closed());
}

/// Records what the session feeds it; sends nothing.
struct FakeStream {
    params: StreamParams,
    received: StdMutex<Vec<Bytes>>,
    closed_with: StdMutex<Option<MuxError>>,
}

impl MuxStream for FakeStream {
    fn id(&self) -> StreamId {
        self.params.id
    }

    fn stream_type(&self) -> StreamType {
        self.params.stream_type
    }

    fn poll_read(
        &self,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_write(&self, _cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<Result<usize>> {
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_half_close(
        &self,
        _cx: &mut std::task::Context<'_>,
        trailer: &[u8],
    ) -> std::task::Poll<Result<usize>> {
        std::task::Poll::Ready(Ok(trailer.len()))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn handle_stream_data(&self, frame: StreamData) {
        self.received.lock().unwrap().push(frame.data);
    }

    fn handle_stream_wnd_inc(&self, _frame: StreamWndInc) {}

    fn handle_stream_rst(&self, _frame: StreamRst) {}

    fn close_with(&self, err: MuxError) {
        *self.closed_with.lock().unwrap() = Some(err);
    }
}

fn fake_factory() -> StreamFactory<FakeStream> {
    Arc::new(|params, _session| {
        Arc::new(FakeStream {
            params,
            received: StdMutex::new(Vec::new()),
            closed_with: StdMutex::new(None),
        })
    })
}

#[tokio::test]
async fn test_custom_stream_factory() {
    let (session, mut peer) = connect(SessionBuilder::with_factory(fake_factory()).server());

    let mut frame = StreamSyn::new(1);
    frame.fin = true;
    peer.send(frame.encode().unwrap()).await;
    peer.send(data(1, b"payload", false)).await;

    let stream = tokio::time::timeout(STEP, session.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.id(), 1);
    assert!(stream.params.fin_remote);
    assert_eq!(stream.params.window_size, crate::flow_control::DEFAULT_WINDOW_SIZE);

    eventually(|| !stream.received.lock().unwrap().is_empty()).await;
    assert_eq!(&stream.received.lock().unwrap()[0][..], b"payload");

    session.kill();
    terminated(&session).await;
    assert!(matches!(
        *stream.closed_with.lock().unwrap(),
        Some(MuxError::SessionClosed(ErrorCode::Cancel))
    ));
}

/// Claims one extension stream type and frame type.
struct Recorder {
    frames: Arc<StdMutex<Vec<Frame>>>,
    accepted: tokio_mpsc::UnboundedSender<Result<StreamId>>,
}

const RECORDER_STREAM_TYPE: StreamType = MIN_EXTENSION_STREAM_TYPE + 1;

impl Extension for Recorder {
    fn start(&self, _session: Session, mut accept: crate::ExtAccept) -> StreamType {
        let accepted = self.accepted.clone();
        tokio::spawn(async move {
            loop {
                match accept.accept().await {
                    Ok(stream) => {
                        let _ = accepted.send(Ok(stream.id()));
                    }
                    Err(e) => {
                        let _ = accepted.send(Err(e));
                        return;
                    }
                }
            }
        });
        RECORDER_STREAM_TYPE
    }

    fn frame_type(&self) -> Option<u8> {
        Some(0x10)
    }

    fn handle_frame(&self, frame: Frame) {
        self.frames.lock().unwrap().push(frame);
    }
}

#[tokio::test]
async fn test_extension_streams_and_frames() {
    let frames = Arc::new(StdMutex::new(Vec::new()));
    let (accepted_tx, mut accepted) = tokio_mpsc::unbounded_channel();
    let recorder = Recorder {
        frames: frames.clone(),
        accepted: accepted_tx,
    };
    let (session, mut peer) = connect(SessionBuilder::new().client().extension(Arc::new(recorder)));

    let mut frame = StreamSyn::new(2);
    frame.stream_type = Some(RECORDER_STREAM_TYPE);
    peer.send(frame.encode().unwrap()).await;

    let header = Header::new(0x10, 3, 7, 0).unwrap();
    peer.send(OutboundFrame::new(&header, Bytes::from_static(b"ext")))
        .await;

    let first = tokio::time::timeout(STEP, accepted.recv()).await.unwrap();
    assert!(matches!(first, Some(Ok(2))));

    eventually(|| !frames.lock().unwrap().is_empty()).await;
    assert_eq!(frames.lock().unwrap()[0].payload(), b"ext");
    assert_eq!(frames.lock().unwrap()[0].stream_id(), 7);

    // the extension's stream never reaches the plain accept queue
    let plain = tokio::time::timeout(Duration::from_millis(50), session.accept()).await;
    assert!(plain.is_err());

    session.close();
    let last = tokio::time::timeout(STEP, accepted.recv()).await.unwrap();
    assert!(matches!(last, Some(Err(MuxError::SessionClosed(ErrorCode::NoError)))));
}
