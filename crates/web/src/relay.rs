//! Console relay bridge
//!
//! Bridges an upgraded client websocket to the hypervisor's console websocket.
//! Frames are forwarded verbatim in both directions; closing either side
//! closes the other.

use crate::config::BridgeConfig;
use crate::frame::{client_frames, upstream_frames, CloseFrame, Frame, FrameStream, CLOSE_TOO_BIG};
use crate::session::{RelaySession, RelayState};
use crate::tls::console_connector;
use axum::extract::ws::WebSocket;
use futures::{stream, Sink, SinkExt, Stream, StreamExt};
use hvconsole_common::{ConsoleTicket, NodeProfile};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Relay transport errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("client websocket error: {0}")]
    Client(#[source] axum::Error),

    #[error("upstream websocket error: {0}")]
    Upstream(#[source] tungstenite::Error),

    #[error("upstream console connection failed: {0}")]
    UpstreamConnect(#[source] tungstenite::Error),

    #[error("upstream console did not open within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    State(#[from] hvconsole_common::Error),
}

/// Frames and bytes forwarded in one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub frames: u64,
    pub bytes: u64,
}

impl DirectionStats {
    fn record(&mut self, len: usize) {
        self.frames += 1;
        self.bytes += len as u64;
    }
}

/// Outcome of one relay session
#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub session: Uuid,
    pub state: RelayState,
    pub client_to_upstream: DirectionStats,
    pub upstream_to_client: DirectionStats,
    /// Close code sent to the side that did not initiate teardown
    pub close_code: Option<u16>,
    pub duration: Duration,
}

/// Why one forwarding direction stopped
#[derive(Debug)]
enum PumpEnd {
    /// The source sent a close frame
    PeerClosed(Option<CloseFrame>),
    /// The source went away without a close frame
    SourceEnded,
    SourceFailed(RelayError),
    SinkFailed(RelayError),
    /// The other direction stopped first
    Cancelled,
}

/// Couples a client websocket with an upstream console websocket
#[derive(Debug, Clone)]
pub struct RelayBridge {
    upstream_open_timeout: Duration,
    close_timeout: Duration,
    max_message_size: usize,
    max_pending_bytes: usize,
}

/// Client data held before the upstream console opens, unless configured
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

impl RelayBridge {
    pub fn new(upstream_open_timeout: Duration, close_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            upstream_open_timeout,
            close_timeout,
            max_message_size,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.upstream_open_timeout(),
            config.close_timeout(),
            config.max_message_size,
        )
        .with_max_pending_bytes(config.max_pending_bytes)
    }

    pub fn with_max_pending_bytes(mut self, max_pending_bytes: usize) -> Self {
        self.max_pending_bytes = max_pending_bytes;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Bridge an upgraded client socket to the node's console endpoint.
    ///
    /// Consumes the console ticket; it is only ever used to build the
    /// upstream URL.
    pub async fn bridge_console(
        self,
        mut session: RelaySession,
        socket: WebSocket,
        node: NodeProfile,
        ticket: ConsoleTicket,
    ) -> RelaySummary {
        let span = info_span!(
            "relay",
            session = %session.id,
            target = %session.target,
        );

        async move {
            let url = console_url(&node, ticket);
            info!("Opening upstream console {}", redact_ticket(&url));

            let connect = connect_upstream(url, console_connector(&node), self.max_message_size);
            let summary = self.run(&mut session, client_frames(socket), connect).await;

            info!(
                state = %summary.state,
                client_frames = summary.client_to_upstream.frames,
                client_bytes = summary.client_to_upstream.bytes,
                upstream_frames = summary.upstream_to_client.frames,
                upstream_bytes = summary.upstream_to_client.bytes,
                close_code = summary.close_code,
                duration_ms = summary.duration.as_millis() as u64,
                "Console relay ended"
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Drive one session from upgraded client to teardown.
    ///
    /// `connect` opens the upstream side. Client data frames arriving before
    /// it resolves are queued, up to `max_pending_bytes`, and flushed first.
    /// If the client leaves or overflows the queue, `connect` is dropped
    /// before returning.
    pub async fn run<C, U, F>(&self, session: &mut RelaySession, client: C, connect: F) -> RelaySummary
    where
        C: FrameStream,
        U: FrameStream,
        F: Future<Output = Result<U, RelayError>>,
    {
        let started = Instant::now();
        let mut c2u = DirectionStats::default();
        let mut u2c = DirectionStats::default();
        let summary = |session: &RelaySession, c2u, u2c, close_code| RelaySummary {
            session: session.id,
            state: session.state(),
            client_to_upstream: c2u,
            upstream_to_client: u2c,
            close_code,
            duration: started.elapsed(),
        };

        if let Err(e) = session.transition(RelayState::ConnectingUpstream) {
            warn!("Relay not started: {}", e);
            session.fail();
            return summary(&*session, c2u, u2c, None);
        }

        let (mut client_tx, mut client_rx) = client.split();
        let mut pending = VecDeque::new();
        let mut pending_bytes = 0usize;

        let opened = {
            let connect = tokio::time::timeout(self.upstream_open_timeout, connect);
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    result = &mut connect => {
                        break match result {
                            Ok(Ok(upstream)) => Ok(upstream),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(RelayError::UpstreamTimeout(self.upstream_open_timeout)),
                        };
                    }
                    frame = client_rx.next() => match frame {
                        Some(Ok(frame)) if frame.is_data() => {
                            pending_bytes += frame.len();
                            if pending_bytes > self.max_pending_bytes {
                                warn!(
                                    "Client sent {} bytes before upstream console opened, limit is {}",
                                    pending_bytes, self.max_pending_bytes
                                );
                                session.fail();
                                let close = CloseFrame::new(CLOSE_TOO_BIG, "too much data before console opened");
                                self.send_close(&mut client_tx, close).await;
                                return summary(&*session, c2u, u2c, Some(CLOSE_TOO_BIG));
                            }
                            trace!("Queued {} byte client frame until upstream opens", frame.len());
                            pending.push_back(frame);
                        }
                        Some(Ok(Frame::Close(_))) | None => {
                            info!("Client left before upstream console opened");
                            session.fail();
                            return summary(&*session, c2u, u2c, None);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Client failed before upstream console opened: {}", e);
                            session.fail();
                            return summary(&*session, c2u, u2c, None);
                        }
                    },
                }
            }
        };

        let upstream = match opened {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("{}", e);
                session.fail();
                let close = CloseFrame::abnormal("upstream console unavailable");
                let code = close.code;
                self.send_close(&mut client_tx, close).await;
                return summary(&*session, c2u, u2c, Some(code));
            }
        };

        if let Err(e) = session.transition(RelayState::Relaying) {
            warn!("{}", e);
            session.fail();
            return summary(&*session, c2u, u2c, None);
        }
        debug!("Relaying, {} queued client frames", pending.len());

        let (mut upstream_tx, upstream_rx) = upstream.split();
        let inbound = stream::iter(pending.into_iter().map(Ok)).chain(client_rx);
        let cancel = CancellationToken::new();

        let (client_end, upstream_end) = tokio::join!(
            pump("client->upstream", inbound, &mut upstream_tx, &cancel, &mut c2u),
            pump("upstream->client", upstream_rx, &mut client_tx, &cancel, &mut u2c),
        );

        let cause = match (client_end, upstream_end) {
            (PumpEnd::Cancelled, end) | (end, _) => end,
        };
        let (close, clean) = match cause {
            PumpEnd::PeerClosed(received) => (CloseFrame::propagate(received.as_ref()), true),
            PumpEnd::Cancelled => (CloseFrame::normal(), true),
            PumpEnd::SourceEnded => (CloseFrame::abnormal("peer went away"), false),
            PumpEnd::SourceFailed(e) | PumpEnd::SinkFailed(e) => {
                warn!("Relay transport error: {}", e);
                (CloseFrame::abnormal("relay transport error"), false)
            }
        };

        let code = close.code;
        tokio::join!(
            self.send_close(&mut client_tx, close.clone()),
            self.send_close(&mut upstream_tx, close),
        );

        if clean {
            let _ = session.transition(RelayState::Closed);
        } else {
            session.fail();
        }
        summary(&*session, c2u, u2c, Some(code))
    }

    /// Best-effort close bounded by the close timeout
    async fn send_close<K>(&self, sink: &mut K, close: CloseFrame)
    where
        K: Sink<Frame, Error = RelayError> + Unpin,
    {
        let result = tokio::time::timeout(self.close_timeout, async {
            sink.send(Frame::Close(Some(close))).await?;
            sink.close().await
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close not delivered: {}", e),
            Err(_) => debug!("Close timed out after {:?}", self.close_timeout),
        }
    }
}

/// Forward data frames from `src` to `sink` until either ends or `cancel` fires
async fn pump<S, K>(
    direction: &'static str,
    mut src: S,
    sink: &mut K,
    cancel: &CancellationToken,
    stats: &mut DirectionStats,
) -> PumpEnd
where
    S: Stream<Item = Result<Frame, RelayError>> + Unpin,
    K: Sink<Frame, Error = RelayError> + Unpin,
{
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            next = src.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) if frame.is_data() => frame,
            Some(Ok(Frame::Close(close))) => break PumpEnd::PeerClosed(close),
            // Keep-alives are answered by each websocket layer
            Some(Ok(_)) => continue,
            Some(Err(e)) => break PumpEnd::SourceFailed(e),
            None => break PumpEnd::SourceEnded,
        };

        let len = frame.len();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            sent = sink.send(frame) => sent,
        };
        if let Err(e) = sent {
            break PumpEnd::SinkFailed(e);
        }
        trace!("{}: {} bytes", direction, len);
        stats.record(len);
    };

    debug!("{} stopped: {:?}", direction, end);
    cancel.cancel();
    end
}

/// Open the upstream console websocket
async fn connect_upstream(
    url: Zeroizing<String>,
    connector: Option<tokio_tungstenite::Connector>,
    max_message_size: usize,
) -> Result<impl FrameStream, RelayError> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);

    let (socket, response) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), Some(config), false, connector)
            .await
            .map_err(RelayError::UpstreamConnect)?;

    debug!("Upstream console opened ({})", response.status());
    Ok(upstream_frames(socket))
}

/// Console websocket URL for a ticket. The ticket is consumed.
pub fn console_url(node: &NodeProfile, ticket: ConsoleTicket) -> Zeroizing<String> {
    let target = ticket.target();
    Zeroizing::new(format!(
        "{}://{}/{}/{}/{}/console?port={}&ticket={}",
        node.ws_scheme(),
        node.authority(),
        target.node,
        target.resource_type.as_str(),
        target.resource_id,
        ticket.port(),
        urlencoding::encode(ticket.ticket()),
    ))
}

/// Replace the ticket query value for logging
pub fn redact_ticket(url: &str) -> String {
    match url.find("ticket=") {
        Some(idx) => {
            let start = idx + "ticket=".len();
            let end = url[start..].find('&').map_or(url.len(), |i| start + i);
            format!("{}<redacted>{}", &url[..start], &url[end..])
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use hvconsole_common::{ConsoleTarget, ResourceType};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    /// One end of an in-memory websocket
    struct Endpoint {
        rx: mpsc::UnboundedReceiver<Frame>,
        tx: mpsc::UnboundedSender<Frame>,
    }

    fn pair() -> (Endpoint, Endpoint) {
        let (a_tx, b_rx) = mpsc::unbounded();
        let (b_tx, a_rx) = mpsc::unbounded();
        (Endpoint { rx: a_rx, tx: a_tx }, Endpoint { rx: b_rx, tx: b_tx })
    }

    impl Stream for Endpoint {
        type Item = Result<Frame, RelayError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.rx.poll_next_unpin(cx).map(|frame| frame.map(Ok))
        }
    }

    impl Sink<Frame> for Endpoint {
        type Error = RelayError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Pin::new(&mut self.tx).poll_ready(cx).map_err(|_| RelayError::Closed)
        }

        fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), RelayError> {
            Pin::new(&mut self.tx).start_send(frame).map_err(|_| RelayError::Closed)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Pin::new(&mut self.tx).poll_flush(cx).map_err(|_| RelayError::Closed)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Pin::new(&mut self.tx).poll_close(cx).map_err(|_| RelayError::Closed)
        }
    }

    /// Sets its flag when dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn bridge() -> RelayBridge {
        RelayBridge::new(Duration::from_secs(5), Duration::from_millis(200), 1 << 20)
    }

    fn upgraded_session() -> RelaySession {
        let mut session = RelaySession::new(ConsoleTarget::new("pve1", 101, ResourceType::Vm));
        for state in [
            RelayState::Authenticating,
            RelayState::TicketIssued,
            RelayState::Upgrading,
        ] {
            session.transition(state).unwrap();
        }
        session
    }

    async fn recv(endpoint: &mut Endpoint) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), endpoint.next())
            .await
            .expect("timed out waiting for frame")
            .expect("endpoint closed")
            .expect("endpoint error")
    }

    #[tokio::test]
    async fn test_forwards_both_directions_in_order() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();

        // Sent before the relay starts, so they are queued until upstream opens
        for i in 0..5 {
            client.send(Frame::Text(format!("c{}", i))).await.unwrap();
        }
        client.send(Frame::Ping(vec![9])).await.unwrap();
        for i in 0..3u8 {
            upstream.send(Frame::Binary(vec![i; 4])).await.unwrap();
        }

        let task = tokio::spawn(async move {
            let mut session = upgraded_session();
            bridge()
                .run(&mut session, client_side, async move { Ok::<_, RelayError>(upstream_side) })
                .await
        });

        for i in 0..5 {
            assert_eq!(recv(&mut upstream).await, Frame::Text(format!("c{}", i)));
        }
        for i in 0..3u8 {
            assert_eq!(recv(&mut client).await, Frame::Binary(vec![i; 4]));
        }

        client
            .send(Frame::Close(Some(CloseFrame::new(1000, "done"))))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut upstream).await,
            Frame::Close(Some(CloseFrame::new(1000, "done")))
        );

        let summary = task.await.unwrap();
        assert_eq!(summary.state, RelayState::Closed);
        assert_eq!(summary.client_to_upstream.frames, 5);
        assert_eq!(summary.client_to_upstream.bytes, 10);
        assert_eq!(summary.upstream_to_client.frames, 3);
        assert_eq!(summary.upstream_to_client.bytes, 12);
        assert_eq!(summary.close_code, Some(1000));
    }

    #[tokio::test]
    async fn test_client_leaving_cancels_pending_connect() {
        let (mut client, client_side) = pair();
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());

        let connect = async move {
            let _guard = guard;
            futures::future::pending::<Result<Endpoint, RelayError>>().await
        };

        client.send(Frame::Text("early".to_string())).await.unwrap();
        client.send(Frame::Close(None)).await.unwrap();

        let mut session = upgraded_session();
        let summary = bridge().run(&mut session, client_side, connect).await;

        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(summary.state, RelayState::Failed);
        assert_eq!(session.state(), RelayState::Failed);
        assert_eq!(summary.client_to_upstream.frames, 0);
    }

    #[tokio::test]
    async fn test_client_overflowing_pending_queue_is_closed() {
        let (mut client, client_side) = pair();
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());

        let connect = async move {
            let _guard = guard;
            futures::future::pending::<Result<Endpoint, RelayError>>().await
        };

        for _ in 0..5 {
            client.send(Frame::Binary(vec![0; 32])).await.unwrap();
        }

        let mut session = upgraded_session();
        let summary = bridge()
            .with_max_pending_bytes(64)
            .run(&mut session, client_side, connect)
            .await;

        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(summary.state, RelayState::Failed);
        assert_eq!(summary.close_code, Some(CLOSE_TOO_BIG));
        assert_eq!(summary.client_to_upstream.frames, 0);
        match recv(&mut client).await {
            Frame::Close(Some(close)) => assert_eq!(close.code, CLOSE_TOO_BIG),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_queue_within_limit_is_flushed() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();

        for _ in 0..2 {
            client.send(Frame::Binary(vec![7; 32])).await.unwrap();
        }

        let task = tokio::spawn(async move {
            let mut session = upgraded_session();
            bridge()
                .with_max_pending_bytes(64)
                .run(&mut session, client_side, async move { Ok::<_, RelayError>(upstream_side) })
                .await
        });

        for _ in 0..2 {
            assert_eq!(recv(&mut upstream).await, Frame::Binary(vec![7; 32]));
        }
        client.send(Frame::Close(None)).await.unwrap();

        let summary = task.await.unwrap();
        assert_eq!(summary.state, RelayState::Closed);
        assert_eq!(summary.client_to_upstream.bytes, 64);
    }

    #[tokio::test]
    async fn test_upstream_open_timeout_closes_client_abnormally() {
        let (mut client, client_side) = pair();
        let bridge = RelayBridge::new(Duration::from_millis(50), Duration::from_millis(200), 1 << 20);

        let mut session = upgraded_session();
        let connect = futures::future::pending::<Result<Endpoint, RelayError>>();
        let summary = bridge.run(&mut session, client_side, connect).await;

        assert_eq!(summary.state, RelayState::Failed);
        match recv(&mut client).await {
            Frame::Close(Some(close)) => assert_eq!(close.code, 1011),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upstream_close_code_reaches_client() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();

        let task = tokio::spawn(async move {
            let mut session = upgraded_session();
            bridge()
                .run(&mut session, client_side, async move { Ok::<_, RelayError>(upstream_side) })
                .await
        });

        upstream.send(Frame::Text("hello".to_string())).await.unwrap();
        assert_eq!(recv(&mut client).await, Frame::Text("hello".to_string()));

        upstream
            .send(Frame::Close(Some(CloseFrame::new(4001, "bye"))))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut client).await,
            Frame::Close(Some(CloseFrame::new(4001, "bye")))
        );

        let summary = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.state, RelayState::Closed);
    }

    #[tokio::test]
    async fn test_upstream_vanishing_fails_session() {
        let (mut client, client_side) = pair();
        let (upstream, upstream_side) = pair();

        let task = tokio::spawn(async move {
            let mut session = upgraded_session();
            bridge()
                .run(&mut session, client_side, async move { Ok::<_, RelayError>(upstream_side) })
                .await
        });

        drop(upstream);
        match recv(&mut client).await {
            Frame::Close(Some(close)) => assert_eq!(close.code, 1011),
            other => panic!("unexpected frame {:?}", other),
        }

        let summary = task.await.unwrap();
        assert_eq!(summary.state, RelayState::Failed);
    }

    #[tokio::test]
    async fn test_client_vanishing_fails_session() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();

        let task = tokio::spawn(async move {
            let mut session = upgraded_session();
            bridge()
                .run(&mut session, client_side, async move { Ok::<_, RelayError>(upstream_side) })
                .await
        });

        client.send(Frame::Text("keys".to_string())).await.unwrap();
        assert_eq!(recv(&mut upstream).await, Frame::Text("keys".to_string()));

        drop(client);
        match recv(&mut upstream).await {
            Frame::Close(Some(close)) => assert_eq!(close.code, 1011),
            other => panic!("unexpected frame {:?}", other),
        }

        let summary = task.await.unwrap();
        assert_eq!(summary.state, RelayState::Failed);
        assert_eq!(summary.close_code, Some(1011));
        assert_eq!(summary.client_to_upstream.frames, 1);
    }

    #[test]
    fn test_console_url_and_redaction() {
        let node = NodeProfile::new("pve1", "10.0.0.5", "root", "pve1-root");
        let ticket = ConsoleTicket::new(
            5901,
            "PVEVNC:AB+CD/EF=".to_string(),
            ConsoleTarget::new("pve1", 101, ResourceType::Vm),
        );

        let url = console_url(&node, ticket);
        assert_eq!(
            url.as_str(),
            "wss://10.0.0.5:8006/pve1/vm/101/console?port=5901&ticket=PVEVNC%3AAB%2BCD%2FEF%3D"
        );
        assert_eq!(
            redact_ticket(&url),
            "wss://10.0.0.5:8006/pve1/vm/101/console?port=5901&ticket=<redacted>"
        );
        assert_eq!(redact_ticket("ws://h/x?ticket=a&port=1"), "ws://h/x?ticket=<redacted>&port=1");
    }
}
