use futures_util::{SinkExt, StreamExt};
use pixelfleet_common::error::{FleetError, Result};
use pixelfleet_common::upstream::StreamEvent;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use uuid::Uuid;

/// One long-lived streaming channel to a worker.
///
/// The channel delivers textual JSON events in arrival order; binary frames
/// (preview snapshots) are always ignorable at this layer and are skipped
/// inside [`next_event`](WorkerStream::next_event). A stream is single-tenant
/// while lent out by the pool.
#[derive(Debug)]
pub struct WorkerStream {
    pub id: Uuid,
    pub worker_id: String,
    /// Opaque client id this stream registered with; submissions monitored on
    /// this stream must carry the same id.
    pub client_id: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    alive: bool,
}

impl WorkerStream {
    /// Dials `ws(s)://<host>/ws?clientId=<fresh uuid>` with a bounded open
    /// deadline.
    pub async fn connect(
        worker_id: &str,
        ws_base: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client_id = Uuid::new_v4().to_string();
        let url = format!("{ws_base}/ws?clientId={client_id}");

        let (ws, _response) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| FleetError::Timeout(connect_timeout.as_millis() as u64))?
            .map_err(|e| FleetError::Transport(format!("stream open to {worker_id} failed: {e}")))?;

        let now = Instant::now();
        let stream = Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
            client_id,
            ws,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            alive: true,
        };
        debug!(worker = %worker_id, stream = %stream.id, "stream connected");
        Ok(stream)
    }

    /// Whether the underlying connection is still usable. Cleared on any
    /// receive or send failure.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mark_used(&mut self) {
        self.use_count += 1;
        self.last_used_at = Instant::now();
    }

    /// Waits up to `deadline` for the next parseable event.
    ///
    /// Binary frames, control frames and unparseable text are skipped without
    /// consuming the caller's patience beyond the shared deadline.
    pub async fn next_event(&mut self, deadline: Duration) -> Result<StreamEvent> {
        let until = Instant::now() + deadline;
        loop {
            let remaining = until
                .checked_duration_since(Instant::now())
                .ok_or(FleetError::Timeout(deadline.as_millis() as u64))?;

            let frame = tokio::time::timeout(remaining, self.ws.next())
                .await
                .map_err(|_| FleetError::Timeout(deadline.as_millis() as u64))?;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = StreamEvent::parse(&text) {
                        self.last_used_at = Instant::now();
                        return Ok(event);
                    }
                    trace!(worker = %self.worker_id, "skipping unparseable text frame");
                }
                // Preview snapshots; never consumed here.
                Some(Ok(Message::Binary(_))) => continue,
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.alive = false;
                    return Err(FleetError::Transport(format!(
                        "stream to {} closed by remote",
                        self.worker_id
                    )));
                }
                Some(Err(e)) => {
                    self.alive = false;
                    return Err(FleetError::Transport(format!(
                        "stream to {} errored: {e}",
                        self.worker_id
                    )));
                }
            }
        }
    }

    /// Idle liveness check: a ping that cannot be written means the stream is
    /// gone.
    pub async fn ping(&mut self, deadline: Duration) -> Result<()> {
        let result = tokio::time::timeout(deadline, self.ws.send(Message::Ping(Vec::new())))
            .await
            .map_err(|_| FleetError::Timeout(deadline.as_millis() as u64))
            .and_then(|sent| {
                sent.map_err(|e| {
                    FleetError::Transport(format!("ping to {} failed: {e}", self.worker_id))
                })
            });
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    /// Requested shutdown: hard close, no reconnect.
    pub async fn close(mut self) {
        self.alive = false;
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    /// Serves a WebSocket endpoint that plays the given frames, then idles.
    async fn serve_ws(frames: Vec<AxumMessage>) -> String {
        let app = Router::new().route(
            "/ws",
            get(move |upgrade: WebSocketUpgrade| {
                let frames = frames.clone();
                async move {
                    upgrade.on_upgrade(move |mut socket| async move {
                        for frame in frames {
                            if socket.send(frame).await.is_err() {
                                return;
                            }
                        }
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    })
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_connect_and_receive_event() {
        let base = serve_ws(vec![AxumMessage::Text(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":0}}}}"#.into(),
        )])
        .await;

        let mut stream = WorkerStream::connect("w1", &base, Duration::from_secs(5))
            .await
            .unwrap();
        let event = stream.next_event(Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            event,
            StreamEvent::Status {
                queue_remaining: Some(0)
            }
        );
        assert!(stream.is_alive());
    }

    #[tokio::test]
    async fn test_binary_frames_are_skipped() {
        let base = serve_ws(vec![
            AxumMessage::Binary(vec![1, 2, 3].into()),
            AxumMessage::Text(r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#.into()),
        ])
        .await;

        let mut stream = WorkerStream::connect("w1", &base, Duration::from_secs(5))
            .await
            .unwrap();
        let event = stream.next_event(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(event, StreamEvent::Executing { node: None, .. }));
    }

    #[tokio::test]
    async fn test_next_event_times_out() {
        let base = serve_ws(vec![]).await;
        let mut stream = WorkerStream::connect("w1", &base, Duration::from_secs(5))
            .await
            .unwrap();
        let err = stream
            .next_event(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Timeout(_)));
        // A receive timeout does not kill the stream.
        assert!(stream.is_alive());
    }

    #[tokio::test]
    async fn test_remote_close_kills_stream() {
        let base = serve_ws(vec![AxumMessage::Close(None)]).await;
        let mut stream = WorkerStream::connect("w1", &base, Duration::from_secs(5))
            .await
            .unwrap();
        let err = stream.next_event(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, FleetError::Transport(_)));
        assert!(!stream.is_alive());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = WorkerStream::connect("w1", "ws://127.0.0.1:1", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.marks_worker_unhealthy());
    }
}
