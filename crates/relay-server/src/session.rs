//! WebSocket session lifecycle: one client from upgrade through disconnect.
//!
//! Two paths run per connection. The outbound path drains the connection's
//! queue into the socket, coalescing queued frames and sending a Ping when
//! nothing was written for a ping interval. The inbound path reads frames,
//! refreshes liveness and dispatches each decoded envelope on its own task.
//! Either path ending tears the connection down.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{Envelope, RelayError};
use relay_settings::ServerSettings;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::auth::Identity;
use crate::connection::{ConnectionHandle, Frame};
use crate::distribution::{Distributor, error_frame};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_FRAMES_PER_WRITE, WS_INBOUND_ERRORS_TOTAL, WS_WRITES_TOTAL,
};
use crate::registry::{Admission, ConnectionRegistry};

/// Per-connection timing and size limits.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Idle time on the outbound path before a Ping is sent.
    pub ping_interval: Duration,
    /// Inbound silence after which the connection is dropped.
    pub idle_timeout: Duration,
    /// Deadline for one socket write.
    pub write_timeout: Duration,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
    /// Most queued frames joined into one write.
    pub max_coalesced_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl SessionConfig {
    /// Build from loaded server settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            ping_interval: settings.ping_interval(),
            idle_timeout: settings.idle_timeout(),
            write_timeout: settings.write_timeout(),
            max_message_size: settings.max_message_size,
            max_coalesced_frames: settings.max_coalesced_frames.max(1),
        }
    }
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error("write failed: {0}")]
    Transport(String),
}

async fn write<W>(sink: &mut W, message: Message, deadline: Duration) -> Result<(), WriteError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Timeout),
    }
}

/// Drain `queue` into `sink` until the queue closes or a write fails.
///
/// Closes `handle` on exit so the inbound path stops too.
pub(crate) async fn outbound_loop<W>(
    mut sink: W,
    mut queue: mpsc::Receiver<Frame>,
    handle: Arc<ConnectionHandle>,
    config: SessionConfig,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    let _ = write(&mut sink, Message::Close(None), config.write_timeout).await;
                    break Ok(());
                };
                let mut batch = String::from(&*first);
                let mut frames: usize = 1;
                while frames < config.max_coalesced_frames {
                    match queue.try_recv() {
                        Ok(more) => {
                            batch.push('\n');
                            batch.push_str(&more);
                            frames += 1;
                        }
                        Err(_) => break,
                    }
                }
                if let Err(e) = write(&mut sink, Message::Text(batch.into()), config.write_timeout).await {
                    break Err(e);
                }
                counter!(WS_WRITES_TOTAL).increment(1);
                #[allow(clippy::cast_precision_loss)]
                histogram!(WS_FRAMES_PER_WRITE).record(frames as f64);
                ping.reset();
            }
            _ = ping.tick() => {
                if let Err(e) = write(&mut sink, Message::Ping(Bytes::new()), config.write_timeout).await {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = outcome {
        info!(error = %e, "outbound path ended");
    }
    let _ = sink.close().await;
    let _ = handle.close();
}

/// Read frames from `stream` until the client leaves, goes silent, sends an
/// oversized frame, or the handle is closed.
pub(crate) async fn inbound_loop<R, E>(
    mut stream: R,
    handle: Arc<ConnectionHandle>,
    identity: Identity,
    distributor: Arc<Distributor>,
    config: SessionConfig,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            () = handle.closed() => break,
            r = tokio::time::timeout(config.idle_timeout, stream.next()) => r,
        };
        let message = match next {
            Err(_) => {
                info!(idle_secs = config.idle_timeout.as_secs(), "client idle, disconnecting");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        handle.mark_alive();

        let data: Bytes = match message {
            Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
        };

        if data.len() > config.max_message_size {
            reject(
                &handle,
                &RelayError::InvalidRequest(format!(
                    "frame of {} bytes exceeds limit of {}",
                    data.len(),
                    config.max_message_size
                )),
            );
            break;
        }

        let envelope = match Envelope::decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                reject(&handle, &e);
                continue;
            }
        };

        let handle = Arc::clone(&handle);
        let identity = identity.clone();
        let distributor = Arc::clone(&distributor);
        let _ = tokio::spawn(async move {
            if let Err(e) = distributor.handle_inbound(&identity, envelope).await {
                debug!(error = %e, "inbound envelope failed");
                reject(&handle, &e);
            }
        });
    }
}

fn reject(handle: &ConnectionHandle, err: &RelayError) {
    counter!(WS_INBOUND_ERRORS_TOTAL, "code" => err.code()).increment(1);
    if let Some(frame) = error_frame(err) {
        let _ = handle.try_enqueue(frame);
    }
}

/// Run a session for an admitted connection over `socket`.
///
/// Returns after both paths have ended and the connection was evicted.
#[instrument(skip_all, fields(user_id = %identity.user_id, conn_id = %admission.handle.id()))]
pub async fn run_session<S, E>(
    socket: S,
    admission: Admission,
    identity: Identity,
    registry: Arc<ConnectionRegistry>,
    distributor: Arc<Distributor>,
    config: SessionConfig,
) where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let Admission { handle, outbound, .. } = admission;
    let (sink, stream) = socket.split();

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!("client connected");

    let mut writer = tokio::spawn(outbound_loop(sink, outbound, Arc::clone(&handle), config.clone()));
    inbound_loop(stream, Arc::clone(&handle), identity, distributor, config.clone()).await;

    let _ = registry.evict(&handle).await;
    if tokio::time::timeout(config.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(dropped = handle.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(handle.age().as_secs_f64());
}
