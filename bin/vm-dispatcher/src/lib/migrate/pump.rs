// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunnels the hypervisor runtime's live-migration streams through the
//! migration connection.
//!
//! Each [`LiveChannel`] is pumped in both directions. Bytes read from the
//! local channel are coalesced, split into packages and sent as
//! [`TunnelChunk`]s tagged with the channel id; chunks arriving from the
//! peer are written to the local channel with the same id. An empty chunk
//! marks the end of a direction. The pump finishes once every direction of
//! every channel has ended, and fails as soon as any of them fails.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use slog::{debug, error, info, trace, Logger};
use strum::EnumIter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::codec::Message;
use super::commands::{Response, TunnelChunk};
use super::conn::Connection;
use super::task_events::TaskEvents;
use super::MigrateError;
use crate::services::LiveChannel;

/// Most bytes gathered from a channel before they are sent.
pub const COLLECTOR_CAPACITY: usize = 256 * 1024;

/// Largest payload carried by one package.
pub const PACKAGE_LIMIT: usize = 64 * 1024;

/// Queued bytes above which reading from channels pauses.
pub const QUEUE_WATERMARK: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("hot migration cancelled")]
    Cancelled,

    #[error(transparent)]
    Connection(MigrateError),

    #[error("channel {0}: {1}")]
    Device(u8, std::io::Error),

    #[error("chunk for unknown channel {0}")]
    UnknownChannel(u8),

    #[error("peer failed: {0}")]
    Remote(String),

    #[error("unexpected message during hot migration: {0}")]
    Protocol(String),

    #[error("pump worker failed: {0}")]
    Worker(String),
}

impl From<MigrateError> for PumpError {
    fn from(err: MigrateError) -> Self {
        match err {
            MigrateError::Cancelled => PumpError::Cancelled,
            other => PumpError::Connection(other),
        }
    }
}

/// Where one direction of one channel is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter)]
pub enum PumpState {
    /// Waiting for data from the source of this direction.
    Reading,
    /// Handing data to the sink of this direction.
    Sending,
    /// Paused until the connection drains.
    Obstruction,
    /// End of stream seen; flushing the sink.
    Closing,
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter)]
pub enum PumpEvent {
    DataRead,
    Eof,
    Sent,
    QueueFull,
    QueueDrained,
    Closed,
    Error,
}

impl PumpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PumpState::Success | PumpState::Failed)
    }
}

/// The pump's transition function. Events that make no sense in a state
/// leave it unchanged; terminal states absorb everything.
pub fn transition(state: PumpState, event: PumpEvent) -> PumpState {
    use PumpEvent as E;
    use PumpState as S;

    match (state, event) {
        (S::Success | S::Failed, _) => state,
        (_, E::Error) => S::Failed,
        (S::Reading, E::DataRead) => S::Sending,
        (S::Reading, E::Eof) => S::Closing,
        (S::Sending, E::Sent) => S::Reading,
        (S::Sending, E::QueueFull) => S::Obstruction,
        (S::Obstruction, E::QueueDrained) => S::Reading,
        (S::Closing, E::Closed) => S::Success,
        _ => state,
    }
}

struct Direction {
    log: Logger,
    state: PumpState,
}

impl Direction {
    fn new(log: Logger) -> Self {
        Direction { log, state: PumpState::Reading }
    }

    fn on(&mut self, event: PumpEvent) {
        let next = transition(self.state, event);
        if next != self.state {
            trace!(self.log, "pump transition";
                   "from" => ?self.state, "to" => ?next, "event" => ?event);
        }
        self.state = next;
    }
}

/// Reads the next batch from `reader`: one blocking read, then whatever
/// more is immediately available, up to the collector capacity. Returns the
/// bytes and whether the stream ended.
async fn collect<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<(usize, bool)> {
    let mut filled = reader.read(buf).await?;
    if filled == 0 {
        return Ok((0, true));
    }
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).now_or_never() {
            Some(Ok(0)) => return Ok((filled, true)),
            Some(Ok(n)) => filled += n,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok((filled, false))
}

/// Local channel to connection.
async fn outbound<R: AsyncRead + Unpin>(
    log: Logger,
    conn: Connection,
    channel: u8,
    mut reader: R,
    timeout: Duration,
) -> Result<u64, PumpError> {
    let mut dir = Direction::new(log.new(slog::o!("direction" => "out")));
    let mut buf = vec![0u8; COLLECTOR_CAPACITY];
    let mut total = 0u64;

    loop {
        let (len, eof) = match collect(&mut reader, &mut buf).await {
            Ok(r) => r,
            Err(e) => {
                dir.on(PumpEvent::Error);
                return Err(PumpError::Device(channel, e));
            }
        };

        if len > 0 {
            dir.on(PumpEvent::DataRead);
            for package in buf[..len].chunks(PACKAGE_LIMIT) {
                let _ = conn.send(Message::TunnelChunk(TunnelChunk {
                    channel,
                    data: Bytes::copy_from_slice(package),
                }));
            }
            total += len as u64;
            if conn.queued_bytes() > QUEUE_WATERMARK {
                dir.on(PumpEvent::QueueFull);
                conn.wait_queue_below(QUEUE_WATERMARK).await;
                dir.on(PumpEvent::QueueDrained);
            } else {
                dir.on(PumpEvent::Sent);
            }
        }

        if eof {
            dir.on(PumpEvent::Eof);
            let mut job = conn.send(Message::TunnelChunk(TunnelChunk {
                channel,
                data: Bytes::new(),
            }));
            if let Err(e) = conn.wait_for_send(&mut job, timeout).await {
                dir.on(PumpEvent::Error);
                return Err(e.into());
            }
            dir.on(PumpEvent::Closed);
            debug!(log, "outbound stream finished"; "bytes" => total);
            return Ok(total);
        }
    }
}

/// Connection to local channel.
async fn inbound<W: AsyncWrite + Unpin>(
    log: Logger,
    channel: u8,
    mut writer: W,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
) -> Result<u64, PumpError> {
    let mut dir = Direction::new(log.new(slog::o!("direction" => "in")));
    let mut total = 0u64;

    while let Some(data) = chunks.recv().await {
        if data.is_empty() {
            dir.on(PumpEvent::Eof);
            if let Err(e) = writer.shutdown().await {
                dir.on(PumpEvent::Error);
                return Err(PumpError::Device(channel, e));
            }
            dir.on(PumpEvent::Closed);
            debug!(log, "inbound stream finished"; "bytes" => total);
            return Ok(total);
        }
        dir.on(PumpEvent::DataRead);
        if let Err(e) = writer.write_all(&data).await {
            dir.on(PumpEvent::Error);
            return Err(PumpError::Device(channel, e));
        }
        total += data.len() as u64;
        dir.on(PumpEvent::Sent);
    }
    dir.on(PumpEvent::Error);
    Err(PumpError::Worker(format!("channel {channel} input dropped")))
}

/// Byte counts moved by a finished pump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub sent: u64,
    pub received: u64,
}

pub(crate) struct HotPump<'a> {
    log: Logger,
    conn: &'a Connection,
    events: &'a mut TaskEvents,
    cancel: CancellationToken,
    timeout: Duration,
}

enum Finished {
    Out(u64),
    In(u64),
}

impl<'a> HotPump<'a> {
    pub(crate) fn new(
        log: &Logger,
        conn: &'a Connection,
        events: &'a mut TaskEvents,
        timeout: Duration,
    ) -> Self {
        let cancel = events.cancel_token().clone();
        HotPump {
            log: log.new(slog::o!("component" => "pump")),
            conn,
            events,
            cancel,
            timeout,
        }
    }

    /// Pumps `channels` until every direction has finished.
    pub(crate) async fn run(
        self,
        channels: Vec<LiveChannel>,
    ) -> Result<PumpStats, PumpError> {
        info!(self.log, "starting hot migration pump";
              "channels" => channels.len());
        let mut workers: JoinSet<Result<Finished, PumpError>> = JoinSet::new();
        let mut routes: Vec<(u8, mpsc::UnboundedSender<Bytes>)> = Vec::new();

        for LiveChannel { id, stream } in channels {
            let log = self.log.new(slog::o!("channel" => id));
            let (reader, writer) = tokio::io::split(stream);
            let (tx, rx) = mpsc::unbounded_channel();
            routes.push((id, tx));

            let (conn, timeout) = (self.conn.clone(), self.timeout);
            let out_log = log.clone();
            workers.spawn(async move {
                outbound(out_log, conn, id, reader, timeout)
                    .await
                    .map(Finished::Out)
            });
            workers.spawn(async move {
                inbound(log, id, writer, rx).await.map(Finished::In)
            });
        }

        let mut stats = PumpStats::default();
        let mut ended: HashSet<u8> = HashSet::new();
        let inbound_pkgs = self.events.inbound();

        let res = loop {
            if workers.is_empty() {
                break Ok(stats);
            }
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Err(PumpError::Cancelled),

                Some(joined) = workers.join_next() => match joined {
                    Ok(Ok(Finished::Out(n))) => stats.sent += n,
                    Ok(Ok(Finished::In(n))) => stats.received += n,
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(PumpError::Worker(e.to_string())),
                },

                res = inbound_pkgs.recv(), if ended.len() < routes.len() => {
                    let package = match res {
                        Ok(p) => p,
                        Err(e) => break Err(e.into()),
                    };
                    match package.message {
                        Message::TunnelChunk(TunnelChunk { channel, data }) => {
                            let Some((_, tx)) =
                                routes.iter().find(|(id, _)| *id == channel)
                            else {
                                break Err(PumpError::UnknownChannel(channel));
                            };
                            if data.is_empty() && !ended.insert(channel) {
                                debug!(self.log, "repeated end of stream";
                                       "channel" => channel);
                                continue;
                            }
                            // A send error means that direction's worker has
                            // already failed; join_next reports why.
                            let _ = tx.send(data);
                        }
                        Message::Cancel(_) | Message::CopyCancel => {
                            break Err(PumpError::Cancelled);
                        }
                        Message::Response(Response::Error { message, .. }) => {
                            break Err(PumpError::Remote(message));
                        }
                        Message::CopyError(failure) => {
                            break Err(PumpError::Remote(failure.message));
                        }
                        other => {
                            break Err(PumpError::Protocol(format!(
                                "{:?}",
                                other.kind()
                            )));
                        }
                    }
                }
            }
        };

        match &res {
            Ok(stats) => info!(self.log, "hot migration pump finished";
                               "sent" => stats.sent,
                               "received" => stats.received),
            Err(e) => {
                error!(self.log, "hot migration pump failed"; "error" => %e);
                workers.abort_all();
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::conn::tests::connected_pair;
    use strum::IntoEnumIterator;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn terminal_states_absorb_every_event() {
        for state in PumpState::iter().filter(|s| s.is_terminal()) {
            for event in PumpEvent::iter() {
                assert_eq!(transition(state, event), state);
            }
        }
    }

    #[test]
    fn errors_fail_every_live_state() {
        for state in PumpState::iter().filter(|s| !s.is_terminal()) {
            assert_eq!(transition(state, PumpEvent::Error), PumpState::Failed);
        }
    }

    #[test]
    fn every_pair_has_a_defined_outcome() {
        for state in PumpState::iter() {
            for event in PumpEvent::iter() {
                let next = transition(state, event);
                // Only the closing handshake reaches Success.
                if next == PumpState::Success && state != PumpState::Success {
                    assert_eq!(
                        (state, event),
                        (PumpState::Closing, PumpEvent::Closed)
                    );
                }
                // Obstruction is only entered from Sending.
                if next == PumpState::Obstruction
                    && state != PumpState::Obstruction
                {
                    assert_eq!(state, PumpState::Sending);
                }
            }
        }
    }

    #[test]
    fn obstruction_cycle() {
        let mut s = PumpState::Reading;
        for (event, expected) in [
            (PumpEvent::DataRead, PumpState::Sending),
            (PumpEvent::QueueFull, PumpState::Obstruction),
            (PumpEvent::DataRead, PumpState::Obstruction),
            (PumpEvent::QueueDrained, PumpState::Reading),
            (PumpEvent::Eof, PumpState::Closing),
            (PumpEvent::Closed, PumpState::Success),
        ] {
            s = transition(s, event);
            assert_eq!(s, expected);
        }
    }

    #[tokio::test]
    async fn collect_coalesces_ready_data() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        a.write_all(&[1u8; 100]).await.unwrap();
        a.write_all(&[2u8; 100]).await.unwrap();
        let mut buf = vec![0u8; 150];
        let (n, eof) = collect(&mut b, &mut buf).await.unwrap();
        assert_eq!((n, eof), (150, false));
        drop(a);
        let (n, eof) = collect(&mut b, &mut buf).await.unwrap();
        assert_eq!((n, eof), (50, true));
    }

    #[tokio::test]
    async fn tunnels_both_directions() {
        let ((src, src_in), (dst, dst_in)) = connected_pair(None, None).await;
        let mut src_events =
            TaskEvents::new(logger(), src_in, CancellationToken::new());
        let mut dst_events =
            TaskEvents::new(logger(), dst_in, CancellationToken::new());

        let (src_pump_end, mut src_vm) = tokio::io::duplex(64 * 1024);
        let (dst_pump_end, mut dst_vm) = tokio::io::duplex(64 * 1024);
        let payload: Vec<u8> = (0..(3 * COLLECTOR_CAPACITY + 5))
            .map(|i| (i % 251) as u8)
            .collect();

        let timeout = Duration::from_secs(5);
        let src_pump = HotPump::new(&logger(), &src, &mut src_events, timeout)
            .run(vec![LiveChannel { id: 3, stream: Box::new(src_pump_end) }]);
        let dst_pump = HotPump::new(&logger(), &dst, &mut dst_events, timeout)
            .run(vec![LiveChannel { id: 3, stream: Box::new(dst_pump_end) }]);

        let expected = payload.clone();
        let source_vm = async move {
            src_vm.write_all(&payload).await.unwrap();
            src_vm.shutdown().await.unwrap();
            let mut ack = Vec::new();
            src_vm.read_to_end(&mut ack).await.unwrap();
            ack
        };
        let target_vm = async move {
            let mut got = Vec::new();
            dst_vm.read_to_end(&mut got).await.unwrap();
            dst_vm.write_all(b"resumed").await.unwrap();
            dst_vm.shutdown().await.unwrap();
            got
        };

        let (src_res, dst_res, ack, got) =
            tokio::join!(src_pump, dst_pump, source_vm, target_vm);
        assert_eq!(got, expected);
        assert_eq!(ack, b"resumed");
        let src_stats = src_res.unwrap();
        assert_eq!(src_stats.sent, expected.len() as u64);
        assert_eq!(src_stats.received, 7);
        assert_eq!(dst_res.unwrap().received, expected.len() as u64);
    }

    #[tokio::test]
    async fn unknown_channel_fails_the_pump() {
        let ((src, _src_in), (dst, dst_in)) = connected_pair(None, None).await;
        let mut dst_events =
            TaskEvents::new(logger(), dst_in, CancellationToken::new());
        let (pump_end, _vm) = tokio::io::duplex(1024);

        let _ = src.send(Message::TunnelChunk(TunnelChunk {
            channel: 9,
            data: Bytes::from_static(b"x"),
        }));
        let res = HotPump::new(
            &logger(),
            &dst,
            &mut dst_events,
            Duration::from_secs(5),
        )
        .run(vec![LiveChannel { id: 0, stream: Box::new(pump_end) }])
        .await;
        assert!(matches!(res, Err(PumpError::UnknownChannel(9))));
    }

    #[tokio::test]
    async fn repeated_end_of_stream_keeps_other_channels_open() {
        let ((src, _src_in), (dst, dst_in)) = connected_pair(None, None).await;
        let mut dst_events =
            TaskEvents::new(logger(), dst_in, CancellationToken::new());
        let (end0, mut vm0) = tokio::io::duplex(1024);
        let (end1, mut vm1) = tokio::io::duplex(1024);

        let chunks: [(u8, &[u8]); 5] =
            [(0, b"a"), (0, b""), (0, b""), (1, b"bc"), (1, b"")];
        for (channel, data) in chunks {
            let _ = src.send(Message::TunnelChunk(TunnelChunk {
                channel,
                data: Bytes::copy_from_slice(data),
            }));
        }
        vm0.shutdown().await.unwrap();
        vm1.shutdown().await.unwrap();

        let pump = HotPump::new(
            &logger(),
            &dst,
            &mut dst_events,
            Duration::from_secs(5),
        )
        .run(vec![
            LiveChannel { id: 0, stream: Box::new(end0) },
            LiveChannel { id: 1, stream: Box::new(end1) },
        ]);
        let stats = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("pump stopped reading channel 1")
            .unwrap();
        assert_eq!(stats.received, 3);

        let mut got = Vec::new();
        vm1.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bc");
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let ((_src, _src_in), (dst, dst_in)) = connected_pair(None, None).await;
        let token = CancellationToken::new();
        let mut dst_events = TaskEvents::new(logger(), dst_in, token.clone());
        let (pump_end, _vm) = tokio::io::duplex(1024);
        token.cancel();
        let res = HotPump::new(
            &logger(),
            &dst,
            &mut dst_events,
            Duration::from_secs(5),
        )
        .run(vec![LiveChannel { id: 0, stream: Box::new(pump_end) }])
        .await;
        assert!(matches!(res, Err(PumpError::Cancelled)));
    }
}
