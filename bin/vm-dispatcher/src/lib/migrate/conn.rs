// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response plumbing over a migration websocket.
//!
//! A session is split into a writer task fed by an unbounded queue and a
//! reader task that decodes incoming frames. Packages that answer a pending
//! request are routed to that request's waiter; everything else lands on the
//! session's [`Inbound`] channel in arrival order. Bytes queued for the
//! writer are tracked so bulk senders can throttle themselves.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, trace, warn, Logger};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{tungstenite, WebSocketStream};

use super::codec::{Message, Package};
use super::protocol::{self, ProtocolVersion};
use super::{MigrateConn, MigrateError};

/// What the reader task hands to the owner of a session.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Package(Package),
    /// The peer closed the session or the transport failed.
    Closed(Option<String>),
}

struct Outbound {
    frame: tungstenite::Message,
    len: usize,
    done: oneshot::Sender<Result<(), MigrateError>>,
}

enum WriterCmd {
    Send(Outbound),
    Close,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Package>>>>;

struct Inner {
    log: Logger,
    version: ProtocolVersion,
    next_id: AtomicU64,
    writer: mpsc::UnboundedSender<WriterCmd>,
    pending: PendingMap,
    queued_bytes: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    reader_task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Sending half of a migration session. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Receiving half of a migration session: every package that is not a
/// reply to an outstanding request.
pub(crate) struct Inbound {
    rx: mpsc::UnboundedReceiver<ConnEvent>,
    closed: bool,
}

/// A package handed to the writer.
pub(crate) struct SendJob {
    pub id: u64,
    written: oneshot::Receiver<Result<(), MigrateError>>,
    response: Option<oneshot::Receiver<Package>>,
}

impl Connection {
    /// Negotiates a protocol with the target on a freshly opened session and
    /// starts the session tasks.
    pub(crate) async fn offer<T: MigrateConn + 'static>(
        mut ws: WebSocketStream<T>,
        ceiling: Option<u32>,
        log: Logger,
    ) -> Result<(Connection, Inbound), MigrateError> {
        let offer = protocol::make_protocol_offer(ceiling);
        ws.send(tungstenite::Message::Text(offer.clone())).await?;
        let selected = match ws.next().await {
            Some(Ok(tungstenite::Message::Text(selected))) => {
                match protocol::parse_selected_protocol(&selected, ceiling) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(log, "target selected protocol not on offer";
                               "offered" => &offer,
                               "selected" => &selected);
                        return Err(MigrateError::ProtocolParse(
                            selected,
                            e.to_string(),
                        ));
                    }
                }
            }
            Some(Ok(tungstenite::Message::Close(frame))) => {
                let reason =
                    frame.map(|f| f.reason.to_string()).unwrap_or_default();
                error!(log, "target refused protocol offer";
                       "offered" => &offer, "reason" => &reason);
                return Err(MigrateError::NoMatchingProtocol(offer, reason));
            }
            x => {
                error!(log, "target failed to negotiate protocol: {:?}", x);
                return Err(MigrateError::Initiate(
                    "no protocol selection from target".to_string(),
                ));
            }
        };
        info!(
            log, "negotiated protocol";
            "protocol" => selected.offer_string()
        );
        Ok(Connection::start(ws, selected.version(), log))
    }

    /// Reads the source's protocol offer, answers with the newest protocol
    /// both sides speak and starts the session tasks.
    pub(crate) async fn accept<T: MigrateConn + 'static>(
        mut ws: WebSocketStream<T>,
        ceiling: Option<u32>,
        log: Logger,
    ) -> Result<(Connection, Inbound), MigrateError> {
        let offer = match ws.next().await {
            Some(Ok(tungstenite::Message::Text(offer))) => offer,
            x => {
                error!(log, "source did not send a protocol offer: {:?}", x);
                return Err(MigrateError::Initiate(
                    "missing protocol offer".to_string(),
                ));
            }
        };

        let selected = match protocol::select_protocol_from_offer(
            &offer, ceiling,
        ) {
            Ok(Some(selected)) => selected,
            Ok(None) => {
                let ours = protocol::make_protocol_offer(ceiling);
                error!(log, "no compatible protocol";
                       "offered" => &offer, "supported" => &ours);
                ws.send(tungstenite::Message::Close(Some(CloseFrame {
                    code: CloseCode::Protocol,
                    reason: "no compatible protocol".into(),
                })))
                .await?;
                return Err(MigrateError::NoMatchingProtocol(offer, ours));
            }
            Err(e) => {
                error!(log, "source protocol offer failed to parse";
                       "offered" => &offer);
                return Err(MigrateError::ProtocolParse(offer, e.to_string()));
            }
        };

        ws.send(tungstenite::Message::Text(selected.offer_string())).await?;
        info!(
            log, "negotiated protocol";
            "protocol" => selected.offer_string()
        );
        Ok(Connection::start(ws, selected.version(), log))
    }

    fn start<T: MigrateConn + 'static>(
        ws: WebSocketStream<T>,
        version: ProtocolVersion,
        log: Logger,
    ) -> (Connection, Inbound) {
        let (sink, stream) = ws.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());

        tokio::spawn(writer_loop(
            log.clone(),
            sink,
            writer_rx,
            queued_bytes.clone(),
            drained.clone(),
        ));
        let reader_task = tokio::spawn(reader_loop(
            log.clone(),
            stream,
            version,
            pending.clone(),
            inbound_tx,
        ));

        let conn = Connection {
            inner: Arc::new(Inner {
                log,
                version,
                next_id: AtomicU64::new(1),
                writer: writer_tx,
                pending,
                queued_bytes,
                drained,
                reader_task,
            }),
        };
        (conn, Inbound { rx: inbound_rx, closed: false })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }

    fn enqueue(
        &self,
        reply_to: Option<u64>,
        mut message: Message,
        expect_response: bool,
    ) -> SendJob {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        message.restrict(self.inner.version);
        let kind = message.kind();

        let response = if expect_response {
            let (tx, rx) = oneshot::channel();
            lock_pending(&self.inner.pending).insert(id, tx);
            Some(rx)
        } else {
            None
        };

        let package = Package { id, reply_to, message };
        let frame: tungstenite::Message = match package.try_into() {
            Ok(frame) => frame,
            Err(e) => {
                error!(self.inner.log, "failed to encode package";
                       "kind" => ?kind, "error" => %e);
                let _ = done_tx.send(Err(e.into()));
                return SendJob { id, written: done_rx, response };
            }
        };
        let len = frame.len();
        trace!(self.inner.log, "queueing package";
               "id" => id, "kind" => ?kind, "len" => len);

        self.inner.queued_bytes.fetch_add(len, Ordering::SeqCst);
        let cmd = WriterCmd::Send(Outbound { frame, len, done: done_tx });
        if let Err(mpsc::error::SendError(cmd)) = self.inner.writer.send(cmd)
        {
            self.inner.queued_bytes.fetch_sub(len, Ordering::SeqCst);
            if let WriterCmd::Send(out) = cmd {
                let _ = out.done.send(Err(MigrateError::Disconnected));
            }
        }
        SendJob { id, written: done_rx, response }
    }

    /// Queues an unsolicited package.
    pub(crate) fn send(&self, message: Message) -> SendJob {
        self.enqueue(None, message, false)
    }

    /// Queues a package whose answer should be routed back to this job.
    pub(crate) fn send_request(&self, message: Message) -> SendJob {
        self.enqueue(None, message, true)
    }

    /// Queues an answer to package `to`.
    pub(crate) fn reply(&self, to: u64, message: Message) -> SendJob {
        self.enqueue(Some(to), message, false)
    }

    /// Waits until the job's package has been handed to the transport.
    pub(crate) async fn wait_for_send(
        &self,
        job: &mut SendJob,
        timeout: Duration,
    ) -> Result<(), MigrateError> {
        match tokio::time::timeout(timeout, &mut job.written).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(MigrateError::Disconnected),
            Err(_) => Err(MigrateError::Timeout(format!(
                "package {} to be sent",
                job.id
            ))),
        }
    }

    /// Waits for the answer to a job queued with `send_request`.
    pub(crate) async fn wait_for_response(
        &self,
        job: &mut SendJob,
        timeout: Duration,
    ) -> Result<Package, MigrateError> {
        let Some(rx) = job.response.as_mut() else {
            return Err(MigrateError::UnexpectedMessage(format!(
                "package {} does not expect a response",
                job.id
            )));
        };
        let res = tokio::time::timeout(timeout, rx).await;
        if res.is_ok() {
            job.response = None;
        }
        match res {
            Ok(Ok(package)) => Ok(package),
            Ok(Err(_)) => Err(MigrateError::Disconnected),
            Err(_) => {
                lock_pending(&self.inner.pending).remove(&job.id);
                Err(MigrateError::Timeout(format!(
                    "response to package {}",
                    job.id
                )))
            }
        }
    }

    /// Sends `message` and waits for its answer, each bounded by `timeout`.
    pub(crate) async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Package, MigrateError> {
        let mut job = self.send_request(message);
        self.wait_for_send(&mut job, timeout).await?;
        self.wait_for_response(&mut job, timeout).await
    }

    /// Bytes handed to the writer but not yet written to the transport.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.inner.queued_bytes.load(Ordering::SeqCst)
    }

    /// Waits until no more than `limit` bytes are queued for the writer.
    pub(crate) async fn wait_queue_below(&self, limit: usize) {
        loop {
            let notified = self.inner.drained.notified();
            if self.queued_bytes() <= limit {
                return;
            }
            notified.await;
        }
    }

    /// Asks the writer to close the session once everything queued so far
    /// has been written.
    pub(crate) fn close(&self) {
        debug!(self.inner.log, "closing migration connection");
        let _ = self.inner.writer.send(WriterCmd::Close);
    }
}

impl Inbound {
    /// Waits for the next unsolicited package.
    pub(crate) async fn recv(&mut self) -> Result<Package, MigrateError> {
        if self.closed {
            return Err(MigrateError::Disconnected);
        }
        match self.rx.recv().await {
            Some(ConnEvent::Package(p)) => Ok(p),
            Some(ConnEvent::Closed(_)) | None => {
                self.closed = true;
                Err(MigrateError::Disconnected)
            }
        }
    }

    /// Returns a package if one is already waiting.
    pub(crate) fn try_recv(&mut self) -> Result<Option<Package>, MigrateError> {
        if self.closed {
            return Err(MigrateError::Disconnected);
        }
        match self.rx.try_recv() {
            Ok(ConnEvent::Package(p)) => Ok(Some(p)),
            Ok(ConnEvent::Closed(_))
            | Err(mpsc::error::TryRecvError::Disconnected) => {
                self.closed = true;
                Err(MigrateError::Disconnected)
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
        }
    }
}

impl SendJob {
    /// Whether an answer to this job will be routed back to it.
    #[cfg(test)]
    pub(crate) fn expects_response(&self) -> bool {
        self.response.is_some()
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Package>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn writer_loop<S>(
    log: Logger,
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    queued_bytes: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) where
    S: futures::Sink<tungstenite::Message, Error = tungstenite::Error>
        + Unpin,
{
    let mut failed: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Send(out) => {
                let res = match &failed {
                    Some(reason) => {
                        Err(MigrateError::Websocket(reason.clone()))
                    }
                    None => sink.send(out.frame).await.map_err(|e| {
                        error!(log, "migration connection write failed";
                               "error" => %e);
                        let err = MigrateError::from(e);
                        failed = Some(err.to_string());
                        err
                    }),
                };
                queued_bytes.fetch_sub(out.len, Ordering::SeqCst);
                drained.notify_waiters();
                let _ = out.done.send(res);
            }
            WriterCmd::Close => break,
        }
    }
    if failed.is_none() {
        if let Err(e) = sink.close().await {
            debug!(log, "error closing migration connection"; "error" => %e);
        }
    }
}

async fn reader_loop<S>(
    log: Logger,
    mut stream: S,
    version: ProtocolVersion,
    pending: PendingMap,
    inbound: mpsc::UnboundedSender<ConnEvent>,
) where
    S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + Unpin,
{
    let reason = loop {
        let frame = match stream.next().await {
            None => break None,
            Some(Err(e)) => break Some(e.to_string()),
            Some(Ok(tungstenite::Message::Close(frame))) => {
                break frame.map(|f| f.reason.to_string());
            }
            Some(Ok(
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_),
            )) => continue,
            Some(Ok(frame)) => frame,
        };

        let mut package: Package = match frame.try_into() {
            Ok(p) => p,
            Err(e) => {
                warn!(log, "dropping undecodable frame"; "error" => %e);
                break Some(e.to_string());
            }
        };
        package.message.restrict(version);
        trace!(log, "received package";
               "id" => package.id,
               "reply_to" => package.reply_to,
               "kind" => ?package.message.kind());

        if let Some(reply_to) = package.reply_to {
            let waiter = lock_pending(&pending).remove(&reply_to);
            if let Some(waiter) = waiter {
                if let Err(package) = waiter.send(package) {
                    debug!(log, "late response dropped"; "id" => package.id);
                }
                continue;
            }
        }
        if inbound.send(ConnEvent::Package(package)).is_err() {
            break None;
        }
    };

    info!(log, "migration connection closed"; "reason" => ?reason);
    // Dropping the waiters fails every outstanding request.
    lock_pending(&pending).clear();
    let _ = inbound.send(ConnEvent::Closed(reason));
}
