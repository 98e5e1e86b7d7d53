// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sending side of the file copy.

use std::time::Duration;

use bytes::Bytes;
use slog::{debug, info, trace, Logger};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    CopyEntry, CopyError, CopyPlan, Progress, CHUNK_SIZE, QUEUE_HIGH_WATER,
};
use crate::migrate::codec::{Message, Package};
use crate::migrate::commands::{
    CopyChunk, CopyDir, CopyFile, CopyFirstRequest, Response,
};
use crate::migrate::conn::{Connection, Inbound};
use crate::migrate::task_events::TaskEvents;
use crate::vm::bundle;

pub(crate) struct FileSender<'a> {
    log: Logger,
    conn: &'a Connection,
    events: &'a mut TaskEvents,
    cancel: CancellationToken,
    timeout: Duration,
}

/// Interprets a package the receiver sent outside of a reply.
fn unsolicited(package: Package) -> CopyError {
    match package.message {
        Message::CopyError(failure) => CopyError::Rejected(failure.message),
        Message::CopyCancel | Message::Cancel(_) => CopyError::Cancelled,
        other => CopyError::Protocol(format!("{:?}", other.kind())),
    }
}

/// Fails if the receiver has already reported an error or asked to stop.
fn check_inbound(inbound: &mut Inbound) -> Result<(), CopyError> {
    match inbound.try_recv()? {
        Some(package) => Err(unsolicited(package)),
        None => Ok(()),
    }
}

impl<'a> FileSender<'a> {
    pub(crate) fn new(
        log: &Logger,
        conn: &'a Connection,
        events: &'a mut TaskEvents,
        timeout: Duration,
    ) -> Self {
        let cancel = events.cancel_token().clone();
        FileSender {
            log: log.new(slog::o!("component" => "file_copy")),
            conn,
            events,
            cancel,
            timeout,
        }
    }

    /// Sends `message` and waits for the receiver's acknowledgement, giving
    /// up early if the receiver reports an error or the task is cancelled.
    async fn request(&mut self, message: Message) -> Result<(), CopyError> {
        let mut job = self.conn.send_request(message);
        self.conn.wait_for_send(&mut job, self.timeout).await?;

        let inbound = self.events.inbound();
        let answer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CopyError::Cancelled),
            res = inbound.recv() => return Err(unsolicited(res?)),
            res = self.conn.wait_for_response(&mut job, self.timeout) => res?,
        };
        match answer.message {
            Message::CopyReply | Message::CopyFirstReply => Ok(()),
            Message::Response(Response::Error { message, .. }) => {
                Err(CopyError::Rejected(message))
            }
            _ => Err(unsolicited(answer)),
        }
    }

    async fn send_file(
        &mut self,
        entry: &CopyEntry,
        progress: &mut Progress,
        on_progress: &mut impl FnMut(u8),
    ) -> Result<(), CopyError> {
        let source = &entry.source;
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| CopyError::io(source, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| CopyError::io(source, e))?
            .len();
        let mode =
            bundle::permissions(source).map_err(|e| CopyError::io(source, e))?;
        debug!(self.log, "sending file";
               "path" => %source.display(), "dest" => &entry.dest,
               "size" => size);
        self.request(Message::CopyFile(CopyFile {
            path: entry.dest.clone(),
            size,
            mode,
        }))
        .await?;

        let mut sent = 0u64;
        while sent < size {
            if self.cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            check_inbound(self.events.inbound())?;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CopyError::Cancelled),
                _ = self.conn.wait_queue_below(QUEUE_HIGH_WATER) => {}
            }

            let len = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    CopyError::SizeMismatch(source.clone())
                } else {
                    CopyError::io(source, e)
                }
            })?;
            sent += len as u64;
            let last = sent == size;
            trace!(self.log, "sending chunk";
                   "dest" => &entry.dest, "len" => len, "last" => last);
            // Chunks are not acknowledged; a failed write surfaces on the
            // next request.
            let _ = self.conn.send(Message::CopyChunk(CopyChunk {
                last,
                data: Bytes::from(buf),
            }));

            if let Some(pct) = progress.advance(len as u64) {
                on_progress(pct);
            }
        }
        Ok(())
    }

    /// Streams every entry of `plan` to the receiver.
    ///
    /// `on_progress` is called with the integer percentage of bytes sent
    /// each time it changes, starting with 0.
    pub(crate) async fn send(
        mut self,
        vm_uuid: Uuid,
        plan: &CopyPlan,
        mut on_progress: impl FnMut(u8),
    ) -> Result<(), CopyError> {
        info!(self.log, "starting file copy";
              "dirs" => plan.dirs.len(),
              "files" => plan.files.len(),
              "bytes" => plan.total_bytes);
        let mut progress = Progress::new(plan.total_bytes);

        self.request(Message::CopyFirstRequest(CopyFirstRequest {
            vm_uuid,
            version: self.conn.version().as_u32(),
            total_bytes: plan.total_bytes,
        }))
        .await?;
        if let Some(pct) = progress.advance(0) {
            on_progress(pct);
        }

        for dir in &plan.dirs {
            if self.cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            let mode = bundle::permissions(&dir.source)
                .map_err(|e| CopyError::io(&dir.source, e))?;
            self.request(Message::CopyDir(CopyDir {
                path: dir.dest.clone(),
                mode,
            }))
            .await?;
        }

        for file in &plan.files {
            self.send_file(file, &mut progress, &mut on_progress).await?;
        }

        self.request(Message::CopyFinish).await?;
        info!(self.log, "file copy complete");
        Ok(())
    }
}
