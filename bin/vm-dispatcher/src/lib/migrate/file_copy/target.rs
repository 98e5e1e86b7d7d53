// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Receiving side of the file copy.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use slog::{debug, info, trace, warn, Logger};
use tokio::io::AsyncWriteExt;

use super::{CopyError, Progress};
use crate::migrate::codec::{Message, Package};
use crate::migrate::commands::{CopyFailure, CopyFile};
use crate::migrate::conn::Connection;
use crate::migrate::task_events::{TaskEvent, TaskEvents, Timer};
use crate::migrate::MigrateError;
use crate::vm::bundle;

struct OpenFile {
    path: PathBuf,
    file: tokio::fs::File,
    remaining: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum Stage {
    AwaitingFirst,
    Receiving,
}

pub(crate) struct FileReceiver {
    log: Logger,
    home: PathBuf,
    external_roots: Vec<PathBuf>,
    created: Vec<PathBuf>,
}

impl FileReceiver {
    /// A receiver writing relative entries below `home` and absolute ones
    /// below any of `external_roots`.
    pub(crate) fn new(
        log: &Logger,
        home: PathBuf,
        external_roots: Vec<PathBuf>,
    ) -> Self {
        FileReceiver {
            log: log.new(slog::o!("component" => "file_copy")),
            home,
            external_roots,
            created: Vec::new(),
        }
    }

    /// Entries this receiver created, oldest first.
    pub(crate) fn created(&self) -> &[PathBuf] {
        &self.created
    }

    /// Maps a destination named by the sender onto a local path.
    fn resolve(&self, dest: &str) -> Result<PathBuf, CopyError> {
        let path = Path::new(dest);
        let clean = path.components().all(|c| {
            matches!(c, Component::Normal(_) | Component::RootDir)
        });
        if dest.is_empty() || !clean {
            return Err(CopyError::EscapesRoot(path.to_path_buf()));
        }
        if path.is_absolute() {
            if self.external_roots.iter().any(|root| path.starts_with(root)) {
                return Ok(path.to_path_buf());
            }
            return Err(CopyError::EscapesRoot(path.to_path_buf()));
        }
        Ok(self.home.join(path))
    }

    fn create_dir(&mut self, dest: &str, mode: u32) -> Result<(), CopyError> {
        let path = self.resolve(dest)?;
        match std::fs::create_dir(&path) {
            Ok(()) => self.created.push(path.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists
                && path.is_dir() => {}
            Err(e) => return Err(CopyError::io(&path, e)),
        }
        bundle::set_permissions(&path, mode)
            .map_err(|e| CopyError::io(&path, e))?;
        debug!(self.log, "created directory"; "path" => %path.display());
        Ok(())
    }

    async fn create_file(
        &mut self,
        req: &CopyFile,
    ) -> Result<Option<OpenFile>, CopyError> {
        let path = self.resolve(&req.path)?;
        let existed = path.exists();
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| CopyError::io(&path, e))?;
        if !existed {
            self.created.push(path.clone());
        }
        bundle::set_permissions(&path, req.mode)
            .map_err(|e| CopyError::io(&path, e))?;
        debug!(self.log, "receiving file";
               "path" => %path.display(), "size" => req.size);
        if req.size == 0 {
            return Ok(None);
        }
        Ok(Some(OpenFile { path, file, remaining: req.size }))
    }

    /// Runs the receive side until the sender's Finish has been
    /// acknowledged.
    ///
    /// Every wait is bounded by `timeout`. On failure the sender is told why,
    /// unless the failure came from the sender. Nothing created so far is
    /// removed; see [`FileReceiver::created`].
    pub(crate) async fn receive(
        &mut self,
        conn: &Connection,
        events: &mut TaskEvents,
        timeout: Duration,
    ) -> Result<(), CopyError> {
        let res = self.run(conn, events, timeout).await;
        events.disarm(Timer::Response);
        if let Err(e) = &res {
            let from_peer = matches!(
                e,
                CopyError::Rejected(_)
                    | CopyError::Migrate(MigrateError::Disconnected)
            );
            if !from_peer {
                warn!(self.log, "file copy failed"; "error" => %e);
                let _ = conn.send(Message::CopyError(CopyFailure {
                    code: e.code(),
                    message: e.to_string(),
                }));
            }
        }
        res
    }

    async fn run(
        &mut self,
        conn: &Connection,
        events: &mut TaskEvents,
        timeout: Duration,
    ) -> Result<(), CopyError> {
        let mut stage = Stage::AwaitingFirst;
        let mut current: Option<OpenFile> = None;
        let mut progress = Progress::new(0);

        loop {
            events.arm(Timer::Response, timeout);
            let package = match events.next().await {
                TaskEvent::Package(p) => p,
                TaskEvent::CancelRequested => return Err(CopyError::Cancelled),
                TaskEvent::Disconnected => {
                    return Err(MigrateError::Disconnected.into())
                }
                TaskEvent::TimerFired(Timer::Response) => {
                    return Err(MigrateError::Timeout(
                        "file copy data".to_string(),
                    )
                    .into())
                }
                TaskEvent::TimerFired(_) => continue,
            };
            let Package { id, message, .. } = package;

            if stage == Stage::AwaitingFirst {
                match message {
                    Message::CopyFirstRequest(first) => {
                        info!(self.log, "file copy started";
                              "bytes" => first.total_bytes);
                        progress = Progress::new(first.total_bytes);
                        stage = Stage::Receiving;
                        let _ = conn.reply(id, Message::CopyFirstReply);
                        continue;
                    }
                    other => return Err(unexpected(other)),
                }
            }

            match message {
                Message::CopyDir(dir) if current.is_none() => {
                    self.create_dir(&dir.path, dir.mode)?;
                    let _ = conn.reply(id, Message::CopyReply);
                }
                Message::CopyFile(req) if current.is_none() => {
                    current = self.create_file(&req).await?;
                    let _ = conn.reply(id, Message::CopyReply);
                }
                Message::CopyChunk(chunk) => {
                    let Some(open) = current.as_mut() else {
                        return Err(CopyError::Protocol(
                            "chunk without a file".to_string(),
                        ));
                    };
                    let len = chunk.data.len() as u64;
                    if len > open.remaining
                        || (chunk.last && len != open.remaining)
                    {
                        return Err(CopyError::SizeMismatch(open.path.clone()));
                    }
                    open.file
                        .write_all(&chunk.data)
                        .await
                        .map_err(|e| CopyError::io(&open.path, e))?;
                    open.remaining -= len;
                    trace!(self.log, "received chunk";
                           "len" => len, "last" => chunk.last);
                    if let Some(pct) = progress.advance(len) {
                        trace!(
                            self.log, "file copy progress";
                            "percent" => pct
                        );
                    }
                    if chunk.last {
                        if let Some(mut done) = current.take() {
                            done.file
                                .flush()
                                .await
                                .map_err(|e| CopyError::io(&done.path, e))?;
                        }
                    }
                }
                Message::CopyFinish if current.is_none() => {
                    let mut job = conn.reply(id, Message::CopyReply);
                    conn.wait_for_send(&mut job, timeout).await?;
                    info!(self.log, "file copy complete";
                          "created" => self.created.len());
                    return Ok(());
                }
                Message::CopyCancel | Message::Cancel(_) => {
                    return Err(CopyError::Rejected(
                        "sender cancelled the copy".to_string(),
                    ));
                }
                Message::CopyError(failure) => {
                    return Err(CopyError::Rejected(failure.message));
                }
                other => return Err(unexpected(other)),
            }
        }
    }
}

fn unexpected(message: Message) -> CopyError {
    CopyError::Protocol(format!("{:?}", message.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::conn::tests::connected_pair;
    use crate::migrate::file_copy::enumerate::{
        bundle_entries, external_entries,
    };
    use crate::migrate::file_copy::source::FileSender;
    use dispatcher_config::BundleLayout;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn copies_bundle_and_external_disks() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let home = src_dir.path().join("vm.pvm");
        let ext = src_dir.path().join("ext");
        fs::create_dir_all(home.join("snap")).unwrap();
        fs::create_dir_all(&ext).unwrap();
        let big: Vec<u8> = (0..(2 * CHUNK + 17)).map(|i| i as u8).collect();
        fs::write(home.join("disk.img"), &big).unwrap();
        fs::write(home.join("snap/empty"), b"").unwrap();
        fs::write(home.join("config.pvs"), "cfg").unwrap();
        bundle::set_permissions(&home.join("snap"), 0o700).unwrap();
        fs::write(ext.join("data.img"), b"external").unwrap();

        let mut plan =
            bundle_entries(&home, &BundleLayout::default()).unwrap();
        let mut external =
            external_entries(&[ext.join("data.img")], &[ext.clone()])
                .unwrap();
        // Both ends share one filesystem here, so point the external
        // entries somewhere else on the receiving side.
        let src_ext = ext.to_str().unwrap().to_string();
        let dst_ext = dst_dir.path().join("ext");
        for entry in external.dirs.iter_mut().chain(external.files.iter_mut())
        {
            entry.dest =
                entry.dest.replace(&src_ext, dst_ext.to_str().unwrap());
        }
        plan.extend(external);

        let target_home = dst_dir.path().join("vm.pvm");
        fs::create_dir_all(&target_home).unwrap();

        let ((src, src_in), (dst, dst_in)) = connected_pair(None, None).await;
        let mut src_events =
            TaskEvents::new(logger(), src_in, CancellationToken::new());
        let mut dst_events =
            TaskEvents::new(logger(), dst_in, CancellationToken::new());

        let mut receiver = FileReceiver::new(
            &logger(),
            target_home.clone(),
            vec![dst_dir.path().to_path_buf()],
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let (sent, received) = tokio::join!(
            FileSender::new(&logger(), &src, &mut src_events, TIMEOUT).send(
                Uuid::new_v4(),
                &plan,
                move |pct| seen_in.lock().unwrap().push(pct),
            ),
            receiver.receive(&dst, &mut dst_events, TIMEOUT),
        );
        sent.unwrap();
        received.unwrap();

        assert_eq!(fs::read(target_home.join("disk.img")).unwrap(), big);
        assert!(target_home.join("snap/empty").exists());
        assert!(!target_home.join("config.pvs").exists());
        assert_eq!(
            bundle::permissions(&target_home.join("snap")).unwrap(),
            0o700
        );
        assert_eq!(fs::read(dst_ext.join("data.img")).unwrap(), b"external");

        let pcts = seen.lock().unwrap().clone();
        assert_eq!(pcts.first(), Some(&0));
        assert_eq!(pcts.last(), Some(&100));
        assert!(pcts.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(
            receiver.created(),
            &[
                target_home.join("snap"),
                dst_ext.clone(),
                target_home.join("disk.img"),
                target_home.join("snap/empty"),
                dst_ext.join("data.img"),
            ]
        );
    }

    const CHUNK: usize = crate::migrate::file_copy::CHUNK_SIZE;

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(
            &logger(),
            dir.path().join("vm.pvm"),
            vec![PathBuf::from("/ext")],
        );
        assert!(receiver.resolve("a/b").is_ok());
        assert!(receiver.resolve("/ext/disk.img").is_ok());
        assert!(matches!(
            receiver.resolve("../outside"),
            Err(CopyError::EscapesRoot(_))
        ));
        assert!(matches!(
            receiver.resolve("/ext/../etc/passwd"),
            Err(CopyError::EscapesRoot(_))
        ));
        assert!(matches!(
            receiver.resolve("/other/disk.img"),
            Err(CopyError::EscapesRoot(_))
        ));
        assert!(receiver.resolve("").is_err());
    }

    #[tokio::test]
    async fn receiver_error_aborts_sender() {
        let src_dir = tempfile::tempdir().unwrap();
        let home = src_dir.path().join("vm.pvm");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join("disk.img"), b"data").unwrap();
        let plan = CopyPlanFixture::escaping(&home);

        let ((src, src_in), (dst, dst_in)) = connected_pair(None, None).await;
        let mut src_events =
            TaskEvents::new(logger(), src_in, CancellationToken::new());
        let mut dst_events =
            TaskEvents::new(logger(), dst_in, CancellationToken::new());
        let target = tempfile::tempdir().unwrap();
        let mut receiver =
            FileReceiver::new(&logger(), target.path().to_path_buf(), vec![]);

        let (sent, received) = tokio::join!(
            FileSender::new(&logger(), &src, &mut src_events, TIMEOUT)
                .send(Uuid::new_v4(), &plan, |_| {}),
            receiver.receive(&dst, &mut dst_events, TIMEOUT),
        );
        assert!(matches!(received, Err(CopyError::EscapesRoot(_))));
        assert!(matches!(sent, Err(CopyError::Rejected(_))));
        assert!(receiver.created().is_empty());
    }

    #[tokio::test]
    async fn cancelled_sender_stops() {
        let src_dir = tempfile::tempdir().unwrap();
        let home = src_dir.path().join("vm.pvm");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join("disk.img"), vec![1u8; CHUNK * 3]).unwrap();
        let plan = bundle_entries(&home, &BundleLayout::default()).unwrap();

        let ((src, src_in), (_dst, _dst_in)) = connected_pair(None, None).await;
        let token = CancellationToken::new();
        token.cancel();
        let mut src_events = TaskEvents::new(logger(), src_in, token);
        let res = FileSender::new(&logger(), &src, &mut src_events, TIMEOUT)
            .send(Uuid::new_v4(), &plan, |_| {})
            .await;
        assert!(matches!(res, Err(CopyError::Cancelled)));
    }

    struct CopyPlanFixture;

    impl CopyPlanFixture {
        fn escaping(home: &Path) -> super::super::CopyPlan {
            let mut plan = bundle_entries(home, &BundleLayout::default())
                .unwrap();
            plan.files[0].dest = "../escape.img".to_string();
            plan
        }
    }
}
