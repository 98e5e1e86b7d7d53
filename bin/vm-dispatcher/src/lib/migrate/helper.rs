// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry points that route migration sessions to tasks.

use std::sync::Arc;

use dispatcher_api_types::ErrorCode;
use slog::{info, warn};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::codec::Message;
use super::commands::Response;
use super::conn::Connection;
use super::target::TargetTask;
use super::{MigrateConn, MigrateError, ReservedFlags};
use crate::server::DispatcherContext;
use crate::tasks::{TaskHandle, TaskKind};

/// Negotiates a session a source opened and starts the target task that
/// serves it.
///
/// The first package must be the precondition check. Anything that keeps a
/// task from starting is answered here with an error Response.
pub async fn accept_session<T: MigrateConn + 'static>(
    ctx: &Arc<DispatcherContext>,
    ws: WebSocketStream<T>,
) -> Result<TaskHandle, MigrateError> {
    let ceiling = ctx.config.migration.max_protocol_version;
    let (conn, mut inbound) =
        Connection::accept(ws, ceiling, ctx.log.clone()).await?;
    let timeout = ctx.config.migration.default_timeout();

    let first = tokio::time::timeout(timeout, inbound.recv())
        .await
        .map_err(|_| MigrateError::Timeout("precondition check".into()))??;
    let check = match first.message {
        Message::CheckPreconditions(check) => check,
        other => {
            let err = MigrateError::UnexpectedMessage(format!(
                "{:?}",
                other.kind()
            ));
            refuse(&conn, first.id, Response::from_error(&err)).await;
            return Err(err);
        }
    };

    if check.reserved_flags().contains(ReservedFlags::CT_MIGRATE) {
        let err = MigrateError::Unimplemented;
        refuse(&conn, first.id, Response::from_error(&err)).await;
        return Err(err);
    }

    let vm_uuid = check.identity.vm_uuid;
    let check_id = first.id;
    let task_ctx = ctx.clone();
    let task_conn = conn.clone();
    let spawned = ctx.tasks.try_spawn(
        TaskKind::MigrateTarget,
        vm_uuid,
        &[TaskKind::MigrateTarget],
        move |cancel| {
            TargetTask::new(
                task_ctx, task_conn, inbound, check_id, check, cancel,
            )
            .run()
        },
    );
    match spawned {
        Ok(handle) => {
            info!(ctx.log, "migration in accepted"; "vm_uuid" => %vm_uuid);
            Ok(handle)
        }
        Err(_) => {
            warn!(ctx.log, "VM is already arriving"; "vm_uuid" => %vm_uuid);
            let response = Response::Error {
                code: ErrorCode::VmAlreadyMigratingOnTarget,
                message: format!("VM {vm_uuid} is already being received"),
                errors: Vec::new(),
            };
            refuse(&conn, check_id, response).await;
            Err(MigrateError::AlreadyMigrating(vm_uuid))
        }
    }
}

async fn refuse(conn: &Connection, to: u64, response: Response) {
    let mut job = conn.reply(to, Message::Response(response));
    let _ = conn
        .wait_for_send(&mut job, std::time::Duration::from_secs(5))
        .await;
    conn.close();
}

/// Asks every migration task serving `vm_uuid` to stop. Returns whether
/// there was one.
pub fn cancel_migration(ctx: &DispatcherContext, vm_uuid: Uuid) -> bool {
    ctx.tasks.cancel(vm_uuid, TaskKind::ALL_MIGRATIONS)
}
