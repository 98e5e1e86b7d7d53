// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helper types for publishing VM events and migration states to the
//! dispatcher's clients.

use std::sync::Arc;

use chrono::Utc;
use dispatcher_api_types::{
    CheckError, DispatcherEvent, DispatcherEventKind, MigrationDirection,
    MigrationMonitorResponse, MigrationState, MigrationStatus,
};
use slog::{debug, info, warn};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::migrate::commands::VmIdentity;
use crate::migrate::MigrateRole;

const EVENT_CHANNEL_DEPTH: usize = 256;

pub struct MigrationStateUpdate {
    pub id: Uuid,
    pub vm_uuid: Uuid,
    pub role: MigrateRole,
    pub state: MigrationState,
    pub progress: u8,
}

impl MigrationStateUpdate {
    fn apply_to(
        self,
        old: &MigrationMonitorResponse,
    ) -> MigrationMonitorResponse {
        let direction = match self.role {
            MigrateRole::Source => MigrationDirection::Out,
            MigrateRole::Target => MigrationDirection::In,
        };
        let new = MigrationStatus {
            id: self.id,
            vm_uuid: self.vm_uuid,
            direction,
            state: self.state,
            progress: self.progress,
        };
        match self.role {
            MigrateRole::Target => MigrationMonitorResponse {
                gen: old.gen + 1,
                migration_in: Some(new),
                migration_out: old.migration_out.clone(),
            },
            MigrateRole::Source => MigrationMonitorResponse {
                gen: old.gen + 1,
                migration_in: old.migration_in.clone(),
                migration_out: Some(new),
            },
        }
    }
}

/// Fan-out of dispatcher events plus the latest migration statuses.
///
/// Cloning yields another handle onto the same channels.
#[derive(Clone)]
pub struct EventPublisher {
    events: broadcast::Sender<DispatcherEvent>,
    migration: Arc<watch::Sender<MigrationMonitorResponse>>,
    log: slog::Logger,
}

impl EventPublisher {
    pub fn new(log: &slog::Logger) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (migration, _) =
            watch::channel(MigrationMonitorResponse::default());
        Self { events, migration: Arc::new(migration), log: log.clone() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    pub fn migration_monitor(
        &self,
    ) -> watch::Receiver<MigrationMonitorResponse> {
        self.migration.subscribe()
    }

    pub fn emit(&self, vm: &VmIdentity, kind: DispatcherEventKind) {
        debug!(self.log, "publishing event";
               "vm_uuid" => %vm.vm_uuid,
               "event" => ?kind);
        let event = DispatcherEvent {
            vm_uuid: vm.vm_uuid,
            dir_uuid: vm.dir_uuid,
            kind,
            at: Utc::now(),
        };
        // Nobody listening is not an error.
        let _ = self.events.send(event);
    }

    pub fn warn(&self, vm: &VmIdentity, warning: CheckError) {
        warn!(self.log, "migration warning";
              "vm_uuid" => %vm.vm_uuid,
              "warning" => %warning);
        self.emit(vm, DispatcherEventKind::Warning(warning));
    }

    pub fn update_migration(&self, update: MigrationStateUpdate) {
        self.migration.send_modify(|current| {
            let next = update.apply_to(current);
            info!(self.log, "publishing new migration state";
                  "gen" => next.gen,
                  "migration_in" => ?next.migration_in,
                  "migration_out" => ?next.migration_out);
            *current = next;
        });
    }
}
