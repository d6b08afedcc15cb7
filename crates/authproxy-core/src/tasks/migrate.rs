// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;

use super::{Task, TaskError, TaskHandler};
use crate::service::CoreService;

/// Runs [`CoreService::migrate`] for the configured connectors.
///
/// A rejected batch is not retried; lock timeouts and store failures are.
pub struct MigrateConnectorsHandler {
    service: CoreService,
}

impl MigrateConnectorsHandler {
    /// Create a handler backed by `service`.
    pub fn new(service: CoreService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for MigrateConnectorsHandler {
    async fn handle(&self, _task: &Task) -> Result<(), TaskError> {
        self.service.migrate().await?;
        Ok(())
    }
}
