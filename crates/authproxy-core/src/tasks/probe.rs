// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{Task, TaskError, TaskHandler};
use crate::service::CoreService;

/// Payload of a `probe:invoke` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeProbePayload {
    /// Connection to probe.
    pub connection_id: Uuid,
    /// Probe id within the connection's connector version.
    pub probe_id: String,
}

/// Runs one probe against one connection and records the outcome.
pub struct InvokeProbeHandler {
    service: CoreService,
}

impl InvokeProbeHandler {
    /// Create a handler backed by `service`.
    pub fn new(service: CoreService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for InvokeProbeHandler {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        let payload: InvokeProbePayload = task.decode()?;

        match self
            .service
            .invoke_probe(payload.connection_id, &payload.probe_id)
            .await
        {
            Ok(outcome) => {
                debug!(
                    connection_id = %payload.connection_id,
                    probe_id = %payload.probe_id,
                    outcome = %outcome.outcome,
                    "Probe invoked"
                );
                Ok(())
            }
            // The connection or its probe went away since scheduling.
            Err(e) if e.is_not_found() => Err(TaskError::SkipRetry(e.to_string())),
            Err(e) => Err(TaskError::classify(e)),
        }
    }
}
