// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixtures shared by unit tests.

use std::sync::Arc;

use crate::connector::ConnectorDefinition;
use crate::encrypt::AesGcmEncryptService;
use crate::labels::Labels;
use crate::persistence::SqlitePersistence;
use crate::service::CoreService;
use crate::tasks::MemoryTaskQueue;

/// Service over a fresh in-memory database and queue.
pub(crate) async fn service() -> (CoreService, Arc<MemoryTaskQueue>) {
    let queue = Arc::new(MemoryTaskQueue::new());
    let service = CoreService::builder()
        .store(Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("in-memory store"),
        ))
        .encrypt(Arc::new(AesGcmEncryptService::new([42u8; 32])))
        .queue(queue.clone())
        .build()
        .expect("service");
    (service, queue)
}

/// Definition labelled `type=<kind>`.
pub(crate) fn definition(kind: &str, display_name: &str) -> ConnectorDefinition {
    let mut labels = Labels::new();
    labels.insert("type".to_string(), kind.to_string());
    ConnectorDefinition::new(display_name, labels)
}
