// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use collector_proto::AgentResponse;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no downstream connection became available within {0:?}")]
pub struct SinkUnavailable(pub Duration);

/// Single-slot handoff of the current downstream writer.
///
/// A reconnect replaces the writer atomically. Writers that find no writer,
/// or whose writer was torn down mid-send, wait for the next one instead of
/// failing the command.
#[derive(Debug)]
pub struct ResponseSink {
    slot: watch::Sender<Option<mpsc::Sender<AgentResponse>>>,
}

impl Default for ResponseSink {
    fn default() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }
}

impl ResponseSink {
    pub fn install(&self, writer: mpsc::Sender<AgentResponse>) {
        self.slot.send_replace(Some(writer));
    }

    pub fn clear(&self) {
        self.slot.send_replace(None);
    }

    pub fn is_installed(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub async fn send(&self, response: AgentResponse, wait: Duration) -> Result<(), SinkUnavailable> {
        let deadline = Instant::now() + wait;
        let mut slot = self.slot.subscribe();
        let mut response = response;
        let mut failed: Option<mpsc::Sender<AgentResponse>> = None;

        loop {
            let writer = {
                let writer = tokio::time::timeout_at(
                    deadline,
                    slot.wait_for(|current| match (current, &failed) {
                        (Some(writer), Some(failed)) => !writer.same_channel(failed),
                        (Some(_), None) => true,
                        (None, _) => false,
                    }),
                )
                .await;
                match writer {
                    Ok(Ok(current)) => current.clone(),
                    _ => return Err(SinkUnavailable(wait)),
                }
            };
            let Some(writer) = writer else {
                return Err(SinkUnavailable(wait));
            };

            match writer.send(response).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    response = returned;
                    failed = Some(writer);
                }
            }
        }
    }
}
