// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds and issues the telemetry calls on top of the connection manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use collector_proto::{
    AggregateStreamMessage, Environment, GaugeValue, GaugeValueMessage, InitMessage, InitResponse,
    LogEvent, LogMessage, TraceQuery, TraceStreamMessage,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config_sync::{ConfigSyncMarker, LocalConfigService};
use crate::connection::{CallSpec, ConnectionManager, RemoteLogging};
use crate::dedup::{PayloadDedupCache, SharedTextIndex, Truncation};
use crate::error::{ExportError, Status};
use crate::identity::AgentIdentity;
use crate::version::{compare_versions, VersionCheck};

/// Retry budget for an aggregate upload when the collector has not suggested one.
pub const DEFAULT_AGGREGATE_BUDGET: Duration = Duration::from_secs(30);
pub const MAX_AGGREGATE_BUDGET: Duration = Duration::from_secs(30);
/// Logger name of the startup banner, which is never forwarded.
pub const STARTUP_LOGGER_NAME: &str = "agent.startup";

const INIT: CallSpec = CallSpec::new("init");
const RESEND_INIT: CallSpec = CallSpec::new("init (resend)");
const GAUGES: CallSpec = CallSpec::new("gauge values");
const AGGREGATES: CallSpec = CallSpec::new("aggregates");
const TRACE: CallSpec = CallSpec::new("trace");
const LOG: CallSpec = CallSpec::new("log").with_remote_logging(RemoteLogging::Suppressed);

/// One transaction group of an aggregate upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateGroup {
    pub transaction_type: String,
    /// `None` for the overall aggregate of the transaction type.
    pub transaction_name: Option<String>,
    /// Query texts referenced by the payload, in payload order.
    pub query_texts: Vec<String>,
    pub payload: Vec<u8>,
}

/// Captured aggregate data. `read` is called once per attempt and must
/// return the same groups every time.
pub trait AggregateReader: Send + Sync {
    fn capture_time(&self) -> i64;

    fn read(&self) -> Result<Vec<AggregateGroup>, ExportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub query_text: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceQueryRecord {
    pub query_text: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceContents {
    pub header: Vec<u8>,
    pub entries: Vec<TraceEntry>,
    pub queries: Vec<TraceQueryRecord>,
    pub main_thread_profile: Option<Vec<u8>>,
    pub aux_thread_profile: Option<Vec<u8>>,
}

/// A captured trace. A partial trace is still being captured and reading it
/// twice may not yield the same bytes.
pub trait TraceReader: Send + Sync {
    fn trace_id(&self) -> &str;

    fn is_partial(&self) -> bool;

    /// True when this upload replaces an earlier upload of the same trace.
    fn is_update(&self) -> bool;

    fn read(&self) -> Result<TraceContents, ExportError>;
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TelemetryExporter {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<ConnectionManager>,
    identity: AgentIdentity,
    agent_version: String,
    dedup: PayloadDedupCache,
    marker: ConfigSyncMarker,
    local_config: Arc<dyn LocalConfigService>,
    next_aggregate_delay_millis: AtomicU64,
    last_init: Mutex<Option<InitMessage>>,
    version_notice_logged: AtomicBool,
}

impl TelemetryExporter {
    pub fn new(
        manager: Arc<ConnectionManager>,
        identity: AgentIdentity,
        agent_version: impl Into<String>,
        marker: ConfigSyncMarker,
        local_config: Arc<dyn LocalConfigService>,
    ) -> Self {
        Self::with_dedup_cache(
            manager,
            identity,
            agent_version,
            marker,
            local_config,
            PayloadDedupCache::default(),
        )
    }

    pub fn with_dedup_cache(
        manager: Arc<ConnectionManager>,
        identity: AgentIdentity,
        agent_version: impl Into<String>,
        marker: ConfigSyncMarker,
        local_config: Arc<dyn LocalConfigService>,
        dedup: PayloadDedupCache,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                identity,
                agent_version: agent_version.into(),
                dedup,
                marker,
                local_config,
                next_aggregate_delay_millis: AtomicU64::new(0),
                last_init: Mutex::new(None),
                version_notice_logged: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    pub fn dedup_cache(&self) -> &PayloadDedupCache {
        &self.inner.dedup
    }

    /// Retry budget the next aggregate upload will get.
    pub fn next_aggregate_budget(&self) -> Duration {
        aggregate_budget(self.inner.next_aggregate_delay_millis.load(Ordering::Relaxed))
    }

    /// Sends identity, environment and the local config snapshot, retrying
    /// until the collector answers or the manager closes.
    pub async fn handshake(&self, environment: Environment) -> Result<InitResponse, ExportError> {
        self.inner.handshake(environment).await
    }

    pub fn send_gauge_values(
        &self,
        gauge_values: Vec<GaugeValue>,
    ) -> JoinHandle<Result<(), ExportError>> {
        let inner = self.inner.clone();
        self.inner
            .manager
            .spawn(async move { inner.send_gauge_values(gauge_values).await })
    }

    pub fn send_aggregates(
        &self,
        reader: Arc<dyn AggregateReader>,
    ) -> JoinHandle<Result<(), ExportError>> {
        let inner = self.inner.clone();
        self.inner
            .manager
            .spawn(async move { inner.send_aggregates(reader.as_ref()).await })
    }

    pub fn send_trace(&self, reader: Arc<dyn TraceReader>) -> JoinHandle<Result<(), ExportError>> {
        let inner = self.inner.clone();
        self.inner
            .manager
            .spawn(async move { inner.send_trace(reader.as_ref()).await })
    }

    /// Forwards a log event. Returns `None` when the event is not forwarded at all.
    pub fn send_log(
        &self,
        event: LogEvent,
        remote_logging: RemoteLogging,
    ) -> Option<JoinHandle<Result<(), ExportError>>> {
        if remote_logging.is_suppressed() || event.logger_name == STARTUP_LOGGER_NAME {
            return None;
        }
        let inner = self.inner.clone();
        Some(
            self.inner
                .manager
                .spawn(async move { inner.send_log(event).await }),
        )
    }
}

fn aggregate_budget(next_delay_millis: u64) -> Duration {
    if next_delay_millis == 0 {
        DEFAULT_AGGREGATE_BUDGET
    } else {
        Duration::from_millis(next_delay_millis).min(MAX_AGGREGATE_BUDGET)
    }
}

impl Inner {
    fn agent_id(&self) -> &str {
        self.identity.as_str()
    }

    async fn handshake(&self, environment: Environment) -> Result<InitResponse, ExportError> {
        let synced = self.marker.is_synced_for(self.agent_id())?;
        let read_only = self.local_config.is_read_only();
        let overwrite = !synced || read_only;

        let message = InitMessage {
            agent_id: self.agent_id().to_string(),
            agent_version: self.agent_version.clone(),
            environment,
            agent_config: self.local_config.snapshot(),
            overwrite_existing_agent_config: overwrite,
        };
        *lock(&self.last_init) = Some(message.clone());

        let response = self
            .manager
            .call_handshake(INIT, |transport| {
                let message = message.clone();
                async move { transport.init(message).await }
            })
            .await?;
        info!(collector_version = %response.collector_version, "connected to the collector");

        self.check_collector_version(&response.collector_version);

        if !overwrite {
            if let Some(config) = response.agent_config.clone() {
                if let Err(e) = self.local_config.overwrite_from_collector(config) {
                    warn!("unable to apply agent config from the collector: {e}");
                }
            }
        }
        if !synced {
            if let Err(e) = self.marker.write(self.agent_id()) {
                warn!("{e}");
            }
        }
        Ok(response)
    }

    fn check_collector_version(&self, collector_version: &str) {
        match compare_versions(&self.agent_version, collector_version) {
            VersionCheck::AgentNewer => warn!(
                agent_version = %self.agent_version,
                collector_version,
                "agent is newer than the collector, upgrade the collector"
            ),
            VersionCheck::Compatible => {}
            VersionCheck::Unparsable => {
                if !self.version_notice_logged.swap(true, Ordering::Relaxed) {
                    info!(
                        agent_version = %self.agent_version,
                        collector_version,
                        "unable to compare agent and collector versions"
                    );
                }
            }
        }
    }

    async fn send_gauge_values(&self, gauge_values: Vec<GaugeValue>) -> Result<(), ExportError> {
        let message = GaugeValueMessage {
            agent_id: self.agent_id().to_string(),
            gauge_values,
        };
        let response = self
            .manager
            .call_with_retries(GAUGES, self.manager.settings().max_total, |transport| {
                let message = message.clone();
                async move { transport.collect_gauge_values(message).await }
            })
            .await?;

        if response.resend_init {
            self.resend_init().await;
        }
        Ok(())
    }

    /// One unretried handshake with the last init message.
    async fn resend_init(&self) {
        let Some(message) = lock(&self.last_init).clone() else {
            debug!("collector asked for init before the first handshake");
            return;
        };
        let result = self
            .manager
            .call_once(RESEND_INIT, |transport| {
                let message = message.clone();
                async move { transport.init(message).await }
            })
            .await;
        match result {
            Ok(_) => debug!("re-sent init at the collector's request"),
            Err(e) => debug!("unable to re-send init: {e}"),
        }
    }

    async fn send_aggregates(&self, reader: &dyn AggregateReader) -> Result<(), ExportError> {
        let budget = aggregate_budget(self.next_aggregate_delay_millis.load(Ordering::Relaxed));
        // a reader failure completes the call without touching the transport
        let (response, pending) = self
            .manager
            .call_with_retries(AGGREGATES, budget, |transport| {
                let frames = self.aggregate_frames(reader);
                async move {
                    let (frames, pending) = match frames {
                        Ok(built) => built,
                        Err(e) => return Ok::<_, Status>(Err(e)),
                    };
                    let response = transport.collect_aggregate_stream(frames).await?;
                    Ok::<_, Status>(Ok((response, pending)))
                }
            })
            .await??;

        self.dedup.mark_seen(pending);
        self.next_aggregate_delay_millis
            .store(response.next_delay_millis, Ordering::Relaxed);
        Ok(())
    }

    fn aggregate_frames(
        &self,
        reader: &dyn AggregateReader,
    ) -> Result<(Vec<AggregateStreamMessage>, Vec<String>), ExportError> {
        let groups = reader.read()?;
        let mut texts = SharedTextIndex::new(&self.dedup, Truncation::Head);
        let mut frames = vec![AggregateStreamMessage::StreamHeader {
            agent_id: self.agent_id().to_string(),
            capture_time: reader.capture_time(),
        }];

        for group in groups {
            let mut indexes = Vec::with_capacity(group.query_texts.len());
            for text in &group.query_texts {
                let (index, frame) = texts.index_of(text);
                if let Some(frame) = frame {
                    frames.push(AggregateStreamMessage::SharedQueryText(frame));
                }
                indexes.push(index);
            }
            frames.push(match group.transaction_name {
                None => AggregateStreamMessage::OverallAggregate {
                    transaction_type: group.transaction_type,
                    shared_query_text_indexes: indexes,
                    payload: group.payload,
                },
                Some(transaction_name) => AggregateStreamMessage::TransactionAggregate {
                    transaction_type: group.transaction_type,
                    transaction_name,
                    shared_query_text_indexes: indexes,
                    payload: group.payload,
                },
            });
        }
        Ok((frames, texts.into_pending_hashes()))
    }

    async fn send_trace(&self, reader: &dyn TraceReader) -> Result<(), ExportError> {
        let call = |transport: Arc<dyn crate::transport::CollectorTransport>| {
            let frames = self.trace_frames(reader);
            async move {
                let (frames, pending) = match frames {
                    Ok(built) => built,
                    Err(e) => return Ok::<_, Status>(Err(e)),
                };
                transport.collect_trace_stream(frames).await?;
                Ok::<_, Status>(Ok(pending))
            }
        };
        let result = if reader.is_partial() {
            self.manager.call_once(TRACE, call).await
        } else {
            self.manager
                .call_with_retries(TRACE, self.manager.settings().max_total, call)
                .await
        };
        let pending = result??;
        self.dedup.mark_seen(pending);
        Ok(())
    }

    fn trace_frames(
        &self,
        reader: &dyn TraceReader,
    ) -> Result<(Vec<TraceStreamMessage>, Vec<String>), ExportError> {
        let contents = reader.read()?;
        let mut texts = SharedTextIndex::new(&self.dedup, Truncation::HeadAndTail);
        let mut shared = Vec::new();
        let mut frames = vec![TraceStreamMessage::StreamHeader {
            agent_id: self.agent_id().to_string(),
            trace_id: reader.trace_id().to_string(),
            update: reader.is_update(),
        }];

        let entry_count = contents.entries.len() as u32;
        for entry in contents.entries {
            let shared_query_text_index = entry.query_text.as_deref().map(|text| {
                let (index, frame) = texts.index_of(text);
                shared.extend(frame.map(TraceStreamMessage::SharedQueryText));
                index
            });
            frames.push(TraceStreamMessage::Entry {
                shared_query_text_index,
                payload: entry.payload,
            });
        }

        if !contents.queries.is_empty() {
            let queries = contents
                .queries
                .into_iter()
                .map(|query| {
                    let (index, frame) = texts.index_of(&query.query_text);
                    shared.extend(frame.map(TraceStreamMessage::SharedQueryText));
                    TraceQuery {
                        shared_query_text_index: index,
                        payload: query.payload,
                    }
                })
                .collect();
            frames.push(TraceStreamMessage::Queries { queries });
        }

        frames.append(&mut shared);
        if let Some(payload) = contents.main_thread_profile {
            frames.push(TraceStreamMessage::MainThreadProfile { payload });
        }
        if let Some(payload) = contents.aux_thread_profile {
            frames.push(TraceStreamMessage::AuxThreadProfile { payload });
        }
        frames.push(TraceStreamMessage::Header {
            payload: contents.header,
        });
        frames.push(TraceStreamMessage::StreamCounts {
            entry_count,
            shared_query_text_count: texts.count(),
        });
        Ok((frames, texts.into_pending_hashes()))
    }

    async fn send_log(&self, log_event: LogEvent) -> Result<(), ExportError> {
        let message = LogMessage {
            agent_id: self.agent_id().to_string(),
            log_event,
        };
        self.manager
            .call_with_retries(LOG, self.manager.settings().max_total, |transport| {
                let message = message.clone();
                async move { transport.log(message).await }
            })
            .await?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
