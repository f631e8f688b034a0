// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted transport and collaborator mocks for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use agent_exporter::command::{DiagnosticsService, HeapDumpFile, TraceDetailSource};
use agent_exporter::config_sync::LocalConfigService;
use agent_exporter::error::{CommandError, Status};
use agent_exporter::exporter::{AggregateGroup, AggregateReader, TraceContents, TraceReader};
use agent_exporter::error::ExportError;
use agent_exporter::proto::*;
use agent_exporter::transport::{CollectorTransport, DownstreamStream};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Queue of canned results; `Ok(T::default())` once exhausted.
pub struct Script<T> {
    results: Mutex<VecDeque<Result<T, Status>>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T: Default> Script<T> {
    pub fn push(&self, result: Result<T, Status>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn push_errors(&self, status: Status, count: usize) {
        for _ in 0..count {
            self.push(Err(status.clone()));
        }
    }

    fn next(&self) -> Result<T, Status> {
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(T::default()))
    }
}

/// Test side of an open downstream stream.
pub struct DownstreamHandle {
    pub requests: mpsc::Sender<Result<CentralRequest, Status>>,
    pub responses: mpsc::Receiver<AgentResponse>,
}

pub fn downstream_pair() -> (DownstreamStream, DownstreamHandle) {
    let (outbound, responses) = mpsc::channel(16);
    let (requests, inbound) = mpsc::channel(16);
    (
        DownstreamStream { outbound, inbound },
        DownstreamHandle {
            requests,
            responses,
        },
    )
}

#[derive(Default)]
pub struct ScriptedTransport {
    pub init: Script<InitResponse>,
    pub gauges: Script<GaugeValueResponse>,
    pub aggregates: Script<AggregateResponse>,
    pub traces: Script<()>,
    pub logs: Script<()>,
    downstreams: Mutex<VecDeque<DownstreamStream>>,

    pub init_calls: Mutex<Vec<InitMessage>>,
    pub gauge_calls: Mutex<Vec<GaugeValueMessage>>,
    pub aggregate_calls: Mutex<Vec<Vec<AggregateStreamMessage>>>,
    pub trace_calls: Mutex<Vec<Vec<TraceStreamMessage>>>,
    pub log_calls: Mutex<Vec<LogMessage>>,
    pub downstream_connects: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    /// The next `connect_downstream` succeeds with `stream`; without a queued
    /// stream it fails with `UNAVAILABLE`.
    pub fn push_downstream(&self, stream: DownstreamStream) {
        self.downstreams.lock().unwrap().push_back(stream);
    }

    pub fn init_count(&self) -> usize {
        self.init_calls.lock().unwrap().len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate_calls.lock().unwrap().len()
    }

    pub fn trace_count(&self) -> usize {
        self.trace_calls.lock().unwrap().len()
    }

    pub fn log_count(&self) -> usize {
        self.log_calls.lock().unwrap().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.downstream_connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl CollectorTransport for ScriptedTransport {
    async fn init(&self, message: InitMessage) -> Result<InitResponse, Status> {
        self.init_calls.lock().unwrap().push(message);
        self.init.next()
    }

    async fn collect_gauge_values(
        &self,
        message: GaugeValueMessage,
    ) -> Result<GaugeValueResponse, Status> {
        self.gauge_calls.lock().unwrap().push(message);
        self.gauges.next()
    }

    async fn collect_aggregate_stream(
        &self,
        frames: Vec<AggregateStreamMessage>,
    ) -> Result<AggregateResponse, Status> {
        self.aggregate_calls.lock().unwrap().push(frames);
        self.aggregates.next()
    }

    async fn collect_trace_stream(&self, frames: Vec<TraceStreamMessage>) -> Result<(), Status> {
        self.trace_calls.lock().unwrap().push(frames);
        self.traces.next()
    }

    async fn log(&self, message: LogMessage) -> Result<(), Status> {
        self.log_calls.lock().unwrap().push(message);
        self.logs.next()
    }

    async fn connect_downstream(&self) -> Result<DownstreamStream, Status> {
        self.downstream_connects.lock().unwrap().push(Instant::now());
        self.downstreams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Status::unavailable("connection refused"))
    }
}

pub struct MockLocalConfig {
    pub config: AgentConfig,
    pub read_only: bool,
    pub applied: Mutex<Vec<AgentConfig>>,
}

impl MockLocalConfig {
    pub fn new(read_only: bool) -> Self {
        Self {
            config: AgentConfig(serde_json::json!({"transactions": {"slowThresholdMillis": 2000}})),
            read_only,
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn applied(&self) -> Vec<AgentConfig> {
        self.applied.lock().unwrap().clone()
    }
}

impl LocalConfigService for MockLocalConfig {
    fn snapshot(&self) -> AgentConfig {
        self.config.clone()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn overwrite_from_collector(&self, config: AgentConfig) -> Result<(), CommandError> {
        self.applied.lock().unwrap().push(config);
        Ok(())
    }
}

/// Diagnostics whose heap dump fails and whose explicit GC panics.
#[derive(Default)]
pub struct MockDiagnostics {
    pub calls: AtomicU32,
}

impl MockDiagnostics {
    fn called(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiagnosticsService for MockDiagnostics {
    async fn thread_dump(&self) -> Result<Vec<u8>, CommandError> {
        self.called();
        Ok(vec![1, 2, 3])
    }

    async fn jstack(&self) -> Result<String, CommandError> {
        self.called();
        Ok("\"main\" #1 prio=5".to_string())
    }

    async fn available_disk_space(&self, _directory: &str) -> Result<i64, CommandError> {
        self.called();
        Ok(1 << 30)
    }

    async fn heap_dump(&self, directory: &str) -> Result<HeapDumpFile, CommandError> {
        self.called();
        Err(CommandError::failed(format!("no space left in {directory}")))
    }

    async fn heap_histogram(&self) -> Result<Vec<u8>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn explicit_gc(&self) -> Result<(), CommandError> {
        self.called();
        panic!("gc exploded");
    }

    async fn mbean_tree(
        &self,
        _include_attrs_for_object_names: &[String],
    ) -> Result<Vec<u8>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn mbean_meta(&self, _object_name: &str) -> Result<Vec<u8>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn capabilities(&self) -> Result<Vec<u8>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn global_meta(&self) -> Result<Vec<u8>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn preload_classpath_cache(&self) -> Result<(), CommandError> {
        self.called();
        Ok(())
    }

    async fn matching_class_names(
        &self,
        partial_class_name: &str,
        limit: u32,
    ) -> Result<Vec<String>, CommandError> {
        self.called();
        Ok(["com.example.Foo", "com.example.FooBar", "org.other.Foo"]
            .iter()
            .filter(|name| name.contains(partial_class_name))
            .take(limit as usize)
            .map(|name| name.to_string())
            .collect())
    }

    async fn matching_method_names(
        &self,
        _class_name: &str,
        _partial_method_name: &str,
        _limit: u32,
    ) -> Result<Vec<String>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn method_signatures(
        &self,
        _class_name: &str,
        _method_name: &str,
    ) -> Result<Vec<MethodSignature>, CommandError> {
        self.called();
        Ok(Vec::new())
    }

    async fn reweave(&self) -> Result<u32, CommandError> {
        self.called();
        Ok(3)
    }

    async fn update_agent_config(&self, _agent_config: AgentConfig) -> Result<(), CommandError> {
        self.called();
        Ok(())
    }
}

/// Holds a single trace, `"known"`.
pub struct MockTraceSource;

impl MockTraceSource {
    fn lookup(trace_id: &str, payload: u8) -> Result<Option<Vec<u8>>, CommandError> {
        Ok((trace_id == "known").then(|| vec![payload]))
    }
}

#[async_trait]
impl TraceDetailSource for MockTraceSource {
    async fn header(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Self::lookup(trace_id, 1)
    }

    async fn entries(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Self::lookup(trace_id, 2)
    }

    async fn queries(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Self::lookup(trace_id, 3)
    }

    async fn main_thread_profile(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Self::lookup(trace_id, 4)
    }

    async fn aux_thread_profile(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Self::lookup(trace_id, 5)
    }

    async fn full_trace(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Self::lookup(trace_id, 6)
    }
}

pub struct StaticAggregateReader {
    pub capture_time: i64,
    pub groups: Vec<AggregateGroup>,
    pub fail: bool,
    pub reads: AtomicU32,
}

impl StaticAggregateReader {
    pub fn new(groups: Vec<AggregateGroup>) -> Self {
        Self {
            capture_time: 60_000,
            groups,
            fail: false,
            reads: AtomicU32::new(0),
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl AggregateReader for StaticAggregateReader {
    fn capture_time(&self) -> i64 {
        self.capture_time
    }

    fn read(&self) -> Result<Vec<AggregateGroup>, ExportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExportError::Reader("aggregate file truncated".to_string()));
        }
        Ok(self.groups.clone())
    }
}

pub struct StaticTraceReader {
    pub trace_id: String,
    pub partial: bool,
    pub contents: TraceContents,
}

impl TraceReader for StaticTraceReader {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn is_partial(&self) -> bool {
        self.partial
    }

    fn is_update(&self) -> bool {
        false
    }

    fn read(&self) -> Result<TraceContents, ExportError> {
        Ok(self.contents.clone())
    }
}
