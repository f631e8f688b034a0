// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP + WebSocket collector transport.
//!
//! Unary calls are JSON `POST`s, client streams are newline-delimited JSON
//! bodies, and the downstream command stream is a WebSocket carrying one JSON
//! message per text frame.

use std::time::Duration;

use async_trait::async_trait;
use collector_proto::{
    AgentResponse, AggregateResponse, AggregateStreamMessage, CentralRequest, GaugeValueMessage,
    GaugeValueResponse, InitMessage, InitResponse, LogMessage, TraceStreamMessage,
};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderValue, CONTENT_TYPE, HOST};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue as WsHeaderValue, HOST as WS_HOST,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{client_async_tls_with_config, connect_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{CollectorTransport, DownstreamStream};
use crate::address::{ResolvedEndpoint, ResolvedTargets, RoundRobin, Scheme};
use crate::error::{Code, ConfigError, Status};

const INIT_ENDPOINT: &str = "/v1/init";
const GAUGES_ENDPOINT: &str = "/v1/gauges";
const AGGREGATES_ENDPOINT: &str = "/v1/aggregates";
const TRACES_ENDPOINT: &str = "/v1/traces";
const LOG_ENDPOINT: &str = "/v1/log";
const DOWNSTREAM_ENDPOINT: &str = "/v1/downstream";

const JSON_CONTENT_TYPE: &str = "application/json";
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const DOWNSTREAM_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    /// Timeout applied to each HTTP request.
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("agent-exporter/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

struct Endpoint {
    base_url: String,
    ws_url: String,
    client: Client,
    resolved: ResolvedEndpoint,
}

/// Transport over the resolved collector endpoints, picked round robin per call.
pub struct HttpTransport {
    endpoints: RoundRobin<Endpoint>,
    authority: Option<String>,
    io_tasks: TaskTracker,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(
        resolved: ResolvedTargets,
        options: &HttpTransportOptions,
    ) -> Result<Self, ConfigError> {
        let scheme = resolved.scheme;
        let endpoints = resolved
            .endpoints
            .into_iter()
            .map(|endpoint| build_endpoint(scheme, endpoint, options))
            .collect::<Result<Vec<_>, _>>()?;
        let endpoints = RoundRobin::new(endpoints)
            .ok_or_else(|| ConfigError::InvalidConfig("no collector endpoints".to_string()))?;

        Ok(Self {
            endpoints,
            authority: resolved.authority,
            io_tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the body of a successful response.
    async fn post(
        &self,
        path: &str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        let endpoint = self.endpoints.pick();
        let url = format!("{}{}", endpoint.base_url, path);
        debug!(url = %url, body_len = body.len(), "collector HTTP request");

        let mut builder = endpoint
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if let Some(authority) = &self.authority {
            let value = HeaderValue::from_str(authority)
                .map_err(|_| Status::new(Code::InvalidArgument, "invalid authority override"))?;
            builder = builder.header(HOST, value);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        debug!(url = %url, status = %status, "collector HTTP response");

        if let Err(mut error) = classify_status(status) {
            let body = String::from_utf8_lossy(&bytes);
            if !body.is_empty() {
                error.message = format!("{}: {}", error.message, body);
            }
            return Err(error);
        }
        Ok(bytes.to_vec())
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Vec<u8>, Status> {
        let body = serde_json::to_vec(body).map_err(encode_error)?;
        self.post(path, JSON_CONTENT_TYPE, body).await
    }

    async fn post_stream<F: Serialize>(&self, path: &str, frames: &[F]) -> Result<Vec<u8>, Status> {
        let body = encode_ndjson(frames)?;
        self.post(path, NDJSON_CONTENT_TYPE, body).await
    }
}

fn build_endpoint(
    scheme: Scheme,
    resolved: ResolvedEndpoint,
    options: &HttpTransportOptions,
) -> Result<Endpoint, ConfigError> {
    let host_port = resolved.target.host_port();
    let mut builder = Client::builder()
        .timeout(options.request_timeout)
        .user_agent(options.user_agent.clone());
    if let Some(addr) = resolved.addr {
        // keep the host name for TLS verification while pinning the resolved address
        builder = builder.resolve(&resolved.target.host, addr);
    }
    let client = builder
        .build()
        .map_err(|e| ConfigError::InvalidConfig(format!("unable to build HTTP client: {e}")))?;

    Ok(Endpoint {
        base_url: format!("{}://{}", scheme.http(), host_port),
        ws_url: format!("{}://{}", scheme.websocket(), host_port),
        client,
        resolved,
    })
}

/// Maps HTTP status codes onto transport status codes.
fn classify_status(status: StatusCode) -> Result<(), Status> {
    if status.is_success() {
        return Ok(());
    }
    let code = match status {
        StatusCode::TOO_MANY_REQUESTS => Code::ResourceExhausted,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Code::DeadlineExceeded,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Code::Unauthenticated,
        StatusCode::PRECONDITION_FAILED => Code::FailedPrecondition,
        StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => Code::Unimplemented,
        s if s.is_server_error() => Code::Unavailable,
        _ => Code::InvalidArgument,
    };
    Err(Status::new(code, format!("HTTP status {}", status.as_u16())))
}

fn map_reqwest_error(error: reqwest::Error) -> Status {
    if error.is_timeout() {
        Status::new(Code::DeadlineExceeded, error.to_string())
    } else {
        Status::unavailable(error.to_string())
    }
}

fn encode_error(error: serde_json::Error) -> Status {
    Status::new(Code::InvalidArgument, format!("unable to encode request: {error}"))
}

fn encode_ndjson<F: Serialize>(frames: &[F]) -> Result<Vec<u8>, Status> {
    let mut body = Vec::new();
    for frame in frames {
        serde_json::to_writer(&mut body, frame).map_err(encode_error)?;
        body.push(b'\n');
    }
    Ok(body)
}

/// Decodes the body of an accepted call.
///
/// The collector already took the request, so a body that cannot be decoded
/// must not be retried.
fn decode_or_default<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, Status> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| {
        Status::new(
            Code::Unimplemented,
            format!("unable to decode collector response: {e}"),
        )
    })
}

#[async_trait]
impl CollectorTransport for HttpTransport {
    async fn init(&self, message: InitMessage) -> Result<InitResponse, Status> {
        decode_or_default(&self.post_json(INIT_ENDPOINT, &message).await?)
    }

    async fn collect_gauge_values(
        &self,
        message: GaugeValueMessage,
    ) -> Result<GaugeValueResponse, Status> {
        decode_or_default(&self.post_json(GAUGES_ENDPOINT, &message).await?)
    }

    async fn collect_aggregate_stream(
        &self,
        frames: Vec<AggregateStreamMessage>,
    ) -> Result<AggregateResponse, Status> {
        decode_or_default(&self.post_stream(AGGREGATES_ENDPOINT, &frames).await?)
    }

    // trace and log responses carry nothing; their bodies are not inspected
    async fn collect_trace_stream(&self, frames: Vec<TraceStreamMessage>) -> Result<(), Status> {
        self.post_stream(TRACES_ENDPOINT, &frames).await?;
        Ok(())
    }

    async fn log(&self, message: LogMessage) -> Result<(), Status> {
        self.post_json(LOG_ENDPOINT, &message).await?;
        Ok(())
    }

    async fn connect_downstream(&self) -> Result<DownstreamStream, Status> {
        let endpoint = self.endpoints.pick();
        let url = format!("{}{}", endpoint.ws_url, DOWNSTREAM_ENDPOINT);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Status::new(Code::InvalidArgument, e.to_string()))?;
        if let Some(authority) = &self.authority {
            let value = WsHeaderValue::from_str(authority)
                .map_err(|_| Status::new(Code::InvalidArgument, "invalid authority override"))?;
            request.headers_mut().insert(WS_HOST, value);
        }

        let (stream, _) = match endpoint.resolved.addr {
            Some(addr) => {
                let tcp = TcpStream::connect(addr)
                    .await
                    .map_err(|e| Status::unavailable(e.to_string()))?;
                client_async_tls_with_config(request, tcp, None, None).await
            }
            None => connect_async(request).await,
        }
        .map_err(|e| Status::unavailable(e.to_string()))?;
        debug!(url = %url, "downstream websocket connected");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<AgentResponse>(DOWNSTREAM_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(DOWNSTREAM_BUFFER);

        let cancel = self.cancel.child_token();
        self.io_tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = outbound_rx.recv() => {
                        let Some(response) = next else { break };
                        let text = match serde_json::to_string(&response) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("unable to encode downstream response: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            debug!("downstream write failed: {e}");
                            break;
                        }
                    }
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        });

        let cancel = self.cancel.child_token();
        self.io_tasks.spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = source.next() => frame,
                };
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match CentralRequest::from_json_lenient(&text) {
                            Ok(request) => {
                                if inbound_tx.send(Ok(request)).await.is_err() {
                                    break;
                                }
                            }
                            // without an id there is nothing to answer
                            Err(e) => warn!("discarding downstream message without request id: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        let _ = inbound_tx
                            .send(Err(Status::unavailable("downstream closed by collector")))
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inbound_tx.send(Err(Status::unavailable(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(DownstreamStream {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.io_tasks.close();
        self.io_tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressResolver, TargetConfig};
    use collector_proto::{AgentConfig, Environment, GaugeValue};
    use mockito::{Matcher, Server};

    async fn transport_for(url: &str) -> HttpTransport {
        let config = TargetConfig::parse(url, None).unwrap();
        let resolved = AddressResolver::resolve(&config).await.unwrap();
        HttpTransport::new(resolved, &HttpTransportOptions::default()).unwrap()
    }

    fn init_message() -> InitMessage {
        InitMessage {
            agent_id: "agent-1".into(),
            agent_version: "1.2.3".into(),
            environment: Environment::default(),
            agent_config: AgentConfig::default(),
            overwrite_existing_agent_config: true,
        }
    }

    #[test]
    fn classify_status_maps_expected_codes() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err().code,
            Code::ResourceExhausted
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE)
                .unwrap_err()
                .code,
            Code::Unavailable
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT).unwrap_err().code,
            Code::DeadlineExceeded
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST).unwrap_err().code,
            Code::InvalidArgument
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED).unwrap_err().code,
            Code::Unauthenticated
        );
    }

    #[test]
    fn precondition_failed_is_not_retried() {
        let status = classify_status(StatusCode::PRECONDITION_FAILED).unwrap_err();
        assert_eq!(status.code, Code::FailedPrecondition);
        assert!(!status.is_retryable());
    }

    #[test]
    fn empty_body_decodes_to_default() {
        let response: GaugeValueResponse = decode_or_default(b"").unwrap();
        assert_eq!(response, GaugeValueResponse::default());
    }

    #[tokio::test]
    async fn init_posts_json_and_decodes_response() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/init")
            .match_header("content-type", JSON_CONTENT_TYPE)
            .match_body(Matcher::PartialJsonString(
                r#"{"agent_id":"agent-1","overwrite_existing_agent_config":true}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"collector_version":"0.13.1"}"#)
            .create_async()
            .await;

        let transport = transport_for(&server.url()).await;
        let response = transport.init(init_message()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.collector_version, "0.13.1");
        assert_eq!(response.agent_config, None);
    }

    #[tokio::test]
    async fn throttled_gauge_call_is_resource_exhausted() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/gauges")
            .with_status(429)
            .create_async()
            .await;

        let transport = transport_for(&server.url()).await;
        let error = transport
            .collect_gauge_values(GaugeValueMessage {
                agent_id: "agent-1".into(),
                gauge_values: vec![GaugeValue {
                    gauge_name: "heap".into(),
                    value: 1.0,
                    weight: 1,
                    capture_time: 0,
                }],
            })
            .await
            .unwrap_err();

        assert_eq!(error.code, Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn stream_frames_are_newline_delimited() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/aggregates")
            .match_header("content-type", NDJSON_CONTENT_TYPE)
            .match_body(Matcher::Regex(
                r#"^\{"type":"StreamHeader".*\}\n\{"type":"OverallAggregate".*\}\n$"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"next_delay_millis":5000}"#)
            .create_async()
            .await;

        let transport = transport_for(&server.url()).await;
        let response = transport
            .collect_aggregate_stream(vec![
                AggregateStreamMessage::StreamHeader {
                    agent_id: "agent-1".into(),
                    capture_time: 60_000,
                },
                AggregateStreamMessage::OverallAggregate {
                    transaction_type: "Web".into(),
                    shared_query_text_indexes: vec![],
                    payload: vec![1, 2],
                },
            ])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.next_delay_millis, 5000);
    }

    #[tokio::test]
    async fn undecodable_accepted_response_is_not_retried() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/init")
            .with_status(200)
            .with_body("<html>ok</html>")
            .create_async()
            .await;

        let transport = transport_for(&server.url()).await;
        let error = transport.init(init_message()).await.unwrap_err();

        assert_eq!(error.code, Code::Unimplemented);
        assert!(!error.is_retryable());
        assert!(!error.is_connection_failure());
    }

    #[tokio::test]
    async fn accepted_log_body_is_not_inspected() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/log")
            .with_status(200)
            .with_body("accepted")
            .create_async()
            .await;

        let transport = transport_for(&server.url()).await;
        transport
            .log(LogMessage {
                agent_id: "agent-1".into(),
                log_event: collector_proto::LogEvent {
                    timestamp: 1,
                    level: collector_proto::LogLevel::Warn,
                    logger_name: "agent.jdbc".into(),
                    message: "slow query".into(),
                    throwable: None,
                },
            })
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn downstream_keeps_requests_with_a_readable_id() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in [
                r#"{"request_id":5,"request":{"type":"MatchingClassNames","partial_class_name":"x"}}"#,
                r#"{"request":{"type":"Jstack"}}"#,
                r#"{"request_id":6,"request":{"type":"Jstack"}}"#,
            ] {
                ws.send(WsMessage::Text(frame.to_string())).await.unwrap();
            }
            // hold the socket open until the client hangs up
            while let Some(Ok(_)) = ws.next().await {}
        });

        let transport = transport_for(&format!("127.0.0.1:{port}")).await;
        let mut downstream = transport.connect_downstream().await.unwrap();

        let first = downstream.inbound.recv().await.unwrap().unwrap();
        assert_eq!(first.request_id, 5);
        assert!(matches!(
            first.request,
            collector_proto::CentralRequestKind::Malformed { .. }
        ));
        let second = downstream.inbound.recv().await.unwrap().unwrap();
        assert_eq!(second.request_id, 6);
        assert_eq!(second.request, collector_proto::CentralRequestKind::Jstack);

        transport.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_collector_is_unavailable() {
        let transport = transport_for("127.0.0.1:9").await;
        let error = transport.connect_downstream().await.err().unwrap();
        assert_eq!(error.code, Code::Unavailable);
    }
}
