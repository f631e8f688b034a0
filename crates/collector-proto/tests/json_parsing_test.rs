// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use collector_proto::{
    AgentResponse, AgentResponseKind, AggregateStreamMessage, CentralRequest, CentralRequestKind,
    SharedQueryText, TraceStreamMessage,
};

#[test]
fn test_parse_known_central_request() {
    let json = r#"{"request_id":42,"request":{"type":"MatchingClassNames","partial_class_name":"com.ex","limit":10}}"#;

    let request: CentralRequest = serde_json::from_str(json).expect("request should parse");

    assert_eq!(request.request_id, 42);
    assert_eq!(
        request.request,
        CentralRequestKind::MatchingClassNames {
            partial_class_name: "com.ex".into(),
            limit: 10,
        }
    );
}

#[test]
fn test_parse_unrecognised_request_type_as_unknown() {
    // A collector newer than this agent may send request types (with fields) we have never seen.
    let json = r#"{"request_id":7,"request":{"type":"FlameGraph","trace_id":"abc","depth":3}}"#;

    let request: CentralRequest = serde_json::from_str(json).expect("request should parse");

    assert_eq!(request.request_id, 7);
    assert_eq!(request.request, CentralRequestKind::Unknown);
}

#[test]
fn test_request_with_bad_fields_keeps_its_id() {
    let json = r#"{"request_id":5,"request":{"type":"MatchingClassNames","partial_class_name":"x"}}"#;

    let request = CentralRequest::from_json_lenient(json).expect("id should be recovered");

    assert_eq!(request.request_id, 5);
    match request.request {
        CentralRequestKind::Malformed { error } => assert!(error.contains("limit"), "{error}"),
        other => panic!("expected a malformed request, got {other:?}"),
    }
}

#[test]
fn test_lenient_decode_matches_strict_decode_for_valid_requests() {
    let json = r#"{"request_id":9,"request":{"type":"HeapDump","directory":"/tmp"}}"#;

    let request = CentralRequest::from_json_lenient(json).unwrap();

    assert_eq!(request, serde_json::from_str::<CentralRequest>(json).unwrap());
}

#[test]
fn test_frame_without_request_id_is_rejected() {
    assert!(CentralRequest::from_json_lenient(r#"{"request":{"type":"Jstack"}}"#).is_err());
    assert!(CentralRequest::from_json_lenient("not json").is_err());
}

#[test]
fn test_opaque_payloads_are_base64_encoded() {
    let response = AgentResponse {
        request_id: 3,
        response: AgentResponseKind::ThreadDump {
            payload: vec![1, 2, 3, 4, 5],
        },
    };

    let json = serde_json::to_string(&response).unwrap();

    assert!(
        json.contains("\"AQIDBAU=\""),
        "payload should be base64 encoded. Got: {}",
        json
    );
    let decoded: AgentResponse = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, response);
}

#[test]
fn test_missing_trace_payload_serializes_as_null() {
    let response = AgentResponse {
        request_id: 9,
        response: AgentResponseKind::FullTrace { payload: None },
    };

    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"payload\":null"), "Got: {}", json);

    let decoded: AgentResponse = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, response);
}

#[test]
fn test_shared_query_text_omits_absent_fields() {
    let frame = AggregateStreamMessage::SharedQueryText(SharedQueryText {
        truncated_text: Some("select".into()),
        full_text_sha: Some("abc".into()),
        ..Default::default()
    });

    let json = serde_json::to_string(&frame).unwrap();

    assert_eq!(
        json,
        r#"{"type":"SharedQueryText","truncated_text":"select","full_text_sha":"abc"}"#
    );
}

#[test]
fn test_trace_stream_counts_frame() {
    let json = r#"{"type":"StreamCounts","entry_count":4,"shared_query_text_count":2}"#;

    let frame: TraceStreamMessage = serde_json::from_str(json).unwrap();

    assert_eq!(
        frame,
        TraceStreamMessage::StreamCounts {
            entry_count: 4,
            shared_query_text_count: 2,
        }
    );
}
