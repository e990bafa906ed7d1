use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use trapi_throttle::engine::{KPInfo, ThrottledEngine};
use trapi_throttle::error::ThrottleError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn query_with_curie(curie: &str) -> Value {
    json!({
        "message": {
            "query_graph": {
                "nodes": {
                    "n0": {"categories": ["biolink:ChemicalEntity"], "ids": [curie]},
                    "n1": {"categories": ["biolink:Disease"]},
                },
                "edges": {
                    "e0": {"subject": "n0", "object": "n1", "predicates": ["biolink:treats"]},
                },
            }
        }
    })
}

fn upstream_response_for(curies: &[&str]) -> Value {
    let mut kg_nodes = serde_json::Map::new();
    let mut results = Vec::new();
    for curie in curies {
        kg_nodes.insert(curie.to_string(), json!({"name": curie}));
        results.push(json!({
            "node_bindings": {"n0": [{"id": curie}], "n1": [{"id": "MONDO:0005148"}]},
            "edge_bindings": {"e0": [{"id": format!("edge-{curie}")}]},
        }));
    }
    kg_nodes.insert("MONDO:0005148".to_string(), json!({"name": "diabetes"}));
    let mut kg_edges = serde_json::Map::new();
    for curie in curies {
        kg_edges.insert(
            format!("edge-{curie}"),
            json!({"subject": curie, "object": "MONDO:0005148"}),
        );
    }

    json!({
        "message": {
            "query_graph": {
                "nodes": {"n0": {"ids": curies}, "n1": {}},
                "edges": {"e0": {}},
            },
            "knowledge_graph": {"nodes": kg_nodes, "edges": kg_edges},
            "results": results,
        }
    })
}

#[tokio::test]
async fn batch_of_three_dispatches_once() {
    let mock_server = MockServer::start().await;
    let curies = ["CHEBI:6801", "CHEBI:6802", "CHEBI:6803"];
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(upstream_response_for(&curies)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let info = KPInfo {
        url: format!("{}/query", mock_server.uri()),
        request_qty: 1,
        request_duration: Duration::from_secs(1),
        timeout: None,
    };
    let engine = ThrottledEngine::start("test-kp".to_string(), info, Client::new());

    let mut handles = Vec::new();
    for curie in curies {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.submit(query_with_curie(curie), None).await
        }));
    }

    for (handle, curie) in handles.into_iter().zip(curies) {
        let result = handle.await.unwrap().unwrap();
        let nodes = result["message"]["knowledge_graph"]["nodes"]
            .as_object()
            .unwrap();
        assert!(nodes.contains_key(curie));
        assert_eq!(nodes.len(), 2);
    }

    engine.stop().await;
}

#[tokio::test]
async fn upstream_500_delivers_status_error_to_every_member() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal server error"))
        .mount(&mock_server)
        .await;

    let info = KPInfo {
        url: format!("{}/query", mock_server.uri()),
        request_qty: 1,
        request_duration: Duration::from_secs(1),
        timeout: None,
    };
    let engine = ThrottledEngine::start("test-kp".to_string(), info, Client::new());

    let result = engine.submit(query_with_curie("CHEBI:6801"), None).await;
    assert!(matches!(
        result,
        Err(ThrottleError::KPStatusError { status: 500, .. })
    ));

    engine.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_is_reported() {
    let info = KPInfo {
        url: "http://127.0.0.1:1".to_string(),
        request_qty: 1,
        request_duration: Duration::from_secs(1),
        timeout: None,
    };
    let engine = ThrottledEngine::start("test-kp".to_string(), info, Client::new());

    let result = engine.submit(query_with_curie("CHEBI:6801"), None).await;
    assert!(matches!(result, Err(ThrottleError::KPUnreachable { .. })));

    engine.stop().await;
}

#[tokio::test]
async fn missing_qgraph_is_a_batching_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "query_graph": Value::Null,
                "knowledge_graph": {"nodes": {}, "edges": {}},
                "results": [],
            }
        })))
        .mount(&mock_server)
        .await;

    let info = KPInfo {
        url: format!("{}/query", mock_server.uri()),
        request_qty: 1,
        request_duration: Duration::from_secs(1),
        timeout: None,
    };
    let engine = ThrottledEngine::start("test-kp".to_string(), info, Client::new());

    let result = engine.submit(query_with_curie("CHEBI:6801"), None).await;
    match result {
        Err(ThrottleError::BatchingError { reason, request, .. }) => {
            assert!(reason.contains("qgraph not returned"));
            assert!(request.get("message").is_some());
        }
        other => panic!("expected BatchingError, got {other:?}"),
    }

    engine.stop().await;
}

#[tokio::test]
async fn null_results_become_empty_list() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "query_graph": {"nodes": {"n0": {}, "n1": {}}, "edges": {"e0": {}}},
                "knowledge_graph": {"nodes": {}, "edges": {}},
                "results": Value::Null,
            }
        })))
        .mount(&mock_server)
        .await;

    let info = KPInfo {
        url: format!("{}/query", mock_server.uri()),
        request_qty: 1,
        request_duration: Duration::from_secs(1),
        timeout: None,
    };
    let engine = ThrottledEngine::start("test-kp".to_string(), info, Client::new());

    let result = engine
        .submit(query_with_curie("CHEBI:6801"), None)
        .await
        .unwrap();
    assert_eq!(result["message"]["results"], json!([]));

    engine.stop().await;
}

#[tokio::test]
async fn stop_cancels_pending_requests() {
    let info = KPInfo {
        url: "http://127.0.0.1:1".to_string(),
        request_qty: 1,
        request_duration: Duration::from_secs(60),
        timeout: None,
    };
    let engine = ThrottledEngine::start("test-kp".to_string(), info, Client::new());
    engine.stop().await;

    let result = engine.submit(query_with_curie("CHEBI:6801"), None).await;
    assert!(matches!(result, Err(ThrottleError::Cancelled)));
}
