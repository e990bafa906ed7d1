//! QueryGraph algebra: the pure functions that make batching correct.
//!
//! Every function here takes a `serde_json::Value` and returns a new one;
//! none mutates its input. TRAPI messages carry open-ended attribute bags
//! (node categories, edge attributes, qualifiers) that a closed struct would
//! lose on round-trip, so the message shapes are modeled as `Value` with
//! targeted field access rather than a fully-typed schema.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value, json};

use crate::error::ThrottleError;

/// `qg_id -> ordered list of pinned CURIEs` extracted from one query graph.
pub type CurieMapping = BTreeMap<String, Vec<String>>;

/// Collects the `ids` pinned on each node of a query graph.
///
/// Nodes with an absent or explicitly `null` `ids` field are omitted — the
/// two are treated identically as "not pinned" (see DESIGN.md Open
/// Question (a)). Does not modify `qgraph`.
pub fn extract_curies(qgraph: &Value) -> CurieMapping {
    let mut mapping = CurieMapping::new();
    let Some(nodes) = qgraph.get("nodes").and_then(Value::as_object) else {
        return mapping;
    };
    for (node_id, node) in nodes {
        let Some(ids) = node.get("ids") else { continue };
        if ids.is_null() {
            continue;
        }
        let Some(ids) = ids.as_array() else { continue };
        let curies: Vec<String> = ids
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if !curies.is_empty() {
            mapping.insert(node_id.clone(), curies);
        }
    }
    mapping
}

/// Returns a deep copy of `qgraph` with `ids` stripped from every node.
///
/// Two query graphs are mergeable iff `remove_curies` produces equal
/// values for both — this is the structural-equivalence relation batching
/// uses to decide what can share an upstream call.
pub fn remove_curies(qgraph: &Value) -> Value {
    let mut out = qgraph.clone();
    if let Some(nodes) = out.get_mut("nodes").and_then(Value::as_object_mut) {
        for node in nodes.values_mut() {
            if let Some(node) = node.as_object_mut() {
                node.remove("ids");
            }
        }
    }
    out
}

/// Splits a merged upstream message back into the slice one client asked
/// for, by re-pinning `curie_mapping` onto the returned query graph and
/// keeping only the results and knowledge-graph entries it can reach.
///
/// `kp_label` is included in error variants purely for diagnostics.
pub fn filter_by_curie_mapping(
    message: &Value,
    curie_mapping: &CurieMapping,
    kp_label: &str,
) -> Result<Value, ThrottleError> {
    let Some(query_graph) = message.get("query_graph").filter(|v| !v.is_null()) else {
        return Err(ThrottleError::MissingQGraph {
            kp_id: kp_label.to_string(),
        });
    };
    if message
        .get("knowledge_graph")
        .filter(|v| !v.is_null())
        .is_none()
    {
        return Err(ThrottleError::MissingKGraph {
            kp_id: kp_label.to_string(),
        });
    }

    let mut filtered_qg = query_graph.clone();
    {
        let nodes = filtered_qg
            .get_mut("nodes")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ThrottleError::MalformedQGraph {
                kp_id: kp_label.to_string(),
            })?;
        for (qg_id, curies) in curie_mapping {
            let node = nodes
                .get_mut(qg_id)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| ThrottleError::MalformedQGraph {
                    kp_id: kp_label.to_string(),
                })?;
            node.insert("ids".to_string(), json!(curies));
        }
    }

    let results = message
        .get("results")
        .filter(|v| !v.is_null())
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let retained: Vec<Value> = results
        .into_iter()
        .filter(|result| result_matches_mapping(result, curie_mapping))
        .collect();

    let knowledge_graph = message
        .get("knowledge_graph")
        .cloned()
        .unwrap_or_else(|| json!({"nodes": {}, "edges": {}}));
    let trimmed_kg = remove_unbound_from_kg(&knowledge_graph, &retained);

    Ok(json!({
        "query_graph": filtered_qg,
        "knowledge_graph": trimmed_kg,
        "results": retained,
    }))
}

/// True iff, for every `(qg_id, curies)` pair, some binding of `qg_id` in
/// `result.node_bindings` has an `id` in `curies`.
fn result_matches_mapping(result: &Value, curie_mapping: &CurieMapping) -> bool {
    let Some(node_bindings) = result.get("node_bindings").and_then(Value::as_object) else {
        return curie_mapping.is_empty();
    };
    curie_mapping.iter().all(|(qg_id, curies)| {
        node_bindings
            .get(qg_id)
            .and_then(Value::as_array)
            .is_some_and(|bindings| {
                bindings.iter().any(|binding| {
                    binding
                        .get("id")
                        .and_then(Value::as_str)
                        .is_some_and(|id| curies.iter().any(|c| c == id))
                })
            })
    })
}

/// Trims a knowledge graph down to the nodes and edges referenced by any
/// binding in `results`; everything else is dropped.
pub fn remove_unbound_from_kg(message_kg: &Value, results: &[Value]) -> Value {
    let mut node_ids = BTreeSet::new();
    let mut edge_ids = BTreeSet::new();

    for result in results {
        collect_bound_ids(result.get("node_bindings"), &mut node_ids);
        collect_bound_ids(result.get("edge_bindings"), &mut edge_ids);
    }

    let mut out_nodes = Map::new();
    if let Some(nodes) = message_kg.get("nodes").and_then(Value::as_object) {
        for (id, node) in nodes {
            if node_ids.contains(id) {
                out_nodes.insert(id.clone(), node.clone());
            }
        }
    }

    let mut out_edges = Map::new();
    if let Some(edges) = message_kg.get("edges").and_then(Value::as_object) {
        for (id, edge) in edges {
            if edge_ids.contains(id) {
                out_edges.insert(id.clone(), edge.clone());
            }
        }
    }

    json!({ "nodes": out_nodes, "edges": out_edges })
}

fn collect_bound_ids(bindings: Option<&Value>, into: &mut BTreeSet<String>) {
    let Some(bindings) = bindings.and_then(Value::as_object) else {
        return;
    };
    for binding_list in bindings.values() {
        let Some(binding_list) = binding_list.as_array() else {
            continue;
        };
        for binding in binding_list {
            if let Some(id) = binding.get("id").and_then(Value::as_str) {
                into.insert(id.to_string());
            }
        }
    }
}
