//! The throttled batching engine: one per registered KP.
//!
//! A single worker task drains the request queue, merges whatever is
//! structurally mergeable, dispatches one upstream call per batch,
//! demultiplexes the reply, and paces itself against the KP's declared
//! rate limit. The public handle (`ThrottledEngine`) only ever touches the
//! queue and a shutdown signal; all batch-formation state lives inside the
//! worker task, so no locking is needed around it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ThrottleError;
use crate::gcra::{Gcra, RateLimit};
use crate::trapi;

/// Immutable per-registration description of an upstream KP.
#[derive(Debug, Clone)]
pub struct KPInfo {
    pub url: String,
    pub request_qty: u32,
    pub request_duration: Duration,
    /// Per-KP upstream dispatch timeout, overriding the shared client's
    /// default for every request this engine sends.
    pub timeout: Option<Duration>,
}

impl KPInfo {
    fn rate_limit(&self) -> RateLimit {
        if self.request_qty == 0 {
            RateLimit::unlimited()
        } else {
            RateLimit {
                request_qty: self.request_qty,
                request_duration: self.request_duration,
            }
        }
    }
}

type ResponseSlot = oneshot::Sender<Result<Value, ThrottleError>>;

/// One accepted-but-not-yet-answered client query, queued on an engine.
struct PendingRequest {
    id: uuid::Uuid,
    query: Value,
    reply: ResponseSlot,
}

enum Command {
    Submit(PendingRequest),
}

/// Per-KP throttled batching engine.
pub struct ThrottledEngine {
    kp_id: String,
    url: String,
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ThrottledEngine {
    /// Builds and starts the worker. Engines are always running once
    /// constructed; `stop()` tears the worker down.
    pub fn start(kp_id: String, info: KPInfo, client: Client) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let url = info.url.clone();
        let handle = tokio::spawn(run_worker(kp_id.clone(), info, client, rx, cancel.clone()));

        Arc::new(Self {
            kp_id,
            url,
            tx,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Enqueues `query`, waiting for the worker to produce a filtered
    /// message or a dispatch error. `timeout` bounds only this caller's
    /// wait; a batch already dispatched upstream is not cancelled by it.
    pub async fn submit(
        &self,
        query: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ThrottleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4();
        self.tx
            .send(Command::Submit(PendingRequest {
                id,
                query,
                reply: reply_tx,
            }))
            .map_err(|_| ThrottleError::Cancelled)?;

        let wait = async { reply_rx.await.map_err(|_| ThrottleError::Cancelled)? };
        match timeout {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| ThrottleError::Timeout(d))?,
            None => wait.await,
        }
    }

    pub fn kp_id(&self) -> &str {
        &self.kp_id
    }

    /// Cancels the worker and waits for it to finish draining. Any request
    /// still queued or in flight receives `Cancelled`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    kp_id: String,
    info: KPInfo,
    client: Client,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let mut queue: Vec<PendingRequest> = Vec::new();
    let mut gcra = Gcra::new(info.rate_limit());

    loop {
        // Block for at least one request, unless we already have
        // re-enqueued ones from a previous partition step.
        if queue.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Submit(req)) => queue.push(req),
                        None => break,
                    }
                }
            }
        }

        // Drain everything else currently available, non-blockingly.
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Submit(req) => queue.push(req),
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        // Partition: the leader seeds the canonical form; everyone whose
        // query graph matches it after stripping `ids` joins this batch.
        let leader_qg = queue[0]
            .query
            .get("message")
            .and_then(|m| m.get("query_graph"))
            .cloned()
            .unwrap_or(Value::Null);
        let leader_canonical = trapi::remove_curies(&leader_qg);

        let mut batch = Vec::new();
        let mut remainder = Vec::new();
        for req in queue.drain(..) {
            let qg = req
                .query
                .get("message")
                .and_then(|m| m.get("query_graph"))
                .cloned()
                .unwrap_or(Value::Null);
            if trapi::remove_curies(&qg) == leader_canonical {
                batch.push(req);
            } else {
                remainder.push(req);
            }
        }
        queue = remainder;

        tracing::debug!(
            kp_id = %kp_id,
            batch_size = batch.len(),
            leader = %batch[0].id,
            "formed batch"
        );

        let merged_query = build_merged_query(&leader_qg, &batch);

        let dispatch_result =
            dispatch(&client, &info.url, &merged_query, &kp_id, info.timeout).await;

        match dispatch_result {
            Ok(message) => {
                for req in batch {
                    let mapping = trapi::extract_curies(
                        req.query
                            .get("message")
                            .and_then(|m| m.get("query_graph"))
                            .unwrap_or(&Value::Null),
                    );
                    let result =
                        trapi::filter_by_curie_mapping(&message, &mapping, &kp_id)
                            .map(|filtered| serde_json::json!({ "message": filtered }));
                    let _ = req.reply.send(result);
                }
            }
            Err(err) => {
                tracing::warn!(kp_id = %kp_id, error = %err, "batch dispatch failed");
                for req in batch {
                    let resend = clone_error(&err);
                    let _ = req.reply.send(Err(resend));
                }
            }
        }

        gcra.pace().await;
    }

    tracing::info!(kp_id = %kp_id, "worker shutting down");
    for req in queue {
        let _ = req.reply.send(Err(ThrottleError::Cancelled));
    }
    while let Ok(Command::Submit(req)) = rx.try_recv() {
        let _ = req.reply.send(Err(ThrottleError::Cancelled));
    }
}

/// Folds the `ids` pinned by each batch member into a deep copy of the
/// leader's query, unioning pinned CURIEs at every node any member pinned.
fn build_merged_query(leader_qg: &Value, batch: &[PendingRequest]) -> Value {
    let mut merged_qg = trapi::remove_curies(leader_qg);

    for req in batch {
        let qg = req
            .query
            .get("message")
            .and_then(|m| m.get("query_graph"))
            .unwrap_or(&Value::Null);
        let mapping = trapi::extract_curies(qg);
        if let Some(nodes) = merged_qg.get_mut("nodes").and_then(Value::as_object_mut) {
            for (node_id, curies) in mapping {
                let entry = nodes
                    .entry(node_id)
                    .or_insert_with(|| serde_json::json!({}));
                let existing = entry
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let mut union = existing;
                for curie in curies {
                    if !union.contains(&curie) {
                        union.push(curie);
                    }
                }
                entry["ids"] = serde_json::json!(union);
            }
        }
    }

    serde_json::json!({ "message": { "query_graph": merged_qg } })
}

async fn dispatch(
    client: &Client,
    url: &str,
    query: &Value,
    kp_id: &str,
    timeout: Option<Duration>,
) -> Result<Value, ThrottleError> {
    let mut req = client.post(url).json(query);
    if let Some(d) = timeout {
        req = req.timeout(d);
    }
    let response = req.send().await.map_err(|e| ThrottleError::KPUnreachable {
        kp_id: kp_id.to_string(),
        message: e.to_string(),
        request: query.clone(),
    })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ThrottleError::KPUnreachable {
            kp_id: kp_id.to_string(),
            message: e.to_string(),
            request: query.clone(),
        })?;

    if !status.is_success() {
        return Err(ThrottleError::KPStatusError {
            kp_id: kp_id.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let parsed: Value =
        serde_json::from_str(&body).map_err(|e| ThrottleError::KPMalformedResponse {
            kp_id: kp_id.to_string(),
            reason: e.to_string(),
            request: query.clone(),
        })?;

    let message = parsed
        .get("message")
        .cloned()
        .ok_or_else(|| ThrottleError::KPMalformedResponse {
            kp_id: kp_id.to_string(),
            reason: "response has no 'message' field".to_string(),
            request: query.clone(),
        })?;

    if message.get("query_graph").filter(|v| !v.is_null()).is_none() {
        return Err(ThrottleError::BatchingError {
            kp_id: kp_id.to_string(),
            reason: "qgraph not returned".to_string(),
            request: query.clone(),
        });
    }
    if message
        .get("knowledge_graph")
        .filter(|v| !v.is_null())
        .is_none()
    {
        return Err(ThrottleError::BatchingError {
            kp_id: kp_id.to_string(),
            reason: "kgraph not returned".to_string(),
            request: query.clone(),
        });
    }

    Ok(message)
}

/// `ThrottleError` doesn't implement `Clone` (it wraps non-`Clone` upstream
/// context in some variants' sources); batch fan-out needs one copy per
/// member, so this rebuilds an equivalent error from its fields.
fn clone_error(err: &ThrottleError) -> ThrottleError {
    match err {
        ThrottleError::Duplicate(id) => ThrottleError::Duplicate(id.clone()),
        ThrottleError::UnknownKP(id) => ThrottleError::UnknownKP(id.clone()),
        ThrottleError::KPUnreachable {
            kp_id,
            message,
            request,
        } => ThrottleError::KPUnreachable {
            kp_id: kp_id.clone(),
            message: message.clone(),
            request: request.clone(),
        },
        ThrottleError::KPStatusError { kp_id, status, body } => ThrottleError::KPStatusError {
            kp_id: kp_id.clone(),
            status: *status,
            body: body.clone(),
        },
        ThrottleError::KPMalformedResponse {
            kp_id,
            reason,
            request,
        } => ThrottleError::KPMalformedResponse {
            kp_id: kp_id.clone(),
            reason: reason.clone(),
            request: request.clone(),
        },
        ThrottleError::BatchingError {
            kp_id,
            reason,
            request,
        } => ThrottleError::BatchingError {
            kp_id: kp_id.clone(),
            reason: reason.clone(),
            request: request.clone(),
        },
        ThrottleError::MalformedQGraph { kp_id } => {
            ThrottleError::MalformedQGraph { kp_id: kp_id.clone() }
        }
        ThrottleError::MissingQGraph { kp_id } => {
            ThrottleError::MissingQGraph { kp_id: kp_id.clone() }
        }
        ThrottleError::MissingKGraph { kp_id } => {
            ThrottleError::MissingKGraph { kp_id: kp_id.clone() }
        }
        ThrottleError::Cancelled => ThrottleError::Cancelled,
        ThrottleError::Timeout(d) => ThrottleError::Timeout(*d),
        ThrottleError::InvalidRegistration(s) => ThrottleError::InvalidRegistration(s.clone()),
    }
}
