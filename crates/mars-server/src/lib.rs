//! JSON-over-HTTP surface for an [`Orchestrator`].
//!
//! [`route`] maps a request to a [`Reply`] without touching sockets; [`serve`]
//! feeds it from a `tiny_http` server.

use anyhow::{anyhow, Result};
use mars_core::{Mutation, OrchestratorError};
use mars_runner::{Orchestrator, Status};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tiny_http::{Header, Response, Server};
use tracing::{debug, info, warn};
use url::Url;

const HANDLERS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Option<Value>,
}

impl Reply {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    fn failure(status: u16, kind: &str, message: impl Into<String>) -> Self {
        Self::json(
            status,
            json!({
                "error": {
                    "kind": kind,
                    "message": message.into()
                }
            }),
        )
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::failure(400, "BadRequest", message)
    }
}

impl From<OrchestratorError> for Reply {
    fn from(err: OrchestratorError) -> Self {
        Reply::failure(err.http_status(), err.kind(), err.to_string())
    }
}

/// Dispatches one request. `url` is the request target (path plus query).
pub fn route(orchestrator: &Orchestrator, method: &str, url: &str, body: &str) -> Reply {
    let Ok(parsed) = Url::parse(&format!("http://localhost{}", url)) else {
        return Reply::bad_request(format!("malformed request target: {}", url));
    };
    let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
    let path = parsed.path();
    debug!(method, path, "handling request");
    let handled = match (method, path) {
        ("GET", "/files") => files(orchestrator),
        ("GET", "/lines") => lines(orchestrator),
        ("GET", "/perturbations") => perturbations(orchestrator, &params),
        ("GET", "/observe") => Ok(Reply::json(200, observe(&orchestrator.status()))),
        ("POST", "/perturb") => perturb(orchestrator, body),
        ("POST", "/adapt") => adapt(orchestrator, &params),
        (_, "/files" | "/lines" | "/perturbations" | "/observe" | "/perturb" | "/adapt") => {
            Err(Reply::failure(405, "MethodNotAllowed", format!("{} {}", method, path)))
        }
        _ => Err(Reply::failure(404, "NotFound", format!("no such resource: {}", path))),
    };
    handled.unwrap_or_else(|reply| reply)
}

fn files(orchestrator: &Orchestrator) -> Result<Reply, Reply> {
    Ok(Reply::json(200, json!(orchestrator.files()?)))
}

fn lines(orchestrator: &Orchestrator) -> Result<Reply, Reply> {
    let lines: Vec<String> = orchestrator
        .lines()?
        .iter()
        .map(|l| l.to_string())
        .collect();
    Ok(Reply::json(200, json!(lines)))
}

fn perturbations(
    orchestrator: &Orchestrator,
    params: &HashMap<String, String>,
) -> Result<Reply, Reply> {
    let file = params
        .get("file")
        .ok_or_else(|| Reply::bad_request("missing query parameter: file"))?;
    let line = optional_number::<usize>(params, "line")?;
    let operator = params.get("operator").map(String::as_str);
    let mutations = orchestrator.perturbations(file, line, operator)?;
    Ok(Reply::json(200, json!(mutations)))
}

fn perturb(orchestrator: &Orchestrator, body: &str) -> Result<Reply, Reply> {
    let mutation: Mutation = serde_json::from_str(body)
        .map_err(|err| Reply::bad_request(format!("malformed mutation: {}", err)))?;
    orchestrator.perturb(mutation)?;
    Ok(Reply::empty(204))
}

fn adapt(orchestrator: &Orchestrator, params: &HashMap<String, String>) -> Result<Reply, Reply> {
    let minutes = optional_number::<u64>(params, "minutes")?;
    let attempts = optional_number::<usize>(params, "attempts")?;
    orchestrator.adapt(minutes, attempts)?;
    Ok(Reply::empty(202))
}

fn optional_number<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, Reply> {
    match params.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Reply::bad_request(format!("invalid {}: {}", name, raw))),
    }
}

pub fn observe(status: &Status) -> Value {
    let pareto: Vec<Value> = status
        .patches
        .iter()
        .map(|p| {
            json!({
                "diff": p.diff(),
                "build": p.build,
                "tests": p.tests
            })
        })
        .collect();
    json!({
        "stage": status.state,
        "resource-consumption": {
            "num-attempts": status.attempts,
            "time-spent": status.elapsed
        },
        "pareto-set": pareto
    })
}

/// Serves requests until the listener fails. Requests are handled by a small
/// fixed set of threads so observers are answered while a perturbation runs.
pub fn serve(orchestrator: Arc<Orchestrator>, port: u16) -> Result<()> {
    let server = Server::http(("0.0.0.0", port))
        .map_err(|err| anyhow!("failed to bind port {}: {}", port, err))?;
    let server = Arc::new(server);
    info!(port, "listening");
    let handles: Vec<_> = (0..HANDLERS)
        .map(|i| {
            let server = server.clone();
            let orchestrator = orchestrator.clone();
            thread::Builder::new()
                .name(format!("mars-http-{}", i))
                .spawn(move || handle_requests(&server, &orchestrator))
        })
        .collect::<std::io::Result<_>>()?;
    for handle in handles {
        if handle.join().is_err() {
            warn!("request handler panicked");
        }
    }
    Ok(())
}

fn handle_requests(server: &Server, orchestrator: &Orchestrator) {
    while let Ok(mut request) = server.recv() {
        let mut body = String::new();
        if let Err(err) = request.as_reader().read_to_string(&mut body) {
            warn!("failed to read request body: {}", err);
        }
        let method = request.method().to_string();
        let url = request.url().to_string();
        let reply = route(orchestrator, &method, &url, &body);
        info!(method = %method, url = %url, status = reply.status, "handled request");
        let mut response = match &reply.body {
            Some(value) => Response::from_string(value.to_string()),
            None => Response::from_data(Vec::new()),
        }
        .with_status_code(reply.status);
        if reply.body.is_some() {
            if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
                response = response.with_header(header);
            }
        }
        if let Err(err) = request.respond(response) {
            warn!("failed to send response: {}", err);
        }
    }
}
