//! Scripted in-process backend
//!
//! Backs fake mode (the dev sentinel instance) and the test suites. Routes
//! are keyed by method + path; one-shot responses are consumed in order
//! before the repeating fallback. Every call is recorded so tests can
//! assert on what actually went over the "wire".

use crate::transport::{Backend, BackendError, HttpCall, RawResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use std::collections::VecDeque;
use url::Url;

/// A canned response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    /// Bare status with no body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: String::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn xml(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/xml".to_string(),
            body: body.into().into_bytes(),
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/octet-stream".to_string(),
            body,
        }
    }

    /// A transient network failure instead of a response.
    pub fn network_failure(message: impl Into<String>) -> ScriptedOutcome {
        ScriptedOutcome::Failure(BackendError::retryable(message))
    }
}

/// What a scripted route yields: a response or a backend failure.
#[derive(Debug)]
pub enum ScriptedOutcome {
    Response(ScriptedResponse),
    Failure(BackendError),
}

impl From<ScriptedResponse> for ScriptedOutcome {
    fn from(response: ScriptedResponse) -> Self {
        ScriptedOutcome::Response(response)
    }
}

struct Route {
    method: Method,
    path: String,
    queue: VecDeque<ScriptedOutcome>,
    fallback: Option<ScriptedResponse>,
}

/// One recorded exchange.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: Url,
    pub body: Option<serde_json::Value>,
}

/// In-process backend driven by a script.
#[derive(Default)]
pub struct ScriptedBackend {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn route_mut<'a>(
        routes: &'a mut Vec<Route>,
        method: &Method,
        path: &str,
    ) -> &'a mut Route {
        if let Some(index) = routes
            .iter()
            .position(|r| r.method == *method && r.path == path)
        {
            &mut routes[index]
        } else {
            routes.push(Route {
                method: method.clone(),
                path: path.to_string(),
                queue: VecDeque::new(),
                fallback: None,
            });
            routes
                .last_mut()
                .unwrap_or_else(|| unreachable!("route was just pushed"))
        }
    }

    /// Queue a one-shot outcome for `method path`.
    pub fn enqueue(&self, method: Method, path: &str, outcome: impl Into<ScriptedOutcome>) {
        let mut routes = self.routes.lock();
        Self::route_mut(&mut routes, &method, path)
            .queue
            .push_back(outcome.into());
    }

    /// Set the repeating response served once the queue for
    /// `method path` is drained.
    pub fn respond(&self, method: Method, path: &str, response: ScriptedResponse) {
        let mut routes = self.routes.lock();
        Self::route_mut(&mut routes, &method, path).fallback = Some(response);
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls whose URL path matches exactly.
    pub fn call_count(&self, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.url.path() == path)
            .count()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn send(&self, call: &HttpCall) -> std::result::Result<RawResponse, BackendError> {
        self.calls.lock().push(RecordedCall {
            method: call.method.clone(),
            url: call.url.clone(),
            body: call.body.clone(),
        });

        let outcome = {
            let mut routes = self.routes.lock();
            let route = routes
                .iter_mut()
                .find(|r| r.method == call.method && r.path == call.url.path());
            match route {
                Some(route) => match route.queue.pop_front() {
                    Some(outcome) => Some(outcome),
                    None => route
                        .fallback
                        .clone()
                        .map(ScriptedOutcome::Response),
                },
                None => None,
            }
        };

        match outcome {
            Some(ScriptedOutcome::Response(response)) => Ok(RawResponse {
                status: response.status,
                content_type: response.content_type,
                body: response.body,
            }),
            Some(ScriptedOutcome::Failure(error)) => Err(error),
            None => Err(BackendError::fatal(format!(
                "no scripted response for {} {}",
                call.method,
                call.url.path()
            ))),
        }
    }
}
