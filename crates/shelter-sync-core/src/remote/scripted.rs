//! Scripted in-memory `RemoteApi` used by the coordinator and session tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{ApiRequest, RemoteApi, RemoteFailure};
use crate::types::ApiResponse;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Respond(ApiResponse),
    Fail(RemoteFailure),
    /// Never answers; exercises the request timeout
    Hang,
}

/// Answers per request path from a queue of steps, falling back to an empty
/// success envelope once a path's script runs out.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, path: &str, step: Step) -> &Self {
        self.script
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.path.clone()).collect()
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RemoteFailure> {
        self.calls.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(|steps| steps.pop_front());

        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(failure)) => Err(failure),
            Some(Step::Hang) => std::future::pending().await,
            None => Ok(ApiResponse::success(None)),
        }
    }
}
