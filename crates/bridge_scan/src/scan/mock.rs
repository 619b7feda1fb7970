//! Scripted transport for unit tests.

use crate::scan::transport::{Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn ok_json(value: serde_json::Value) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: 200,
        body: value.to_string(),
    })
}

/// Replies from a queue; once drained, repeats `fallback` or times out.
pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    fallback: Option<TransportResponse>,
    calls: Mutex<Vec<Vec<(String, String)>>>,
    posts: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedTransport {
    pub(crate) fn new(replies: Vec<Result<TransportResponse, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always_timeout() -> Self {
        Self::new(vec![])
    }

    pub(crate) fn repeating(reply: Result<TransportResponse, TransportError>) -> Self {
        let mut t = Self::new(vec![]);
        t.fallback = Some(reply.unwrap());
        t
    }

    pub(crate) fn calls(&self) -> Vec<Vec<(String, String)>> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len() + self.posts.lock().unwrap().len()
    }

    pub(crate) fn posts(&self) -> Vec<serde_json::Value> {
        self.posts.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<TransportResponse, TransportError> {
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => self.fallback.clone().ok_or(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        _url: &str,
        params: &[(String, String)],
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(params.to_vec());
        self.next_reply()
    }

    async fn post_json(
        &self,
        _url: &str,
        body: &serde_json::Value,
    ) -> Result<TransportResponse, TransportError> {
        self.posts.lock().unwrap().push(body.clone());
        self.next_reply()
    }
}
