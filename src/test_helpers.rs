//! Backend double for component tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use reqwest::Method;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::api::rest::{Backend, Filter};
use crate::error::{Result, SyncError};

pub enum Reply {
    Row(Value),
    Fail,
    /// Completes when the test sends on the paired sender
    Gated(oneshot::Receiver<Value>),
}

#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    queries: AtomicUsize,
    invocations: Mutex<Vec<(String, Method)>>,
    fail_invoke: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, table: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue a gated reply and return the sender that releases it.
    pub fn push_gated(&self, table: &str) -> oneshot::Sender<Value> {
        let (tx, rx) = oneshot::channel();
        self.push_reply(table, Reply::Gated(rx));
        tx
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn last_invocation(&self) -> Option<(String, Method)> {
        self.invocations.lock().unwrap().last().cloned()
    }

    pub fn set_fail_invoke(&self, fail: bool) {
        self.fail_invoke.store(fail, Ordering::SeqCst);
    }
}

impl Backend for MockBackend {
    async fn query_single(&self, table: &str, _filter: &Filter) -> Result<Value> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(table)
            .and_then(|q| q.pop_front());

        match reply {
            Some(Reply::Row(row)) => Ok(row),
            Some(Reply::Gated(rx)) => rx.await.map_err(|_| SyncError::Authority {
                status: 503,
                body: "gate dropped".to_string(),
            }),
            Some(Reply::Fail) => Err(SyncError::Authority {
                status: 500,
                body: "boom".to_string(),
            }),
            None => Err(SyncError::NotFound {
                table: table.to_string(),
            }),
        }
    }

    async fn invoke(&self, name: &str, method: Method) -> Result<()> {
        self.invocations.lock().unwrap().push((name.to_string(), method));
        if self.fail_invoke.load(Ordering::SeqCst) {
            return Err(SyncError::Authority {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        Ok(())
    }
}

/// Let spawned tasks run to their next await point.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
