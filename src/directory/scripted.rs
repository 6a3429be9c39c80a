//! In-memory transport that replays canned replies.
//!
//! Used by the unit and integration tests, and handy for dry runs against a
//! recorded directory. Replies are scripted per function name: a sequence is
//! consumed in order and its last entry repeats forever. Functions without a
//! script answer with an HTTP 404, which the client reports as a request
//! error.

use super::{DirectoryTransport, TransportError, TransportFuture};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Json(Value),
    Fail(TransportError),
}

impl ScriptedReply {
    pub fn json(value: Value) -> Self {
        ScriptedReply::Json(value)
    }

    pub fn fail(error: TransportError) -> Self {
        ScriptedReply::Fail(error)
    }

    fn into_result(self) -> Result<Value, TransportError> {
        match self {
            ScriptedReply::Json(v) => Ok(v),
            ScriptedReply::Fail(e) => Err(e),
        }
    }
}

/// A call as the transport received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub function: String,
    pub params: Vec<(String, String)>,
}

impl RecordedCall {
    /// Value of the first parameter named `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    /// Remaining replies per function, stored reversed so `pop` yields the next.
    scripts: Mutex<HashMap<String, Vec<ScriptedReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    total: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `function` with `reply`.
    pub fn reply(self, function: &str, reply: ScriptedReply) -> Self {
        self.reply_sequence(function, vec![reply])
    }

    /// Answer `function` with `replies` in order, then repeat the last one.
    pub fn reply_sequence(self, function: &str, mut replies: Vec<ScriptedReply>) -> Self {
        replies.reverse();
        lock(&self.scripts).insert(function.to_string(), replies);
        self
    }

    /// Number of calls made to `function`.
    pub fn call_count(&self, function: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.function == function)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    fn next_reply(&self, function: &str) -> Result<Value, TransportError> {
        let mut scripts = lock(&self.scripts);
        let reply = match scripts.get_mut(function) {
            Some(queue) if queue.len() > 1 => queue.pop(),
            Some(queue) => queue.last().cloned(),
            None => None,
        };
        reply
            .map(ScriptedReply::into_result)
            .unwrap_or_else(|| {
                Err(TransportError::Status {
                    status: 404,
                    body: format!("no scripted reply for {function}"),
                })
            })
    }
}

impl DirectoryTransport for ScriptedTransport {
    fn call<'a>(
        &'a self,
        function: &'a str,
        params: &'a [(String, String)],
    ) -> TransportFuture<'a> {
        self.total.fetch_add(1, Ordering::SeqCst);
        lock(&self.calls).push(RecordedCall {
            function: function.to_string(),
            params: params.to_vec(),
        });
        let reply = self.next_reply(function);
        Box::pin(async move { reply })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
