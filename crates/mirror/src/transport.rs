//! Transport seam between the mirror and the remote debugging protocol
//!
//! The mirror only needs request/response RPC; events are pushed into it by
//! whoever owns the event stream (see `DomMirror::run`).

use async_trait::async_trait;
use cdp::CDPSession;
use serde_json::Value;

/// Issues protocol commands on behalf of a mirror
#[async_trait]
pub trait DomTransport: Send + Sync + 'static {
    async fn command(&self, method: &str, params: Value) -> cdp::Result<Value>;
}

#[async_trait]
impl DomTransport for CDPSession {
    async fn command(&self, method: &str, params: Value) -> cdp::Result<Value> {
        self.send(method, Some(params)).await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for coordinator tests

    use super::*;
    use cdp::CDPError;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        responses: Mutex<HashMap<String, VecDeque<cdp::Result<Value>>>>,
        calls: Mutex<Vec<(String, Value)>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue a successful response; unscripted methods answer `{}`
        pub(crate) fn respond(&self, method: &str, result: Value) {
            self.responses
                .lock()
                .entry(method.to_string())
                .or_default()
                .push_back(Ok(result));
        }

        pub(crate) fn fail(&self, method: &str, message: &str) {
            self.responses
                .lock()
                .entry(method.to_string())
                .or_default()
                .push_back(Err(CDPError::Protocol {
                    code: -32000,
                    message: message.to_string(),
                }));
        }

        /// Hold the next call to `method` until the returned gate is notified
        pub(crate) fn gate(&self, method: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates.lock().insert(method.to_string(), gate.clone());
            gate
        }

        pub(crate) fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().clone()
        }

        pub(crate) fn calls_to(&self, method: &str) -> usize {
            self.calls.lock().iter().filter(|(m, _)| m == method).count()
        }
    }

    #[async_trait]
    impl DomTransport for ScriptedTransport {
        async fn command(&self, method: &str, params: Value) -> cdp::Result<Value> {
            self.calls.lock().push((method.to_string(), params));
            let gate = self.gates.lock().remove(method);
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let response = self
                .responses
                .lock()
                .get_mut(method)
                .and_then(|queue| queue.pop_front());
            response.unwrap_or_else(|| Ok(Value::Object(Default::default())))
        }
    }
}
