use bridge_coords::ComponentId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{ExecError, ExecRequest, ExecResponse, FunctionId, RequestId};

/// Outbound half of the exec protocol, usually a channel.
pub trait RequestSink: Send + Sync {
    fn send_request(&self, request: ExecRequest) -> Result<(), ExecError>;
}

type PendingSender = oneshot::Sender<Result<Value, ExecError>>;

#[derive(Default)]
struct ClientState {
    pending: HashMap<RequestId, PendingSender>,
    closed: bool,
}

/// Untrusted-side caller. Each call gets a fresh [`RequestId`] and waits for
/// the response carrying the same id.
#[derive(Clone)]
pub struct ExecClient {
    sink: Arc<dyn RequestSink>,
    state: Arc<Mutex<ClientState>>,
    next_id: Arc<AtomicU64>,
}

impl ExecClient {
    pub fn new(sink: Arc<dyn RequestSink>) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new(ClientState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls `function` with no target element.
    pub async fn call(&self, function: FunctionId, args: Value) -> Result<Value, ExecError> {
        self.request(function, None, args).await
    }

    /// Calls `function` against the element at `target`.
    pub async fn call_on(
        &self,
        target: ComponentId,
        function: FunctionId,
        args: Value,
    ) -> Result<Value, ExecError> {
        self.request(function, Some(target), args).await
    }

    async fn request(
        &self,
        function_id: FunctionId,
        target: Option<ComponentId>,
        args: Value,
    ) -> Result<Value, ExecError> {
        let request_id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ExecError::connection_closed("client is closed"));
            }
            state.pending.insert(request_id, tx);
        }

        trace!(request = request_id.0, function = function_id.0, "sending exec request");
        let request = ExecRequest {
            request_id,
            function_id,
            target,
            args,
        };
        if let Err(e) = self.sink.send_request(request) {
            self.lock().pending.remove(&request_id);
            return Err(e);
        }

        rx.await.map_err(|_| {
            ExecError::connection_closed(format!("request {request_id} was abandoned"))
        })?
    }

    /// Completes the call waiting on `response.request_id`. Returns `false`
    /// for responses nobody is waiting for.
    pub fn resolve(&self, response: ExecResponse) -> bool {
        let request_id = response.request_id;
        let Some(sender) = self.lock().pending.remove(&request_id) else {
            warn!(request = request_id.0, "response for unknown or settled request");
            return false;
        };
        trace!(request = request_id.0, "exec response received");
        // The caller may have gone away; that is not an error here.
        let _ = sender.send(response.into_result());
        true
    }

    /// Rejects every outstanding call and refuses new ones. Returns how many
    /// calls were rejected.
    pub fn close(&self) -> usize {
        let pending: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().collect()
        };
        let count = pending.len();
        for (request_id, sender) in pending {
            let _ = sender.send(Err(ExecError::connection_closed(format!(
                "connection closed before request {request_id} completed"
            ))));
        }
        if count > 0 {
            debug!(rejected = count, "pending exec requests rejected");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecServer, FunctionRepository, FN_ECHO};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct QueueSink(mpsc::UnboundedSender<ExecRequest>);

    impl RequestSink for QueueSink {
        fn send_request(&self, request: ExecRequest) -> Result<(), ExecError> {
            self.0
                .send(request)
                .map_err(|_| ExecError::connection_closed("sink dropped"))
        }
    }

    fn client() -> (ExecClient, mpsc::UnboundedReceiver<ExecRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ExecClient::new(Arc::new(QueueSink(tx))), rx)
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (client, mut requests) = client();
        let server = ExecServer::new(Arc::new(FunctionRepository::standard()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call(FN_ECHO, json!({"hello": "world"})).await }
        });
        let request = requests.recv().await.unwrap();
        assert_eq!(request.function_id, FN_ECHO);
        let response = server.handle(request, |_| true).await;
        assert!(client.resolve(response));

        assert_eq!(call.await.unwrap().unwrap(), json!({"hello": "world"}));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_responses_correlate_out_of_order() {
        let (client, mut requests) = client();
        let mut calls = Vec::new();
        for n in 0..3 {
            let client = client.clone();
            calls.push(tokio::spawn(
                async move { client.call(FN_ECHO, json!(n)).await },
            ));
        }
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(requests.recv().await.unwrap());
        }
        let mut ids: Vec<u64> = received.iter().map(|r| r.request_id.0).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        for request in received.into_iter().rev() {
            let value = json!({"echo": request.args});
            assert!(client.resolve(ExecResponse::ok(request.request_id, value)));
        }
        for (n, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!({"echo": n}));
        }
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_ignores_late_responses() {
        let (client, mut requests) = client();
        let mut calls = Vec::new();
        for n in 0..4 {
            let client = client.clone();
            calls.push(tokio::spawn(
                async move { client.call(FN_ECHO, json!(n)).await },
            ));
        }
        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(requests.recv().await.unwrap());
        }
        assert_eq!(client.pending_count(), 4);

        assert_eq!(client.close(), 4);
        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, ExecError::ConnectionClosed { .. }));
        }

        let late = ExecResponse::ok(received[0].request_id, json!(0));
        assert!(!client.resolve(late));

        let err = client.call(FN_ECHO, json!(9)).await.unwrap_err();
        assert_eq!(err.code(), 11401);
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_failure_clears_pending() {
        let (client, requests) = client();
        drop(requests);
        let err = client.call(FN_ECHO, json!(1)).await.unwrap_err();
        assert!(matches!(err, ExecError::ConnectionClosed { .. }));
        assert_eq!(client.pending_count(), 0);
    }
}
