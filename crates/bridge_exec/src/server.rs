use bridge_coords::ComponentId;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{ExecCall, ExecError, ExecRequest, ExecResponse, FunctionRepository};

/// Trusted-side executor for [`ExecRequest`]s.
///
/// Every request yields exactly one response; failures are reported in the
/// response rather than dropped.
#[derive(Clone)]
pub struct ExecServer {
    repository: Arc<FunctionRepository>,
}

impl ExecServer {
    pub fn new(repository: Arc<FunctionRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<FunctionRepository> {
        &self.repository
    }

    /// Runs one request. `is_mounted` tells whether a target coordinate still
    /// names a live element.
    pub async fn handle(
        &self,
        request: ExecRequest,
        is_mounted: impl Fn(ComponentId) -> bool,
    ) -> ExecResponse {
        let ExecRequest {
            request_id,
            function_id,
            target,
            args,
        } = request;

        if let Some(coordinate) = target {
            if !is_mounted(coordinate) {
                let error =
                    ExecError::dangling(format!("target coordinate {coordinate} is not mounted"));
                warn!(request = request_id.0, function = function_id.0, "{error}");
                return ExecResponse::err(request_id, &error);
            }
        }

        debug!(request = request_id.0, function = function_id.0, "executing request");
        match self
            .repository
            .call(function_id, ExecCall { target, args })
            .await
        {
            Ok(value) => ExecResponse::ok(request_id, value),
            Err(error) => {
                warn!(request = request_id.0, function = function_id.0, "{error}");
                ExecResponse::err(request_id, &error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionId, RequestId, FN_ECHO};
    use serde_json::json;

    fn request(id: u64, function: FunctionId, target: Option<u32>) -> ExecRequest {
        ExecRequest {
            request_id: RequestId(id),
            function_id: function,
            target: target.map(ComponentId),
            args: json!({"n": id}),
        }
    }

    #[tokio::test]
    async fn test_echo_and_unknown() {
        let server = ExecServer::new(Arc::new(FunctionRepository::standard()));

        let response = server.handle(request(1, FN_ECHO, None), |_| true).await;
        assert_eq!(response.request_id, RequestId(1));
        assert_eq!(response.into_result().unwrap(), json!({"n": 1}));

        let response = server
            .handle(request(2, FunctionId(4242), None), |_| true)
            .await;
        assert_eq!(response.request_id, RequestId(2));
        assert_eq!(response.into_result().unwrap_err().code(), 11400);
    }

    #[tokio::test]
    async fn test_unmounted_target_is_dangling() {
        let server = ExecServer::new(Arc::new(FunctionRepository::standard()));
        let response = server
            .handle(request(3, FN_ECHO, Some(12)), |id| id == ComponentId(1))
            .await;
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, ExecError::DanglingReference { .. }));

        let response = server
            .handle(request(4, FN_ECHO, Some(1)), |id| id == ComponentId(1))
            .await;
        assert!(response.into_result().is_ok());
    }
}
