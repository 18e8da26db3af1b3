//! Method registry and async dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, warn};

use crate::metrics::{API_ERRORS_TOTAL, API_REQUEST_DURATION_SECONDS, API_REQUESTS_TOTAL};
use crate::rpc::context::RpcContext;
use crate::rpc::errors::{self, RpcError};
use crate::rpc::types::{ApiRequest, ApiResponse};

/// APIs guests and observers may call.
pub const READ_ONLY_APIS: [&str; 5] = [
    "channel.list",
    "channel.enter",
    "channel.members_count",
    "channel.member.list.online",
    "message.list",
];

/// Default maximum time a single handler may run.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait implemented by every API handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given payload and context.
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError>;
}

/// Registry mapping API names to handlers.
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    timeout: Duration,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Set the per-call handler timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a handler for an API name.
    pub fn register(&mut self, api: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(api.to_owned(), Arc::new(handler));
    }

    /// Dispatch a call to its handler.
    ///
    /// Unidentified callers get `NOT_IDENTIFIED` and read-only callers get
    /// `READ_ONLY` for anything outside [`READ_ONLY_APIS`]; in both cases no
    /// handler runs. The caller's `echo` is mirrored on every response.
    pub async fn dispatch(&self, request: ApiRequest, ctx: &RpcContext) -> ApiResponse {
        let api = request.api.clone();
        counter!(API_REQUESTS_TOTAL, "api" => api.clone()).increment(1);

        let Some(identity) = ctx.connection.identity() else {
            return reject(&request.echo, &api, errors::NOT_IDENTIFIED, "Identify first".into());
        };
        if identity.is_read_only() && !READ_ONLY_APIS.contains(&api.as_str()) {
            return reject(
                &request.echo,
                &api,
                errors::READ_ONLY,
                format!("'{api}' is not available to read-only sessions"),
            );
        }
        let Some(handler) = self.handlers.get(&api) else {
            return reject(
                &request.echo,
                &api,
                errors::METHOD_NOT_FOUND,
                format!("API '{api}' not found"),
            );
        };

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(self.timeout, handler.handle(request.data, ctx)).await;

        let response = match result {
            Ok(Ok(data)) => ApiResponse::success(request.echo, data),
            Ok(Err(err)) => {
                counter!(API_ERRORS_TOTAL, "api" => api.clone(), "code" => err.code().to_owned())
                    .increment(1);
                if let RpcError::Internal { message } = &err {
                    error!(api, error = %message, "API handler failed");
                }
                ApiResponse {
                    echo: request.echo,
                    success: false,
                    data: None,
                    error: Some(err.to_error_body()),
                }
            }
            Err(_elapsed) => {
                counter!(API_ERRORS_TOTAL, "api" => api.clone(), "code" => "timeout").increment(1);
                error!(api, "API handler timed out after {:?}", self.timeout);
                ApiResponse::error(
                    request.echo,
                    errors::INTERNAL_ERROR,
                    format!("Handler for '{api}' timed out"),
                )
            }
        };

        let duration = start.elapsed();
        histogram!(API_REQUEST_DURATION_SECONDS, "api" => api.clone())
            .record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(api, duration_secs = duration.as_secs_f64(), "slow API request");
        }

        response
    }

    /// List all registered API names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether an API is registered.
    pub fn has_method(&self, api: &str) -> bool {
        self.handlers.contains_key(api)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn reject(echo: &str, api: &str, code: &'static str, message: String) -> ApiResponse {
    counter!(API_ERRORS_TOTAL, "api" => api.to_owned(), "code" => code).increment(1);
    ApiResponse::error(echo, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use crate::test_support::{fake_connection, identified, test_gateway};
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
            Ok(params.unwrap_or(json!(null)))
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MethodHandler for FailHandler {
        async fn handle(&self, _params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
            Err(RpcError::Internal {
                message: "boom".into(),
            })
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl MethodHandler for SlowHandler {
        async fn handle(&self, _params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn request(echo: &str, api: &str, data: Option<Value>) -> ApiRequest {
        ApiRequest {
            api: api.into(),
            echo: echo.into(),
            data,
        }
    }

    fn context(user: &str) -> RpcContext {
        let (gateway, _backend) = test_gateway();
        let (conn, _rx) = identified(user, false);
        RpcContext::new(gateway, conn)
    }

    #[tokio::test]
    async fn dispatch_success_mirrors_echo() {
        let ctx = context("alice");
        let mut reg = MethodRegistry::new();
        reg.register("message.list", EchoHandler);

        let resp = reg
            .dispatch(request("r1", "message.list", Some(json!({"x": 1}))), &ctx)
            .await;
        assert!(resp.success);
        assert_eq!(resp.echo, "r1");
        assert_eq!(resp.data.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn dispatch_method_not_found() {
        let ctx = context("alice");
        let reg = MethodRegistry::new();
        let resp = reg.dispatch(request("r2", "no.such", None), &ctx).await;
        assert!(!resp.success);
        assert_eq!(resp.echo, "r2");
        let err = resp.error.unwrap();
        assert_eq!(err.code, errors::METHOD_NOT_FOUND);
        assert!(err.message.contains("no.such"));
    }

    #[tokio::test]
    async fn dispatch_handler_error_is_sanitized() {
        let ctx = context("alice");
        let mut reg = MethodRegistry::new();
        reg.register("fail", FailHandler);
        let resp = reg.dispatch(request("r3", "fail", None), &ctx).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, errors::INTERNAL_ERROR);
        assert_eq!(err.message, "Internal error");
    }

    #[tokio::test]
    async fn unidentified_caller_never_reaches_handler() {
        let (gateway, _backend) = test_gateway();
        let (conn, _rx) = fake_connection();
        let ctx = RpcContext::new(gateway, conn);
        let mut reg = MethodRegistry::new();
        reg.register("channel.list", EchoHandler);
        let resp = reg.dispatch(request("r4", "channel.list", None), &ctx).await;
        assert_eq!(resp.error.unwrap().code, errors::NOT_IDENTIFIED);
    }

    #[tokio::test]
    async fn guests_limited_to_read_only_apis() {
        let (gateway, _backend) = test_gateway();
        let (conn, _rx) = fake_connection();
        assert!(conn.bind_identity(Identity::guest()));
        let ctx = RpcContext::new(gateway, conn);
        let mut reg = MethodRegistry::new();
        reg.register("message.create", EchoHandler);
        reg.register("message.list", EchoHandler);

        let denied = reg.dispatch(request("w", "message.create", None), &ctx).await;
        assert_eq!(denied.echo, "w");
        assert_eq!(denied.error.unwrap().code, errors::READ_ONLY);

        let allowed = reg.dispatch(request("r", "message.list", None), &ctx).await;
        assert!(allowed.success);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let ctx = context("alice");
        let mut reg = MethodRegistry::new().with_timeout(Duration::from_millis(50));
        reg.register("slow", SlowHandler);
        let resp = reg.dispatch(request("r5", "slow", None), &ctx).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, errors::INTERNAL_ERROR);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn list_methods_sorted() {
        let mut reg = MethodRegistry::new();
        reg.register("b.method", EchoHandler);
        reg.register("a.method", EchoHandler);
        assert_eq!(reg.methods(), vec!["a.method", "b.method"]);
        assert!(reg.has_method("a.method"));
        assert!(!reg.has_method("c.method"));
    }
}
