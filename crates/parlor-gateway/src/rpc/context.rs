//! Per-call dependency-injection context.

use std::sync::Arc;

use parlor_core::UserId;

use crate::gateway::Gateway;
use crate::model::Identity;
use crate::rpc::errors::{self, RpcError};
use crate::websocket::connection::ClientConnection;

/// Shared context passed to every API handler.
#[derive(Clone)]
pub struct RpcContext {
    /// Gateway state and collaborators.
    pub gateway: Arc<Gateway>,
    /// Calling connection.
    pub connection: Arc<ClientConnection>,
}

impl RpcContext {
    /// Build a context for one call.
    pub fn new(gateway: Arc<Gateway>, connection: Arc<ClientConnection>) -> Self {
        Self {
            gateway,
            connection,
        }
    }

    /// The caller's identity.
    pub fn identity(&self) -> Result<&Identity, RpcError> {
        self.connection
            .identity()
            .ok_or_else(|| RpcError::custom(errors::NOT_IDENTIFIED, "Identify first"))
    }

    /// The caller's user ID.
    pub fn user_id(&self) -> Result<&UserId, RpcError> {
        self.identity().map(|i| &i.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_connection, test_gateway};

    #[test]
    fn unidentified_caller_is_rejected() {
        let (gateway, _backend) = test_gateway();
        let (conn, _rx) = fake_connection();
        let ctx = RpcContext::new(gateway, conn);
        assert_eq!(ctx.user_id().unwrap_err().code(), errors::NOT_IDENTIFIED);
    }

    #[test]
    fn identified_caller_exposes_user() {
        let (gateway, _backend) = test_gateway();
        let (conn, _rx) = crate::test_support::identified("alice", false);
        let ctx = RpcContext::new(gateway, conn);
        assert_eq!(ctx.user_id().unwrap().as_str(), "alice");
        assert!(!ctx.identity().unwrap().is_read_only());
    }
}
