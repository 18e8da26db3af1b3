//! API handler modules and registration.

pub mod channel;
pub mod character;
pub mod message;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;

/// Register all API handlers with the registry.
pub fn register_all(registry: &mut MethodRegistry) {
    // Channel
    registry.register("channel.enter", channel::EnterChannelHandler);
    registry.register("channel.list", channel::ListChannelsHandler);
    registry.register("channel.members_count", channel::MembersCountHandler);
    registry.register("channel.member.list.online", channel::OnlineMembersHandler);

    // Message
    registry.register("message.create", message::CreateMessageHandler);
    registry.register("message.update", message::UpdateMessageHandler);
    registry.register("message.delete", message::DeleteMessageHandler);
    registry.register("message.remove", message::RemoveMessageHandler);
    registry.register("message.reorder", message::ReorderMessageHandler);
    registry.register("message.typing", message::TypingHandler);
    registry.register("message.list", message::ListMessagesHandler);

    // Character sheets (answered by the channel's bot)
    registry.register("character.query", character::QueryCharacterHandler);
}

/// Extract a required parameter from the params object.
pub(crate) fn require_param<'a>(
    params: Option<&'a Value>,
    key: &str,
) -> Result<&'a Value, RpcError> {
    params
        .and_then(|p| p.get(key))
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Missing required parameter: {key}"),
        })
}

/// Extract a required string parameter.
pub(crate) fn require_string_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    require_param(params, key)?
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a string"),
        })
}

/// Decode the whole params object into a typed request. Absent params
/// decode as `{}`.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams {
        message: e.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn register_all_populates_registry() {
        let mut reg = MethodRegistry::new();
        register_all(&mut reg);
        assert!(reg.has_method("channel.enter"));
        assert!(reg.has_method("channel.member.list.online"));
        assert!(reg.has_method("message.create"));
        assert!(reg.has_method("message.reorder"));
        assert!(reg.has_method("character.query"));
        assert_eq!(reg.methods().len(), 12);
    }

    #[test]
    fn read_only_apis_are_all_registered() {
        let mut reg = MethodRegistry::new();
        register_all(&mut reg);
        for api in crate::rpc::registry::READ_ONLY_APIS {
            assert!(reg.has_method(api), "{api} missing");
        }
    }

    #[test]
    fn require_param_present() {
        let params = Some(json!({"channelId": "c1"}));
        let val = require_param(params.as_ref(), "channelId").unwrap();
        assert_eq!(val, "c1");
    }

    #[test]
    fn require_param_missing() {
        let params = Some(json!({"other": 1}));
        let err = require_param(params.as_ref(), "channelId").unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        let err = require_param(None, "channelId").unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }

    #[test]
    fn require_string_param_wrong_type() {
        let params = Some(json!({"channelId": 42}));
        let err = require_string_param(params.as_ref(), "channelId").unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert!(err.to_string().contains("must be a string"));
    }

    #[derive(Debug, Deserialize)]
    struct Paging {
        #[serde(default)]
        limit: Option<u32>,
    }

    #[test]
    fn parse_params_treats_absent_as_empty_object() {
        let paging: Paging = parse_params(None).unwrap();
        assert!(paging.limit.is_none());

        let err = parse_params::<Paging>(Some(json!({"limit": "ten"}))).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }
}
