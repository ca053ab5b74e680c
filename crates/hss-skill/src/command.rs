//! Commands the skill server sends to a skill.

use serde_json::Value;

use crate::intent::{IntentError, IntentRequest};

pub const GET_INTENT_LIST: &str = "get_intentlist";
pub const HANDLE: &str = "handle";

#[derive(Debug, Clone, PartialEq)]
pub enum SkillCommand {
    /// Report the intents this skill handles.
    GetIntentList,
    /// Process one recognized intent.
    Handle(IntentRequest),
    /// A `handle` request whose payload is not a usable intent.
    MalformedIntent(IntentError),
    /// Anything else. Left unanswered.
    Unknown(String),
}

impl SkillCommand {
    pub fn parse(command: &str, payload: Value) -> Self {
        match command {
            GET_INTENT_LIST => Self::GetIntentList,
            HANDLE => match IntentRequest::from_payload(payload) {
                Ok(intent) => Self::Handle(intent),
                Err(e) => Self::MalformedIntent(e),
            },
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::GetIntentList => GET_INTENT_LIST,
            Self::Handle(_) | Self::MalformedIntent(_) => HANDLE,
            Self::Unknown(name) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_commands() {
        assert_eq!(
            SkillCommand::parse("get_intentlist", Value::Null),
            SkillCommand::GetIntentList
        );

        let SkillCommand::Handle(intent) = SkillCommand::parse(
            "handle",
            json!({"intent": {"intentName": "timer:Set"}, "siteId": "default"}),
        ) else {
            panic!("expected a handle command");
        };
        assert_eq!(intent.intent_name, "timer:Set");
        assert_eq!(intent.site_id.as_deref(), Some("default"));
    }

    #[test]
    fn handle_without_intent_name_is_malformed() {
        assert_eq!(
            SkillCommand::parse("handle", json!({"sessionId": "s"})),
            SkillCommand::MalformedIntent(IntentError::MissingIntentName)
        );
    }

    #[test]
    fn unknown_commands_keep_their_name() {
        let command = SkillCommand::parse("get_config", json!({}));
        assert_eq!(command, SkillCommand::Unknown("get_config".to_string()));
        assert_eq!(command.name(), "get_config");
    }

    #[test]
    fn command_names_are_case_sensitive() {
        assert!(matches!(
            SkillCommand::parse("Handle", Value::Null),
            SkillCommand::Unknown(_)
        ));
    }
}
