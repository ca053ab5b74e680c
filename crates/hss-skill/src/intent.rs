//! Intent requests from the skill server and the replies a skill sends back.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

pub const DEFAULT_LANG: &str = "en_GB";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    #[error("Received message without \"intentName\", must skip")]
    MissingIntentName,
}

/// A recognized intent, as delivered in the payload of a `handle` request.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRequest {
    pub intent_name: String,
    pub session_id: Option<String>,
    pub site_id: Option<String>,
    /// Slot name to value. A slot filled more than once maps to an array of
    /// all its values in arrival order.
    pub slots: Map<String, Value>,
    /// The full request payload.
    pub raw: Value,
}

impl IntentRequest {
    pub fn from_payload(payload: Value) -> Result<Self, IntentError> {
        let intent_name = payload
            .pointer("/intent/intentName")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or(IntentError::MissingIntentName)?
            .to_string();

        let session_id = string_field(&payload, "sessionId");
        let site_id = string_field(&payload, "siteId");
        let slots = fold_slots(payload.get("slots"));

        Ok(Self {
            intent_name,
            session_id,
            site_id,
            slots,
            raw: payload,
        })
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.slots.get(name)
    }

    pub fn slot_str(&self, name: &str) -> Option<&str> {
        self.slot(name).and_then(Value::as_str)
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn fold_slots(slots: Option<&Value>) -> Map<String, Value> {
    let entries = match slots {
        None | Some(Value::Null) => return Map::new(),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            tracing::error!(slots = %other, "Failed to parse slots (expected an array)");
            return Map::new();
        }
    };

    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();

    for entry in entries {
        let Some(name) = entry
            .get("slotName")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
        else {
            continue;
        };

        let Some(value) = entry.pointer("/value/value") else {
            tracing::error!(slot = name, "Failed to parse slots (slot without value)");
            continue;
        };

        grouped
            .entry(name.to_string())
            .or_default()
            .push(value.clone());
    }

    grouped
        .into_iter()
        .map(|(name, mut values)| {
            let folded = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            (name, folded)
        })
        .collect()
}

/// What a skill answers to an intent.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillReply {
    /// Speak `text` and end the session.
    Answer { text: String, lang: Option<String> },
    /// Ask a follow-up question and keep the session open, optionally
    /// restricting which intents may answer it.
    Followup {
        question: String,
        lang: Option<String>,
        intent_filter: Option<Vec<String>>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerPayload<'a> {
    session_id: Option<&'a str>,
    site_id: Option<&'a str>,
    text: &'a str,
    lang: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FollowupPayload<'a> {
    session_id: Option<&'a str>,
    site_id: Option<&'a str>,
    question: &'a str,
    lang: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    intent_filter: Option<&'a [String]>,
}

impl SkillReply {
    pub fn answer(text: impl Into<String>) -> Self {
        Self::Answer {
            text: text.into(),
            lang: None,
        }
    }

    pub fn followup(question: impl Into<String>) -> Self {
        Self::Followup {
            question: question.into(),
            lang: None,
            intent_filter: None,
        }
    }

    pub fn with_lang(mut self, new_lang: impl Into<String>) -> Self {
        match &mut self {
            Self::Answer { lang, .. } | Self::Followup { lang, .. } => *lang = Some(new_lang.into()),
        }
        self
    }

    /// Restrict the intents accepted as an answer. Ignored for answers.
    pub fn with_intent_filter<I, S>(mut self, intents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::Followup { intent_filter, .. } = &mut self {
            *intent_filter = Some(intents.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Render the response payload for `intent`'s session.
    pub fn to_payload(&self, intent: &IntentRequest) -> Value {
        let session_id = intent.session_id.as_deref();
        let site_id = intent.site_id.as_deref();

        let rendered = match self {
            Self::Answer { text, lang } => serde_json::to_value(AnswerPayload {
                session_id,
                site_id,
                text,
                lang: lang.as_deref().unwrap_or(DEFAULT_LANG),
            }),
            Self::Followup {
                question,
                lang,
                intent_filter,
            } => serde_json::to_value(FollowupPayload {
                session_id,
                site_id,
                question,
                lang: lang.as_deref().unwrap_or(DEFAULT_LANG),
                intent_filter: intent_filter.as_deref(),
            }),
        };

        // Only strings and options of strings: serialization cannot fail.
        rendered.unwrap_or(Value::Null)
    }
}
