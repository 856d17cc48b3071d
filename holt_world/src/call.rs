use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Dispatch channel for a [`Call`].
///
/// The tag decides which candidate chain a call walks: `command` is tried
/// against the acting object itself, `action` against its location and
/// siblings, and `emit` is queue-delivered straight to its addressed
/// recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallTag {
    Command,
    Action,
    Emit,
}

impl CallTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallTag::Command => "command",
            CallTag::Action => "action",
            CallTag::Emit => "emit",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "command" => Some(CallTag::Command),
            "action" => Some(CallTag::Action),
            "emit" => Some(CallTag::Emit),
            _ => None,
        }
    }
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named event delivered to one object. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub tag: CallTag,
    pub content: serde_json::Value,
}

impl Call {
    pub fn new(name: impl Into<String>, tag: CallTag, content: serde_json::Value) -> Self {
        Call {
            name: name.into(),
            tag,
            content,
        }
    }
}

/// Listener registrations extracted from a script run: event name to the set
/// of tags the script accepts that event on.
pub type CallbackSet = BTreeMap<String, BTreeSet<CallTag>>;
