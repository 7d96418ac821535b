//! Command and mention candidates for the composer text.
//!
//! Both pickers filter with case-insensitive substring containment.

use serde::Serialize;
use shared::domain::{Command, User, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Candidate {
    Command { name: String, args_hint: String },
    Mention { user_id: UserId, display_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Command,
    Mention,
}

/// Filtered view derived from the channel's commands or members.
///
/// Never empty: an empty result is reported as `None` by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestions {
    pub kind: SuggestionKind,
    pub candidates: Vec<Candidate>,
}

impl Suggestions {
    fn new(kind: SuggestionKind, candidates: Vec<Candidate>) -> Option<Self> {
        (!candidates.is_empty()).then_some(Self { kind, candidates })
    }
}

/// Composer text after a candidate was chosen, with the cursor at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub text: String,
    pub cursor: usize,
}

impl TextEdit {
    fn at_end(text: String) -> Self {
        let cursor = text.chars().count();
        Self { text, cursor }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandMentionResolver {
    prefix: char,
    trigger: char,
}

impl CommandMentionResolver {
    pub fn new(prefix: char, trigger: char) -> Self {
        Self { prefix, trigger }
    }

    pub fn resolve<'a>(
        &self,
        text: &str,
        commands: &[Command],
        members: impl IntoIterator<Item = &'a User>,
    ) -> Option<Suggestions> {
        let is_command = text.starts_with(self.prefix);
        if text.is_empty() || (!is_command && !text.contains(self.trigger)) {
            return None;
        }

        if text.chars().count() == 1 {
            return if is_command {
                self.commands_matching(commands, "")
            } else {
                self.members_matching(members, "")
            };
        }

        if text.ends_with(self.trigger) {
            return self.members_matching(members, "");
        }

        if let Some(query) = text.strip_prefix(self.prefix) {
            return self.commands_matching(commands, query);
        }

        let fragment = text.rsplit(self.trigger).next().unwrap_or_default();
        self.members_matching(members, fragment)
    }

    pub fn apply_command(&self, name: &str) -> TextEdit {
        TextEdit::at_end(format!("{}{name} ", self.prefix))
    }

    /// Replace the trailing `@fragment` of `text` with `@display_name `.
    pub fn apply_mention(&self, text: &str, display_name: &str) -> TextEdit {
        let head = match text.rfind(self.trigger) {
            Some(idx) => &text[..idx],
            None => text,
        };
        TextEdit::at_end(format!("{head}{}{display_name} ", self.trigger))
    }

    fn commands_matching(&self, commands: &[Command], query: &str) -> Option<Suggestions> {
        let query = query.to_lowercase();
        let candidates = commands
            .iter()
            .filter(|command| command.name.to_lowercase().contains(&query))
            .map(|command| Candidate::Command {
                name: command.name.clone(),
                args_hint: command.args_hint.clone(),
            })
            .collect();
        Suggestions::new(SuggestionKind::Command, candidates)
    }

    fn members_matching<'a>(
        &self,
        members: impl IntoIterator<Item = &'a User>,
        fragment: &str,
    ) -> Option<Suggestions> {
        let fragment = fragment.to_lowercase();
        let candidates = members
            .into_iter()
            .filter(|user| user.display_name.to_lowercase().contains(&fragment))
            .map(|user| Candidate::Mention {
                user_id: user.user_id.clone(),
                display_name: user.display_name.clone(),
            })
            .collect();
        Suggestions::new(SuggestionKind::Mention, candidates)
    }
}

#[cfg(test)]
#[path = "tests/suggestions_tests.rs"]
mod tests;
