//! Conversation History
//!
//! `RawHistory` is the authoritative, append-only log of turns for one
//! session. Coalescing never happens at append time: the merged forms are
//! read-time projections computed from the raw log on demand.

use crate::turn::{Role, Turn};
use serde::{Deserialize, Serialize};

/// Character the backend appends to an assistant turn cut off by the user.
pub const INTERRUPTION_CHAR: char = '\u{2014}';

/// Inserted into a user turn when the user stays silent.
pub const USER_SILENCE_MARKER: &str = "...";

/// The authoritative, ordered sequence of turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawHistory {
    turns: Vec<Turn>,
}

impl RawHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn at the tail. This is the only mutation path.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// See [`compress`].
    pub fn compress(&self, separator: &str) -> Vec<Turn> {
        compress(&self.turns, separator)
    }
}

impl From<Vec<Turn>> for RawHistory {
    fn from(turns: Vec<Turn>) -> Self {
        Self { turns }
    }
}

impl<'a> IntoIterator for &'a RawHistory {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

/// A turn can take part in a merge only if it carries text and no tool calls.
fn is_mergeable(turn: &Turn) -> bool {
    turn.content.is_some() && !turn.has_tool_calls()
}

/// Folds consecutive same-role turns into one, joining their content with
/// `separator`.
///
/// Turns without content (tool-call-bearing assistant turns) are never merged
/// into or with a neighbor. Leading whitespace is trimmed only when a new turn
/// is started, never in the middle of a merge.
pub fn compress(turns: &[Turn], separator: &str) -> Vec<Turn> {
    let mut output: Vec<Turn> = Vec::with_capacity(turns.len());

    for turn in turns {
        if let Some(last) = output.last_mut() {
            if is_mergeable(turn) && is_mergeable(last) && last.role == turn.role {
                if let (Some(merged), Some(content)) = (last.content.as_mut(), &turn.content) {
                    merged.push_str(separator);
                    merged.push_str(content);
                    continue;
                }
            }
        }

        let mut started = turn.clone();
        if let Some(content) = started.content.as_mut() {
            *content = content.trim_start().to_string();
        }
        output.push(started);
    }

    output
}

/// Prepares a history for a chat-completion model.
///
/// - Turns left empty once the interruption character is removed are dropped.
/// - Consecutive same-role text turns are merged with a single space.
/// - A `user: "Hello."` turn is inserted after a leading system turn when the
///   next turn is an assistant turn or there is none.
/// - A user turn that starts with the silence marker, but is more than the
///   marker, has the marker stripped.
pub fn prepare_for_llm(turns: &[Turn]) -> Vec<Turn> {
    let mut output: Vec<Turn> = Vec::with_capacity(turns.len() + 1);

    for turn in turns {
        if let Some(content) = &turn.content {
            if content.replace(INTERRUPTION_CHAR, "").is_empty() {
                continue;
            }
        }

        if let Some(last) = output.last_mut() {
            if is_mergeable(turn) && is_mergeable(last) && last.role == turn.role {
                if let (Some(merged), Some(content)) = (last.content.as_mut(), &turn.content) {
                    merged.push(' ');
                    merged.push_str(content);
                    continue;
                }
            }
        }
        output.push(turn.clone());
    }

    let role_at = |output: &[Turn], index: usize| output.get(index).map(|t| t.role);
    if role_at(&output, 0) == Some(Role::System)
        && matches!(role_at(&output, 1), None | Some(Role::Assistant))
    {
        output.insert(1, Turn::user("Hello."));
    }

    for turn in output.iter_mut().filter(|t| t.role == Role::User) {
        if let Some(content) = turn.content.as_mut() {
            if content.starts_with(USER_SILENCE_MARKER) && content != USER_SILENCE_MARKER {
                *content = content[USER_SILENCE_MARKER.len()..].to_string();
            }
        }
    }

    output
}
