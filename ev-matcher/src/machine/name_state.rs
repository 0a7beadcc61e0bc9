/*!
Field-level states of the name machine.

A `NameState` represents "the set of sub-rules whose observed-field
prefix equals the path taken to here". It owns one [`ByteMachine`] per
field name that can be consumed next, plus the sub-rule accounting that
keeps state sharing safe: every sub-rule that travels through this
state is registered *per incoming pattern*, and the finder intersects
its candidate set with those registrations at each hop. Sharing a state
therefore changes the graph's shape but never the match set.
*/
use std::collections::{BTreeSet, HashMap};

use crate::machine::byte_machine::ByteMachine;
use crate::machine::sub_rule::SubRuleId;
use crate::pattern::Pattern;

/// Stable arena index of a [`NameState`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct NameStateId(u32);

impl NameStateId {
    pub(crate) fn from_index(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
impl NameStateId {
    pub(crate) const fn test(raw: u32) -> Self {
        Self(raw)
    }
}

/// An Exists(true) edge: any value of the field advances to `next`.
/// `uses` counts the sub-rules threaded through it.
#[derive(Debug)]
pub(crate) struct ExistsEntry {
    pub next: NameStateId,
    pub uses: u32,
}

#[derive(Debug, Default)]
pub(crate) struct NameState {
    /// Field name -> the byte machine holding every value pattern any
    /// sub-rule attaches to that field at this point of its path.
    pub value_transitions: HashMap<String, ByteMachine>,
    /// Field name -> existence edges (usually one; reuse can fork).
    pub exists_true: HashMap<String, Vec<ExistsEntry>>,
    /// Sub-rules that complete on arrival via the keyed pattern.
    terminal: HashMap<Pattern, BTreeSet<SubRuleId>>,
    /// Sub-rules that continue past this state via the keyed pattern.
    non_terminal: HashMap<Pattern, BTreeSet<SubRuleId>>,
    /// Sub-rules consisting of must-not-exist checks alone (held by the
    /// root; they fire when their fields are absent from the event).
    pub absent_only: BTreeSet<SubRuleId>,
    /// Incoming byte-machine matches plus existence edges. Zero with no
    /// registrations left means the state is garbage.
    pub ref_count: u32,
}

impl NameState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: &Pattern, id: SubRuleId, terminal: bool) {
        self.bucket(terminal)
            .entry(pattern.clone())
            .or_default()
            .insert(id);
    }

    pub fn unregister(&mut self, pattern: &Pattern, id: SubRuleId, terminal: bool) {
        let bucket = self.bucket(terminal);
        if let Some(set) = bucket.get_mut(pattern) {
            set.remove(&id);
            if set.is_empty() {
                bucket.remove(pattern);
            }
        }
    }

    fn bucket(&mut self, terminal: bool) -> &mut HashMap<Pattern, BTreeSet<SubRuleId>> {
        match terminal {
            true => &mut self.terminal,
            false => &mut self.non_terminal,
        }
    }

    pub fn terminal_for(&self, pattern: &Pattern) -> Option<&BTreeSet<SubRuleId>> {
        self.terminal.get(pattern)
    }

    pub fn non_terminal_for(&self, pattern: &Pattern) -> Option<&BTreeSet<SubRuleId>> {
        self.non_terminal.get(pattern)
    }

    /// Whether any sub-rule still travels through `pattern` into this
    /// state; when none does, the byte match feeding it can go.
    pub fn in_use_via(&self, pattern: &Pattern) -> bool {
        self.terminal.contains_key(pattern) || self.non_terminal.contains_key(pattern)
    }

    /// Whether `id` continues through (or completes at) this state via
    /// `pattern`. The deletion walk uses this to pick the right branch
    /// when one pattern fans out to several next states.
    pub fn carries(&self, pattern: &Pattern, id: SubRuleId, terminal: bool) -> bool {
        match terminal {
            true => &self.terminal,
            false => &self.non_terminal,
        }
        .get(pattern)
        .is_some_and(|set| set.contains(&id))
    }

    pub fn is_garbage(&self) -> bool {
        self.ref_count == 0
            && self.terminal.is_empty()
            && self.non_terminal.is_empty()
            && self.absent_only.is_empty()
    }

    /// This state plus everything its byte machines hold.
    pub fn object_count(&self) -> usize {
        1 + self
            .value_transitions
            .values()
            .map(ByteMachine::object_count)
            .sum::<usize>()
            + self.exists_true.values().map(Vec::len).sum::<usize>()
    }
}
