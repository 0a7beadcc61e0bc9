/*!
The machine: rules in, rule names out.

`Machine` owns the name-state graph behind one machine-wide
reader-writer lock. Writers (`add_rule` / `delete_rule`) validate
everything (parse, normalize, encode, complexity) before the first
mutation, so a failed add leaves the graph exactly as it was. Readers
traverse purely in memory and never mutate, so any number of them run
concurrently; a reader admitted after a writer releases sees the whole
write or none of it.

Threading a sub-rule walks its sorted steps from the root: each step
either reuses an existing next state (conservatively, only when every
pattern of the step already leads there; a configurable extended mode
also reuses a single agreed candidate) or creates a fresh one, then
records the sub-rule per pattern at the destination. Deletion walks the
same path and unwinds it, letting the byte machines and the name-state
arena reclaim whatever no surviving rule uses.
*/
mod arena;
mod byte_machine;
mod finder;
mod name_state;
mod sub_rule;

use std::collections::HashMap;
use std::sync::Arc;

use bon::bon;
use itertools::Itertools;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Error;
use crate::event;
use crate::machine::arena::Arena;
use crate::machine::byte_machine::ByteMachine;
use crate::machine::name_state::{ExistsEntry, NameState, NameStateId};
use crate::machine::sub_rule::{next_sub_rule_id, StoredSubRule, SubRuleContext, SubRuleId};
use crate::pattern::Pattern;
use crate::syntax::{self, NormalizedSubRule, Step};

/// Matches JSON events against named declarative rules in time
/// proportional to the event, not the rule count.
///
/// ```
/// use ev_matcher::Machine;
///
/// let machine = Machine::default();
/// machine
///     .add_rule("scale-up", r#"{"metric": ["cpu"], "value": [{"numeric": [">", 80]}]}"#)
///     .unwrap();
///
/// let matched = machine
///     .rules_for_json_event(r#"{"metric": "cpu", "value": 93}"#)
///     .unwrap();
/// assert_eq!(matched, vec!["scale-up"]);
/// ```
pub struct Machine {
    core: RwLock<MachineCore>,
    additional_name_state_reuse: bool,
    rule_overriding: bool,
    path_allowed_multiple_times: bool,
    max_complexity: usize,
}

#[bon]
impl Machine {
    #[builder]
    pub fn new(
        /// Also reuse a next state when the step's already-known
        /// patterns agree on a single candidate, instead of requiring
        /// every pattern to know it. Changes graph shape, never the
        /// match set.
        #[builder(default = false)]
        additional_name_state_reuse: bool,

        /// `add_rule` with an existing name atomically replaces the
        /// rule instead of adding alternatives to it.
        #[builder(default = false)]
        rule_overriding: bool,

        /// Permit one sub-rule to constrain the same JSON path twice.
        /// Off by default: plain JSON cannot even express it, so a
        /// duplicate arriving through `$or` composition is almost
        /// always a mistake.
        #[builder(default = false)]
        path_allowed_multiple_times: bool,

        /// Ceiling on wildcard states that can be simultaneously live
        /// in one field's machine; adds that would cross it fail with
        /// [`Error::TooComplex`].
        #[builder(default = 256)]
        max_complexity: usize,
    ) -> Self {
        Self {
            core: RwLock::new(MachineCore::new()),
            additional_name_state_reuse,
            rule_overriding,
            path_allowed_multiple_times,
            max_complexity,
        }
    }

    pub fn add_rule(&self, name: &str, rule: &str) -> Result<(), Error> {
        let json: Value = serde_json::from_str(rule)
            .map_err(|e| Error::InvalidRule(format!("rule is not valid JSON: {e}")))?;
        self.add_rule_value(name, &json)
    }

    pub fn add_rule_value(&self, name: &str, rule: &Value) -> Result<(), Error> {
        let sub_rules = syntax::compile(rule, self.path_allowed_multiple_times)?;
        let mut core = self.core.write();

        let overriding = self.rule_overriding && core.rules.contains_key(name);
        let mut fresh: Vec<NormalizedSubRule> = Vec::new();
        for sub in sub_rules {
            if !fresh.contains(&sub) && (overriding || !core.has_sub_rule(name, &sub)) {
                fresh.push(sub);
            }
        }
        // Everything that can fail does so here, before any mutation.
        for sub in &fresh {
            core.check_complexity(sub, self.max_complexity, self.additional_name_state_reuse)?;
        }

        if overriding {
            core.delete_rule_entirely(name);
        }
        let name: Arc<str> = Arc::from(name);
        let added = fresh.len();
        for sub in fresh {
            core.insert_sub_rule(&name, sub, self.additional_name_state_reuse);
        }
        debug!(rule = %name, sub_rules = added, "rule added");
        Ok(())
    }

    /// Removes the given rule. Idempotent: unknown names, unknown
    /// alternatives, and a `name` that does not own the found
    /// alternative are quiet no-ops.
    pub fn delete_rule(&self, name: &str, rule: &str) -> Result<(), Error> {
        let json: Value = serde_json::from_str(rule)
            .map_err(|e| Error::InvalidRule(format!("rule is not valid JSON: {e}")))?;
        self.delete_rule_value(name, &json)
    }

    pub fn delete_rule_value(&self, name: &str, rule: &Value) -> Result<(), Error> {
        let sub_rules = syntax::compile(rule, self.path_allowed_multiple_times)?;
        let mut core = self.core.write();
        let mut removed = 0;
        for sub in sub_rules {
            let stored = match core.rules.get_mut(name) {
                Some(list) => list
                    .iter()
                    .position(|s| s.steps == sub.steps && s.must_not_exist == sub.must_not_exist)
                    .map(|pos| list.remove(pos)),
                None => None,
            };
            if core.rules.get(name).is_some_and(Vec::is_empty) {
                core.rules.remove(name);
            }
            if let Some(stored) = stored {
                core.delete_sub_rule(&stored);
                removed += 1;
            }
        }
        debug!(rule = name, sub_rules = removed, "rule deleted");
        Ok(())
    }

    /// Matches a JSON event with per-row array semantics: values picked
    /// from an array of objects must all come from the same element.
    pub fn rules_for_json_event(&self, event: &str) -> Result<Vec<String>, Error> {
        let json: Value = serde_json::from_str(event)
            .map_err(|e| Error::InvalidEvent(format!("not valid JSON: {e}")))?;
        self.rules_for_json_event_value(&json)
    }

    pub fn rules_for_json_event_value(&self, event: &Value) -> Result<Vec<String>, Error> {
        let fields = event::flatten_json(event)?;
        let core = self.core.read();
        Ok(names_of(&core, finder::rules_matching(&core, &fields, true)))
    }

    /// Matches a pre-flattened event: alternating path and value
    /// tokens, string values already JSON-quoted. This is the older
    /// flat multiset semantics, which may accept matches spanning
    /// different array elements. New rule sets should prefer
    /// [`Machine::rules_for_json_event`].
    pub fn rules_for_event(&self, tokens: &[&str]) -> Result<Vec<String>, Error> {
        let fields = event::flatten_tokens(tokens)?;
        let core = self.core.read();
        Ok(names_of(&core, finder::rules_matching(&core, &fields, false)))
    }

    pub fn is_empty(&self) -> bool {
        self.core.read().rules.is_empty()
    }

    /// Structural size: name states plus everything their byte
    /// machines hold. Adding then deleting a rule restores it.
    pub fn approximate_object_count(&self) -> usize {
        let core = self.core.read();
        core.names.iter().map(|(_, s)| s.object_count()).sum()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.core.read().rules.keys().map(|k| k.to_string()).collect()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::builder().build()
    }
}

fn names_of(core: &MachineCore, ids: std::collections::BTreeSet<SubRuleId>) -> Vec<String> {
    ids.iter()
        .map(|id| core.sub_rule(*id).rule.to_string())
        .unique()
        .collect()
}

/// Everything behind the lock.
pub(crate) struct MachineCore {
    names: Arena<NameState>,
    root: NameStateId,
    registry: HashMap<SubRuleId, SubRuleContext>,
    rules: HashMap<Arc<str>, Vec<StoredSubRule>>,
}

impl MachineCore {
    fn new() -> Self {
        let mut names = Arena::new();
        let root = NameStateId::from_index(names.insert(NameState::new()));
        Self {
            names,
            root,
            registry: HashMap::new(),
            rules: HashMap::new(),
        }
    }

    pub(crate) fn root(&self) -> NameStateId {
        self.root
    }

    pub(crate) fn name_state(&self, id: NameStateId) -> &NameState {
        self.names.get(id.index())
    }

    fn name_state_mut(&mut self, id: NameStateId) -> &mut NameState {
        self.names.get_mut(id.index())
    }

    pub(crate) fn sub_rule(&self, id: SubRuleId) -> &SubRuleContext {
        self.registry.get(&id).expect("unregistered sub-rule id")
    }

    fn has_sub_rule(&self, name: &str, sub: &NormalizedSubRule) -> bool {
        self.rules.get(name).is_some_and(|list| {
            list.iter()
                .any(|s| s.steps == sub.steps && s.must_not_exist == sub.must_not_exist)
        })
    }

    /// Wildcard-safety pre-check, run before any mutation. Walks the
    /// reuse path the insert would take and bounds each touched field
    /// machine's live-state count plus the incoming stars.
    fn check_complexity(
        &self,
        sub: &NormalizedSubRule,
        limit: usize,
        additional_reuse: bool,
    ) -> Result<(), Error> {
        let mut state = Some(self.root);
        for step in &sub.steps {
            let stars: usize = step.patterns.iter().map(Pattern::spin_weight).sum();
            let existing = state
                .and_then(|sid| self.name_state(sid).value_transitions.get(&step.path))
                .map_or(0, |m| m.evaluate_complexity(limit.saturating_add(stars) + 1));
            let complexity = existing + stars;
            if complexity > limit {
                return Err(Error::TooComplex { complexity, limit });
            }
            state = state.and_then(|sid| self.reuse_target(sid, step, additional_reuse));
        }
        Ok(())
    }

    /// The next state an added step would reuse, if any.
    ///
    /// Conservative default: every pattern of the step must already
    /// have a terminal leading to one common state (lowest index wins
    /// when several qualify). Extended mode additionally reuses when
    /// the patterns that are already known agree on exactly one
    /// candidate; the per-pattern accounting keeps either choice
    /// invisible to the match set.
    fn reuse_target(&self, state: NameStateId, step: &Step, additional: bool) -> Option<NameStateId> {
        let state = self.name_state(state);
        let per_pattern: Vec<Vec<NameStateId>> = step
            .patterns
            .iter()
            .map(|pattern| match pattern {
                Pattern::Exists(true) => state
                    .exists_true
                    .get(&step.path)
                    .map(|entries| entries.iter().map(|e| e.next).collect())
                    .unwrap_or_default(),
                pattern => state
                    .value_transitions
                    .get(&step.path)
                    .map(|m| m.nexts_of(pattern))
                    .unwrap_or_default(),
            })
            .collect();

        let common = per_pattern[0]
            .iter()
            .copied()
            .filter(|candidate| per_pattern.iter().all(|c| c.contains(candidate)))
            .min_by_key(|c| c.index());
        if common.is_some() {
            return common;
        }

        if additional {
            let mut distinct: Vec<NameStateId> = per_pattern.into_iter().flatten().collect();
            distinct.sort_by_key(|c| c.index());
            distinct.dedup();
            if let [only] = distinct[..] {
                return Some(only);
            }
        }
        None
    }

    fn insert_sub_rule(&mut self, name: &Arc<str>, sub: NormalizedSubRule, additional_reuse: bool) {
        let id = next_sub_rule_id();
        let mut state = self.root;
        let count = sub.steps.len();
        for (i, step) in sub.steps.iter().enumerate() {
            let terminal = i + 1 == count;
            let next = self
                .reuse_target(state, step, additional_reuse)
                .unwrap_or_else(|| NameStateId::from_index(self.names.insert(NameState::new())));
            for pattern in &step.patterns {
                let created = match pattern {
                    Pattern::Exists(true) => {
                        let entries = self
                            .name_state_mut(state)
                            .exists_true
                            .entry(step.path.clone())
                            .or_default();
                        match entries.iter_mut().find(|e| e.next == next) {
                            Some(entry) => {
                                entry.uses += 1;
                                false
                            }
                            None => {
                                entries.push(ExistsEntry { next, uses: 1 });
                                true
                            }
                        }
                    }
                    Pattern::Exists(false) => {
                        unreachable!("must-not-exist fields never become steps")
                    }
                    pattern => self
                        .name_state_mut(state)
                        .value_transitions
                        .entry(step.path.clone())
                        .or_insert_with(ByteMachine::new)
                        .add_pattern(pattern, next),
                };
                if created {
                    self.name_state_mut(next).ref_count += 1;
                }
                self.name_state_mut(next).register(pattern, id, terminal);
            }
            state = next;
        }
        if sub.steps.is_empty() {
            let root = self.root;
            self.name_state_mut(root).absent_only.insert(id);
        }
        self.registry.insert(
            id,
            SubRuleContext {
                id,
                rule: Arc::clone(name),
                must_not_exist: sub.must_not_exist.clone(),
            },
        );
        self.rules.entry(Arc::clone(name)).or_default().push(StoredSubRule {
            id,
            steps: sub.steps,
            must_not_exist: sub.must_not_exist,
        });
    }

    fn delete_rule_entirely(&mut self, name: &str) {
        for stored in self.rules.remove(name).unwrap_or_default() {
            self.delete_sub_rule(&stored);
        }
    }

    fn delete_sub_rule(&mut self, stored: &StoredSubRule) {
        self.remove_chain(self.root, &stored.steps, 0, stored.id);
        if stored.steps.is_empty() {
            let root = self.root;
            self.name_state_mut(root).absent_only.remove(&stored.id);
        }
        self.registry.remove(&stored.id);
    }

    /// Walks the insert path of one sub-rule and unwinds it from the
    /// far end: unregister everywhere, drop byte matches nothing else
    /// travels through, and reclaim name states that end up garbage.
    fn remove_chain(&mut self, state: NameStateId, steps: &[Step], index: usize, id: SubRuleId) {
        let Some(step) = steps.get(index) else { return };
        let terminal = index + 1 == steps.len();

        let lead = &step.patterns[0];
        let candidates: Vec<NameStateId> = match lead {
            Pattern::Exists(true) => self
                .name_state(state)
                .exists_true
                .get(&step.path)
                .map(|entries| entries.iter().map(|e| e.next).collect())
                .unwrap_or_default(),
            lead => self
                .name_state(state)
                .value_transitions
                .get(&step.path)
                .map(|m| m.nexts_of(lead))
                .unwrap_or_default(),
        };
        let Some(next) = candidates
            .into_iter()
            .find(|n| self.name_state(*n).carries(lead, id, terminal))
        else {
            return;
        };
        self.remove_chain(next, steps, index + 1, id);

        for pattern in &step.patterns {
            self.name_state_mut(next).unregister(pattern, id, terminal);
            let removed = match pattern {
                Pattern::Exists(true) => {
                    let entries = self
                        .name_state_mut(state)
                        .exists_true
                        .get_mut(&step.path)
                        .expect("existence edge vanished");
                    let pos = entries
                        .iter()
                        .position(|e| e.next == next)
                        .expect("existence edge vanished");
                    entries[pos].uses -= 1;
                    let unused = entries[pos].uses == 0;
                    if unused {
                        entries.remove(pos);
                    }
                    unused
                }
                Pattern::Exists(false) => {
                    unreachable!("must-not-exist fields never become steps")
                }
                pattern => {
                    !self.name_state(next).in_use_via(pattern)
                        && self
                            .name_state_mut(state)
                            .value_transitions
                            .get_mut(&step.path)
                            .is_some_and(|m| m.delete_match(pattern, next))
                }
            };
            if removed {
                self.name_state_mut(next).ref_count -= 1;
            }
        }

        let state_mut = self.name_state_mut(state);
        if state_mut
            .value_transitions
            .get(&step.path)
            .is_some_and(ByteMachine::is_empty)
        {
            state_mut.value_transitions.remove(&step.path);
        }
        if state_mut
            .exists_true
            .get(&step.path)
            .is_some_and(Vec::is_empty)
        {
            state_mut.exists_true.remove(&step.path);
        }

        if self.name_state(next).is_garbage() {
            trace!(state = next.index(), "reclaiming unreferenced name state");
            let gone = self.names.remove(next.index());
            debug_assert!(
                gone.value_transitions.is_empty() && gone.exists_true.is_empty(),
                "reclaimed a name state that still owns structure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(machine: &Machine, event: &str) -> Vec<String> {
        let mut out = machine.rules_for_json_event(event).unwrap();
        out.sort();
        out
    }

    #[test]
    fn cidr_blocks() {
        let machine = Machine::default();
        machine
            .add_rule("block", r#"{"ip": [{"cidr": "10.0.0.0/30"}]}"#)
            .unwrap();
        assert_eq!(matched(&machine, r#"{"ip": "10.0.0.2"}"#), vec!["block"]);
        assert!(matched(&machine, r#"{"ip": "10.0.0.4"}"#).is_empty());
        assert!(matched(&machine, r#"{"ip": "not an ip"}"#).is_empty());
    }

    #[test]
    fn lone_ip_rule_matches_like_slash_32() {
        let machine = Machine::default();
        machine.add_rule("one", r#"{"ip": ["10.0.0.2"]}"#).unwrap();
        assert_eq!(matched(&machine, r#"{"ip": "10.0.0.2"}"#), vec!["one"]);
        assert!(matched(&machine, r#"{"ip": "10.0.0.3"}"#).is_empty());
    }

    #[test]
    fn numeric_ranges() {
        let machine = Machine::default();
        machine
            .add_rule("open", r#"{"x": [{"numeric": [">", 0, "<", 1]}]}"#)
            .unwrap();
        assert_eq!(matched(&machine, r#"{"x": 0.5}"#), vec!["open"]);
        assert!(matched(&machine, r#"{"x": 1}"#).is_empty());
        assert!(matched(&machine, r#"{"x": 0}"#).is_empty());
        assert!(matched(&machine, r#"{"x": "0.5"}"#).is_empty());
    }

    #[test]
    fn numeric_forms_are_canonical() {
        let machine = Machine::default();
        machine.add_rule("n", r#"{"x": [380]}"#).unwrap();
        assert_eq!(matched(&machine, r#"{"x": 3.8e2}"#), vec!["n"]);
        assert_eq!(matched(&machine, r#"{"x": 380.000}"#), vec!["n"]);
        // Higher precision than the rule literal does not match.
        assert!(matched(&machine, r#"{"x": 380.0000001}"#).is_empty());
    }

    #[test]
    fn anything_but_suffix() {
        let machine = Machine::default();
        machine
            .add_rule("ab", r#"{"a": [{"anything-but": {"suffix": "$"}}]}"#)
            .unwrap();
        assert!(matched(&machine, r#"{"a": "value$"}"#).is_empty());
        assert_eq!(matched(&machine, r#"{"a": "$notvalue"}"#), vec!["ab"]);
    }

    #[test]
    fn shared_name_states_stay_safe() {
        let machine = Machine::default();
        machine
            .add_rule("r1", r#"{"foo": ["a"], "bar": ["x", "y"]}"#)
            .unwrap();
        machine
            .add_rule("r2", r#"{"foo": ["a", "b"], "bar": ["x"]}"#)
            .unwrap();
        machine
            .add_rule("r3", r#"{"foo": ["a", "b"], "bar": ["y"]}"#)
            .unwrap();

        assert_eq!(
            matched(&machine, r#"{"foo": "a", "bar": "x"}"#),
            vec!["r1", "r2"]
        );
        assert_eq!(
            matched(&machine, r#"{"foo": "a", "bar": "y"}"#),
            vec!["r1", "r3"]
        );
        assert_eq!(
            matched(&machine, r#"{"foo": "b", "bar": "x"}"#),
            vec!["r2"]
        );
    }

    #[test]
    fn shared_name_states_stay_safe_with_extra_reuse() {
        let machine = Machine::builder().additional_name_state_reuse(true).build();
        machine
            .add_rule("r1", r#"{"foo": ["a"], "bar": ["x", "y"]}"#)
            .unwrap();
        machine
            .add_rule("r2", r#"{"foo": ["a", "b"], "bar": ["x"]}"#)
            .unwrap();
        machine
            .add_rule("r3", r#"{"foo": ["a", "b"], "bar": ["y"]}"#)
            .unwrap();

        // The reuse decision may change the graph, never the matches.
        assert_eq!(
            matched(&machine, r#"{"foo": "a", "bar": "x"}"#),
            vec!["r1", "r2"]
        );
        assert_eq!(
            matched(&machine, r#"{"foo": "a", "bar": "y"}"#),
            vec!["r1", "r3"]
        );
    }

    #[test]
    fn subset_alternatives_keep_their_own_terminals() {
        let machine = Machine::default();
        machine
            .add_rule("long", r#"{"a": ["x"], "b": ["y"]}"#)
            .unwrap();
        machine.add_rule("short", r#"{"a": ["x"]}"#).unwrap();

        // The shorter rule's fields are a prefix of the longer rule's
        // path; neither may borrow the other's terminal.
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["short"]);
        assert_eq!(matched(&machine, r#"{"a": "x", "b": "y"}"#), vec!["long", "short"]);

        machine.delete_rule("short", r#"{"a": ["x"]}"#).unwrap();
        assert!(matched(&machine, r#"{"a": "x"}"#).is_empty());
        assert_eq!(matched(&machine, r#"{"a": "x", "b": "y"}"#), vec!["long"]);
    }

    #[test]
    fn exists_false() {
        let machine = Machine::default();
        machine
            .add_rule("absent", r#"{"bar": [{"exists": false}]}"#)
            .unwrap();
        assert_eq!(matched(&machine, r#"{"zoo": "a"}"#), vec!["absent"]);
        assert!(matched(&machine, r#"{"bar": 1}"#).is_empty());
    }

    #[test]
    fn exists_false_with_positive_fields() {
        let machine = Machine::default();
        machine
            .add_rule(
                "lonely",
                r#"{"a": ["on"], "b": [{"exists": false}]}"#,
            )
            .unwrap();
        assert_eq!(matched(&machine, r#"{"a": "on"}"#), vec!["lonely"]);
        assert!(matched(&machine, r#"{"a": "on", "b": 0}"#).is_empty());
        assert!(matched(&machine, r#"{"a": "off"}"#).is_empty());
    }

    #[test]
    fn exists_true() {
        let machine = Machine::default();
        machine
            .add_rule("present", r#"{"a": [{"exists": true}]}"#)
            .unwrap();
        assert_eq!(matched(&machine, r#"{"a": "anything"}"#), vec!["present"]);
        assert_eq!(matched(&machine, r#"{"a": 17}"#), vec!["present"]);
        assert!(matched(&machine, r#"{"b": "a"}"#).is_empty());
    }

    #[test]
    fn or_composes_with_context() {
        let machine = Machine::default();
        machine
            .add_rule(
                "either",
                r#"{"source": ["m"], "$or": [{"x": [1]}, {"y": [2]}]}"#,
            )
            .unwrap();
        assert_eq!(matched(&machine, r#"{"source": "m", "x": 1}"#), vec!["either"]);
        assert_eq!(matched(&machine, r#"{"source": "m", "y": 2}"#), vec!["either"]);
        assert!(matched(&machine, r#"{"source": "m", "x": 2}"#).is_empty());
        assert!(matched(&machine, r#"{"x": 1}"#).is_empty());
    }

    #[test]
    fn string_pattern_kinds() {
        let machine = Machine::default();
        machine.add_rule("p", r#"{"a": [{"prefix": "al"}]}"#).unwrap();
        machine.add_rule("s", r#"{"a": [{"suffix": "rn"}]}"#).unwrap();
        machine
            .add_rule("i", r#"{"a": [{"equals-ignore-case": "Albern"}]}"#)
            .unwrap();
        machine.add_rule("w", r#"{"a": [{"wildcard": "a*n"}]}"#).unwrap();
        machine.add_rule("e", r#"{"a": [{"exactly": "albern"}]}"#).unwrap();

        assert_eq!(matched(&machine, r#"{"a": "albern"}"#), vec!["e", "i", "p", "s", "w"]);
        assert_eq!(matched(&machine, r#"{"a": "ALBERN"}"#), vec!["i"]);
        assert_eq!(matched(&machine, r#"{"a": "alpen"}"#), vec!["p", "w"]);
        assert_eq!(matched(&machine, r#"{"a": "modern"}"#), vec!["s"]);
    }

    #[test]
    fn arrays_of_objects_keep_their_rows() {
        let machine = Machine::default();
        machine
            .add_rule("row", r#"{"l": {"x": [1], "y": [4]}}"#)
            .unwrap();
        // Present, but only across different rows.
        let event = r#"{"l": [{"x": 1, "y": 2}, {"x": 3, "y": 4}]}"#;
        assert!(matched(&machine, event).is_empty());
        // The flat multiset path accepts the cross-row combination.
        assert_eq!(
            machine
                .rules_for_event(&["l.x", "1", "l.y", "4"])
                .unwrap(),
            vec!["row"]
        );
        // Same row: both paths match.
        let event = r#"{"l": [{"x": 1, "y": 4}, {"x": 3, "y": 2}]}"#;
        assert_eq!(matched(&machine, event), vec!["row"]);
    }

    #[test]
    fn order_of_adds_does_not_matter() {
        let rules = [
            ("a", r#"{"foo": ["a"], "bar": ["x", "y"]}"#),
            ("b", r#"{"foo": ["a", "b"], "bar": ["x"]}"#),
            ("c", r#"{"foo": [{"prefix": "a"}]}"#),
            ("d", r#"{"bar": [{"anything-but": "x"}]}"#),
            ("e", r#"{"n": [{"numeric": [">=", 0, "<", 10]}]}"#),
        ];
        let forward = Machine::default();
        for (name, rule) in rules {
            forward.add_rule(name, rule).unwrap();
        }
        let backward = Machine::default();
        for (name, rule) in rules.iter().rev() {
            backward.add_rule(name, rule).unwrap();
        }
        for event in [
            r#"{"foo": "a", "bar": "x"}"#,
            r#"{"foo": "ab", "bar": "y"}"#,
            r#"{"foo": "b", "bar": "z", "n": 3}"#,
            r#"{"n": 10}"#,
        ] {
            assert_eq!(matched(&forward, event), matched(&backward, event), "{event}");
        }
    }

    #[test]
    fn delete_restores_structure() {
        let machine = Machine::default();
        machine.add_rule("keep", r#"{"a": ["x"]}"#).unwrap();
        let baseline = machine.approximate_object_count();

        let rules = [
            ("gone1", r#"{"a": ["x", "y"], "b": [{"prefix": "p"}]}"#),
            ("gone2", r#"{"a": [{"anything-but": {"wildcard": "x*z"}}]}"#),
            ("gone3", r#"{"n": [{"numeric": [">", 0, "<=", 5]}], "$or": [{"u": [1]}, {"v": [true]}]}"#),
            ("gone4", r#"{"c": [{"exists": true}], "d": [{"exists": false}]}"#),
        ];
        for (name, rule) in rules {
            machine.add_rule(name, rule).unwrap();
        }
        assert!(machine.approximate_object_count() > baseline);
        for (name, rule) in rules {
            machine.delete_rule(name, rule).unwrap();
        }
        assert_eq!(machine.approximate_object_count(), baseline);
        assert_eq!(machine.rule_names(), vec!["keep"]);
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["keep"]);
        assert!(matched(&machine, r#"{"a": "y"}"#).is_empty());
    }

    #[test]
    fn deleted_rules_stop_matching() {
        let machine = Machine::default();
        let rule = r#"{"a": ["x"]}"#;
        machine.add_rule("r", rule).unwrap();
        machine.delete_rule("r", rule).unwrap();
        assert!(matched(&machine, r#"{"a": "x"}"#).is_empty());
        assert!(machine.is_empty());

        // Re-adding brings it back.
        machine.add_rule("r", rule).unwrap();
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["r"]);
    }

    #[test]
    fn delete_is_idempotent_and_owner_checked() {
        let machine = Machine::default();
        let rule = r#"{"a": ["x"]}"#;
        machine.add_rule("mine", rule).unwrap();
        // Wrong owner: no-op.
        machine.delete_rule("theirs", rule).unwrap();
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["mine"]);
        // Unknown alternative: no-op.
        machine.delete_rule("mine", r#"{"a": ["zzz"]}"#).unwrap();
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["mine"]);
        // Double delete: no-op.
        machine.delete_rule("mine", rule).unwrap();
        machine.delete_rule("mine", rule).unwrap();
        assert!(machine.is_empty());
    }

    #[test]
    fn duplicate_names_are_additive_by_default() {
        let machine = Machine::default();
        machine.add_rule("r", r#"{"a": ["x"]}"#).unwrap();
        machine.add_rule("r", r#"{"a": ["y"]}"#).unwrap();
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["r"]);
        assert_eq!(matched(&machine, r#"{"a": "y"}"#), vec!["r"]);
        // Re-adding an identical alternative changes nothing.
        let count = machine.approximate_object_count();
        machine.add_rule("r", r#"{"a": ["x"]}"#).unwrap();
        assert_eq!(machine.approximate_object_count(), count);
    }

    #[test]
    fn rule_overriding_replaces() {
        let machine = Machine::builder().rule_overriding(true).build();
        machine.add_rule("r", r#"{"a": ["x"]}"#).unwrap();
        machine.add_rule("r", r#"{"a": ["y"]}"#).unwrap();
        assert!(matched(&machine, r#"{"a": "x"}"#).is_empty());
        assert_eq!(matched(&machine, r#"{"a": "y"}"#), vec!["r"]);
    }

    #[test]
    fn too_complex_rules_are_rejected_whole() {
        let machine = Machine::builder().max_complexity(3).build();
        machine.add_rule("ok", r#"{"a": [{"wildcard": "x*y*z"}]}"#).unwrap();
        let count = machine.approximate_object_count();

        let err = machine
            .add_rule("bad", r#"{"a": [{"wildcard": "a*b*c*d"}], "b": ["fine"]}"#)
            .unwrap_err();
        assert!(matches!(err, Error::TooComplex { .. }));
        // All-or-nothing: the machine is untouched.
        assert_eq!(machine.approximate_object_count(), count);
        assert_eq!(machine.rule_names(), vec!["ok"]);
    }

    #[test]
    fn failed_adds_leave_no_trace() {
        let machine = Machine::default();
        let count = machine.approximate_object_count();
        for bad in [
            r#"{"a": [{"wildcard": "a**b"}], "b": ["fine"]}"#,
            r#"{"a": [{"numeric": ["=", 6e11]}]}"#,
            r#"{"a": ["x"], "$or": [{"a": ["y"]}]}"#,
            r#"not json"#,
        ] {
            assert!(machine.add_rule("bad", bad).is_err());
        }
        assert_eq!(machine.approximate_object_count(), count);
        assert!(machine.is_empty());
    }

    #[test]
    fn invalid_events_fail_without_harm() {
        let machine = Machine::default();
        machine.add_rule("r", r#"{"a": ["x"]}"#).unwrap();
        assert!(matches!(
            machine.rules_for_json_event("{"),
            Err(Error::InvalidEvent(_))
        ));
        assert!(matches!(
            machine.rules_for_json_event("[1, 2]"),
            Err(Error::InvalidEvent(_))
        ));
        assert_eq!(matched(&machine, r#"{"a": "x"}"#), vec!["r"]);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let machine = Machine::default();
        let total = 100;
        let event = {
            let pairs: Vec<String> =
                (0..total).map(|i| format!(r#""k{i}": "v{i}""#)).collect();
            format!("{{{}}}", pairs.join(", "))
        };
        let expected: Vec<String> = (0..total).map(|i| format!("r{i}")).collect();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for writer in 0..10 {
                let machine = &machine;
                scope.spawn(move || {
                    for i in (writer * 10)..(writer * 10 + 10) {
                        let rule = format!(r#"{{"k{i}": ["v{i}"]}}"#);
                        machine.add_rule(&format!("r{i}"), &rule).unwrap();
                    }
                });
            }
            for _ in 0..8 {
                let machine = &machine;
                let event = event.as_str();
                let expected = expected.as_slice();
                let done = &done;
                scope.spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let seen = machine.rules_for_json_event(event).unwrap();
                        for name in &seen {
                            assert!(expected.contains(name), "phantom rule {name}");
                        }
                    }
                });
            }
            // Writers are the first ten spawned threads; wait for them
            // by re-adding everything (idempotent) on this thread, then
            // release the readers.
            for i in 0..total {
                let rule = format!(r#"{{"k{i}": ["v{i}"]}}"#);
                machine.add_rule(&format!("r{i}"), &rule).unwrap();
            }
            done.store(true, Ordering::Relaxed);
        });

        let mut seen = machine.rules_for_json_event(&event).unwrap();
        seen.sort();
        let mut expected = expected;
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn anything_but_sees_every_presentation_of_a_value() {
        // An IP-shaped value reaches the machine both quoted and
        // range-encoded; the complement must only fire when no
        // presentation hits the positive core.
        let machine = Machine::default();
        machine
            .add_rule("ab", r#"{"a": [{"anything-but": "10.0.0.2"}]}"#)
            .unwrap();
        assert!(matched(&machine, r#"{"a": "10.0.0.2"}"#).is_empty());
        assert_eq!(matched(&machine, r#"{"a": "10.0.0.3"}"#), vec!["ab"]);
        assert_eq!(matched(&machine, r#"{"a": "plain"}"#), vec!["ab"]);
    }

    #[test]
    fn booleans_and_null_are_typed_literals() {
        let machine = Machine::default();
        machine.add_rule("t", r#"{"a": [true]}"#).unwrap();
        machine.add_rule("n", r#"{"a": [null]}"#).unwrap();
        assert_eq!(matched(&machine, r#"{"a": true}"#), vec!["t"]);
        assert_eq!(matched(&machine, r#"{"a": null}"#), vec!["n"]);
        // The quoted string is a different value entirely.
        assert!(matched(&machine, r#"{"a": "true"}"#).is_empty());
    }

    #[test]
    fn primitive_array_values_match_any_element() {
        let machine = Machine::default();
        machine.add_rule("r", r#"{"a": ["y"]}"#).unwrap();
        assert_eq!(matched(&machine, r#"{"a": ["x", "y", "z"]}"#), vec!["r"]);
        assert!(matched(&machine, r#"{"a": ["x", "z"]}"#).is_empty());
    }
}
