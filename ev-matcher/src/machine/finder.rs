/*!
Event traversal.

Work items are `(next field index, name state, candidate sub-rules,
array trail)`. From each item the finder consumes the current field
through the state's byte machine (and existence edges), and always also
skips the field: a live state stays live, because a later field may
still advance it.

The candidate set is what makes shared name states safe: a sub-rule is
threaded per incoming pattern, and every hop intersects the running
candidates with the destination's registrations for the pattern that
fired. A terminal can therefore only fire for a sub-rule whose own
patterns were matched along the whole path, no matter how many rules
share the states on it.

Array trails implement the JSON-event semantics: a work item may only
consume values whose array memberships agree with everything it already
consumed (same array => same element index). The flat-event path skips
the check and gets the historical multiset semantics.
*/
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use crate::event::Field;
use crate::machine::name_state::NameStateId;
use crate::machine::sub_rule::SubRuleId;
use crate::machine::MachineCore;
use crate::pattern::Pattern;

#[derive(Clone, PartialEq, Eq, Hash)]
struct Task {
    field: usize,
    state: NameStateId,
    /// None means "every sub-rule" (the state before the first hop).
    candidates: Option<Arc<BTreeSet<SubRuleId>>>,
    trail: Arc<Vec<(u32, u32)>>,
}

pub(crate) fn rules_matching(
    core: &MachineCore,
    fields: &[Field],
    check_trails: bool,
) -> BTreeSet<SubRuleId> {
    let mut reached: BTreeSet<SubRuleId> = BTreeSet::new();
    let mut pending_absent: BTreeSet<SubRuleId> = BTreeSet::new();
    let mut visited: HashSet<Task> = HashSet::new();
    let mut queue: VecDeque<Task> = VecDeque::new();

    queue.push_back(Task {
        field: 0,
        state: core.root(),
        candidates: None,
        trail: Arc::new(Vec::new()),
    });

    while let Some(task) = queue.pop_front() {
        if task.field >= fields.len() || !visited.insert(task.clone()) {
            continue;
        }
        let field = &fields[task.field];
        let state = core.name_state(task.state);

        if !check_trails || trail_compatible(&task.trail, &field.trail) {
            let merged = if check_trails {
                Arc::new(merge_trails(&task.trail, &field.trail))
            } else {
                Arc::clone(&task.trail)
            };
            if let Some(machine) = state.value_transitions.get(&field.path) {
                for (pattern, next) in machine.transition_on(&field.presentations) {
                    hop(
                        core,
                        &task,
                        &pattern,
                        next,
                        &merged,
                        &mut queue,
                        &mut reached,
                        &mut pending_absent,
                    );
                }
            }
            for entry in state.exists_true.get(&field.path).into_iter().flatten() {
                hop(
                    core,
                    &task,
                    &Pattern::Exists(true),
                    entry.next,
                    &merged,
                    &mut queue,
                    &mut reached,
                    &mut pending_absent,
                );
            }
        }

        // The state stays live past this field.
        queue.push_back(Task {
            field: task.field + 1,
            state: task.state,
            candidates: task.candidates.clone(),
            trail: Arc::clone(&task.trail),
        });
    }

    // Must-not-exist resolution against the observed paths.
    let observed: HashSet<&str> = fields.iter().map(|f| f.path.as_str()).collect();
    let absent = |id: &SubRuleId| {
        core.sub_rule(*id)
            .must_not_exist
            .iter()
            .all(|path| !observed.contains(path.as_str()))
    };
    reached.extend(pending_absent.into_iter().filter(absent));
    reached.extend(
        core.name_state(core.root())
            .absent_only
            .iter()
            .copied()
            .filter(absent),
    );
    reached
}

#[allow(clippy::too_many_arguments)]
fn hop(
    core: &MachineCore,
    task: &Task,
    pattern: &Pattern,
    next: NameStateId,
    trail: &Arc<Vec<(u32, u32)>>,
    queue: &mut VecDeque<Task>,
    reached: &mut BTreeSet<SubRuleId>,
    pending_absent: &mut BTreeSet<SubRuleId>,
) {
    let next_state = core.name_state(next);

    if let Some(terminals) = next_state.terminal_for(pattern) {
        for id in survivors(&task.candidates, terminals) {
            match core.sub_rule(id).must_not_exist.is_empty() {
                true => reached.insert(id),
                false => pending_absent.insert(id),
            };
        }
    }

    if let Some(continuing) = next_state.non_terminal_for(pattern) {
        let next_candidates: BTreeSet<SubRuleId> =
            survivors(&task.candidates, continuing).collect();
        if !next_candidates.is_empty() {
            queue.push_back(Task {
                field: task.field + 1,
                state: next,
                candidates: Some(Arc::new(next_candidates)),
                trail: Arc::clone(trail),
            });
        }
    }
}

fn survivors<'s>(
    candidates: &'s Option<Arc<BTreeSet<SubRuleId>>>,
    registered: &'s BTreeSet<SubRuleId>,
) -> impl Iterator<Item = SubRuleId> + 's {
    registered
        .iter()
        .copied()
        .filter(move |id| candidates.as_ref().map_or(true, |c| c.contains(id)))
}

/// Values already consumed and the next value must sit in the same row
/// of every array they share.
fn trail_compatible(have: &[(u32, u32)], incoming: &[(u32, u32)]) -> bool {
    incoming.iter().all(|(array, index)| {
        have.iter()
            .all(|(a, i)| a != array || i == index)
    })
}

fn merge_trails(have: &[(u32, u32)], incoming: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut merged = have.to_vec();
    for entry in incoming {
        if !merged.contains(entry) {
            merged.push(*entry);
        }
    }
    merged.sort_unstable();
    merged
}
