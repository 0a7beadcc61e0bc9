use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::syntax::Step;

/// Identity of one disjunctive alternative of a named rule.
///
/// Ids come from a process-wide sequence, so they are monotonic and
/// comparable across machine instances.
pub(crate) type SubRuleId = u64;

static NEXT_SUB_RULE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sub_rule_id() -> SubRuleId {
    let id = NEXT_SUB_RULE_ID.fetch_add(1, Ordering::Relaxed);
    assert!(id < u64::MAX, "sub-rule id sequence exhausted");
    id
}

/// What the machine remembers about one live sub-rule.
#[derive(Debug, Clone)]
pub(crate) struct SubRuleContext {
    pub id: SubRuleId,
    pub rule: Arc<str>,
    /// Paths that must be absent from the event for this sub-rule to
    /// match; checked once traversal is done.
    pub must_not_exist: Vec<String>,
}

/// A sub-rule as threaded into the machine, kept so deletion can walk
/// the same path insertion took.
#[derive(Debug)]
pub(crate) struct StoredSubRule {
    pub id: SubRuleId,
    pub steps: Vec<Step>,
    pub must_not_exist: Vec<String>,
}
