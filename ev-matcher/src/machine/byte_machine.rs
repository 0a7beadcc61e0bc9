/*!
The per-field byte automaton.

Every pattern attached to one field of one name state compiles into
chains over a 257-symbol alphabet: the 256 byte values plus a value
terminator. All patterns evaluate simultaneously: the traversal carries
a set of live states, so independent chains leaving one state on the
same byte (an exact chain and an ignore-case chain, two wildcards, a
range trie) coexist as multiple targets of one transition.

Chains share structure only with chains of the same discipline (plain
byte tries share their trunks, dual-case tries pair their case edges,
wildcard and range chains stay private), so sharing can never forge a
match for an unrelated pattern. Deletion replays a pattern's recorded
build path backwards under per-edge use counts and reclaims exactly the
structure no surviving pattern uses.
*/
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::machine::arena::Arena;
use crate::machine::name_state::NameStateId;
use crate::pattern::{AnythingBut, Pattern, Range, Wildcard};

/// A byte value, or [`VALUE_TERMINATOR`].
pub(crate) type Symbol = u16;

/// Pseudo-symbol fed after the last value byte so complete-token
/// patterns can terminate unambiguously.
pub(crate) const VALUE_TERMINATOR: Symbol = 0x100;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ByteStateId(u32);

/// Which build discipline owns a state; controls trunk sharing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ChainKind {
    /// The start state hosts first edges of every discipline.
    Start,
    /// Single-byte tries: exact, prefix, numeric-equals, and suffix
    /// chains (which run over reversed bytes).
    Plain,
    /// Both-case tries for equals-ignore-case.
    DualCase,
    /// Wildcard chains; private per pattern because a spin state leaks
    /// its any-byte loop into anything built through it.
    Wild,
    /// Range tries; private per pattern.
    Range,
}

#[derive(Debug)]
struct ByteState {
    kind: ChainKind,
    /// Any byte re-enters this state (the wildcard `*` loop).
    spin: bool,
    /// Incoming explicit edges and shortcuts. Zero means unreachable.
    in_edges: u32,
    transitions: BTreeMap<Symbol, ByteTransition>,
    shortcuts: Vec<Shortcut>,
}

impl ByteState {
    fn new(kind: ChainKind) -> Self {
        Self {
            kind,
            spin: false,
            in_edges: 0,
            transitions: BTreeMap::new(),
            shortcuts: Vec::new(),
        }
    }
}

/// One outgoing edge: next states to continue in, terminal matches to
/// yield, or both at once. The composite case, "accept here AND keep
/// going", is how a prefix shares the trunk of a longer exact chain.
#[derive(Debug, Default)]
struct ByteTransition {
    nexts: Vec<ByteStateId>,
    matches: Vec<ByteMatch>,
}

impl ByteTransition {
    fn is_empty(&self) -> bool {
        self.nexts.is_empty() && self.matches.is_empty()
    }
}

/// Terminal record: reaching it means `pattern` matched, continue the
/// name machine at `next_name`. Several matches can sit on one
/// transition when patterns share their final position.
#[derive(Debug, Clone)]
pub(crate) struct ByteMatch {
    pub pattern: Pattern,
    pub next_name: NameStateId,
}

/// "Any byte in `lo..=hi` goes to `next`"; keeps range tries compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Shortcut {
    lo: u8,
    hi: u8,
    next: ByteStateId,
}

/// An edge as recorded in a pattern's build path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Edge {
    Sym {
        from: ByteStateId,
        sym: Symbol,
        to: ByteStateId,
    },
    Span {
        from: ByteStateId,
        lo: u8,
        hi: u8,
        to: ByteStateId,
    },
}

/// Everything one pattern put into the machine, in build order, so
/// deletion can replay it backwards.
#[derive(Debug, Default)]
struct PatternEntry {
    edges: Vec<Edge>,
    match_positions: Vec<(ByteStateId, Symbol)>,
    spins: Vec<ByteStateId>,
    /// Name states this pattern continues to; one ByteMatch per entry
    /// at every match position.
    nexts: Vec<NameStateId>,
}

/// Accumulates a chain build before it is committed to the use counts.
#[derive(Default)]
struct BuildCtx {
    edges: Vec<Edge>,
    match_positions: Vec<(ByteStateId, Symbol)>,
    spins: Vec<ByteStateId>,
}

impl BuildCtx {
    fn record_match(&mut self, at: (ByteStateId, Symbol)) {
        if !self.match_positions.contains(&at) {
            self.match_positions.push(at);
        }
    }
}

#[derive(Debug)]
pub(crate) struct ByteMachine {
    states: Arena<ByteState>,
    start: ByteStateId,
    patterns: HashMap<Pattern, PatternEntry>,
    /// How many pattern build paths run through each edge.
    edge_uses: HashMap<Edge, u32>,
    /// States whose spin flag is owned by some pattern.
    spin_uses: HashMap<ByteStateId, u32>,
    /// Patterns matched by the right-to-left pass.
    reverse_terminals: usize,
}

impl ByteMachine {
    pub fn new() -> Self {
        let mut states = Arena::new();
        let start = ByteStateId(states.insert(ByteState::new(ChainKind::Start)));
        Self {
            states,
            start,
            patterns: HashMap::new(),
            edge_uses: HashMap::new(),
            spin_uses: HashMap::new(),
            reverse_terminals: 0,
        }
    }

    fn state(&self, id: ByteStateId) -> &ByteState {
        self.states.get(id.0)
    }

    fn state_mut(&mut self, id: ByteStateId) -> &mut ByteState {
        self.states.get_mut(id.0)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Name states reachable through `pattern`, for reuse analysis.
    pub fn nexts_of(&self, pattern: &Pattern) -> Vec<NameStateId> {
        self.patterns
            .get(pattern)
            .map(|e| e.nexts.clone())
            .unwrap_or_default()
    }

    /// States + patterns + terminal matches, for diagnostics.
    pub fn object_count(&self) -> usize {
        self.states.len()
            + self.patterns.len()
            + self.patterns.values().map(|e| e.nexts.len()).sum::<usize>()
    }

    /// Upper bound on simultaneously-live wildcard states on worst-case
    /// input. A spin state, once entered, stays live to the end of the
    /// value, so every one of them can coexist.
    pub fn evaluate_complexity(&self, limit: usize) -> usize {
        self.spin_uses.len().min(limit)
    }

    /// Associates `pattern` with `next`, building its chains on first
    /// sight. Returns whether a new terminal match was created (false
    /// means this exact association already existed).
    pub fn add_pattern(&mut self, pattern: &Pattern, next: NameStateId) -> bool {
        debug_assert!(
            !matches!(pattern, Pattern::Exists(_)),
            "existence checks are tracked at the name state"
        );

        if let Some(entry) = self.patterns.get(pattern) {
            if entry.nexts.contains(&next) {
                return false;
            }
            let positions = entry.match_positions.clone();
            for (sid, sym) in positions {
                self.state_mut(sid)
                    .transitions
                    .entry(sym)
                    .or_default()
                    .matches
                    .push(ByteMatch {
                        pattern: pattern.clone(),
                        next_name: next,
                    });
            }
            self.patterns
                .get_mut(pattern)
                .expect("pattern entry vanished")
                .nexts
                .push(next);
            return true;
        }

        let mut ctx = BuildCtx::default();
        self.build(&mut ctx, pattern);
        for edge in &ctx.edges {
            *self.edge_uses.entry(*edge).or_insert(0) += 1;
        }
        for spin in &ctx.spins {
            *self.spin_uses.entry(*spin).or_insert(0) += 1;
        }
        for &(sid, sym) in &ctx.match_positions {
            self.state_mut(sid)
                .transitions
                .entry(sym)
                .or_default()
                .matches
                .push(ByteMatch {
                    pattern: pattern.clone(),
                    next_name: next,
                });
        }
        if pattern.is_reverse() {
            self.reverse_terminals += 1;
        }
        self.patterns.insert(
            pattern.clone(),
            PatternEntry {
                edges: ctx.edges,
                match_positions: ctx.match_positions,
                spins: ctx.spins,
                nexts: vec![next],
            },
        );
        true
    }

    /// Removes the (pattern, next) association. When the pattern's last
    /// association goes, its build path is replayed backwards and every
    /// edge and state no surviving pattern uses is reclaimed. Returns
    /// whether a match was actually removed.
    pub fn delete_match(&mut self, pattern: &Pattern, next: NameStateId) -> bool {
        let Some(entry) = self.patterns.get_mut(pattern) else {
            return false;
        };
        let Some(ix) = entry.nexts.iter().position(|n| *n == next) else {
            return false;
        };
        entry.nexts.remove(ix);
        let last_association = entry.nexts.is_empty();
        let positions = entry.match_positions.clone();

        for (sid, sym) in positions {
            let state = self.state_mut(sid);
            if let Some(tr) = state.transitions.get_mut(&sym) {
                tr.matches
                    .retain(|m| !(m.next_name == next && m.pattern == *pattern));
                if tr.is_empty() {
                    state.transitions.remove(&sym);
                }
            }
        }
        if !last_association {
            return true;
        }

        let entry = self
            .patterns
            .remove(pattern)
            .expect("pattern entry vanished");
        if pattern.is_reverse() {
            self.reverse_terminals -= 1;
        }

        for spin in &entry.spins {
            let uses = self
                .spin_uses
                .get_mut(spin)
                .expect("spin bookkeeping out of sync");
            *uses -= 1;
            if *uses == 0 {
                self.spin_uses.remove(spin);
                self.state_mut(*spin).spin = false;
            }
        }

        // Backwards over the build path: a state's own out-edges come
        // after its in-edge, so they are detached before the in-edge
        // count can reach zero.
        let mut dead = Vec::new();
        for edge in entry.edges.iter().rev() {
            let uses = self
                .edge_uses
                .get_mut(edge)
                .expect("edge bookkeeping out of sync");
            *uses -= 1;
            if *uses > 0 {
                continue;
            }
            self.edge_uses.remove(edge);
            let to = match *edge {
                Edge::Sym { from, sym, to } => {
                    let state = self.state_mut(from);
                    let tr = state
                        .transitions
                        .get_mut(&sym)
                        .expect("edge without transition");
                    let pos = tr
                        .nexts
                        .iter()
                        .position(|n| *n == to)
                        .expect("edge without target");
                    tr.nexts.remove(pos);
                    if tr.is_empty() {
                        state.transitions.remove(&sym);
                    }
                    to
                }
                Edge::Span { from, lo, hi, to } => {
                    let state = self.state_mut(from);
                    let pos = state
                        .shortcuts
                        .iter()
                        .position(|s| s.lo == lo && s.hi == hi && s.next == to)
                        .expect("span without shortcut");
                    state.shortcuts.remove(pos);
                    to
                }
            };
            let target = self.state_mut(to);
            target.in_edges -= 1;
            if target.in_edges == 0 {
                dead.push(to);
            }
        }
        for id in dead {
            let state = self.state(id);
            debug_assert!(
                state.transitions.is_empty() && state.shortcuts.is_empty() && !state.spin,
                "reclaiming a state something still hangs off"
            );
            self.states.remove(id.0);
        }
        true
    }

    // ---- chain construction ------------------------------------------------

    fn build(&mut self, ctx: &mut BuildCtx, pattern: &Pattern) {
        match pattern {
            Pattern::Exact(bytes) | Pattern::NumericEq(bytes) => {
                self.add_literal_chain(ctx, bytes, false, false)
            }
            Pattern::Prefix(bytes) | Pattern::Suffix(bytes) => {
                self.add_literal_chain(ctx, bytes, false, true)
            }
            Pattern::EqualsIgnoreCase(bytes) => self.add_literal_chain(ctx, bytes, true, false),
            Pattern::Wildcard(w) => self.add_wildcard_chain(ctx, w),
            Pattern::NumericRange(r) => self.add_range_chains(ctx, r),
            Pattern::AnythingBut(ab) => match ab {
                AnythingBut::Literals(vs) => {
                    for v in vs.iter() {
                        self.add_literal_chain(ctx, v, false, false);
                    }
                }
                AnythingBut::Prefix(vs) | AnythingBut::Suffix(vs) => {
                    for v in vs.iter() {
                        self.add_literal_chain(ctx, v, false, true);
                    }
                }
                AnythingBut::EqualsIgnoreCase(vs) => {
                    for v in vs.iter() {
                        self.add_literal_chain(ctx, v, true, false);
                    }
                }
                AnythingBut::Wildcard(ws) => {
                    for w in ws.iter() {
                        self.add_wildcard_chain(ctx, w);
                    }
                }
            },
            Pattern::Exists(_) => unreachable!("existence checks never reach the byte machine"),
        }
    }

    /// A (dual-)byte trie chain. `terminal_on_last_byte` puts the match
    /// on the final byte's transition (prefix/suffix: any continuation
    /// is fine); otherwise the chain runs to its end and the match sits
    /// on the terminator.
    fn add_literal_chain(
        &mut self,
        ctx: &mut BuildCtx,
        bytes: &[u8],
        dual: bool,
        terminal_on_last_byte: bool,
    ) {
        debug_assert!(!bytes.is_empty());
        debug_assert!(!(dual && terminal_on_last_byte));
        let mut state = self.start;
        let last = bytes.len() - 1;
        for (i, &b) in bytes.iter().enumerate() {
            if terminal_on_last_byte && i == last {
                ctx.record_match((state, Symbol::from(b)));
                return;
            }
            state = if dual {
                self.ensure_dual_step(ctx, state, b)
            } else {
                self.ensure_trunk_step(ctx, state, Symbol::from(b))
            };
        }
        ctx.record_match((state, VALUE_TERMINATOR));
    }

    /// Follow or create the plain-trie edge for `sym`.
    fn ensure_trunk_step(&mut self, ctx: &mut BuildCtx, from: ByteStateId, sym: Symbol) -> ByteStateId {
        let found = self.state(from).transitions.get(&sym).and_then(|tr| {
            tr.nexts
                .iter()
                .copied()
                .find(|t| self.state(*t).kind == ChainKind::Plain)
        });
        let to = match found {
            Some(t) => t,
            None => self.attach_fresh(from, sym, ChainKind::Plain),
        };
        ctx.edges.push(Edge::Sym { from, sym, to });
        to
    }

    /// Follow or create the paired lower/upper edges for a folded byte.
    /// Both case edges always lead to the same state, so a candidate
    /// counts only if it is reachable through each of them.
    fn ensure_dual_step(&mut self, ctx: &mut BuildCtx, from: ByteStateId, folded: u8) -> ByteStateId {
        let lower = Symbol::from(folded);
        let upper = folded
            .is_ascii_lowercase()
            .then(|| Symbol::from(folded.to_ascii_uppercase()));

        let found = self.state(from).transitions.get(&lower).and_then(|tr| {
            tr.nexts.iter().copied().find(|t| {
                self.state(*t).kind == ChainKind::DualCase
                    && upper.map_or(true, |u| {
                        self.state(from)
                            .transitions
                            .get(&u)
                            .is_some_and(|utr| utr.nexts.contains(t))
                    })
            })
        });
        let to = match found {
            Some(t) => t,
            None => {
                let to = self.attach_fresh(from, lower, ChainKind::DualCase);
                if let Some(u) = upper {
                    self.attach_edge(from, u, to);
                }
                to
            }
        };
        ctx.edges.push(Edge::Sym { from, sym: lower, to });
        if let Some(u) = upper {
            ctx.edges.push(Edge::Sym { from, sym: u, to });
        }
        to
    }

    /// Wildcard chains are private: fresh states every time, and a spin
    /// flag on each pre-star state. The spin stands in for a full set of
    /// cross-edges from the state back to itself over every byte.
    fn add_wildcard_chain(&mut self, ctx: &mut BuildCtx, wildcard: &Wildcard) {
        let segments = wildcard.segments();
        let mut state = self.start;
        for (i, segment) in segments.iter().enumerate() {
            for &b in segment.iter() {
                let to = self.attach_fresh(state, Symbol::from(b), ChainKind::Wild);
                ctx.edges.push(Edge::Sym {
                    from: state,
                    sym: Symbol::from(b),
                    to,
                });
                state = to;
            }
            if i < segments.len() - 1 {
                self.state_mut(state).spin = true;
                ctx.spins.push(state);
            }
        }
        ctx.record_match((state, VALUE_TERMINATOR));
    }

    /// Range trie over the fixed-width encoded endpoints: a common
    /// prefix chain, then at each position the strictly-between byte
    /// span jumps to an "accept the rest" run while the boundary bytes
    /// continue their exact chains.
    fn add_range_chains(&mut self, ctx: &mut BuildCtx, range: &Range) {
        let lo = &*range.lo;
        let hi = &*range.hi;
        debug_assert_eq!(lo.len(), hi.len());
        let len = lo.len();

        let mut pos = 0;
        let mut state = self.start;
        while pos < len && lo[pos] == hi[pos] {
            state = self.range_step(ctx, state, lo[pos]);
            pos += 1;
        }
        if pos == len {
            // Degenerate range; validation guarantees both ends closed.
            ctx.record_match((state, VALUE_TERMINATOR));
            return;
        }

        let mut rest = RestChains::default();
        if hi[pos] - lo[pos] >= 2 {
            let tail = self.accept_rest(ctx, &mut rest, len - pos - 1);
            self.attach_span(ctx, state, lo[pos] + 1, hi[pos] - 1, tail);
        }

        let mut low_state = self.range_step(ctx, state, lo[pos]);
        for p in pos + 1..len {
            if lo[p] < 0xff {
                let tail = self.accept_rest(ctx, &mut rest, len - p - 1);
                self.attach_span(ctx, low_state, lo[p] + 1, 0xff, tail);
            }
            low_state = self.range_step(ctx, low_state, lo[p]);
        }
        if range.lo_inclusive {
            ctx.record_match((low_state, VALUE_TERMINATOR));
        }

        let mut high_state = self.range_step(ctx, state, hi[pos]);
        for p in pos + 1..len {
            if hi[p] > 0x00 {
                let tail = self.accept_rest(ctx, &mut rest, len - p - 1);
                self.attach_span(ctx, high_state, 0x00, hi[p] - 1, tail);
            }
            high_state = self.range_step(ctx, high_state, hi[p]);
        }
        if range.hi_inclusive {
            ctx.record_match((high_state, VALUE_TERMINATOR));
        }
    }

    fn range_step(&mut self, ctx: &mut BuildCtx, from: ByteStateId, byte: u8) -> ByteStateId {
        let to = self.attach_fresh(from, Symbol::from(byte), ChainKind::Range);
        ctx.edges.push(Edge::Sym {
            from,
            sym: Symbol::from(byte),
            to,
        });
        to
    }

    /// State that consumes exactly `remaining` arbitrary bytes and then
    /// matches on the terminator; memoized per pattern so every branch
    /// of the trie funnels into one tail run.
    fn accept_rest(
        &mut self,
        ctx: &mut BuildCtx,
        rest: &mut RestChains,
        remaining: usize,
    ) -> ByteStateId {
        if let Some(&id) = rest.by_len.get(&remaining) {
            return id;
        }
        let id = if remaining == 0 {
            let id = ByteStateId(self.states.insert(ByteState::new(ChainKind::Range)));
            ctx.record_match((id, VALUE_TERMINATOR));
            id
        } else {
            let tail = self.accept_rest(ctx, rest, remaining - 1);
            let id = ByteStateId(self.states.insert(ByteState::new(ChainKind::Range)));
            self.attach_span_raw(id, 0x00, 0xff, tail);
            ctx.edges.push(Edge::Span {
                from: id,
                lo: 0x00,
                hi: 0xff,
                to: tail,
            });
            id
        };
        rest.by_len.insert(remaining, id);
        id
    }

    fn attach_fresh(&mut self, from: ByteStateId, sym: Symbol, kind: ChainKind) -> ByteStateId {
        let to = ByteStateId(self.states.insert(ByteState::new(kind)));
        self.attach_edge(from, sym, to);
        to
    }

    fn attach_edge(&mut self, from: ByteStateId, sym: Symbol, to: ByteStateId) {
        self.state_mut(from)
            .transitions
            .entry(sym)
            .or_default()
            .nexts
            .push(to);
        self.state_mut(to).in_edges += 1;
    }

    fn attach_span(
        &mut self,
        ctx: &mut BuildCtx,
        from: ByteStateId,
        lo: u8,
        hi: u8,
        to: ByteStateId,
    ) {
        self.attach_span_raw(from, lo, hi, to);
        ctx.edges.push(Edge::Span { from, lo, hi, to });
    }

    fn attach_span_raw(&mut self, from: ByteStateId, lo: u8, hi: u8, to: ByteStateId) {
        debug_assert!(lo <= hi);
        self.state_mut(from).shortcuts.push(Shortcut { lo, hi, next: to });
        self.state_mut(to).in_edges += 1;
    }

    // ---- evaluation --------------------------------------------------------

    /// Runs one value (plus the terminator) through every pattern at
    /// once and yields each (pattern, next name state) that matched.
    /// `presentations` are alternative byte forms of the same value
    /// (an IP-shaped string arrives both quoted and range-encoded);
    /// suffix terminals are found by a second right-to-left pass, and
    /// anything-but terminals fire by complement once, after every
    /// presentation and pass has had its chance to hit the positive
    /// core.
    pub fn transition_on(&self, presentations: &[Vec<u8>]) -> Vec<(Pattern, NameStateId)> {
        let mut out: HashSet<(Pattern, NameStateId)> = HashSet::new();
        let mut hits: HashSet<&Pattern> = HashSet::new();

        for value in presentations {
            self.run(value, false, &mut out, &mut hits);
            if self.reverse_terminals > 0 {
                let reversed: Vec<u8> = value.iter().rev().copied().collect();
                self.run(&reversed, true, &mut out, &mut hits);
            }
        }

        for (pattern, entry) in &self.patterns {
            if pattern.is_negated() && !hits.contains(pattern) {
                for &next in &entry.nexts {
                    out.insert((pattern.clone(), next));
                }
            }
        }
        out.into_iter().collect()
    }

    fn run<'a>(
        &'a self,
        bytes: &[u8],
        reverse: bool,
        out: &mut HashSet<(Pattern, NameStateId)>,
        hits: &mut HashSet<&'a Pattern>,
    ) {
        let mut live: Vec<ByteStateId> = vec![self.start];
        let mut next_live: Vec<ByteStateId> = Vec::new();
        for i in 0..=bytes.len() {
            let sym: Symbol = match bytes.get(i) {
                Some(&b) => Symbol::from(b),
                None => VALUE_TERMINATOR,
            };
            next_live.clear();
            for &sid in &live {
                let state = self.state(sid);
                if let Some(tr) = state.transitions.get(&sym) {
                    for m in &tr.matches {
                        if m.pattern.is_reverse() != reverse {
                            continue;
                        }
                        if m.pattern.is_negated() {
                            hits.insert(&m.pattern);
                        } else {
                            out.insert((m.pattern.clone(), m.next_name));
                        }
                    }
                    next_live.extend_from_slice(&tr.nexts);
                }
                if sym <= 0xff {
                    let b = sym as u8;
                    for sc in &state.shortcuts {
                        if sc.lo <= b && b <= sc.hi {
                            next_live.push(sc.next);
                        }
                    }
                    if state.spin {
                        next_live.push(sid);
                    }
                }
            }
            next_live.sort_unstable_by_key(|s| s.0);
            next_live.dedup();
            std::mem::swap(&mut live, &mut next_live);
            if live.is_empty() {
                break;
            }
        }
    }
}

#[derive(Default)]
struct RestChains {
    by_len: HashMap<usize, ByteStateId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::normalize_values;

    const N1: NameStateId = NameStateId::test(1);
    const N2: NameStateId = NameStateId::test(2);

    fn matched(m: &ByteMachine, value: &[u8]) -> Vec<NameStateId> {
        let mut out: Vec<NameStateId> = m
            .transition_on(&[value.to_vec()])
            .into_iter()
            .map(|(_, n)| n)
            .collect();
        out.sort_by_key(|n| n.index());
        out.dedup();
        out
    }

    #[test]
    fn exact_and_prefix_share_a_trunk() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::exact("albert"), N1);
        let states_before = m.states.len();
        m.add_pattern(&Pattern::prefix("al"), N2);
        // The prefix rides the existing chain; no new states at all.
        assert_eq!(m.states.len(), states_before);

        assert_eq!(matched(&m, b"\"albert\""), vec![N1, N2]);
        assert_eq!(matched(&m, b"\"alfred\""), vec![N2]);
        assert_eq!(matched(&m, b"\"al\""), vec![N2]);
        assert_eq!(matched(&m, b"\"a\""), vec![]);
        assert_eq!(matched(&m, b"\"albertson\""), vec![N2]);
    }

    #[test]
    fn suffix_matches_right_to_left() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::suffix("ert"), N1);
        assert_eq!(matched(&m, b"\"albert\""), vec![N1]);
        assert_eq!(matched(&m, b"\"ert\""), vec![N1]);
        assert_eq!(matched(&m, b"\"erta\""), vec![]);
        assert_eq!(matched(&m, b"\"bert\""), vec![N1]);
    }

    #[test]
    fn equals_ignore_case_branches_both_cases() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::equals_ignore_case("aB9"), N1);
        for value in [&b"\"ab9\""[..], b"\"AB9\"", b"\"Ab9\"", b"\"aB9\""] {
            assert_eq!(matched(&m, value), vec![N1], "{}", String::from_utf8_lossy(value));
        }
        assert_eq!(matched(&m, b"\"ab8\""), vec![]);
        assert_eq!(matched(&m, b"\"ab9x\""), vec![]);
    }

    #[test]
    fn ignore_case_never_bleeds_into_exact() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::exact("AB"), N1);
        m.add_pattern(&Pattern::equals_ignore_case("ab"), N2);
        // Mixed case may only hit the folded pattern.
        assert_eq!(matched(&m, b"\"Ab\""), vec![N2]);
        assert_eq!(matched(&m, b"\"AB\""), vec![N1, N2]);
        assert_eq!(matched(&m, b"\"ab\""), vec![N2]);
    }

    #[test]
    fn wildcards_run_as_state_sets() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::wildcard("a*b").unwrap(), N1);
        m.add_pattern(&Pattern::wildcard("*x*").unwrap(), N2);
        assert_eq!(matched(&m, b"\"ab\""), vec![N1]);
        assert_eq!(matched(&m, b"\"azzzb\""), vec![N1]);
        assert_eq!(matched(&m, b"\"axb\""), vec![N1, N2]);
        assert_eq!(matched(&m, b"\"x\""), vec![N2]);
        assert_eq!(matched(&m, b"\"ba\""), vec![]);
        // Segments must appear in order without overlap.
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::wildcard("ab*b").unwrap(), N1);
        assert_eq!(matched(&m, b"\"ab\""), vec![]);
        assert_eq!(matched(&m, b"\"abb\""), vec![N1]);
    }

    #[test]
    fn numeric_range_is_a_byte_trie() {
        let mut m = ByteMachine::new();
        let range = Pattern::NumericRange(
            Range::numeric(Some(("0", false)), Some(("1", false))).unwrap(),
        );
        m.add_pattern(&range, N1);
        let enc = |s: &str| ev_number::encode(s).unwrap();
        assert_eq!(matched(&m, &enc("0.5")), vec![N1]);
        assert_eq!(matched(&m, &enc("0.000001")), vec![N1]);
        assert_eq!(matched(&m, &enc("0.999999")), vec![N1]);
        assert_eq!(matched(&m, &enc("0")), vec![]);
        assert_eq!(matched(&m, &enc("1")), vec![]);
        assert_eq!(matched(&m, &enc("-0.5")), vec![]);
        assert_eq!(matched(&m, &enc("2")), vec![]);
    }

    #[test]
    fn inclusive_endpoints() {
        let mut m = ByteMachine::new();
        let range = Pattern::NumericRange(
            Range::numeric(Some(("0", true)), Some(("1", true))).unwrap(),
        );
        m.add_pattern(&range, N1);
        let enc = |s: &str| ev_number::encode(s).unwrap();
        assert_eq!(matched(&m, &enc("0")), vec![N1]);
        assert_eq!(matched(&m, &enc("1")), vec![N1]);
        assert_eq!(matched(&m, &enc("1.000001")), vec![]);
    }

    #[test]
    fn anything_but_fires_by_complement() {
        let mut m = ByteMachine::new();
        let ab = Pattern::AnythingBut(AnythingBut::Literals(normalize_values(vec![
            b"\"x\"".to_vec(),
            b"\"y\"".to_vec(),
        ])));
        m.add_pattern(&ab, N1);
        assert_eq!(matched(&m, b"\"x\""), vec![]);
        assert_eq!(matched(&m, b"\"y\""), vec![]);
        assert_eq!(matched(&m, b"\"z\""), vec![N1]);
        assert_eq!(matched(&m, b"\"xx\""), vec![N1]);
    }

    #[test]
    fn anything_but_suffix() {
        let mut m = ByteMachine::new();
        let ab = Pattern::AnythingBut(AnythingBut::Suffix(normalize_values(vec![
            crate::pattern::reversed_suffix("$"),
        ])));
        m.add_pattern(&ab, N1);
        assert_eq!(matched(&m, b"\"value$\""), vec![]);
        assert_eq!(matched(&m, b"\"$notvalue\""), vec![N1]);
    }

    #[test]
    fn one_pattern_may_continue_to_several_name_states() {
        let mut m = ByteMachine::new();
        assert!(m.add_pattern(&Pattern::exact("a"), N1));
        assert!(m.add_pattern(&Pattern::exact("a"), N2));
        // Idempotent per association.
        assert!(m.add_pattern(&Pattern::exact("a"), N1) == false);
        assert_eq!(matched(&m, b"\"a\""), vec![N1, N2]);

        m.delete_match(&Pattern::exact("a"), N1);
        assert_eq!(matched(&m, b"\"a\""), vec![N2]);
    }

    #[test]
    fn deletion_restores_the_machine_exactly() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::exact("albert"), N1);
        let baseline = m.object_count();

        let extras: Vec<Pattern> = vec![
            Pattern::prefix("al"),
            Pattern::suffix("bert"),
            Pattern::equals_ignore_case("Albert"),
            Pattern::wildcard("al*t").unwrap(),
            Pattern::NumericRange(Range::numeric(Some(("1", true)), Some(("300", false))).unwrap()),
            Pattern::AnythingBut(AnythingBut::Literals(normalize_values(vec![
                b"\"albert\"".to_vec(),
            ]))),
        ];
        for p in &extras {
            m.add_pattern(p, N2);
        }
        assert!(m.object_count() > baseline);
        for p in &extras {
            assert!(m.delete_match(p, N2));
        }
        assert_eq!(m.object_count(), baseline);
        assert_eq!(matched(&m, b"\"albert\""), vec![N1]);

        // Deleting the unknown is a quiet no-op.
        assert!(m.delete_match(&Pattern::exact("zzz"), N1) == false);
    }

    #[test]
    fn shared_trunk_survives_partial_deletion() {
        let mut m = ByteMachine::new();
        m.add_pattern(&Pattern::exact("albert"), N1);
        m.add_pattern(&Pattern::prefix("al"), N2);
        m.delete_match(&Pattern::exact("albert"), N1);
        assert_eq!(matched(&m, b"\"albert\""), vec![N2]);
        assert_eq!(matched(&m, b"\"al\""), vec![N2]);

        m.delete_match(&Pattern::prefix("al"), N2);
        assert!(m.is_empty());
        // Only the start state is left.
        assert_eq!(m.states.len(), 1);
    }

    #[test]
    fn complexity_counts_spin_states() {
        let mut m = ByteMachine::new();
        assert_eq!(m.evaluate_complexity(10), 0);
        m.add_pattern(&Pattern::wildcard("a*b*c").unwrap(), N1);
        m.add_pattern(&Pattern::wildcard("x*y").unwrap(), N2);
        assert_eq!(m.evaluate_complexity(10), 3);
        assert_eq!(m.evaluate_complexity(2), 2);
        m.delete_match(&Pattern::wildcard("a*b*c").unwrap(), N1);
        assert_eq!(m.evaluate_complexity(10), 1);
    }
}
