/*!
A rules-matching engine: match JSON events against large sets of
declarative rules in time proportional to the event, independent of how
many rules are loaded.

## Features
- Field-level automaton over JSON paths: all rules make progress
  simultaneously as the event's fields stream by, whatever order the
  keys arrive in.
- Per-field byte-level automata evaluating every value pattern at once:
  exact, prefix, suffix, wildcard, equals-ignore-case, numeric equality
  and ranges, CIDR blocks, anything-but, and existence checks.
- Numeric comparisons via an order-preserving string encoding
  ([`ev_number`]), so ranges reduce to byte ranges in the same automaton.
- Rules can be added and deleted at runtime; deletion reclaims exactly
  the structure no surviving rule uses.
- Readers run concurrently with each other and with writers under a
  single reader-writer lock; a completed add or delete is visible to
  every subsequent match call.

## Usage
```
use ev_matcher::Machine;

let machine = Machine::default();
machine
    .add_rule(
        "interesting",
        r#"{
            "source": ["orders"],
            "detail": {
                "total": [{"numeric": [">=", 100]}],
                "ip": [{"cidr": "10.0.0.0/24"}]
            }
        }"#,
    )
    .unwrap();

let matched = machine
    .rules_for_json_event(
        r#"{"source": "orders", "detail": {"total": 250, "ip": "10.0.0.93"}}"#,
    )
    .unwrap();
assert_eq!(matched, vec!["interesting"]);

let matched = machine
    .rules_for_json_event(r#"{"source": "orders", "detail": {"total": 99.99, "ip": "10.0.0.93"}}"#)
    .unwrap();
assert!(matched.is_empty());
```

## Rule language
A rule is a JSON object mirroring the events it should match. Leaves
are arrays of literals or pattern objects (`prefix`, `suffix`,
`exactly`, `equals-ignore-case`, `wildcard`, `numeric`, `cidr`,
`exists`, `anything-but`); `$or` introduces alternatives that share the
surrounding context. See [`Machine`] for the configuration options and
the two match entry points.
*/
mod error;
mod event;
mod machine;
mod pattern;
mod syntax;

pub use error::Error;
pub use machine::Machine;
