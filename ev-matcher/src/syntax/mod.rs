/*!
Rule-language compiler.

A rule is a JSON object whose leaves are arrays of literals or pattern
objects. Nested objects become dot-joined paths; `$or` at any object
position expands into independent alternatives composed with the
surrounding context. The compiler's output is a list of normalized
sub-rules: sorted `(path, patterns)` steps plus the paths that must be
absent, ready to thread into the machine.
*/
use itertools::Itertools;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::pattern::{normalize_values, parse_ipv4, quote_string, reversed_suffix};
use crate::pattern::{AnythingBut, Pattern, Range, Wildcard};

/// One field of a sub-rule: any of `patterns` matching the value at
/// `path` satisfies the step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub path: String,
    pub patterns: Vec<Pattern>,
}

/// One disjunctive alternative, normalized: steps sorted by path,
/// must-not-exist paths split out.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NormalizedSubRule {
    pub steps: Vec<Step>,
    pub must_not_exist: Vec<String>,
}

/// Compiles a rule into its normalized sub-rules.
pub(crate) fn compile(
    rule: &Value,
    path_allowed_multiple_times: bool,
) -> Result<Vec<NormalizedSubRule>, Error> {
    let object = rule
        .as_object()
        .ok_or_else(|| Error::InvalidRule("a rule must be a JSON object".into()))?;
    let alternatives = walk(object, &mut Vec::new())?;
    alternatives
        .into_iter()
        .map(|alt| normalize(alt, path_allowed_multiple_times))
        .collect()
}

/// Leaves of one (not yet normalized) alternative.
type Alternative = Vec<(String, Vec<Pattern>)>;

fn walk(object: &Map<String, Value>, prefix: &mut Vec<String>) -> Result<Vec<Alternative>, Error> {
    let mut alternatives: Vec<Alternative> = vec![Vec::new()];
    for (key, value) in object {
        let expansions = if key == "$or" {
            let branches = value
                .as_array()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| Error::InvalidRule("`$or` takes a non-empty array".into()))?;
            let mut expanded = Vec::new();
            for branch in branches {
                let branch = branch.as_object().ok_or_else(|| {
                    Error::InvalidRule("every `$or` alternative must be an object".into())
                })?;
                expanded.extend(walk(branch, prefix)?);
            }
            expanded
        } else {
            prefix.push(key.clone());
            let expanded = match value {
                Value::Object(nested) => walk(nested, prefix)?,
                Value::Array(leaf) => {
                    vec![vec![(prefix.join("."), parse_leaf(leaf, prefix)?)]]
                }
                _ => {
                    return Err(Error::InvalidRule(format!(
                        "`{}` must hold an object or an array of patterns",
                        prefix.join(".")
                    )))
                }
            };
            prefix.pop();
            expanded
        };
        // Compose with everything gathered so far: the surrounding
        // context multiplies into each alternative.
        alternatives = alternatives
            .into_iter()
            .cartesian_product(expansions)
            .map(|(mut base, ext)| {
                base.extend(ext);
                base
            })
            .collect();
    }
    Ok(alternatives)
}

fn normalize(
    alternative: Alternative,
    path_allowed_multiple_times: bool,
) -> Result<NormalizedSubRule, Error> {
    let mut steps = Vec::new();
    let mut must_not_exist = Vec::new();
    for (path, patterns) in alternative {
        if patterns.contains(&Pattern::Exists(false)) {
            if patterns.len() > 1 {
                return Err(Error::InvalidRule(format!(
                    "`{path}`: `exists: false` cannot be combined with other patterns"
                )));
            }
            must_not_exist.push(path);
        } else {
            steps.push(Step { path, patterns });
        }
    }
    if steps.is_empty() && must_not_exist.is_empty() {
        return Err(Error::InvalidRule("a rule must name at least one field".into()));
    }

    if !path_allowed_multiple_times {
        let mut seen: Vec<&str> = steps
            .iter()
            .map(|s| s.path.as_str())
            .chain(must_not_exist.iter().map(String::as_str))
            .collect();
        seen.sort_unstable();
        if let Some(dup) = seen.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::DuplicatePath(dup[0].to_owned()));
        }
    }

    steps.sort_by(|a, b| a.path.cmp(&b.path));
    must_not_exist.sort_unstable();
    Ok(NormalizedSubRule {
        steps,
        must_not_exist,
    })
}

fn parse_leaf(leaf: &[Value], prefix: &[String]) -> Result<Vec<Pattern>, Error> {
    if leaf.is_empty() {
        return Err(Error::InvalidRule(format!(
            "`{}` must list at least one pattern",
            prefix.join(".")
        )));
    }
    let patterns: Vec<Pattern> = leaf
        .iter()
        .map(|v| parse_pattern(v, prefix))
        .collect::<Result<_, _>>()?;
    // Spelled-out duplicates would double-count in the accounting.
    let mut seen: Vec<Pattern> = Vec::new();
    Ok(patterns
        .into_iter()
        .filter(|p| {
            let fresh = !seen.contains(p);
            if fresh {
                seen.push(p.clone());
            }
            fresh
        })
        .collect())
}

fn parse_pattern(value: &Value, prefix: &[String]) -> Result<Pattern, Error> {
    match value {
        // A literal string that is an IPv4 address compiles to the
        // degenerate range of that address, same as its /32 block.
        Value::String(s) => Ok(match parse_ipv4(s) {
            Some(ip) => Pattern::NumericRange(Range::single_ip(ip)),
            None => Pattern::exact(s),
        }),
        Value::Number(n) => Pattern::numeric_eq(&n.to_string()),
        Value::Bool(true) => Ok(Pattern::exact_token("true")),
        Value::Bool(false) => Ok(Pattern::exact_token("false")),
        Value::Null => Ok(Pattern::exact_token("null")),
        Value::Object(o) => parse_pattern_object(o, prefix),
        Value::Array(_) => Err(Error::InvalidRule(format!(
            "`{}`: nested arrays are not a pattern",
            prefix.join(".")
        ))),
    }
}

fn parse_pattern_object(object: &Map<String, Value>, prefix: &[String]) -> Result<Pattern, Error> {
    let field = prefix.join(".");
    let mut entries = object.iter();
    let (Some((key, value)), None) = (entries.next(), entries.next()) else {
        return Err(Error::InvalidRule(format!(
            "`{field}`: a pattern object holds exactly one key"
        )));
    };
    match key.as_str() {
        "prefix" => Ok(Pattern::prefix(expect_str(key, value, &field)?)),
        "suffix" => Ok(Pattern::suffix(expect_str(key, value, &field)?)),
        "exactly" => Ok(Pattern::exact(expect_str(key, value, &field)?)),
        "equals-ignore-case" => Ok(Pattern::equals_ignore_case(expect_str(key, value, &field)?)),
        "wildcard" => Pattern::wildcard(expect_str(key, value, &field)?),
        "numeric" => parse_numeric(value, &field),
        "cidr" => Ok(Pattern::NumericRange(Range::cidr(expect_str(
            key, value, &field,
        )?)?)),
        "exists" => value
            .as_bool()
            .map(Pattern::Exists)
            .ok_or_else(|| Error::InvalidRule(format!("`{field}`: `exists` takes true or false"))),
        "anything-but" => parse_anything_but(value, &field),
        other => Err(Error::InvalidRule(format!(
            "`{field}`: unrecognized pattern key `{other}`"
        ))),
    }
}

fn expect_str<'v>(key: &str, value: &'v Value, field: &str) -> Result<&'v str, Error> {
    value
        .as_str()
        .ok_or_else(|| Error::InvalidRule(format!("`{field}`: `{key}` takes a string")))
}

/// `numeric` holds one or two (comparison, number) pairs.
fn parse_numeric(value: &Value, field: &str) -> Result<Pattern, Error> {
    let bad = |msg: &str| Error::InvalidRule(format!("`{field}`: {msg}"));
    let items = value
        .as_array()
        .filter(|a| a.len() == 2 || a.len() == 4)
        .ok_or_else(|| bad("`numeric` takes one or two comparison/value pairs"))?;

    let mut pairs = Vec::new();
    for pair in items.chunks(2) {
        let op = pair[0]
            .as_str()
            .ok_or_else(|| bad("comparisons are `=`, `<`, `<=`, `>` or `>=`"))?;
        let literal = pair[1]
            .as_number()
            .ok_or_else(|| bad("comparison values must be numbers"))?
            .to_string();
        pairs.push((op, literal));
    }

    if let [(op, literal)] = &pairs[..] {
        let literal = literal.as_str();
        return match *op {
            "=" => Pattern::numeric_eq(literal),
            "<" => Ok(Pattern::NumericRange(Range::numeric(
                None,
                Some((literal, false)),
            )?)),
            "<=" => Ok(Pattern::NumericRange(Range::numeric(
                None,
                Some((literal, true)),
            )?)),
            ">" => Ok(Pattern::NumericRange(Range::numeric(
                Some((literal, false)),
                None,
            )?)),
            ">=" => Ok(Pattern::NumericRange(Range::numeric(
                Some((literal, true)),
                None,
            )?)),
            other => Err(bad(&format!("unrecognized comparison `{other}`"))),
        };
    }

    // Two pairs: exactly one lower and one upper bound, either order.
    let lower = pairs
        .iter()
        .find(|(op, _)| matches!(*op, ">" | ">="))
        .map(|(op, l)| (l.as_str(), *op == ">="));
    let upper = pairs
        .iter()
        .find(|(op, _)| matches!(*op, "<" | "<="))
        .map(|(op, l)| (l.as_str(), *op == "<="));
    match (lower, upper) {
        (Some(lo), Some(hi)) => Ok(Pattern::NumericRange(Range::numeric(Some(lo), Some(hi))?)),
        _ => Err(bad(
            "a two-comparison `numeric` needs one lower and one upper bound",
        )),
    }
}

fn parse_anything_but(value: &Value, field: &str) -> Result<Pattern, Error> {
    let bad = |msg: String| Error::InvalidRule(format!("`{field}`: {msg}"));
    let ab = match value {
        Value::String(s) => AnythingBut::Literals(normalize_values(vec![quote_string(s)])),
        Value::Number(n) => AnythingBut::Literals(normalize_values(vec![ev_number::encode(
            &n.to_string(),
        )?
        .to_vec()])),
        Value::Array(items) if !items.is_empty() => {
            let values = match &items[0] {
                Value::String(_) => items
                    .iter()
                    .map(|v| {
                        v.as_str().map(quote_string).ok_or_else(|| {
                            bad("`anything-but` lists are all-strings or all-numbers".into())
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                Value::Number(_) => items
                    .iter()
                    .map(|v| match v.as_number() {
                        Some(n) => Ok(ev_number::encode(&n.to_string())?.to_vec()),
                        None => {
                            Err(bad("`anything-but` lists are all-strings or all-numbers".into()))
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => {
                    return Err(bad(
                        "`anything-but` lists hold strings or numbers".into(),
                    ))
                }
            };
            AnythingBut::Literals(normalize_values(values))
        }
        Value::Object(o) => {
            let mut entries = o.iter();
            let (Some((key, inner)), None) = (entries.next(), entries.next()) else {
                return Err(bad("a nested `anything-but` holds exactly one key".into()));
            };
            let operands = anything_but_operands(key, inner, field)?;
            match key.as_str() {
                "prefix" => AnythingBut::Prefix(normalize_values(
                    operands
                        .iter()
                        .map(|s| {
                            let mut q = quote_string(s);
                            q.pop();
                            q
                        })
                        .collect(),
                )),
                "suffix" => AnythingBut::Suffix(normalize_values(
                    operands.iter().map(|s| reversed_suffix(s)).collect(),
                )),
                "equals-ignore-case" => AnythingBut::EqualsIgnoreCase(normalize_values(
                    operands
                        .iter()
                        .map(|s| quote_string(s).to_ascii_lowercase())
                        .collect(),
                )),
                "wildcard" => {
                    let mut wildcards = operands
                        .iter()
                        .map(|s| Wildcard::parse(s))
                        .collect::<Result<Vec<_>, _>>()?;
                    wildcards.sort_by(|a, b| a.segments().cmp(b.segments()));
                    wildcards.dedup();
                    AnythingBut::Wildcard(wildcards.into())
                }
                other => {
                    return Err(bad(format!(
                        "`anything-but` does not nest `{other}`"
                    )))
                }
            }
        }
        _ => return Err(bad("unsupported `anything-but` operand".into())),
    };
    Ok(Pattern::AnythingBut(ab))
}

/// Nested anything-but forms take a string or a non-empty list of
/// non-empty strings.
fn anything_but_operands<'v>(
    key: &str,
    value: &'v Value,
    field: &str,
) -> Result<Vec<&'v str>, Error> {
    let bad = || {
        Error::InvalidRule(format!(
            "`{field}`: `anything-but/{key}` takes a non-empty string or a list of them"
        ))
    };
    let operands = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|v| v.as_str().ok_or_else(bad))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(bad()),
    };
    if operands.iter().any(|s| s.is_empty()) {
        return Err(bad());
    }
    Ok(operands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile_one(rule: serde_json::Value) -> Vec<NormalizedSubRule> {
        compile(&rule, false).unwrap()
    }

    #[test]
    fn paths_are_dot_joined_and_sorted() {
        let subs = compile_one(json!({"detail": {"state": ["on"]}, "account": ["a"]}));
        assert_eq!(subs.len(), 1);
        let paths: Vec<_> = subs[0].steps.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["account", "detail.state"]);
    }

    #[test]
    fn or_expands_with_surrounding_context() {
        let subs = compile_one(json!({
            "source": ["aws"],
            "$or": [
                {"metric": [1]},
                {"name": ["cpu"], "unit": ["%"]}
            ]
        }));
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.steps.iter().any(|st| st.path == "source")));
        assert_eq!(subs[0].steps.len(), 2);
        assert_eq!(subs[1].steps.len(), 3);
    }

    #[test]
    fn nested_ors_multiply() {
        let subs = compile_one(json!({
            "a": {"$or": [{"x": [1]}, {"y": [2]}]},
            "b": {"$or": [{"u": [3]}, {"v": [4]}]}
        }));
        assert_eq!(subs.len(), 4);
        let paths: Vec<Vec<&str>> = subs
            .iter()
            .map(|s| s.steps.iter().map(|st| st.path.as_str()).collect())
            .collect();
        assert!(paths.contains(&vec!["a.x", "b.u"]));
        assert!(paths.contains(&vec!["a.y", "b.v"]));
    }

    #[test]
    fn exists_false_splits_out() {
        let subs = compile_one(json!({"a": [1], "b": [{"exists": false}]}));
        assert_eq!(subs[0].steps.len(), 1);
        assert_eq!(subs[0].must_not_exist, vec!["b"]);

        // exists:false cannot be one branch of a value leaf.
        let err = compile(&json!({"b": ["x", {"exists": false}]}), false).unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)));
    }

    #[test]
    fn duplicate_paths_are_rejected_unless_allowed() {
        let rule = json!({"a": [1], "$or": [{"a": [2]}, {"b": [3]}]});
        assert!(matches!(compile(&rule, false), Err(Error::DuplicatePath(p)) if p == "a"));
        let subs = compile(&rule, true).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].steps.len(), 2);
    }

    #[test]
    fn literal_kinds() {
        let subs = compile_one(json!({"a": ["s", 4e2, true, null]}));
        let patterns = &subs[0].steps[0].patterns;
        assert_eq!(patterns[0], Pattern::exact("s"));
        assert_eq!(patterns[1], Pattern::numeric_eq("400").unwrap());
        assert_eq!(patterns[2], Pattern::exact_token("true"));
        assert_eq!(patterns[3], Pattern::exact_token("null"));
    }

    #[test]
    fn lone_ip_matches_its_slash_32() {
        let subs = compile_one(json!({"ip": ["10.0.0.2"]}));
        assert_eq!(
            subs[0].steps[0].patterns[0],
            Pattern::NumericRange(Range::cidr("10.0.0.2/32").unwrap())
        );
    }

    #[test]
    fn numeric_comparisons() {
        let subs = compile_one(json!({"x": [{"numeric": [">", 0, "<", 1]}]}));
        assert_eq!(
            subs[0].steps[0].patterns[0],
            Pattern::NumericRange(
                Range::numeric(Some(("0", false)), Some(("1", false))).unwrap()
            )
        );
        // Either bound order is accepted.
        assert_eq!(
            compile_one(json!({"x": [{"numeric": ["<", 1, ">", 0]}]})),
            compile_one(json!({"x": [{"numeric": [">", 0, "<", 1]}]}))
        );
        assert!(compile(&json!({"x": [{"numeric": [">", 0, ">", 1]}]}), false).is_err());
        assert!(compile(&json!({"x": [{"numeric": [">", 1, "<", 0]}]}), false).is_err());
        assert!(compile(&json!({"x": [{"numeric": ["~", 1]}]}), false).is_err());
    }

    #[test]
    fn anything_but_forms() {
        let subs = compile_one(json!({"a": [{"anything-but": ["x", "y"]}]}));
        assert_eq!(
            subs[0].steps[0].patterns[0],
            Pattern::AnythingBut(AnythingBut::Literals(normalize_values(vec![
                quote_string("x"),
                quote_string("y"),
            ])))
        );

        assert!(compile(&json!({"a": [{"anything-but": ["x", 5]}]}), false).is_err());
        assert!(compile(&json!({"a": [{"anything-but": {"prefix": ""}}]}), false).is_err());
        assert!(compile(&json!({"a": [{"anything-but": {"numeric": 5}}]}), false).is_err());
        assert!(compile(&json!({"a": [{"anything-but": {"suffix": "$"}}]}), false).is_ok());
    }

    #[test]
    fn malformed_rules() {
        for rule in [
            json!([]),
            json!({"a": "b"}),
            json!({"a": []}),
            json!({"$or": []}),
            json!({"$or": [1]}),
            json!({"a": [{"unknown": 1}]}),
            json!({}),
        ] {
            assert!(compile(&rule, false).is_err(), "{rule} should be rejected");
        }
    }
}
