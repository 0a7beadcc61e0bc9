/*!
Value-level patterns.

Every pattern kind (except existence checks) denotes a set of byte
strings over the *raw value token* of an event field: string values keep
their JSON quotes, numbers are the order-preserving [`ev_number`]
encoding, booleans and null are their literal text. Two patterns are
equal iff they denote the same set, which the constructors guarantee by
normalizing (folding, reversing, escaping, encoding) at build time.
*/
use crate::error::Error;

mod range;

pub(crate) use range::Range;
pub(crate) use range::{encode_ipv4, parse_ipv4};

/// One value-level match, normalized and hashable by deep value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Pattern {
    /// The whole token, quotes included for strings.
    Exact(Box<[u8]>),
    /// Leading token bytes, opening quote included.
    Prefix(Box<[u8]>),
    /// Trailing token bytes including the closing quote, stored
    /// reversed; matched by the right-to-left traversal pass.
    Suffix(Box<[u8]>),
    /// ASCII-folded whole token.
    EqualsIgnoreCase(Box<[u8]>),
    Wildcard(Wildcard),
    /// Encoded numeric literal, exact.
    NumericEq(Box<[u8]>),
    NumericRange(Range),
    AnythingBut(AnythingBut),
    /// Tracked at the name-state level, never inside a byte machine.
    Exists(bool),
}

/// The complement patterns: match any value the inner set does *not*.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum AnythingBut {
    /// Exact tokens: quoted strings or encoded numbers. Sorted.
    Literals(Box<[Box<[u8]>]>),
    Prefix(Box<[Box<[u8]>]>),
    /// Each entry reversed, like [`Pattern::Suffix`].
    Suffix(Box<[Box<[u8]>]>),
    EqualsIgnoreCase(Box<[Box<[u8]>]>),
    Wildcard(Box<[Wildcard]>),
}

/// A parsed wildcard: literal segments with one `*` between each pair.
///
/// The first segment starts with the value token's opening quote and
/// the last ends with the closing quote, so anchoring falls out of the
/// token shape. `\*` and `\\` escapes are resolved at parse time and
/// the segment text is JSON-escaped the same way event tokens are.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Wildcard {
    segments: Box<[Box<[u8]>]>,
}

impl Wildcard {
    pub(crate) fn parse(raw: &str) -> Result<Self, Error> {
        let mut segments: Vec<Vec<u8>> = vec![Vec::new()];
        let mut bytes = raw.bytes();
        while let Some(b) = bytes.next() {
            match b {
                b'\\' => match bytes.next() {
                    Some(e @ (b'*' | b'\\')) => segments.last_mut().unwrap().push(e),
                    Some(e) => {
                        return Err(Error::PatternSyntax(format!(
                            "`\\{}` in wildcard `{raw}`: only `*` and `\\` can be escaped",
                            e as char
                        )))
                    }
                    None => {
                        return Err(Error::PatternSyntax(format!(
                            "wildcard `{raw}` ends with a lone backslash"
                        )))
                    }
                },
                b'*' => {
                    if segments.len() > 1 && segments.last().unwrap().is_empty() {
                        return Err(Error::PatternSyntax(format!(
                            "consecutive wildcard characters at position {} in `{raw}`",
                            raw.len() - bytes.len() - 1
                        )));
                    }
                    segments.push(Vec::new());
                }
                _ => segments.last_mut().unwrap().push(b),
            }
        }

        let last = segments.len() - 1;
        let segments = segments
            .into_iter()
            .enumerate()
            .map(|(i, seg)| {
                // Segment text must look exactly like it does inside the
                // event's raw token.
                let mut out = Vec::with_capacity(seg.len() + 2);
                if i == 0 {
                    out.push(b'"');
                }
                escape_into(&seg, &mut out);
                if i == last {
                    out.push(b'"');
                }
                out.into_boxed_slice()
            })
            .collect();
        Ok(Self { segments })
    }

    pub(crate) fn segments(&self) -> &[Box<[u8]>] {
        &self.segments
    }

    /// Number of `*` runs, i.e. spin states this pattern will add.
    pub(crate) fn star_count(&self) -> usize {
        self.segments.len() - 1
    }
}

impl Pattern {
    pub(crate) fn exact(s: &str) -> Self {
        Self::Exact(quote_string(s).into_boxed_slice())
    }

    /// Exact match on an unquoted literal token (`true`, `false`,
    /// `null`, or a number that failed to encode).
    pub(crate) fn exact_token(token: &str) -> Self {
        Self::Exact(token.as_bytes().into())
    }

    pub(crate) fn prefix(s: &str) -> Self {
        let mut quoted = quote_string(s);
        quoted.pop();
        Self::Prefix(quoted.into_boxed_slice())
    }

    pub(crate) fn suffix(s: &str) -> Self {
        Self::Suffix(reversed_suffix(s).into_boxed_slice())
    }

    pub(crate) fn equals_ignore_case(s: &str) -> Self {
        Self::EqualsIgnoreCase(quote_string(s).to_ascii_lowercase().into_boxed_slice())
    }

    pub(crate) fn wildcard(raw: &str) -> Result<Self, Error> {
        Wildcard::parse(raw).map(Self::Wildcard)
    }

    pub(crate) fn numeric_eq(literal: &str) -> Result<Self, Error> {
        Ok(Self::NumericEq(ev_number::encode(literal)?.into()))
    }

    /// True for patterns matched by the right-to-left traversal pass.
    pub(crate) fn is_reverse(&self) -> bool {
        matches!(
            self,
            Pattern::Suffix(_) | Pattern::AnythingBut(AnythingBut::Suffix(_))
        )
    }

    /// True for complement patterns, whose terminals mark positive hits
    /// instead of yielding matches.
    pub(crate) fn is_negated(&self) -> bool {
        matches!(self, Pattern::AnythingBut(_))
    }

    /// Spin states this pattern contributes to a byte machine.
    pub(crate) fn spin_weight(&self) -> usize {
        match self {
            Pattern::Wildcard(w) => w.star_count(),
            Pattern::AnythingBut(AnythingBut::Wildcard(ws)) => {
                ws.iter().map(Wildcard::star_count).sum()
            }
            _ => 0,
        }
    }
}

/// Reversed `s` + closing quote, the chain a suffix builds forward over
/// reversed value bytes.
pub(crate) fn reversed_suffix(s: &str) -> Vec<u8> {
    let mut quoted = quote_string(s);
    quoted.remove(0);
    quoted.reverse();
    quoted
}

/// The raw JSON token of a string value: quotes plus serde_json-style
/// escaping. Rules and events both run through here, so the bytes agree
/// on both sides of the automaton.
pub(crate) fn quote_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 2);
    out.push(b'"');
    escape_into(s.as_bytes(), &mut out);
    out.push(b'"');
    out
}

fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x09 => out.extend_from_slice(b"\\t"),
            0x0a => out.extend_from_slice(b"\\n"),
            0x0c => out.extend_from_slice(b"\\f"),
            0x0d => out.extend_from_slice(b"\\r"),
            b if b < 0x20 => {
                const HEX: &[u8; 16] = b"0123456789abcdef";
                out.extend_from_slice(b"\\u00");
                out.push(HEX[(b >> 4) as usize]);
                out.push(HEX[(b & 0xf) as usize]);
            }
            b => out.push(b),
        }
    }
}

/// Sorts and dedupes anything-but operands so pattern equality is by
/// value set, not spelling order.
pub(crate) fn normalize_values(mut values: Vec<Vec<u8>>) -> Box<[Box<[u8]>]> {
    values.sort();
    values.dedup();
    values.into_iter().map(Vec::into_boxed_slice).collect()
}
