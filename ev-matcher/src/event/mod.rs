/*!
Event flattening.

A parsed JSON event becomes an ordered list of fields: dot-joined path,
the raw value presentations the byte machines will see, and the array
trail that records which array element each value came from. Fields are
sorted by path so the traversal sees them in the same order rule chains
were threaded in.

Value presentations follow the pattern model: strings keep their quoted
JSON token (an IPv4-shaped string is additionally presented in its
range encoding); numbers become their order-preserving encoding when
the domain allows, otherwise they stay raw text and simply match no
numeric pattern; booleans and null are their literal text.
*/
use serde_json::Value;

use crate::error::Error;
use crate::pattern::{encode_ipv4, parse_ipv4, quote_string};

/// One flattened (path, value) observation.
#[derive(Debug, Clone)]
pub(crate) struct Field {
    pub path: String,
    /// Raw byte forms this value takes in the byte machines.
    pub presentations: Vec<Vec<u8>>,
    /// (array id, element index) for every array on the path here.
    pub trail: Vec<(u32, u32)>,
}

pub(crate) fn flatten_json(event: &Value) -> Result<Vec<Field>, Error> {
    let object = event
        .as_object()
        .ok_or_else(|| Error::InvalidEvent("an event must be a JSON object".into()))?;
    let mut fields = Vec::new();
    let mut walker = Walker {
        fields: &mut fields,
        next_array: 0,
    };
    walker.object(object, &mut Vec::new(), &mut Vec::new());
    sort_fields(&mut fields);
    Ok(fields)
}

/// The pre-flattened form: alternating path and value tokens, string
/// values already JSON-quoted, everything else a raw literal. No array
/// trails; this is the flat multiset input.
pub(crate) fn flatten_tokens(tokens: &[&str]) -> Result<Vec<Field>, Error> {
    if tokens.len() % 2 != 0 {
        return Err(Error::InvalidEvent(
            "expected alternating path and value tokens".into(),
        ));
    }
    let mut fields: Vec<Field> = tokens
        .chunks(2)
        .map(|pair| Field {
            path: pair[0].to_owned(),
            presentations: token_presentations(pair[1]),
            trail: Vec::new(),
        })
        .collect();
    sort_fields(&mut fields);
    Ok(fields)
}

struct Walker<'f> {
    fields: &'f mut Vec<Field>,
    next_array: u32,
}

impl Walker<'_> {
    fn object(
        &mut self,
        object: &serde_json::Map<String, Value>,
        path: &mut Vec<String>,
        trail: &mut Vec<(u32, u32)>,
    ) {
        for (key, value) in object {
            path.push(key.clone());
            self.value(value, path, trail);
            path.pop();
        }
    }

    fn value(&mut self, value: &Value, path: &mut Vec<String>, trail: &mut Vec<(u32, u32)>) {
        match value {
            Value::Object(o) => self.object(o, path, trail),
            Value::Array(items) => {
                let id = self.next_array;
                self.next_array += 1;
                for (index, item) in items.iter().enumerate() {
                    trail.push((id, index as u32));
                    self.value(item, path, trail);
                    trail.pop();
                }
            }
            scalar => self.fields.push(Field {
                path: path.join("."),
                presentations: presentations(scalar),
                trail: trail.clone(),
            }),
        }
    }
}

fn presentations(value: &Value) -> Vec<Vec<u8>> {
    match value {
        Value::String(s) => {
            let mut out = vec![quote_string(s)];
            if let Some(ip) = parse_ipv4(s) {
                out.push(encode_ipv4(ip).to_vec());
            }
            out
        }
        Value::Number(n) => {
            let literal = n.to_string();
            match ev_number::encode(&literal) {
                Ok(encoded) => vec![encoded.to_vec()],
                // Out of the encodable domain: raw text, which matches
                // no numeric pattern.
                Err(_) => vec![literal.into_bytes()],
            }
        }
        Value::Bool(true) => vec![b"true".to_vec()],
        Value::Bool(false) => vec![b"false".to_vec()],
        Value::Null => vec![b"null".to_vec()],
        Value::Object(_) | Value::Array(_) => unreachable!("containers are walked, not presented"),
    }
}

fn token_presentations(token: &str) -> Vec<Vec<u8>> {
    if token.starts_with('"') {
        let mut out = vec![token.as_bytes().to_vec()];
        if let Some(ip) = token
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .and_then(parse_ipv4)
        {
            out.push(encode_ipv4(ip).to_vec());
        }
        return out;
    }
    match ev_number::encode(token) {
        Ok(encoded) => vec![encoded.to_vec()],
        Err(_) => vec![token.as_bytes().to_vec()],
    }
}

fn sort_fields(fields: &mut [Field]) {
    fields.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| a.presentations[0].cmp(&b.presentations[0]))
            .then_with(|| a.trail.cmp(&b.trail))
    });
}
