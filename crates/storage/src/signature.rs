//! Parameter signatures: the key that groups recorded calls which are
//! indistinguishable to a live caller.

use sha2::{Digest, Sha256};

/// Normalise one parameter value to the string a form field would carry.
///
/// Live calls arrive form-encoded, so every value is a string on the wire;
/// recorded values keep their YAML types. Booleans compare by their textual
/// rendering. Numbers and numeric strings compare by decimal value, so `42`,
/// `"042"` and `"42.0"` are equal.
pub fn normalize_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => canonical_decimal(s).unwrap_or_else(|| s.clone()),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => {
            let text = n.to_string();
            canonical_decimal(&text).unwrap_or(text)
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Canonical form of a plain decimal literal (`-?digits[.digits]`): no
/// leading zeros in the integer part, no trailing zeros in the fraction, no
/// fraction if it is zero. `None` for anything else. Exact, so long numeric
/// identifiers never collide.
fn canonical_decimal(text: &str) -> Option<String> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if unsigned.ends_with('.') {
        return None;
    }
    if !int_part
        .bytes()
        .chain(frac_part.bytes())
        .all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let mut canonical = String::new();
    if negative && !(int_part.is_empty() && frac_part.is_empty()) {
        canonical.push('-');
    }
    canonical.push_str(if int_part.is_empty() { "0" } else { int_part });
    if !frac_part.is_empty() {
        canonical.push('.');
        canonical.push_str(frac_part);
    }
    Some(canonical)
}

/// SHA-256 (hex) over the endpoint name and the key-sorted, normalised
/// parameters. Equal signatures mean key-by-key equal parameter maps.
pub fn param_signature<'a, I>(endpoint: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a serde_json::Value)>,
{
    let mut pairs: Vec<(&str, String)> = params
        .into_iter()
        .map(|(k, v)| (k.as_str(), normalize_value(v)))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    for (key, value) in &pairs {
        // Length prefixes keep ("ab","c") distinct from ("a","bc").
        hasher.update([0u8]);
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
