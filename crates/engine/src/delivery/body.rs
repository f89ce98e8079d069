//! Wire encoding of a recorded response payload.
//!
//! CPEE records a response as a list of `{name, mimetype, data}` entries.
//! Such a payload is sent back as `multipart/form-data`, one part per entry;
//! anything else goes out as JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix of the multipart boundary. ureq does not build multipart bodies,
/// so they are assembled by hand.
const BOUNDARY_PREFIX: &str = "logreplay-";

const DEFAULT_MIMETYPE: &str = "text/plain";

/// An encoded request body and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

struct Part<'a> {
    name: &'a str,
    mimetype: &'a str,
    content: Vec<u8>,
}

/// Encode `payload` for delivery.
pub fn encode_body(payload: &Value) -> EncodedBody {
    match multipart_parts(payload) {
        Some(parts) => {
            let boundary = boundary_for(&parts);
            EncodedBody {
                content_type: format!("multipart/form-data; boundary={boundary}"),
                bytes: multipart_bytes(&parts, &boundary),
            }
        }
        None => EncodedBody {
            content_type: "application/json".to_string(),
            bytes: payload.to_string().into_bytes(),
        },
    }
}

fn multipart_parts(payload: &Value) -> Option<Vec<Part<'_>>> {
    let entries = payload.as_array().filter(|e| !e.is_empty())?;
    entries
        .iter()
        .map(|entry| {
            let name = entry.get("name")?.as_str()?;
            let mimetype = entry
                .get("mimetype")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_MIMETYPE);
            Some(Part {
                name,
                mimetype,
                content: decode_content(entry.get("data")),
            })
        })
        .collect()
}

/// A boundary derived from the parts' content that occurs in none of them.
fn boundary_for(parts: &[Part<'_>]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.name.as_bytes());
        hasher.update(&part.content);
    }
    first_free_boundary(hasher.finalize().to_vec(), parts)
}

fn first_free_boundary(mut seed: Vec<u8>, parts: &[Part<'_>]) -> String {
    loop {
        let boundary = boundary_from_seed(&seed);
        if !parts.iter().any(|p| contains(&p.content, boundary.as_bytes())) {
            return boundary;
        }
        seed = Sha256::digest(&seed).to_vec();
    }
}

fn boundary_from_seed(seed: &[u8]) -> String {
    let mut boundary = BOUNDARY_PREFIX.to_string();
    for byte in seed.iter().take(12) {
        boundary.push_str(&format!("{byte:02x}"));
    }
    boundary
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn multipart_bytes(parts: &[Part<'_>], boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        let name = part.name.replace('"', "%22");
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\nContent-Type: {}\r\n\r\n",
                part.mimetype
            )
            .as_bytes(),
        );
        body.extend_from_slice(&part.content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

/// Raw bytes of a part's recorded data. `data:` URIs are base64-decoded;
/// other strings are sent as-is and structured values as JSON.
pub fn decode_content(data: Option<&Value>) -> Vec<u8> {
    match data {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            decode_data_uri(trimmed).unwrap_or_else(|| trimmed.as_bytes().to_vec())
        }
        Some(other) => other.to_string().into_bytes(),
    }
}

fn decode_data_uri(value: &str) -> Option<Vec<u8>> {
    let rest = value.strip_prefix("data:")?;
    let (_, encoded) = rest.split_once(',')?;
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_entries_become_multipart() {
        let body = encode_body(&json!([
            { "name": "result", "mimetype": "application/json", "data": "{\"status\":\"ok\"}" },
            { "name": "note", "data": "hi" }
        ]));
        let boundary = body
            .content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_string();
        assert!(boundary.starts_with(BOUNDARY_PREFIX));
        let text = String::from_utf8(body.bytes).unwrap();
        assert!(text.contains("name=\"result\"\r\nContent-Type: application/json\r\n\r\n{\"status\":\"ok\"}\r\n"));
        assert!(text.contains("name=\"note\"\r\nContent-Type: text/plain\r\n\r\nhi\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn boundary_never_occurs_in_part_content() {
        let seed = vec![7u8; 32];
        let taken = boundary_from_seed(&seed);
        let parts = [Part {
            name: "result",
            mimetype: DEFAULT_MIMETYPE,
            content: format!("before --{taken} after").into_bytes(),
        }];
        let boundary = first_free_boundary(seed, &parts);
        assert_ne!(boundary, taken);
        assert!(!contains(&parts[0].content, boundary.as_bytes()));

        // Different content gives a different boundary.
        let a = encode_body(&json!([{ "name": "r", "data": "one" }]));
        let b = encode_body(&json!([{ "name": "r", "data": "two" }]));
        assert_ne!(a.content_type, b.content_type);
    }

    #[test]
    fn other_payloads_are_json() {
        let body = encode_body(&json!({ "status": "ok" }));
        assert_eq!(body.content_type, "application/json");
        assert_eq!(body.bytes, br#"{"status":"ok"}"#.to_vec());

        // A list that is not made of named entries is JSON too.
        let body = encode_body(&json!([1, 2]));
        assert_eq!(body.content_type, "application/json");
        assert_eq!(encode_body(&json!([])).content_type, "application/json");
    }

    #[test]
    fn data_uris_are_decoded() {
        let encoded = STANDARD.encode("hello");
        let uri = format!("data:text/plain;base64,{encoded}");
        assert_eq!(decode_content(Some(&json!(uri))), b"hello".to_vec());
        assert_eq!(decode_content(Some(&json!("data:broken,@@@"))), b"data:broken,@@@".to_vec());
        assert_eq!(decode_content(Some(&json!({ "a": 1 }))), br#"{"a":1}"#.to_vec());
        assert!(decode_content(None).is_empty());
    }
}
