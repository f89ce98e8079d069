//! Inbound call description: parameters, simulation-target hint and caller
//! identity.

use indexmap::IndexMap;
use logreplay_storage::InputParams;
use tokio::time::Instant;

/// Hint keys that pin selection to one recorded instance.
const INSTANCE_KEYS: [&str; 2] = ["instance", "instance_uuid"];

/// The `cpee-sim-target` hint: space-separated `key=value` tokens.
///
/// The raw header is kept so it can be passed back to the engine verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimTarget {
    raw: String,
    entries: IndexMap<String, String>,
}

impl SimTarget {
    /// Parse a hint header. Tokens without `=` are ignored.
    pub fn parse(header: &str) -> Self {
        let entries = header
            .split_whitespace()
            .filter_map(|token| token.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self {
            raw: header.trim().to_string(),
            entries,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded instance the caller asked to be served from, if any.
    pub fn instance(&self) -> Option<&str> {
        INSTANCE_KEYS
            .iter()
            .find_map(|key| self.get(key))
            .filter(|v| !v.is_empty())
    }
}

/// Identify the live caller of an inbound call.
///
/// The explicit instance header wins. Otherwise the callback URL identifies
/// the calling process instance once its `/callbacks/...` suffix is removed.
pub fn caller_identity(instance_header: Option<&str>, callback: &str) -> String {
    if let Some(instance) = instance_header.map(str::trim).filter(|s| !s.is_empty()) {
        return instance.to_string();
    }
    match url::Url::parse(callback) {
        Ok(mut url) => {
            if let Some(pos) = url.path().find("/callbacks") {
                let base = url.path()[..pos].to_string();
                url.set_path(&base);
            }
            url.set_query(None);
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => callback
            .split("/callbacks")
            .next()
            .unwrap_or(callback)
            .trim_end_matches('/')
            .to_string(),
    }
}

/// Form-encoded request parameters as call parameters, in request order.
/// A repeated name keeps its last value.
pub fn form_params<I, K, V>(pairs: I) -> InputParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params = InputParams::new();
    for (name, value) in pairs {
        params.insert(name.into(), serde_json::Value::String(value.into()));
    }
    params
}

/// A live service call awaiting a recorded answer.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Endpoint name the engine originally called.
    pub endpoint: String,
    /// Where responses are delivered.
    pub callback: String,
    pub sim_target: SimTarget,
    /// Identity of the live process instance making the call.
    pub caller: String,
    pub params: InputParams,
    /// When the call arrived; response offsets count from here.
    pub received_at: Instant,
}
