//! Content-service-paths. A CSP names a view on an asset:
//! `/path/segments?view=<name>&keyType=<t>&valueType=<t>&...`. The first
//! time a CSP appears on a connection the server binds a 64-bit alias (CID)
//! to it; afterwards either form may appear in request metadata.

use std::collections::HashMap;
use std::fmt;

use crate::error::EngineError;

pub mod views {
    pub const MAP: &str = "map";
    pub const KEY_SET: &str = "keySet";
    pub const ENTRY_SET: &str = "entrySet";
    pub const VALUES: &str = "values";
    pub const TOPIC_PUBLISHER: &str = "topicPublisher";
    // Capitalised on the wire since the first release; do not "fix".
    pub const REPLICATION: &str = "Replication";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Csp {
    pub path: String,
    pub view: String,
    pub key_type: Option<String>,
    pub value_type: Option<String>,
    pub put_returns_null: bool,
    pub remove_returns_null: bool,
    pub bootstrap: bool,
    pub base_path: Option<String>,
}

impl Csp {
    pub fn new(path: &str, view: &str) -> Self {
        Csp {
            path: path.to_owned(),
            view: view.to_owned(),
            key_type: None,
            value_type: None,
            put_returns_null: false,
            remove_returns_null: false,
            bootstrap: true,
            base_path: None,
        }
    }

    /// Parse a CSP uri. `view` is mandatory; unknown query keys are ignored.
    pub fn parse(uri: &str) -> Result<Csp, EngineError> {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, q),
            None => (uri, ""),
        };
        if path.is_empty() || !path.starts_with('/') {
            return Err(EngineError::ProtocolViolation(format!(
                "csp path must start with '/': {uri}"
            )));
        }
        let mut csp = Csp::new(path, "");
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            match k {
                "view" => csp.view = v.to_owned(),
                "keyType" => csp.key_type = Some(v.to_owned()),
                "valueType" => csp.value_type = Some(v.to_owned()),
                "putReturnsNull" => csp.put_returns_null = parse_bool(v)?,
                "removeReturnsNull" => csp.remove_returns_null = parse_bool(v)?,
                "bootstrap" => csp.bootstrap = parse_bool(v)?,
                "basePath" => csp.base_path = Some(v.to_owned()),
                _ => {} // forward compatibility
            }
        }
        if csp.view.is_empty() {
            return Err(EngineError::ProtocolViolation(format!(
                "csp without view: {uri}"
            )));
        }
        Ok(csp)
    }

    /// The same asset seen through another view; used for set-proxy replies.
    pub fn derived(&self, view: &str) -> Csp {
        Csp {
            view: view.to_owned(),
            put_returns_null: false,
            remove_returns_null: false,
            bootstrap: true,
            base_path: None,
            ..self.clone()
        }
    }

    pub fn to_uri(&self) -> String {
        self.to_string()
    }
}

fn parse_bool(v: &str) -> Result<bool, EngineError> {
    match v {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(EngineError::ProtocolViolation(format!(
            "bad boolean in csp: {other}"
        ))),
    }
}

impl fmt::Display for Csp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?view={}", self.path, self.view)?;
        if let Some(k) = &self.key_type {
            write!(f, "&keyType={k}")?;
        }
        if let Some(v) = &self.value_type {
            write!(f, "&valueType={v}")?;
        }
        if self.put_returns_null {
            write!(f, "&putReturnsNull=true")?;
        }
        if self.remove_returns_null {
            write!(f, "&removeReturnsNull=true")?;
        }
        if !self.bootstrap {
            write!(f, "&bootstrap=false")?;
        }
        if let Some(b) = &self.base_path {
            write!(f, "&basePath={b}")?;
        }
        Ok(())
    }
}

/// Per-connection CSP ↔ CID bindings. Owned by the connection's read task,
/// dropped with the connection.
#[derive(Default)]
pub struct CidTable {
    next: u64,
    by_cid: HashMap<u64, String>,
    by_uri: HashMap<String, u64>,
}

impl CidTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh cid to the uri, or return the existing one.
    pub fn bind(&mut self, uri: &str) -> u64 {
        if let Some(cid) = self.by_uri.get(uri) {
            return *cid;
        }
        self.next += 1;
        let cid = self.next;
        self.by_uri.insert(uri.to_owned(), cid);
        self.by_cid.insert(cid, uri.to_owned());
        cid
    }

    pub fn resolve(&self, cid: u64) -> Option<&str> {
        self.by_cid.get(&cid).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let csp = Csp::parse(
            "/stocks/eu?view=map&keyType=string&valueType=bytes&putReturnsNull=true&bootstrap=false&ignored=x",
        )
        .unwrap();
        assert_eq!(csp.path, "/stocks/eu");
        assert_eq!(csp.view, "map");
        assert_eq!(csp.key_type.as_deref(), Some("string"));
        assert!(csp.put_returns_null);
        assert!(!csp.remove_returns_null);
        assert!(!csp.bootstrap);
    }

    #[test]
    fn view_is_mandatory() {
        assert!(Csp::parse("/m").is_err());
        assert!(Csp::parse("/m?keyType=string").is_err());
        assert!(Csp::parse("m?view=map").is_err());
    }

    #[test]
    fn uri_round_trips() {
        for uri in [
            "/m?view=map",
            "/m?view=keySet&keyType=string&valueType=bytes",
            "/a/b?view=map&putReturnsNull=true&removeReturnsNull=true&bootstrap=false",
        ] {
            assert_eq!(Csp::parse(uri).unwrap().to_uri(), uri);
        }
    }

    #[test]
    fn derived_view_keeps_types_and_drops_flags() {
        let base = Csp::parse("/m?view=map&keyType=string&putReturnsNull=true").unwrap();
        let proxy = base.derived(views::KEY_SET);
        assert_eq!(proxy.view, "keySet");
        assert_eq!(proxy.key_type.as_deref(), Some("string"));
        assert!(!proxy.put_returns_null);
    }

    #[test]
    fn cid_binding_is_idempotent_per_connection() {
        let mut t = CidTable::new();
        let a = t.bind("/m?view=map");
        let b = t.bind("/m?view=map");
        let c = t.bind("/m?view=keySet");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(t.resolve(a), Some("/m?view=map"));
        assert_eq!(t.resolve(999), None);
    }
}
