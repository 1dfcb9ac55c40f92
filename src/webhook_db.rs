// src/webhook_db.rs
//
// Persistent webhook registry: a binlog-backed key-value store mapping
// `<token>[:T]` to an encoded webhook descriptor.  The encoding is a compact
// prefix grammar so a descriptor replays into the arguments of a synthetic
// `setWebhook` request:
//
//   [cert/][#maxc<n>/][#ip<addr>/][#fix_ip/][#secret<tok>/][#allow<mask>/]<url>

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::binlog::{Binlog, BinlogError};

// ─── Key-value store ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
enum KvRecord {
    Set { key: String, value: String },
    Erase { key: String },
}

pub struct WebhookDb {
    inner: Mutex<HashMap<String, String>>,
    log: Mutex<Option<Binlog>>,
}

impl WebhookDb {
    pub fn open(path: &Path) -> Result<Self, BinlogError> {
        let (log, records) = Binlog::open(path)?;
        let mut map = HashMap::new();
        for record in &records {
            match serde_json::from_slice::<KvRecord>(record) {
                Ok(KvRecord::Set { key, value }) => {
                    map.insert(key, value);
                }
                Ok(KvRecord::Erase { key }) => {
                    map.remove(&key);
                }
                Err(e) => warn!(error = %e, "dropping undecodable webhook registry record"),
            }
        }
        Ok(Self {
            inner: Mutex::new(map),
            log: Mutex::new(Some(log)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            log: Mutex::new(None),
        }
    }

    fn append(&self, record: &KvRecord) {
        if let Some(log) = self.log.lock().unwrap().as_ref() {
            if let Ok(bytes) = serde_json::to_vec(record) {
                if let Err(e) = log.append(bytes) {
                    warn!(error = %e, "failed to append webhook registry record");
                }
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.append(&KvRecord::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn erase(&self, key: &str) {
        if self.inner.lock().unwrap().remove(key).is_some() {
            self.append(&KvRecord::Erase {
                key: key.to_string(),
            });
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn get_all(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        entries
    }

    pub fn close(&self) {
        if let Some(log) = self.log.lock().unwrap().take() {
            log.close();
        }
    }
}

// ─── Descriptor codec ───────────────────────────────────────────────────────

/// The persisted shape of one webhook configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookDescriptor {
    pub url: String,
    pub has_certificate: bool,
    pub max_connections: Option<i32>,
    pub ip_address: Option<String>,
    pub fix_ip_address: bool,
    pub secret_token: Option<String>,
    pub allowed_updates: Option<u32>,
}

impl WebhookDescriptor {
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if self.has_certificate {
            out.push_str("cert/");
        }
        if let Some(max_connections) = self.max_connections {
            out.push_str(&format!("#maxc{max_connections}/"));
        }
        if let Some(ip_address) = &self.ip_address {
            out.push_str(&format!("#ip{ip_address}/"));
        }
        if self.fix_ip_address {
            out.push_str("#fix_ip/");
        }
        if let Some(secret_token) = &self.secret_token {
            out.push_str(&format!("#secret{secret_token}/"));
        }
        if let Some(allowed_updates) = self.allowed_updates {
            out.push_str(&format!("#allow{allowed_updates}/"));
        }
        out.push_str(&self.url);
        out
    }

    pub fn parse(encoded: &str) -> Self {
        let mut rest = encoded;
        let mut descriptor = Self::default();

        let take = |rest: &mut &str, prefix: &str| -> Option<String> {
            let tail = rest.strip_prefix(prefix)?;
            let end = tail.find('/').unwrap_or(tail.len());
            let value = tail[..end].to_string();
            *rest = &tail[(end + 1).min(tail.len())..];
            Some(value)
        };

        if let Some(tail) = rest.strip_prefix("cert/") {
            descriptor.has_certificate = true;
            rest = tail;
        }
        if let Some(value) = take(&mut rest, "#maxc") {
            descriptor.max_connections = value.parse().ok();
        }
        if let Some(value) = take(&mut rest, "#ip") {
            descriptor.ip_address = Some(value);
        }
        if let Some(tail) = rest.strip_prefix("#fix_ip/") {
            descriptor.fix_ip_address = true;
            rest = tail;
        }
        if let Some(value) = take(&mut rest, "#secret") {
            descriptor.secret_token = Some(value);
        }
        if let Some(value) = take(&mut rest, "#allow") {
            descriptor.allowed_updates = value.parse().ok();
        }
        descriptor.url = rest.to_string();
        descriptor
    }

    /// The arguments of the synthetic `setWebhook` replayed at startup for
    /// this descriptor.
    pub fn restore_args(&self) -> Vec<(String, String)> {
        let mut args = Vec::new();
        if self.has_certificate {
            args.push(("certificate".to_string(), "previous".to_string()));
        }
        if let Some(max_connections) = self.max_connections {
            args.push(("max_connections".to_string(), max_connections.to_string()));
        }
        if let Some(ip_address) = &self.ip_address {
            args.push(("ip_address".to_string(), ip_address.clone()));
        }
        if self.fix_ip_address {
            args.push(("fix_ip_address".to_string(), "1".to_string()));
        }
        if let Some(secret_token) = &self.secret_token {
            args.push(("secret_token".to_string(), secret_token.clone()));
        }
        if let Some(allowed_updates) = self.allowed_updates {
            args.push(("allowed_updates".to_string(), allowed_updates.to_string()));
        }
        args.push(("url".to_string(), self.url.clone()));
        args
    }
}

/// Registry key for a bot: the test-DC flag is folded into the token.
pub fn registry_key(token: &str, is_test_dc: bool) -> String {
    if is_test_dc {
        format!("{token}:T")
    } else {
        token.to_string()
    }
}

/// Split a registry key back into `(token, is_test_dc)`.
pub fn parse_registry_key(key: &str) -> (&str, bool) {
    match key.strip_suffix(":T") {
        Some(token) => (token, true),
        None => (key, false),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip_minimal() {
        let descriptor = WebhookDescriptor {
            url: "https://example.com/hook".to_string(),
            ..Default::default()
        };
        let encoded = descriptor.encode();
        assert_eq!(encoded, "https://example.com/hook");
        assert_eq!(WebhookDescriptor::parse(&encoded), descriptor);
    }

    #[test]
    fn descriptor_roundtrip_full() {
        let descriptor = WebhookDescriptor {
            url: "https://example.com/hook?a=b".to_string(),
            has_certificate: true,
            max_connections: Some(40),
            ip_address: Some("1.2.3.4".to_string()),
            fix_ip_address: true,
            secret_token: Some("s3cret_-token".to_string()),
            allowed_updates: Some(5),
        };
        let encoded = descriptor.encode();
        assert_eq!(
            encoded,
            "cert/#maxc40/#ip1.2.3.4/#fix_ip/#secrets3cret_-token/#allow5/https://example.com/hook?a=b"
        );
        assert_eq!(WebhookDescriptor::parse(&encoded), descriptor);
    }

    #[test]
    fn restore_args_shape() {
        let descriptor = WebhookDescriptor {
            url: "https://h/x".to_string(),
            has_certificate: true,
            max_connections: Some(7),
            ..Default::default()
        };
        let args = descriptor.restore_args();
        assert_eq!(
            args,
            vec![
                ("certificate".to_string(), "previous".to_string()),
                ("max_connections".to_string(), "7".to_string()),
                ("url".to_string(), "https://h/x".to_string()),
            ]
        );
    }

    #[test]
    fn registry_key_roundtrip() {
        assert_eq!(registry_key("123:abc", false), "123:abc");
        assert_eq!(registry_key("123:abc", true), "123:abc:T");
        assert_eq!(parse_registry_key("123:abc:T"), ("123:abc", true));
        assert_eq!(parse_registry_key("123:abc"), ("123:abc", false));
    }

    #[test]
    fn kv_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhooks_db.binlog");

        {
            let db = WebhookDb::open(&path).unwrap();
            db.set("1:a", "https://one/");
            db.set("2:b", "https://two/");
            db.set("1:a", "cert/https://one-updated/");
            db.erase("2:b");
            db.close();
        }

        let db = WebhookDb::open(&path).unwrap();
        assert_eq!(db.get("1:a").as_deref(), Some("cert/https://one-updated/"));
        assert_eq!(db.get("2:b"), None);
        assert_eq!(db.get_all().len(), 1);
        db.close();
    }
}
