//! `CookieJar` — cookie storage keyed by URL. Concrete persistence (to
//! disk, to a browser-shared store, …) is an external collaborator; this
//! module only specifies the interface plus an in-memory reference
//! implementation good enough to drive a single run.

use std::collections::HashMap;
use std::sync::RwLock;

/// A single stored cookie. Attributes (`Domain`, `Path`, `Expires`, …) are
/// stripped at storage time — only name/value survive.
#[derive(Debug, Clone)]
pub struct Cookie {
    /// Cookie name, looked up case-sensitively.
    pub name: String,
    /// Cookie value.
    pub value: String,
}

/// Stores and retrieves cookies keyed by URL. Protocol plugins write
/// cookies parsed from `Set-Cookie` response headers; scripts read through
/// `quest.cookies.*` and may clear the jar.
pub trait CookieJar: Send + Sync {
    /// Record (or overwrite) a cookie observed for `url`.
    fn set(&self, url: &str, cookie: Cookie);

    /// Look up a single cookie by exact, case-sensitive name for `url`.
    fn get(&self, url: &str, name: &str) -> Option<String>;

    /// Whether a cookie named `name` exists for `url`.
    fn has(&self, url: &str, name: &str) -> bool {
        self.get(url, name).is_some()
    }

    /// All cookies for `url` as a flat name→value map.
    fn to_object(&self, url: &str) -> HashMap<String, String>;

    /// Remove every cookie stored for `url`. With `url: None`, clears the
    /// entire jar.
    fn clear(&self, url: Option<&str>);
}

/// Cookies partitioned by the URL's registrable host, the granularity
/// `quest.cookies.*` operates at.
fn host_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// A process-local, non-persistent jar — sufficient for a single run;
/// long-term persistence is explicitly out of scope.
#[derive(Debug, Default)]
pub struct InMemoryCookieJar {
    by_host: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryCookieJar {
    /// An empty jar.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieJar for InMemoryCookieJar {
    fn set(&self, url: &str, cookie: Cookie) {
        let mut jar = self.by_host.write().expect("cookie jar lock poisoned");
        jar.entry(host_key(url)).or_default().insert(cookie.name, cookie.value);
    }

    fn get(&self, url: &str, name: &str) -> Option<String> {
        let jar = self.by_host.read().expect("cookie jar lock poisoned");
        jar.get(&host_key(url)).and_then(|cookies| cookies.get(name).cloned())
    }

    fn to_object(&self, url: &str) -> HashMap<String, String> {
        let jar = self.by_host.read().expect("cookie jar lock poisoned");
        jar.get(&host_key(url)).cloned().unwrap_or_default()
    }

    fn clear(&self, url: Option<&str>) {
        let mut jar = self.by_host.write().expect("cookie jar lock poisoned");
        match url {
            Some(url) => {
                jar.remove(&host_key(url));
            }
            None => jar.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let jar = InMemoryCookieJar::new();
        jar.set(
            "https://api.example.com/login",
            Cookie {
                name: "session".to_string(),
                value: "abc123".to_string(),
            },
        );
        assert_eq!(jar.get("https://api.example.com/x", "session"), Some("abc123".to_string()));
        assert!(jar.has("https://api.example.com/x", "session"));
    }

    #[test]
    fn cookie_name_lookup_is_case_sensitive() {
        let jar = InMemoryCookieJar::new();
        jar.set(
            "https://example.com",
            Cookie {
                name: "Session".to_string(),
                value: "v".to_string(),
            },
        );
        assert!(jar.get("https://example.com", "session").is_none());
        assert!(jar.has("https://example.com", "Session"));
    }

    #[test]
    fn clear_without_url_empties_whole_jar() {
        let jar = InMemoryCookieJar::new();
        jar.set(
            "https://a.example.com",
            Cookie {
                name: "x".to_string(),
                value: "1".to_string(),
            },
        );
        jar.set(
            "https://b.example.com",
            Cookie {
                name: "y".to_string(),
                value: "2".to_string(),
            },
        );
        jar.clear(None);
        assert!(jar.to_object("https://a.example.com").is_empty());
        assert!(jar.to_object("https://b.example.com").is_empty());
    }
}
