//! Proxy resolution from `ProtocolOptions.proxy` or the environment:
//! `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`, both case variants.

use url::Url;

/// Picks the proxy URL to use for `target_url`, honoring an explicit
/// override first and falling back to environment variables otherwise.
/// Returns `None` when no proxy applies, including when `target_url`'s host
/// matches a `NO_PROXY` entry.
pub fn resolve_proxy_for(target_url: &str, explicit: Option<&str>) -> Option<String> {
    if let Some(proxy) = explicit {
        return Some(proxy.to_string());
    }
    let host = Url::parse(target_url).ok().and_then(|u| u.host_str().map(ToString::to_string))?;
    if is_bypassed(&host) {
        return None;
    }
    let is_https = target_url.starts_with("https://");
    if is_https {
        env_var_either("HTTPS_PROXY").or_else(|| env_var_either("HTTP_PROXY"))
    } else {
        env_var_either("HTTP_PROXY")
    }
}

fn env_var_either(name: &str) -> Option<String> {
    std::env::var(name).ok().or_else(|| std::env::var(name.to_lowercase()).ok())
}

fn is_bypassed(host: &str) -> bool {
    let no_proxy = env_var_either("NO_PROXY").unwrap_or_default();
    no_proxy.split(',').map(str::trim).filter(|p| !p.is_empty()).any(|pattern| {
        let pattern = pattern.trim_start_matches('.');
        host == pattern || host.ends_with(&format!(".{pattern}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn explicit_override_wins_over_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        assert_eq!(
            resolve_proxy_for("https://api.example.com", Some("http://proxy.local:8080")),
            Some("http://proxy.local:8080".to_string())
        );
    }

    #[test]
    fn env_proxy_is_picked_up_case_insensitively() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("HTTPS_PROXY");
        std::env::set_var("https_proxy", "http://lowercase.local:3128");
        let resolved = resolve_proxy_for("https://api.example.com", None);
        std::env::remove_var("https_proxy");
        assert_eq!(resolved, Some("http://lowercase.local:3128".to_string()));
    }

    #[test]
    fn no_proxy_bypasses_matching_host() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("HTTPS_PROXY", "http://proxy.local:8080");
        std::env::set_var("NO_PROXY", "example.com");
        let resolved = resolve_proxy_for("https://api.example.com", None);
        std::env::remove_var("HTTPS_PROXY");
        std::env::remove_var("NO_PROXY");
        assert_eq!(resolved, None);
    }
}
