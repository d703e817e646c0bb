//! Advertised base URL resolution
//!
//! Every device-surface handler advertises URLs pointing back at this
//! process. The precedence is fixed and implemented once here so handlers
//! cannot diverge:
//!
//! configured base_url > `TUNER_BRIDGE_ADVERTISED_HOST` env override >
//! first non-internal IPv4 address > request Host header > `localhost:<port>`
//!
//! The streaming port is appended whenever the chosen host carries none.

use local_ip_address::list_afinet_netifas;
use std::net::IpAddr;

use crate::config::Config;

/// Environment override for the advertised host.
pub const ADVERTISED_HOST_ENV: &str = "TUNER_BRIDGE_ADVERTISED_HOST";

/// Resolve the advertised base URL for one request.
pub fn advertised_base_url(config: &Config, host_header: Option<&str>) -> String {
    let port = config.web.streaming_port.unwrap_or(config.web.port);

    let candidate = config
        .web
        .base_url
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(ADVERTISED_HOST_ENV).ok().filter(|s| !s.is_empty()))
        .or_else(first_non_internal_ipv4)
        .or_else(|| host_header.map(str::to_string).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| format!("localhost:{port}"));

    normalize(&candidate, port)
}

/// First IPv4 address that is neither loopback, link-local, nor bound to an
/// obviously virtual interface.
fn first_non_internal_ipv4() -> Option<String> {
    let interfaces = list_afinet_netifas().ok()?;
    interfaces.into_iter().find_map(|(name, addr)| match addr {
        IpAddr::V4(ipv4)
            if !ipv4.is_loopback() && !ipv4.is_link_local() && !is_virtual_interface(&name) =>
        {
            Some(ipv4.to_string())
        }
        _ => None,
    })
}

/// Container and VM bridge interfaces advertise addresses the media server
/// cannot reach.
fn is_virtual_interface(name: &str) -> bool {
    const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth", "virbr", "vmnet", "tun", "tap"];
    VIRTUAL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Ensure an `http://` scheme, strip trailing slashes, and append the
/// streaming port when the authority has none.
fn normalize(candidate: &str, port: u16) -> String {
    let trimmed = candidate.trim().trim_end_matches('/');
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    match url::Url::parse(&with_scheme) {
        Ok(mut parsed) => {
            if parsed.port().is_none() && !explicit_default_port(&with_scheme) {
                let _ = parsed.set_port(Some(port));
            }
            parsed.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => format!("http://localhost:{port}"),
    }
}

/// `http://host:80` parses with `port() == None`; preserve an explicitly
/// written default port marker by checking the raw text.
fn explicit_default_port(raw: &str) -> bool {
    raw.rsplit_once(':')
        .is_some_and(|(_, tail)| matches!(tail.trim_end_matches('/'), "80" | "443"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn config_with(base_url: Option<&str>, port: u16) -> Config {
        let mut config = Config::default();
        config.web.base_url = base_url.map(str::to_string);
        config.web.port = port;
        config
    }

    #[test]
    #[serial]
    fn explicit_setting_wins() {
        unsafe { std::env::remove_var(ADVERTISED_HOST_ENV) };
        let config = config_with(Some("http://192.168.1.10:3000"), 3000);
        assert_eq!(
            advertised_base_url(&config, Some("ignored.example:9999")),
            "http://192.168.1.10:3000"
        );
    }

    #[test]
    #[serial]
    fn env_override_beats_host_header() {
        unsafe { std::env::set_var(ADVERTISED_HOST_ENV, "10.1.2.3") };
        let config = config_with(None, 3000);
        let url = advertised_base_url(&config, Some("header.example"));
        unsafe { std::env::remove_var(ADVERTISED_HOST_ENV) };
        assert_eq!(url, "http://10.1.2.3:3000");
    }

    #[test]
    #[serial]
    fn port_appended_when_missing() {
        unsafe { std::env::remove_var(ADVERTISED_HOST_ENV) };
        let config = config_with(Some("192.168.1.10"), 3000);
        assert_eq!(advertised_base_url(&config, None), "http://192.168.1.10:3000");
    }

    #[test]
    #[serial]
    fn existing_port_is_preserved() {
        unsafe { std::env::remove_var(ADVERTISED_HOST_ENV) };
        let config = config_with(Some("192.168.1.10:8080"), 3000);
        assert_eq!(advertised_base_url(&config, None), "http://192.168.1.10:8080");
    }

    #[test]
    fn virtual_interfaces_are_skipped() {
        assert!(is_virtual_interface("docker0"));
        assert!(is_virtual_interface("br-a1b2c3"));
        assert!(is_virtual_interface("veth12ab"));
        assert!(!is_virtual_interface("eth0"));
        assert!(!is_virtual_interface("enp3s0"));
    }
}
