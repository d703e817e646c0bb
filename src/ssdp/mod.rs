//! SSDP discovery responder
//!
//! Joins the UPnP multicast group and answers M-SEARCH queries for the
//! emulated tuner with a unicast HTTP/1.1 200 whose LOCATION points at
//! `/device.xml` on the advertised base URL. Periodic NOTIFY announcements
//! keep long-running media servers aware of the device between searches.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use local_ip_address::list_afinet_netifas;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::{Config, SsdpConfig};
use crate::web::base_url::advertised_base_url;

/// Search targets always answered regardless of configuration.
const BUILTIN_TARGETS: &[&str] = &["ssdp:all", "upnp:rootdevice"];

pub struct SsdpResponder {
    config: SsdpConfig,
    device_udn: String,
    location: String,
    server_ident: String,
}

impl SsdpResponder {
    pub fn new(config: &Config) -> Self {
        let base_url = advertised_base_url(config, None);
        Self {
            config: config.ssdp.clone(),
            device_udn: config.device.uuid.clone(),
            location: format!("{base_url}/device.xml"),
            server_ident: format!(
                "Linux/2.6 UPnP/1.0 {}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
        }
    }

    /// Bind the multicast socket and run the responder until the task is
    /// aborted. Returns the spawned task handles (receiver, announcer).
    pub fn start(self) -> Vec<tokio::task::JoinHandle<()>> {
        if !self.config.enabled {
            info!("SSDP responder disabled by configuration");
            return Vec::new();
        }

        let responder = Arc::new(self);
        let mut handles = Vec::new();

        let recv_responder = Arc::clone(&responder);
        handles.push(tokio::spawn(async move {
            if let Err(e) = recv_responder.run_receiver().await {
                warn!(error = %e, "SSDP receiver stopped");
            }
        }));

        let announce_responder = Arc::clone(&responder);
        handles.push(tokio::spawn(async move {
            announce_responder.run_announcer().await;
        }));

        handles
    }

    async fn run_receiver(&self) -> std::io::Result<()> {
        let socket = Arc::new(self.bind_multicast_socket()?);
        info!(
            port = self.config.port,
            group = %self.config.multicast_addr,
            "SSDP responder listening"
        );

        let mut buf = [0u8; 2048];
        loop {
            let (len, src) = socket.recv_from(&mut buf).await?;
            let message = String::from_utf8_lossy(&buf[..len]);
            if let Some(st) = self.matching_search_target(&message) {
                debug!(%src, st = %st, "answering M-SEARCH");
                let response = self.build_search_response(&st);
                // SSDP asks responders to spread replies over the MX window
                // so a subnet-wide search does not burst.
                let mx = parse_mx(&message).clamp(1, 5);
                let delay = rand::rng().random_range(0..mx * 500);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    if let Err(e) = socket.send_to(response.as_bytes(), src).await {
                        warn!(%src, error = %e, "failed to answer M-SEARCH");
                    }
                });
            }
        }
    }

    async fn run_announcer(&self) {
        let target: SocketAddr = match format!("{}:{}", self.config.multicast_addr, self.config.port)
            .parse()
        {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "invalid SSDP multicast address, announcements disabled");
                return;
            }
        };

        let mut interval = tokio::time::interval(self.config.announce_interval);
        loop {
            interval.tick().await;
            let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "failed to open announce socket");
                    continue;
                }
            };
            for notify in self.build_notifications() {
                if let Err(e) = socket.send_to(notify.as_bytes(), target).await {
                    warn!(error = %e, "failed to send NOTIFY");
                }
            }
            debug!("sent SSDP alive announcements");
        }
    }

    /// Multicast membership socket: reuse-addr/port so the responder
    /// coexists with other UPnP daemons on the host.
    fn bind_multicast_socket(&self) -> std::io::Result<UdpSocket> {
        let group: Ipv4Addr = self
            .config
            .multicast_addr
            .parse()
            .map_err(|_| std::io::Error::other("invalid multicast address"))?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        // UPnP 1.0 recommends TTL 4 for SSDP.
        socket.set_multicast_ttl_v4(4)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port).into())?;

        let mut joined = 0usize;
        for (name, addr) in list_afinet_netifas().unwrap_or_default() {
            if let IpAddr::V4(iface) = addr
                && !iface.is_loopback()
                && socket.join_multicast_v4(&group, &iface).is_ok()
            {
                debug!(interface = %name, ip = %iface, "joined SSDP multicast group");
                joined += 1;
            }
        }
        if joined == 0 {
            // Fall back to the default interface choice.
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }

        UdpSocket::from_std(socket.into())
    }

    /// Whether a datagram is an M-SEARCH for a target we answer. Returns the
    /// ST to echo back.
    fn matching_search_target(&self, message: &str) -> Option<String> {
        if !starts_with_ignore_ascii_case(message, "M-SEARCH") {
            return None;
        }
        let st = message
            .lines()
            .find(|line| starts_with_ignore_ascii_case(line, "st:"))
            .and_then(|line| line.split_once(':').map(|(_, v)| v.trim().to_string()))?;

        let uuid_target = format!("uuid:{}", self.device_udn);
        let matches = BUILTIN_TARGETS
            .iter()
            .any(|t| st.eq_ignore_ascii_case(t))
            || st.eq_ignore_ascii_case(&uuid_target)
            || self
                .config
                .search_targets
                .iter()
                .any(|t| st.eq_ignore_ascii_case(t));
        matches.then_some(st)
    }

    fn build_search_response(&self, st: &str) -> String {
        // ssdp:all queries are answered as the root device.
        let st = if st.eq_ignore_ascii_case("ssdp:all") {
            "upnp:rootdevice"
        } else {
            st
        };
        format!(
            "HTTP/1.1 200 OK\r\n\
             CACHE-CONTROL: max-age=1800\r\n\
             EXT:\r\n\
             LOCATION: {}\r\n\
             SERVER: {}\r\n\
             ST: {}\r\n\
             USN: uuid:{}::{}\r\n\r\n",
            self.location, self.server_ident, st, self.device_udn, st
        )
    }

    fn build_notifications(&self) -> Vec<String> {
        let mut targets: Vec<String> = vec!["upnp:rootdevice".to_string()];
        targets.extend(self.config.search_targets.iter().cloned());
        targets
            .into_iter()
            .map(|nt| {
                format!(
                    "NOTIFY * HTTP/1.1\r\n\
                     HOST: {}:{}\r\n\
                     CACHE-CONTROL: max-age=1800\r\n\
                     LOCATION: {}\r\n\
                     NT: {}\r\n\
                     NTS: ssdp:alive\r\n\
                     SERVER: {}\r\n\
                     USN: uuid:{}::{}\r\n\r\n",
                    self.config.multicast_addr,
                    self.config.port,
                    self.location,
                    nt,
                    self.server_ident,
                    self.device_udn,
                    nt
                )
            })
            .collect()
    }
}

fn starts_with_ignore_ascii_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// MX header of an M-SEARCH: the seconds a responder may wait before
/// answering. Missing or malformed values fall back to 1.
fn parse_mx(message: &str) -> u64 {
    message
        .lines()
        .find(|line| starts_with_ignore_ascii_case(line, "mx:"))
        .and_then(|line| line.split_once(':'))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> SsdpResponder {
        let mut config = Config::default();
        config.web.base_url = Some("http://192.168.1.10:3000".into());
        config.device.uuid = "1f2a9c7e-0000-4000-8000-deadbeef0001".into();
        SsdpResponder::new(&config)
    }

    fn msearch(st: &str) -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 2\r\n\
             ST: {st}\r\n\r\n"
        )
    }

    #[test]
    fn answers_rootdevice_and_ssdp_all() {
        let responder = responder();
        assert!(responder.matching_search_target(&msearch("upnp:rootdevice")).is_some());
        assert!(responder.matching_search_target(&msearch("ssdp:all")).is_some());
        assert!(
            responder
                .matching_search_target(&msearch("urn:schemas-upnp-org:device:MediaServer:1"))
                .is_some()
        );
        assert!(
            responder
                .matching_search_target(&msearch("urn:dial-multiscreen-org:service:dial:1"))
                .is_none()
        );
    }

    #[test]
    fn mx_parses_with_fallback() {
        assert_eq!(parse_mx(&msearch("ssdp:all")), 2);
        assert_eq!(parse_mx("M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n"), 1);
        assert_eq!(parse_mx("M-SEARCH * HTTP/1.1\r\nMX: nope\r\n"), 1);
    }

    #[test]
    fn ignores_non_msearch_datagrams() {
        let responder = responder();
        assert!(responder.matching_search_target("NOTIFY * HTTP/1.1\r\nST: ssdp:all\r\n").is_none());
    }

    #[test]
    fn search_response_points_at_device_xml() {
        let responder = responder();
        let response = responder.build_search_response("upnp:rootdevice");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("LOCATION: http://192.168.1.10:3000/device.xml\r\n"));
        assert!(response.contains(
            "USN: uuid:1f2a9c7e-0000-4000-8000-deadbeef0001::upnp:rootdevice\r\n"
        ));
    }

    #[test]
    fn ssdp_all_is_answered_as_rootdevice() {
        let responder = responder();
        let response = responder.build_search_response("ssdp:all");
        assert!(response.contains("ST: upnp:rootdevice\r\n"));
    }

    #[test]
    fn notifications_cover_root_and_configured_urns() {
        let responder = responder();
        let notifications = responder.build_notifications();
        assert!(notifications.len() >= 2);
        assert!(notifications[0].contains("NT: upnp:rootdevice\r\n"));
        assert!(notifications.iter().all(|n| n.contains("NTS: ssdp:alive\r\n")));
    }
}
