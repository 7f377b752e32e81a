//! Anonymity classification from what a judge observed

use crate::proxy::judge::{extract_ips, ObservedRequest};
use crate::proxy::models::{Anonymity, ProxyType};
use std::net::IpAddr;

/// Headers through which a proxy announces itself
const MARKER_HEADERS: &[&str] = &[
    "via",
    "x-proxy-id",
    "x-proxy-connection",
    "proxy-connection",
    "proxy-agent",
    "x-bluecoat-via",
];

/// Headers carrying the address of the client a proxy forwards for
const ADDRESS_HEADERS: &[&str] = &[
    "forwarded",
    "forwarded-for",
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "client-ip",
    "x-originating-ip",
];

/// Classify a proxy from the request a judge received through it.
///
/// - our address visible anywhere: `Transparent`
/// - proxy headers present but our address hidden: `Anonymous`
/// - nothing revealing: `High`
///
/// HTTPS and SOCKS proxies tunnel the request untouched, so for them only the
/// address check applies; headers seen there were not added by the proxy.
pub fn classify(
    proxy_type: ProxyType,
    real_ip: Option<IpAddr>,
    observed: &ObservedRequest,
) -> Anonymity {
    classify_against(proxy_type, real_ip, observed, None)
}

/// Like [`classify`], ignoring marker headers the judge also reported for a
/// direct request.
///
/// Judges behind load balancers add forwarding headers of their own. An
/// address header only counts when it names someone other than the
/// connecting proxy, and a marker header only when `baseline` lacks it.
pub fn classify_against(
    proxy_type: ProxyType,
    real_ip: Option<IpAddr>,
    observed: &ObservedRequest,
    baseline: Option<&ObservedRequest>,
) -> Anonymity {
    if let Some(ip) = real_ip {
        if reveals_ip(observed, ip) {
            return Anonymity::Transparent;
        }
    }

    if proxy_type == ProxyType::Http && has_proxy_headers(observed, baseline) {
        return Anonymity::Anonymous;
    }

    Anonymity::High
}

fn reveals_ip(observed: &ObservedRequest, ip: IpAddr) -> bool {
    observed.origin.contains(&ip)
        || observed
            .headers
            .values()
            .any(|value| extract_ips(value).contains(&ip))
}

fn has_proxy_headers(observed: &ObservedRequest, baseline: Option<&ObservedRequest>) -> bool {
    // Judges such as httpbin fold forwarded addresses into the origin
    if observed.origin.len() > 1 {
        return true;
    }

    let expected = |name: &str| baseline.is_some_and(|b| b.headers.contains_key(name));
    observed.headers.iter().any(|(name, value)| {
        let name = name.as_str();
        if ADDRESS_HEADERS.contains(&name) {
            let ips = extract_ips(value);
            if ips.is_empty() {
                !expected(name)
            } else {
                ips.iter().any(|ip| !observed.origin.contains(ip))
            }
        } else {
            MARKER_HEADERS.contains(&name) && !expected(name)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn proxy_ip() -> IpAddr {
        "198.51.100.20".parse().unwrap()
    }

    #[test]
    fn test_clean_request_is_high() {
        let observed = ObservedRequest::new()
            .with_origin(proxy_ip())
            .with_header("Host", "httpbin.org")
            .with_header("Accept", "*/*");
        assert_eq!(classify(ProxyType::Http, Some(real_ip()), &observed), Anonymity::High);
    }

    #[test]
    fn test_via_header_is_anonymous() {
        let observed = ObservedRequest::new()
            .with_origin(proxy_ip())
            .with_header("Via", "1.1 squid-proxy");
        assert_eq!(
            classify(ProxyType::Http, Some(real_ip()), &observed),
            Anonymity::Anonymous
        );
    }

    #[test]
    fn test_forwarded_for_other_address_is_anonymous() {
        let observed = ObservedRequest::new()
            .with_origin(proxy_ip())
            .with_header("X-Forwarded-For", "10.0.0.1");
        assert_eq!(
            classify(ProxyType::Http, Some(real_ip()), &observed),
            Anonymity::Anonymous
        );
    }

    #[test]
    fn test_forwarded_real_address_is_transparent() {
        let observed = ObservedRequest::new()
            .with_origin(proxy_ip())
            .with_header("X_FORWARDED_FOR", "203.0.113.7");
        assert_eq!(
            classify(ProxyType::Http, Some(real_ip()), &observed),
            Anonymity::Transparent
        );
    }

    #[test]
    fn test_origin_real_address_is_transparent() {
        let observed = ObservedRequest::new().with_origin(real_ip());
        assert_eq!(
            classify(ProxyType::Socks5, Some(real_ip()), &observed),
            Anonymity::Transparent
        );
    }

    #[test]
    fn test_tunnel_ignores_headers() {
        let observed = ObservedRequest::new()
            .with_origin(proxy_ip())
            .with_header("Via", "1.1 upstream");
        assert_eq!(classify(ProxyType::Https, Some(real_ip()), &observed), Anonymity::High);
    }

    #[test]
    fn test_unknown_real_address() {
        let observed = ObservedRequest::new().with_origin(real_ip());
        assert_eq!(classify(ProxyType::Http, None, &observed), Anonymity::High);
    }

    /// httpbin `show_env` answer for a request that reached it from `origin`
    fn httpbin(origin: &str, extra: &str) -> ObservedRequest {
        let body = format!(
            r#"{{
  "args": {{"show_env": "1"}},
  "headers": {{
    "Accept": "*/*",
    "Host": "httpbin.org",
    "X-Amzn-Trace-Id": "Root=1-652b8e1f-5d3c2a0b7e4f19a2631c0d88",
    "X-Forwarded-For": "{origin}",
    "X-Forwarded-Port": "80",
    "X-Forwarded-Proto": "http"{extra}
  }},
  "origin": "{origin}",
  "url": "http://httpbin.org/get?show_env=1"
}}"#
        );
        ObservedRequest::parse(&body).unwrap()
    }

    #[test]
    fn test_httpbin_elite_proxy_is_high() {
        let baseline = httpbin("203.0.113.7", "");
        let observed = httpbin("198.51.100.20", "");

        assert_eq!(classify(ProxyType::Http, Some(real_ip()), &observed), Anonymity::High);
        assert_eq!(
            classify_against(ProxyType::Http, Some(real_ip()), &observed, Some(&baseline)),
            Anonymity::High
        );
    }

    #[test]
    fn test_httpbin_via_proxy_is_anonymous() {
        let baseline = httpbin("203.0.113.7", "");
        let observed = httpbin("198.51.100.20", r#", "Via": "1.1 squid""#);
        assert_eq!(
            classify_against(ProxyType::Http, Some(real_ip()), &observed, Some(&baseline)),
            Anonymity::Anonymous
        );
    }

    #[test]
    fn test_httpbin_forwarded_chain_is_anonymous() {
        let observed = httpbin("10.0.0.1, 198.51.100.20", "");
        assert_eq!(
            classify(ProxyType::Http, Some(real_ip()), &observed),
            Anonymity::Anonymous
        );
    }

    #[test]
    fn test_baseline_marker_is_ignored() {
        let baseline = ObservedRequest::new()
            .with_origin(real_ip())
            .with_header("Via", "1.1 judge-frontend");
        let observed = ObservedRequest::new()
            .with_origin(proxy_ip())
            .with_header("Via", "1.1 judge-frontend");

        assert_eq!(
            classify(ProxyType::Http, Some(real_ip()), &observed),
            Anonymity::Anonymous
        );
        assert_eq!(
            classify_against(ProxyType::Http, Some(real_ip()), &observed, Some(&baseline)),
            Anonymity::High
        );
    }

    #[test]
    fn test_httpbin_transparent_proxy() {
        let observed = httpbin("203.0.113.7, 198.51.100.20", "");
        assert_eq!(
            classify(ProxyType::Http, Some(real_ip()), &observed),
            Anonymity::Transparent
        );
    }
}
