//! Session cookies: `Set-Cookie` parsing and RFC 6265 scoping.
//!
//! # Design
//! Cookies are keyed by `(name, domain, path)`, so two cookies that share a
//! name but differ in scope are distinct entries. Parsing is strict about the
//! name-value pair (a missing `=` or an empty name is a malformed response)
//! and lenient about attributes: an unparseable `Expires` or `Max-Age` is
//! ignored the way browsers ignore it. A `Domain` attribute that does not
//! cover the responding host is treated as malformed because accepting it
//! would let one host plant cookies for another.

use std::net::IpAddr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use url::Url;

use crate::error::{Result, TransportError};

/// Storage key of a cookie.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CookieKey {
    pub name: String,
    pub domain: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lower-cased, without a leading dot.
    pub domain: String,
    pub path: String,
    /// Set when the response carried no `Domain` attribute: the cookie is
    /// only returned to the exact host that set it.
    pub host_only: bool,
    pub secure: bool,
    pub http_only: bool,
    pub expires: Option<DateTime<Utc>>,
}

impl Cookie {
    pub fn key(&self) -> CookieKey {
        CookieKey {
            name: self.name.clone(),
            domain: self.domain.clone(),
            path: self.path.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Whether this cookie should be sent with a request to `url` at `now`.
    pub fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        host_ok
            && path_match(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
            && !self.is_expired(now)
    }

    /// Parse one `Set-Cookie` header value received from `request_url`.
    pub fn parse(header: &str, request_url: &Url, now: DateTime<Utc>) -> Result<Self> {
        let host = request_url
            .host_str()
            .ok_or_else(|| malformed("request URL has no host"))?
            .to_ascii_lowercase();

        let mut parts = header.split(';');
        let pair = parts.next().unwrap_or_default();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| malformed("Set-Cookie without '='"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(malformed("Set-Cookie with empty name"));
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: host.clone(),
            path: default_path(request_url.path()),
            host_only: true,
            secure: false,
            http_only: false,
            expires: None,
        };
        let mut max_age: Option<DateTime<Utc>> = None;
        let mut expires: Option<DateTime<Utc>> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "expires" => expires = parse_http_date(val).or(expires),
                "max-age" => {
                    if let Ok(secs) = val.parse::<i64>() {
                        max_age = Some(if secs <= 0 {
                            DateTime::<Utc>::MIN_UTC
                        } else {
                            Duration::try_seconds(secs)
                                .and_then(|delta| now.checked_add_signed(delta))
                                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                        });
                    }
                }
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() {
                        continue;
                    }
                    // A dotless domain is a bare suffix unless it is the host itself.
                    if !domain.contains('.') && domain != host {
                        return Err(malformed(format!(
                            "cookie {name} sets top-level domain {domain}"
                        )));
                    }
                    if !domain_match(&host, &domain) {
                        return Err(malformed(format!(
                            "cookie {name} sets domain {domain} outside of {host}"
                        )));
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = val.to_string();
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires when both are present.
        cookie.expires = max_age.or(expires);
        Ok(cookie)
    }
}

fn malformed(msg: impl Into<String>) -> TransportError {
    TransportError::ChallengeProcessing(msg.into())
}

/// RFC 6265 §5.1.3.
pub fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.parse::<IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 §5.1.4.
pub fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// RFC 6265 §5.1.4 default-path of a request URI path.
pub fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Netscape style: "Wednesday, 21-Oct-2015 07:28:00 GMT".
    ["%A, %d-%b-%Y %H:%M:%S GMT", "%a, %d-%b-%Y %H:%M:%S GMT", "%a, %d-%b-%y %H:%M:%S GMT"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
