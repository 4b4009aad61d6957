//! Shared per-client cookie and credential state.
//!
//! # Design
//! The whole cookie map sits behind one `RwLock`. A merge parses every
//! `Set-Cookie` header of a response before taking the write guard, then
//! applies all of them under that single guard, so readers see either the
//! old set or the new one and a malformed response changes nothing.
//! Replacing a cookie keeps its original creation order, which is the
//! secondary sort key of the outgoing `Cookie` header.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use crate::cookie::{Cookie, CookieKey};
use crate::error::{Result, TransportError};
use crate::http::{HttpRequest, HttpResponse};

/// Proxy or basic-auth credential attached to a session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

#[derive(Debug)]
struct Entry {
    cookie: Cookie,
    seq: u64,
}

#[derive(Debug, Default)]
struct CookieJar {
    entries: BTreeMap<CookieKey, Entry>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct Session {
    jar: RwLock<CookieJar>,
    credentials: RwLock<Option<Credentials>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply already-parsed cookies as one atomic update.
    ///
    /// Last write wins per `(name, domain, path)`. An expired cookie deletes
    /// its entry. Returns the number of cookies stored after the merge.
    pub fn merge(&self, cookies: Vec<Cookie>, now: DateTime<Utc>) -> usize {
        let mut guard = self.jar.write().unwrap_or_else(PoisonError::into_inner);
        let jar = &mut *guard;
        for cookie in cookies {
            let key = cookie.key();
            if cookie.is_expired(now) {
                if jar.entries.remove(&key).is_some() {
                    debug!(name = %key.name, domain = %key.domain, "cookie removed by server");
                }
                continue;
            }
            let seq = match jar.entries.get(&key) {
                Some(existing) => existing.seq,
                None => {
                    jar.next_seq += 1;
                    jar.next_seq
                }
            };
            debug!(name = %key.name, domain = %key.domain, path = %key.path, "cookie stored");
            jar.entries.insert(key, Entry { cookie, seq });
        }
        jar.entries.retain(|_, e| !e.cookie.is_expired(now));
        jar.entries.len()
    }

    /// Merge every `Set-Cookie` header of `response` (any status).
    pub fn absorb(&self, response: &HttpResponse, request_url: &Url) -> Result<usize> {
        self.absorb_at(response, request_url, Utc::now())
    }

    pub fn absorb_at(
        &self,
        response: &HttpResponse,
        request_url: &Url,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let parsed = response
            .header_values("set-cookie")
            .map(|raw| Cookie::parse(raw, request_url, now))
            .collect::<Result<Vec<_>>>()?;
        if parsed.is_empty() {
            return Ok(self.len());
        }
        Ok(self.merge(parsed, now))
    }

    /// The `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookie_header_at(url, Utc::now())
    }

    pub fn cookie_header_at(&self, url: &Url, now: DateTime<Utc>) -> Option<String> {
        let jar = self.jar.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<&Entry> = jar
            .entries
            .values()
            .filter(|e| e.cookie.matches(url, now))
            .collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| {
            b.cookie
                .path
                .len()
                .cmp(&a.cookie.path.len())
                .then(a.seq.cmp(&b.seq))
        });
        let header = matching
            .iter()
            .map(|e| format!("{}={}", e.cookie.name, e.cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        Some(header)
    }

    /// Strip every `Cookie` header from `request` and attach the current set.
    ///
    /// Returns whether a header was attached.
    pub fn attach_cookies(&self, request: &mut HttpRequest) -> Result<bool> {
        self.attach_cookies_at(request, Utc::now())
    }

    pub fn attach_cookies_at(&self, request: &mut HttpRequest, now: DateTime<Utc>) -> Result<bool> {
        let url = Url::parse(&request.path).map_err(|e| {
            let path = &request.path;
            TransportError::ChallengeProcessing(format!("invalid request URL {path}: {e}"))
        })?;
        request.remove_headers("cookie");
        match self.cookie_header_at(&url, now) {
            Some(value) => {
                request.headers.push(("Cookie".to_string(), value));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Consistent copy of every stored cookie, in key order.
    pub fn snapshot(&self) -> Vec<Cookie> {
        let jar = self.jar.read().unwrap_or_else(PoisonError::into_inner);
        jar.entries.values().map(|e| e.cookie.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jar.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_cookies(&self) {
        self.jar.write().unwrap_or_else(PoisonError::into_inner).entries.clear();
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().unwrap_or_else(PoisonError::into_inner) = Some(credentials);
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_credentials(&self) {
        *self.credentials.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn set_cookies(values: &[&str]) -> HttpResponse {
        HttpResponse {
            status: 401,
            headers: values
                .iter()
                .map(|v| ("Set-Cookie".to_string(), v.to_string()))
                .collect(),
            body: String::new(),
        }
    }

    #[test]
    fn last_write_wins_per_key() {
        let session = Session::new();
        let u = url("http://example.com/ews/exchange.asmx");
        session.absorb_at(&set_cookies(&["sid=1; Path=/", "lang=en; Path=/"]), &u, now()).unwrap();
        session.absorb_at(&set_cookies(&["sid=2; Path=/"]), &u, now()).unwrap();
        assert_eq!(session.cookie_header_at(&u, now()).as_deref(), Some("sid=2; lang=en"));
    }

    #[test]
    fn same_name_different_path_are_distinct() {
        let session = Session::new();
        let u = url("http://example.com/ews/exchange.asmx");
        session
            .absorb_at(&set_cookies(&["sid=root; Path=/", "sid=ews; Path=/ews"]), &u, now())
            .unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session.cookie_header_at(&u, now()).as_deref(), Some("sid=ews; sid=root"));
        assert_eq!(
            session.cookie_header_at(&url("http://example.com/owa"), now()).as_deref(),
            Some("sid=root")
        );
    }

    #[test]
    fn malformed_response_changes_nothing() {
        let session = Session::new();
        let u = url("http://example.com/");
        session.absorb_at(&set_cookies(&["sid=1"]), &u, now()).unwrap();
        let err = session
            .absorb_at(&set_cookies(&["sid=2", "broken"]), &u, now())
            .unwrap_err();
        assert!(matches!(err, TransportError::ChallengeProcessing(_)));
        assert_eq!(session.cookie_header_at(&u, now()).as_deref(), Some("sid=1"));
    }

    #[test]
    fn expired_cookie_deletes_entry() {
        let session = Session::new();
        let u = url("http://example.com/");
        session.absorb_at(&set_cookies(&["sid=1", "keep=1"]), &u, now()).unwrap();
        session.absorb_at(&set_cookies(&["sid=gone; Max-Age=0"]), &u, now()).unwrap();
        assert_eq!(session.cookie_header_at(&u, now()).as_deref(), Some("keep=1"));
    }

    #[test]
    fn attach_replaces_existing_cookie_headers() {
        let session = Session::new();
        let mut req = HttpRequest::new(crate::http::HttpMethod::Post, "http://example.com/ews");
        req.headers.push(("cookie".to_string(), "stale=1".to_string()));
        req.headers.push(("COOKIE".to_string(), "older=1".to_string()));

        assert!(!session.attach_cookies_at(&mut req, now()).unwrap());
        assert!(req.header("cookie").is_none());

        session
            .absorb_at(&set_cookies(&["sid=abc; Path=/"]), &url("http://example.com/"), now())
            .unwrap();
        assert!(session.attach_cookies_at(&mut req, now()).unwrap());
        let cookie_headers: Vec<_> = req
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
            .collect();
        assert_eq!(cookie_headers.len(), 1);
        assert_eq!(cookie_headers[0].1, "sid=abc");
    }

    #[test]
    fn readers_never_see_half_a_merge() {
        let session = Session::new();
        let u = url("http://example.com/");
        session.absorb_at(&set_cookies(&["a=0", "b=0"]), &u, now()).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=500 {
                    let a = format!("a={i}");
                    let b = format!("b={i}");
                    session
                        .absorb_at(&set_cookies(&[a.as_str(), b.as_str()]), &u, now())
                        .unwrap();
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let header = session.cookie_header_at(&u, now()).unwrap();
                        let values: Vec<&str> = header
                            .split("; ")
                            .map(|pair| pair.split_once('=').unwrap().1)
                            .collect();
                        assert_eq!(values.len(), 2, "{header}");
                        assert_eq!(values[0], values[1], "torn read: {header}");
                    }
                });
            }
        });
        assert_eq!(session.cookie_header_at(&u, now()).as_deref(), Some("a=500; b=500"));
    }

    #[test]
    fn clear_cookies_empties_the_jar() {
        let session = Session::new();
        session.absorb_at(&set_cookies(&["sid=1"]), &url("http://example.com/"), now()).unwrap();
        session.clear_cookies();
        assert!(session.is_empty());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let session = Session::new();
        session.set_credentials(Credentials {
            username: "svc".to_string(),
            password: "hunter2".to_string(),
            domain: Some("CORP".to_string()),
        });
        let printed = format!("{:?}", session.credentials().unwrap());
        assert!(printed.contains("svc"));
        assert!(!printed.contains("hunter2"));
        session.clear_credentials();
        assert!(session.credentials().is_none());
    }
}
