//! Re-authentication on 401 challenges that carry fresh session cookies.
//!
//! # Design
//! `ReauthStrategy` decorates whatever `ChallengeNegotiator` the transport
//! uses for its own scheme negotiation (NTLM, Negotiate, Basic). Before the
//! negotiator runs, the strategy merges the response's cookies into the
//! shared `Session` and rewrites the challenged request so that its retry
//! presents them. The negotiator's scheme map is passed back untouched.
//!
//! The merge and the rewrite both go through the session lock, so the retry
//! observes cookie state at least as fresh as the triggering response.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, TransportError};
use crate::http::{HttpRequest, HttpResponse};
use crate::session::Session;

/// Lower-cased scheme name to the raw challenge text offered for it.
pub type ChallengeMap = BTreeMap<String, String>;

/// The request that produced a challenge, mutable so it can be retried.
#[derive(Debug)]
pub struct RequestContext<'a> {
    pub request: &'a mut HttpRequest,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
}

impl<'a> RequestContext<'a> {
    pub fn new(request: &'a mut HttpRequest, attempt: u32) -> Self {
        Self { request, attempt }
    }
}

/// Credential negotiation performed by the transport after cookie handling.
pub trait ChallengeNegotiator: Send + Sync {
    fn challenges(
        &self,
        host: &str,
        response: &HttpResponse,
        ctx: &RequestContext<'_>,
    ) -> Result<ChallengeMap>;
}

/// Reads the schemes a host offers from its `WWW-Authenticate` headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WwwAuthenticateNegotiator;

impl ChallengeNegotiator for WwwAuthenticateNegotiator {
    fn challenges(
        &self,
        _host: &str,
        response: &HttpResponse,
        _ctx: &RequestContext<'_>,
    ) -> Result<ChallengeMap> {
        let mut schemes = ChallengeMap::new();
        for value in response.header_values("www-authenticate") {
            parse_challenges(value, &mut schemes);
        }
        Ok(schemes)
    }
}

/// Split one `WWW-Authenticate` value into its challenges.
///
/// A comma-separated item that starts with a bare token opens a new
/// challenge; items shaped like `key=value` extend the current one.
fn parse_challenges(value: &str, out: &mut ChallengeMap) {
    let mut current: Option<(String, String)> = None;
    for item in split_unquoted(value, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let first = item.split_whitespace().next().unwrap_or(item);
        if first.contains('=') {
            if let Some((_, text)) = current.as_mut() {
                text.push_str(", ");
                text.push_str(item);
            }
            continue;
        }
        if let Some((scheme, text)) = current.take() {
            out.entry(scheme).or_insert(text);
        }
        current = Some((first.to_ascii_lowercase(), item.to_string()));
    }
    if let Some((scheme, text)) = current {
        out.entry(scheme).or_insert(text);
    }
}

fn split_unquoted(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&value[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

pub struct ReauthStrategy<N = WwwAuthenticateNegotiator> {
    session: Arc<Session>,
    inner: N,
}

impl ReauthStrategy {
    pub fn with_default_negotiator(session: Arc<Session>) -> Self {
        Self::new(session, WwwAuthenticateNegotiator)
    }
}

impl<N: ChallengeNegotiator> ReauthStrategy<N> {
    pub fn new(session: Arc<Session>, inner: N) -> Self {
        Self { session, inner }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Process a 401 for `host`: merge its cookies, rewrite the request,
    /// then return the offered schemes from the wrapped negotiator.
    pub fn on_challenge(
        &self,
        host: &str,
        response: &HttpResponse,
        ctx: &mut RequestContext<'_>,
    ) -> Result<ChallengeMap> {
        self.on_challenge_at(host, response, ctx, Utc::now())
    }

    pub fn on_challenge_at(
        &self,
        host: &str,
        response: &HttpResponse,
        ctx: &mut RequestContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<ChallengeMap> {
        if !response.is_challenge() {
            return Err(TransportError::ChallengeProcessing(format!(
                "expected status 401, got {}",
                response.status
            )));
        }

        let url = Url::parse(&ctx.request.path).map_err(|e| {
            let path = &ctx.request.path;
            TransportError::ChallengeProcessing(format!("invalid request URL {path}: {e}"))
        })?;
        if !same_host(host, &url) {
            warn!(%host, url = %url, "challenge host does not match request");
            return Err(TransportError::ChallengeProcessing(format!(
                "challenge from {host} does not belong to {}",
                url.host_str().unwrap_or_default()
            )));
        }

        let stored = self.session.absorb_at(response, &url, now)?;
        let attached = self.session.attach_cookies_at(ctx.request, now)?;
        debug!(
            %host,
            attempt = ctx.attempt,
            stored,
            attached,
            "session cookies merged into challenged request"
        );

        self.inner.challenges(host, response, ctx)
    }
}

/// `host` may be given with or without a port.
fn same_host(host: &str, url: &Url) -> bool {
    let Some(url_host) = url.host_str() else {
        return false;
    };
    if host.eq_ignore_ascii_case(url_host) {
        return true;
    }
    match url.port_or_known_default() {
        Some(port) => host.eq_ignore_ascii_case(&format!("{url_host}:{port}")),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn challenge(headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status: 401,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: String::new(),
        }
    }

    fn strategy() -> ReauthStrategy {
        ReauthStrategy::with_default_negotiator(Arc::new(Session::new()))
    }

    #[test]
    fn merges_cookie_and_rewrites_request() {
        let strategy = strategy();
        let mut req =
            HttpRequest::soap("http://mail.example.com/ews/exchange.asmx", "urn:Find", "<x/>");
        req.headers.push(("Cookie".to_string(), "sid=old".to_string()));

        let resp = challenge(&[
            ("WWW-Authenticate", "Negotiate"),
            ("WWW-Authenticate", "NTLM"),
            ("Set-Cookie", "sid=abc; Path=/"),
        ]);
        let mut ctx = RequestContext::new(&mut req, 1);
        let schemes = strategy
            .on_challenge_at("mail.example.com", &resp, &mut ctx, now())
            .unwrap();

        assert_eq!(schemes.keys().collect::<Vec<_>>(), vec!["negotiate", "ntlm"]);
        assert_eq!(req.header("cookie"), Some("sid=abc"));
        assert_eq!(
            req.headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case("cookie")).count(),
            1
        );
    }

    #[test]
    fn schemes_pass_through_unmodified() {
        let strategy = strategy();
        let mut req = HttpRequest::new(HttpMethod::Get, "http://example.com/");
        let resp = challenge(&[(
            "WWW-Authenticate",
            r#"Basic realm="corp, east", NTLM, Digest realm="x", qop="auth, auth-int""#,
        )]);
        let schemes = strategy
            .on_challenge_at("example.com", &resp, &mut RequestContext::new(&mut req, 1), now())
            .unwrap();
        assert_eq!(schemes["basic"], r#"Basic realm="corp, east""#);
        assert_eq!(schemes["ntlm"], "NTLM");
        assert_eq!(schemes["digest"], r#"Digest realm="x", qop="auth, auth-int""#);
    }

    #[test]
    fn malformed_cookie_leaves_session_and_request_alone() {
        let strategy = strategy();
        let mut req = HttpRequest::new(HttpMethod::Get, "http://example.com/");
        req.headers.push(("Cookie".to_string(), "sid=keep".to_string()));
        let resp = challenge(&[("Set-Cookie", "sid=new"), ("Set-Cookie", "=nameless")]);

        let err = strategy
            .on_challenge_at("example.com", &resp, &mut RequestContext::new(&mut req, 1), now())
            .unwrap_err();
        assert!(matches!(err, TransportError::ChallengeProcessing(_)));
        assert!(strategy.session().is_empty());
        assert_eq!(req.header("cookie"), Some("sid=keep"));
    }

    #[test]
    fn rejects_non_challenge_and_foreign_host() {
        let strategy = strategy();
        let mut req = HttpRequest::new(HttpMethod::Get, "http://example.com:8080/");
        let ok = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: String::new(),
        };
        assert!(strategy
            .on_challenge_at("example.com", &ok, &mut RequestContext::new(&mut req, 1), now())
            .is_err());

        let resp = challenge(&[("Set-Cookie", "sid=1")]);
        assert!(strategy
            .on_challenge_at("other.com", &resp, &mut RequestContext::new(&mut req, 1), now())
            .is_err());
        let mut ctx = RequestContext::new(&mut req, 1);
        assert!(strategy
            .on_challenge_at("example.com:8080", &resp, &mut ctx, now())
            .is_ok());
    }

    #[test]
    fn concurrent_challenges_lose_no_update() {
        let strategy = strategy();
        std::thread::scope(|s| {
            for i in 0..16 {
                let strategy = &strategy;
                s.spawn(move || {
                    let mut req = HttpRequest::new(HttpMethod::Post, "http://example.com/ews");
                    let own = format!("c{i}={i}; Path=/");
                    let shared = format!("shared={i}; Path=/");
                    let resp =
                        challenge(&[("Set-Cookie", own.as_str()), ("Set-Cookie", shared.as_str())]);
                    let mut ctx = RequestContext::new(&mut req, 1);
                    strategy
                        .on_challenge_at("example.com", &resp, &mut ctx, now())
                        .unwrap();
                    assert!(req.header("cookie").unwrap().contains(&format!("c{i}={i}")));
                });
            }
        });

        let cookies = strategy.session().snapshot();
        assert_eq!(cookies.len(), 17);
        for i in 0..16 {
            assert!(cookies.iter().any(|c| c.name == format!("c{i}") && c.value == i.to_string()));
        }
        let shared = cookies.iter().find(|c| c.name == "shared").unwrap();
        assert!(shared.value.parse::<u32>().unwrap() < 16);
    }

    #[test]
    fn custom_negotiator_sees_rewritten_request() {
        struct Recorder;
        impl ChallengeNegotiator for Recorder {
            fn challenges(
                &self,
                host: &str,
                _response: &HttpResponse,
                ctx: &RequestContext<'_>,
            ) -> Result<ChallengeMap> {
                let mut map = ChallengeMap::new();
                map.insert(
                    "seen".to_string(),
                    format!("{host}|{}", ctx.request.header("cookie").unwrap_or_default()),
                );
                Ok(map)
            }
        }

        let strategy = ReauthStrategy::new(Arc::new(Session::new()), Recorder);
        let mut req = HttpRequest::new(HttpMethod::Get, "http://example.com/");
        let resp = challenge(&[("Set-Cookie", "sid=z")]);
        let map = strategy
            .on_challenge_at("example.com", &resp, &mut RequestContext::new(&mut req, 2), now())
            .unwrap();
        assert_eq!(map["seen"], "example.com|sid=z");
    }
}
