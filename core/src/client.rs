//! Host-does-IO façade over session, re-authentication, trust and calls.
//!
//! # Design
//! `SessionClient` never touches the network. The host asks it to `prepare`
//! a request (attach session cookies), executes the request, and hands the
//! response to `process_response`, which either returns it as final or
//! rewrites the request for a retry after a 401 challenge. Whether the retry
//! is actually sent stays with the host.
//!
//! The trust policy is built lazily on first use because assembling the
//! chain validator is the expensive part of client setup.

use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Result, TransportError};
use crate::http::{HttpRequest, HttpResponse};
use crate::lazy::LazyValue;
use crate::pending::{Callback, CompletionState, PendingCall};
use crate::reauth::{ChallengeMap, ReauthStrategy, RequestContext};
use crate::session::Session;
use crate::trust::{ChainValidator, NameChainValidator, TrustPolicy};

/// Identifies the logical operation a pending call stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub operation: String,
    pub url: String,
}

/// Terminal result delivered to a call's callback.
pub type CallResult = std::result::Result<HttpResponse, TransportError>;

pub type ClientCall<H, S> = PendingCall<CallDescriptor, H, S, CallResult>;

/// What the host should do with a response.
#[derive(Debug)]
pub enum Disposition {
    /// Final response; hand it to the caller.
    Done(HttpResponse),
    /// The request was rewritten with fresh cookies and should be re-sent.
    Retry { schemes: ChallengeMap },
}

pub struct SessionClient {
    config: ClientConfig,
    session: Arc<Session>,
    strategy: ReauthStrategy,
    trust: LazyValue<TrustPolicy>,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        let roots = config.trusted_roots.clone();
        let allow_single = config.accept_single_self_signed;
        Self::build(config, move || {
            if roots.is_empty() && !allow_single {
                return Err("no trusted roots configured and self-signed override disabled".into());
            }
            let delegate: Arc<dyn ChainValidator> =
                Arc::new(NameChainValidator::new(roots.clone()));
            Ok(TrustPolicy::new(delegate, allow_single))
        })
    }

    /// Use a caller-supplied chain validator instead of the name-chain default.
    pub fn with_validator(config: ClientConfig, delegate: Arc<dyn ChainValidator>) -> Self {
        let allow_single = config.accept_single_self_signed;
        Self::build(config, move || Ok(TrustPolicy::new(Arc::clone(&delegate), allow_single)))
    }

    fn build<F>(mut config: ClientConfig, trust_factory: F) -> Self
    where
        F: Fn() -> std::result::Result<TrustPolicy, crate::error::BoxError> + Send + Sync + 'static,
    {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let session = Arc::new(Session::new());
        Self {
            strategy: ReauthStrategy::with_default_negotiator(Arc::clone(&session)),
            session,
            trust: LazyValue::boxed(trust_factory),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Absolute URL for a path below the configured base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    /// The trust policy, built on first access.
    pub fn trust_policy(&self) -> Result<&TrustPolicy> {
        self.trust.get()
    }

    /// Attach the current session cookies to an outgoing request.
    pub fn prepare(&self, request: &mut HttpRequest) -> Result<()> {
        self.session.attach_cookies(request)?;
        Ok(())
    }

    /// Interpret the response to `request` (attempt number `attempt`, from 1).
    pub fn process_response(
        &self,
        request: &mut HttpRequest,
        response: HttpResponse,
        attempt: u32,
    ) -> Result<Disposition> {
        let url = Url::parse(&request.path).map_err(|e| {
            let path = &request.path;
            TransportError::ChallengeProcessing(format!("invalid request URL {path}: {e}"))
        })?;

        if !response.is_challenge() {
            // Cookie trouble on a final response must not cost the caller its payload.
            if let Err(e) = self.session.absorb(&response, &url) {
                warn!(
                    url = %url,
                    status = response.status,
                    error = %e,
                    "ignoring cookies of final response"
                );
            }
            return Ok(Disposition::Done(response));
        }

        if attempt > self.config.max_challenge_retries {
            warn!(url = %url, attempt, "challenge retries exhausted");
            return Ok(Disposition::Done(response));
        }

        let host = host_of(&url)?;
        let mut ctx = RequestContext::new(request, attempt);
        let schemes = self.strategy.on_challenge(&host, &response, &mut ctx)?;
        debug!(
            %host,
            attempt,
            schemes = ?schemes.keys().collect::<Vec<_>>(),
            "retrying challenged request"
        );
        Ok(Disposition::Retry { schemes })
    }

    /// Anchor a new asynchronous call for `request`.
    pub fn begin_call<H, S>(
        &self,
        operation: &str,
        request: &HttpRequest,
        handle: Option<H>,
        callback: Option<Callback<S, CallResult>>,
        user_state: Option<S>,
    ) -> Result<Arc<ClientCall<H, S>>> {
        let descriptor = CallDescriptor {
            operation: operation.to_string(),
            url: request.path.clone(),
        };
        PendingCall::create(Some(descriptor), handle, callback, user_state)
    }

    /// Wait for `call` to settle, cancelling it with `CancelReason::TimedOut`
    /// once the configured call timeout has passed.
    pub async fn wait_call<H, S>(&self, call: &ClientCall<H, S>) -> CompletionState {
        let state = call.wait(Some(self.config.call_timeout())).await;
        debug!(call_id = %call.id(), ?state, "call finished waiting");
        state
    }
}

fn host_of(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::ChallengeProcessing(format!("{url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
