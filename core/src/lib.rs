//! Transport-authentication layer for a cookie-based SOAP backend.
//!
//! # Overview
//! Sits between an application and whatever HTTP library executes its
//! requests (host-does-IO pattern). The core keeps the shared session
//! cookies, rewrites requests after 401 challenges that carry a fresh session
//! cookie, anchors asynchronous calls so each callback fires exactly once,
//! lazily builds expensive shared values, and decides whether a presented
//! certificate chain is acceptable.
//!
//! # Design
//! - `Session` is the only state shared across requests; one `RwLock` guards
//!   the whole cookie map.
//! - `ReauthStrategy` decorates a `ChallengeNegotiator` instead of replacing
//!   the transport's own credential negotiation.
//! - `PendingCall` settles through a single compare-and-set.
//! - `LazyValue` publishes through `OnceLock`; steady-state reads take no lock.
//! - `TrustPolicy` only narrows checks for a lone certificate when the
//!   self-signed override is enabled.

pub mod client;
pub mod config;
pub mod cookie;
pub mod error;
pub mod http;
pub mod lazy;
pub mod pending;
pub mod reauth;
pub mod session;
pub mod trust;

pub use client::{CallDescriptor, CallResult, ClientCall, Disposition, SessionClient};
pub use config::ClientConfig;
pub use cookie::Cookie;
pub use error::{RejectReason, Result, TransportError};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use lazy::LazyValue;
pub use pending::{CancelReason, CompletionState, Outcome, PendingCall};
pub use reauth::{ChallengeMap, ChallengeNegotiator, ReauthStrategy, RequestContext};
pub use session::{Credentials, Session};
pub use trust::{
    CertUsage, Certificate, ChainValidator, NameChainValidator, TrustPolicy, TrustVerdict,
};
