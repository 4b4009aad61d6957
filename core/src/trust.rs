//! Certificate trust evaluation.
//!
//! # Design
//! `TrustPolicy` narrows the checks of an underlying `ChainValidator` in one
//! case only: a chain of exactly one certificate while the self-signed
//! override is enabled. That certificate is judged by its validity window
//! alone, with no issuer or chain-of-trust verification. Every other chain is
//! handed to the delegate and its verdict is returned untouched.
//!
//! Certificates arrive already decoded by the TLS library; this module works
//! on their subject, issuer and validity instants.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RejectReason, Result, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Certificate {
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Judge the certificate by its validity window only.
    pub fn window_verdict(&self, now: DateTime<Utc>) -> TrustVerdict {
        if now < self.not_before {
            TrustVerdict::Reject(RejectReason::NotYetValid)
        } else if now > self.not_after {
            TrustVerdict::Reject(RejectReason::Expired)
        } else {
            TrustVerdict::Accept
        }
    }
}

/// What the presented chain is going to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertUsage {
    ServerAuth,
    ClientAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    Accept,
    Reject(RejectReason),
}

impl TrustVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, TrustVerdict::Accept)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            TrustVerdict::Accept => Ok(()),
            TrustVerdict::Reject(reason) => Err(TransportError::CertificateRejected { reason }),
        }
    }
}

/// Full chain validation supplied by the environment.
pub trait ChainValidator: Send + Sync {
    fn validate(&self, chain: &[Certificate], usage: CertUsage, now: DateTime<Utc>) -> TrustVerdict;
}

impl<F> ChainValidator for F
where
    F: Fn(&[Certificate], CertUsage, DateTime<Utc>) -> TrustVerdict + Send + Sync,
{
    fn validate(
        &self,
        chain: &[Certificate],
        usage: CertUsage,
        now: DateTime<Utc>,
    ) -> TrustVerdict {
        self(chain, usage, now)
    }
}

/// Validator that links a chain by subject/issuer names up to a set of
/// trusted root subjects, checking each certificate's validity window.
///
/// Signatures are not verified here; that stays with the TLS library.
#[derive(Debug, Clone, Default)]
pub struct NameChainValidator {
    trusted_roots: BTreeSet<String>,
}

impl NameChainValidator {
    pub fn new<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted_roots: roots.into_iter().map(Into::into).collect(),
        }
    }
}

impl ChainValidator for NameChainValidator {
    fn validate(
        &self,
        chain: &[Certificate],
        _usage: CertUsage,
        now: DateTime<Utc>,
    ) -> TrustVerdict {
        let Some(last) = chain.last() else {
            return TrustVerdict::Reject(RejectReason::ChainInvalid("empty chain".to_string()));
        };

        for cert in chain {
            if let TrustVerdict::Reject(reason) = cert.window_verdict(now) {
                return TrustVerdict::Reject(reason);
            }
        }

        for pair in chain.windows(2) {
            if pair[0].issuer != pair[1].subject {
                return TrustVerdict::Reject(RejectReason::ChainInvalid(format!(
                    "{} is not issued by {}",
                    pair[0].subject, pair[1].subject
                )));
            }
        }

        let anchored = self.trusted_roots.contains(&last.issuer)
            || (last.is_self_issued() && self.trusted_roots.contains(&last.subject));
        if !anchored {
            return TrustVerdict::Reject(RejectReason::ChainInvalid(format!(
                "no trusted root for issuer {}",
                last.issuer
            )));
        }
        TrustVerdict::Accept
    }
}

#[derive(Clone)]
pub struct TrustPolicy {
    delegate: Arc<dyn ChainValidator>,
    single_self_signed_override: bool,
}

impl TrustPolicy {
    pub fn new(delegate: Arc<dyn ChainValidator>, single_self_signed_override: bool) -> Self {
        Self {
            delegate,
            single_self_signed_override,
        }
    }

    pub fn single_self_signed_override(&self) -> bool {
        self.single_self_signed_override
    }

    pub fn evaluate(&self, chain: &[Certificate], usage: CertUsage) -> TrustVerdict {
        self.evaluate_at(chain, usage, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        chain: &[Certificate],
        usage: CertUsage,
        now: DateTime<Utc>,
    ) -> TrustVerdict {
        if let [only] = chain {
            if self.single_self_signed_override {
                let verdict = only.window_verdict(now);
                match &verdict {
                    TrustVerdict::Accept => warn!(
                        subject = %only.subject,
                        "accepting lone certificate on its validity window, chain not verified"
                    ),
                    TrustVerdict::Reject(reason) => {
                        debug!(
                            subject = %only.subject,
                            %reason,
                            "lone certificate outside its window"
                        )
                    }
                }
                return verdict;
            }
        }
        self.delegate.validate(chain, usage, now)
    }
}

impl std::fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustPolicy")
            .field("single_self_signed_override", &self.single_self_signed_override)
            .finish_non_exhaustive()
    }
}
