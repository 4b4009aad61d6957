//! C-ABI wrapper around `authlink-core`.
//!
//! # Overview
//! Exposes session cookies, 401 re-authentication, pending-call anchors and
//! certificate trust evaluation through `extern "C"` functions, so a host
//! written in any language with a C FFI can keep doing its own HTTP and TLS
//! I/O while this layer decides what the retried request looks like and
//! whether a chain is acceptable.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - `authlink_session_*` mirrors `SessionClient`, `authlink_call_*` mirrors
//!   `PendingCall`.
//! - A single `FfiAuthResult` envelope with `FfiDataTag` + `void* data`
//!   conveys success payloads and errors uniformly.
//! - The C caller owns all returned pointers and must call the matching
//!   `authlink_free_*` (or `*_free`) function to release them.

pub mod types;

use std::ffi::c_void;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use authlink_core::pending::Callback;
use authlink_core::{
    CallResult, CertUsage, Certificate, ClientConfig, Credentials, Disposition, Outcome,
    SessionClient, TransportError,
};
use chrono::{DateTime, Utc};

use types::*;

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Create a session bound to `base_url`.
///
/// `config_json` may be null; otherwise it is a JSON `ClientConfig` whose
/// `base_url` is replaced by the argument. Returns null if `base_url` is
/// null, the JSON is invalid, or an internal panic occurs. Free the result
/// with `authlink_session_free`.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_new(
    base_url: *const c_char,
    config_json: *const c_char,
) -> *mut FfiSession {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(url) = (unsafe { read_str(base_url) }) else {
            return std::ptr::null_mut();
        };
        let config = match unsafe { read_str(config_json) } {
            Some(raw) => match ClientConfig::from_json(raw) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting session configuration");
                    return std::ptr::null_mut();
                }
            },
            None => ClientConfig::default(),
        };
        let inner = SessionClient::new(ClientConfig {
            base_url: url.to_string(),
            ..config
        });
        Box::into_raw(Box::new(FfiSession { inner }))
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Free a session created by `authlink_session_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_free(session: *mut FfiSession) {
    if !session.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(session) });
        }));
    }
}

/// Store credentials on the session. `domain` may be null.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_set_credentials(
    session: *const FfiSession,
    username: *const c_char,
    password: *const c_char,
    domain: *const c_char,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            return FfiErrorCode::NullArg;
        }
        let session = unsafe { &*session };
        let (Some(username), Some(password)) =
            (unsafe { read_str(username) }, unsafe { read_str(password) })
        else {
            return FfiErrorCode::NullArg;
        };
        session.inner.session().set_credentials(Credentials {
            username: username.to_string(),
            password: password.to_string(),
            domain: unsafe { read_str(domain) }.map(str::to_string),
        });
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Forget every stored cookie and credential, e.g. on sign-out.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_reset(session: *const FfiSession) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            return FfiErrorCode::NullArg;
        }
        let state = unsafe { &*session }.inner.session();
        state.clear_cookies();
        state.clear_credentials();
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

// ---------------------------------------------------------------------------
// Requests and challenges
// ---------------------------------------------------------------------------

/// Build a SOAP POST for `path` below the session's base URL, carrying the
/// session's current cookies.
///
/// Returns null if any argument is null. Free the result with
/// `authlink_free_request`.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_prepare(
    session: *const FfiSession,
    path: *const c_char,
    action: *const c_char,
    envelope: *const c_char,
) -> *mut FfiHttpRequest {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            return std::ptr::null_mut();
        }
        let session = unsafe { &*session };
        let (Some(path), Some(action), Some(envelope)) =
            (unsafe { (read_str(path), read_str(action), read_str(envelope)) })
        else {
            return std::ptr::null_mut();
        };
        let mut req = authlink_core::HttpRequest::soap(session.inner.url(path), action, envelope);
        match session.inner.prepare(&mut req) {
            Ok(()) => FfiHttpRequest::from_core(req),
            Err(_) => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Hand the response to `request` (attempt number `attempt`, from 1) to the
/// session.
///
/// A 401 within the retry budget yields `data_tag = Retry` with the
/// rewritten request in `data`. Anything else yields `data_tag = None` and
/// the response status in `http_status`. `request` stays owned by the caller.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_on_challenge(
    session: *const FfiSession,
    request: *const FfiHttpRequest,
    response: *const FfiHttpResponse,
    attempt: u32,
) -> *mut FfiAuthResult {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            return FfiAuthResult::null_arg("session");
        }
        if request.is_null() {
            return FfiAuthResult::null_arg("request");
        }
        if response.is_null() {
            return FfiAuthResult::null_arg("response");
        }
        let session = unsafe { &*session };
        let Some(mut req) = (unsafe { (*request).to_core() }) else {
            return FfiAuthResult::null_arg("request.path");
        };
        let resp = unsafe { (*response).to_core() };
        match session.inner.process_response(&mut req, resp, attempt) {
            Ok(Disposition::Done(resp)) => FfiAuthResult::done(resp.status),
            Ok(Disposition::Retry { schemes }) => {
                FfiAuthResult::retry(req, schemes.into_keys().collect())
            }
            Err(e) => FfiAuthResult::from_error(e),
        }
    }))
    .unwrap_or_else(|_| FfiAuthResult::panic("panic in authlink_session_on_challenge"))
}

/// The `Cookie` header value the session would send to `url`, or null if no
/// cookie applies. Free the result with `authlink_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_session_cookie_header(
    session: *const FfiSession,
    url: *const c_char,
) -> *mut c_char {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            return std::ptr::null_mut();
        }
        let session = unsafe { &*session };
        let Some(url) = (unsafe { read_str(url) }).and_then(|u| url::Url::parse(u).ok()) else {
            return std::ptr::null_mut();
        };
        match session.inner.session().cookie_header(&url) {
            Some(header) => to_c_string(header),
            None => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

// ---------------------------------------------------------------------------
// Trust
// ---------------------------------------------------------------------------

fn instant(secs: i64) -> Result<DateTime<Utc>, TransportError> {
    DateTime::from_timestamp(secs, 0).ok_or(TransportError::InvalidArgument("timestamp in range"))
}

/// Decide whether the presented chain (leaf first) is acceptable at
/// `now_unix`.
///
/// `error_code = Ok` means accept. `CertificateRejected` carries the reason
/// in `reject_reason`; the TLS layer must then abort the connection.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_trust_evaluate(
    session: *const FfiSession,
    chain: *const FfiCertificate,
    chain_len: u32,
    usage: FfiCertUsage,
    now_unix: i64,
) -> *mut FfiAuthResult {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            return FfiAuthResult::null_arg("session");
        }
        if chain.is_null() && chain_len > 0 {
            return FfiAuthResult::null_arg("chain");
        }
        let session = unsafe { &*session };
        let raw = if chain_len == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(chain, chain_len as usize) }
        };

        let mut certs = Vec::with_capacity(raw.len());
        for c in raw {
            let (Some(subject), Some(issuer)) =
                (unsafe { read_str(c.subject) }, unsafe { read_str(c.issuer) })
            else {
                return FfiAuthResult::null_arg("certificate name");
            };
            let window = instant(c.not_before).and_then(|nb| Ok((nb, instant(c.not_after)?)));
            let (not_before, not_after) = match window {
                Ok(w) => w,
                Err(e) => return FfiAuthResult::from_error(e),
            };
            certs.push(Certificate {
                subject: subject.to_string(),
                issuer: issuer.to_string(),
                not_before,
                not_after,
            });
        }

        let now = match instant(now_unix) {
            Ok(now) => now,
            Err(e) => return FfiAuthResult::from_error(e),
        };
        let usage = match usage {
            FfiCertUsage::ServerAuth => CertUsage::ServerAuth,
            FfiCertUsage::ClientAuth => CertUsage::ClientAuth,
        };
        let verdict = match session.inner.trust_policy() {
            Ok(policy) => policy.evaluate_at(&certs, usage, now),
            Err(e) => return FfiAuthResult::from_error(e),
        };
        match verdict.into_result() {
            Ok(()) => FfiAuthResult::ok_empty(),
            Err(e) => FfiAuthResult::from_error(e),
        }
    }))
    .unwrap_or_else(|_| FfiAuthResult::panic("panic in authlink_trust_evaluate"))
}

// ---------------------------------------------------------------------------
// Pending calls
// ---------------------------------------------------------------------------

/// Wrap a C callback so it receives a borrowed `FfiCallOutcome`.
fn c_callback(
    callback: extern "C" fn(*mut c_void, *const FfiCallOutcome),
) -> Callback<UserState, CallResult> {
    Box::new(move |state: Option<UserState>, outcome: Outcome<CallResult>| {
        let user_state = state.map_or(std::ptr::null_mut(), |s| s.0);
        let mut body = None;
        let mut message = None;
        let mut ffi = FfiCallOutcome {
            state: FfiCompletionState::Completed,
            cancel_reason: FfiCancelReason::None,
            error_code: FfiErrorCode::Ok,
            http_status: 0,
            body: std::ptr::null(),
            error_message: std::ptr::null(),
        };
        match outcome {
            Outcome::Completed(Ok(resp)) => {
                ffi.http_status = resp.status;
                ffi.body = body.insert(c_string(resp.body)).as_ptr();
            }
            Outcome::Completed(Err(e)) => {
                ffi.error_code = (&e).into();
                ffi.error_message = message.insert(c_string(e.to_string())).as_ptr();
            }
            Outcome::Cancelled(reason) => {
                ffi.state = FfiCompletionState::Cancelled;
                ffi.cancel_reason = reason.into();
            }
        }
        callback(user_state, &ffi);
    })
}

/// Anchor a call for `request` under the transport handle `handle`.
///
/// `handle` identifies the caller's in-flight transport attempt and must be
/// non-zero. `callback` may be null; when set it fires exactly once, with
/// `user_state`, when the call completes or is cancelled. Returns null on a
/// null session/operation/request or a zero handle. Free the result with
/// `authlink_call_free`.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_call_create(
    session: *const FfiSession,
    operation: *const c_char,
    request: *const FfiHttpRequest,
    handle: u64,
    callback: FfiCallCallback,
    user_state: *mut c_void,
) -> *mut FfiCall {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() || request.is_null() {
            return std::ptr::null_mut();
        }
        let session = unsafe { &*session };
        let Some(operation) = (unsafe { read_str(operation) }) else {
            return std::ptr::null_mut();
        };
        let Some(req) = (unsafe { (*request).to_core() }) else {
            return std::ptr::null_mut();
        };
        let handle = (handle != 0).then_some(handle);
        match session.inner.begin_call(
            operation,
            &req,
            handle,
            callback.map(c_callback),
            Some(UserState(user_state)),
        ) {
            Ok(inner) => Box::into_raw(Box::new(FfiCall { inner })),
            Err(e) => {
                tracing::debug!(error = %e, "call not created");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Swap in the transport handle of a retry attempt.
///
/// Returns `CallSettled` once the call has completed or been cancelled.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_call_rebind(call: *const FfiCall, handle: u64) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if call.is_null() {
            return FfiErrorCode::NullArg;
        }
        if handle == 0 {
            return FfiErrorCode::InvalidArgument;
        }
        let call = unsafe { &*call };
        match call.inner.rebind(handle) {
            Ok(_) => FfiErrorCode::Ok,
            Err(e) => (&e).into(),
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Complete the call with the final response. Returns `false` if the call
/// was already settled, in which case the callback does not fire again.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_call_complete(
    call: *const FfiCall,
    response: *const FfiHttpResponse,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if call.is_null() || response.is_null() {
            return false;
        }
        let call = unsafe { &*call };
        let resp = unsafe { (*response).to_core() };
        call.inner.complete(Ok(resp))
    }))
    .unwrap_or(false)
}

/// Cancel the call. Returns `false` if it was already settled.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_call_cancel(call: *const FfiCall) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if call.is_null() {
            return false;
        }
        unsafe { &*call }.inner.cancel()
    }))
    .unwrap_or(false)
}

#[unsafe(no_mangle)]
pub extern "C" fn authlink_call_state(call: *const FfiCall) -> FfiCompletionState {
    catch_unwind(AssertUnwindSafe(|| {
        if call.is_null() {
            return FfiCompletionState::Cancelled;
        }
        unsafe { &*call }.inner.state().into()
    }))
    .unwrap_or(FfiCompletionState::Cancelled)
}

/// Release a call. A call still pending is cancelled first, so its callback
/// fires before this returns. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_call_free(call: *mut FfiCall) {
    if call.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let call = unsafe { Box::from_raw(call) };
        call.inner.cancel();
    }));
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free a request returned by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_free_request(req: *mut FfiHttpRequest) {
    if req.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let req = unsafe { Box::from_raw(req) };
        free_request_fields(&req);
    }));
}

fn free_request_fields(req: &FfiHttpRequest) {
    free_c_string(req.path);
    free_c_string(req.body);
    if !req.headers.is_null() && req.headers_len > 0 {
        let headers = unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                req.headers,
                req.headers_len as usize,
            ))
        };
        for h in headers.iter() {
            free_c_string(h.key);
            free_c_string(h.value);
        }
    }
}

fn free_c_string(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { std::ffi::CString::from_raw(s) });
    }
}

/// Free a result returned by this library, including its payload. Safe to
/// call with null.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_free_result(result: *mut FfiAuthResult) {
    if result.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let result = unsafe { Box::from_raw(result) };
        free_c_string(result.error_message);
        free_c_string(result.schemes);
        if !result.data.is_null() {
            match result.data_tag {
                FfiDataTag::Retry => {
                    let req = unsafe { Box::from_raw(result.data as *mut FfiHttpRequest) };
                    free_request_fields(&req);
                }
                FfiDataTag::None => {}
            }
        }
    }));
}

/// Free a string returned by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn authlink_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| free_c_string(s));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
