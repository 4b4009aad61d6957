//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Each type mirrors a core type but uses C-compatible representations:
//! `*mut c_char` instead of `String`, raw pointers instead of `Vec`, and
//! tagged enums with explicit discriminants. Conversion functions live here
//! to keep `lib.rs` focused on the `extern "C"` surface.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use authlink_core::{
    CancelReason, ClientCall, CompletionState, HttpMethod, HttpRequest, HttpResponse, RejectReason,
    SessionClient, TransportError,
};

/// Opaque handle to a `SessionClient`. C callers receive a pointer to this
/// and pass it back into every `authlink_session_*` function.
pub struct FfiSession {
    pub(crate) inner: SessionClient,
}

/// Opaque handle to one pending call.
pub struct FfiCall {
    pub(crate) inner: Arc<ClientCall<u64, UserState>>,
}

/// The caller's `void*`, handed back untouched to its callback.
pub(crate) struct UserState(pub(crate) *mut c_void);

// The pointer is never dereferenced on the Rust side; the C caller owns
// whatever it points to and decides which thread may touch it.
unsafe impl Send for UserState {}

/// Interior NULs cut the string short rather than failing.
pub(crate) fn c_string(s: impl Into<String>) -> CString {
    let mut s = s.into();
    if let Some(pos) = s.find('\0') {
        s.truncate(pos);
    }
    CString::new(s).unwrap_or_default()
}

/// Copy a Rust string into a caller-owned C string.
pub(crate) fn to_c_string(s: impl Into<String>) -> *mut c_char {
    c_string(s).into_raw()
}

/// Borrow a C string as `&str`; null or invalid UTF-8 yields `None`.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// HTTP method as a C enum.
#[repr(C)]
#[derive(Clone, Copy)]
pub enum FfiHttpMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Delete = 3,
}

impl From<HttpMethod> for FfiHttpMethod {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => FfiHttpMethod::Get,
            HttpMethod::Post => FfiHttpMethod::Post,
            HttpMethod::Put => FfiHttpMethod::Put,
            HttpMethod::Delete => FfiHttpMethod::Delete,
        }
    }
}

impl From<FfiHttpMethod> for HttpMethod {
    fn from(m: FfiHttpMethod) -> Self {
        match m {
            FfiHttpMethod::Get => HttpMethod::Get,
            FfiHttpMethod::Post => HttpMethod::Post,
            FfiHttpMethod::Put => HttpMethod::Put,
            FfiHttpMethod::Delete => HttpMethod::Delete,
        }
    }
}

/// A single HTTP header as a key-value pair of C strings.
#[repr(C)]
pub struct FfiHeader {
    pub key: *mut c_char,
    pub value: *mut c_char,
}

/// An HTTP request described as C-compatible plain data.
///
/// Built by `authlink_session_prepare` and `authlink_session_on_challenge`.
/// The C caller executes it and frees it with `authlink_free_request`.
#[repr(C)]
pub struct FfiHttpRequest {
    pub method: FfiHttpMethod,
    pub path: *mut c_char,
    pub headers: *mut FfiHeader,
    pub headers_len: u32,
    pub body: *mut c_char,
}

impl FfiHttpRequest {
    /// Convert a core `HttpRequest` into a heap-allocated `FfiHttpRequest`.
    pub(crate) fn from_core(req: HttpRequest) -> *mut Self {
        let path = to_c_string(req.path);
        let body = match req.body {
            Some(b) => to_c_string(b),
            None => std::ptr::null_mut(),
        };

        let headers_len = req.headers.len() as u32;
        let headers = if req.headers.is_empty() {
            std::ptr::null_mut()
        } else {
            let ffi_headers: Box<[FfiHeader]> = req
                .headers
                .into_iter()
                .map(|(k, v)| FfiHeader {
                    key: to_c_string(k),
                    value: to_c_string(v),
                })
                .collect();
            Box::into_raw(ffi_headers) as *mut FfiHeader
        };

        Box::into_raw(Box::new(FfiHttpRequest {
            method: req.method.into(),
            path,
            headers,
            headers_len,
            body,
        }))
    }

    /// Read back a request previously handed out (or built by the caller).
    /// Returns `None` if the path is null or not UTF-8.
    ///
    /// # Safety
    /// Every non-null pointer in `self` must be valid for reads.
    pub(crate) unsafe fn to_core(&self) -> Option<HttpRequest> {
        let path = unsafe { read_str(self.path) }?;
        let mut req = HttpRequest::new(self.method.into(), path);
        req.body = unsafe { read_str(self.body) }.map(str::to_string);
        if !self.headers.is_null() {
            let len = self.headers_len as usize;
            let headers = unsafe { std::slice::from_raw_parts(self.headers, len) };
            for h in headers {
                if let (Some(k), Some(v)) = unsafe { (read_str(h.key), read_str(h.value)) } {
                    req.headers.push((k.to_string(), v.to_string()));
                }
            }
        }
        Some(req)
    }
}

// ---------------------------------------------------------------------------
// Response input (caller-provided, not heap-allocated by us)
// ---------------------------------------------------------------------------

/// A response header borrowed from the caller.
#[repr(C)]
pub struct FfiHeaderRef {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// An HTTP response described as C-compatible plain data.
///
/// The C caller constructs this on the stack after executing an HTTP request.
/// The FFI layer reads but does not free these fields. Repeated headers
/// (`Set-Cookie`, `WWW-Authenticate`) appear once per value.
#[repr(C)]
pub struct FfiHttpResponse {
    pub status: u16,
    pub headers: *const FfiHeaderRef,
    pub headers_len: u32,
    pub body: *const c_char,
}

impl FfiHttpResponse {
    /// # Safety
    /// Every non-null pointer in `self` must be valid for reads.
    pub(crate) unsafe fn to_core(&self) -> HttpResponse {
        let mut headers = Vec::with_capacity(self.headers_len as usize);
        if !self.headers.is_null() {
            let len = self.headers_len as usize;
            let raw = unsafe { std::slice::from_raw_parts(self.headers, len) };
            for h in raw {
                if let (Some(k), Some(v)) = unsafe { (read_str(h.key), read_str(h.value)) } {
                    headers.push((k.to_string(), v.to_string()));
                }
            }
        }
        HttpResponse {
            status: self.status,
            headers,
            body: unsafe { read_str(self.body) }.unwrap_or_default().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trust input
// ---------------------------------------------------------------------------

/// A decoded certificate, leaf first in a chain. Instants are Unix seconds.
#[repr(C)]
pub struct FfiCertificate {
    pub subject: *const c_char,
    pub issuer: *const c_char,
    pub not_before: i64,
    pub not_after: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub enum FfiCertUsage {
    ServerAuth = 0,
    ClientAuth = 1,
}

// ---------------------------------------------------------------------------
// Pending calls
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiCompletionState {
    Pending = 0,
    Completed = 1,
    Cancelled = 2,
}

impl From<CompletionState> for FfiCompletionState {
    fn from(s: CompletionState) -> Self {
        match s {
            CompletionState::Pending => FfiCompletionState::Pending,
            CompletionState::Completed => FfiCompletionState::Completed,
            CompletionState::Cancelled => FfiCompletionState::Cancelled,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiCancelReason {
    None = 0,
    Requested = 1,
    TimedOut = 2,
}

impl From<CancelReason> for FfiCancelReason {
    fn from(r: CancelReason) -> Self {
        match r {
            CancelReason::Requested => FfiCancelReason::Requested,
            CancelReason::TimedOut => FfiCancelReason::TimedOut,
        }
    }
}

/// What a call's callback receives. Only valid for the duration of the
/// callback; copy anything that must outlive it.
///
/// `http_status` and `body` are set when `state` is `Completed` and
/// `error_code` is `Ok`.
#[repr(C)]
pub struct FfiCallOutcome {
    pub state: FfiCompletionState,
    pub cancel_reason: FfiCancelReason,
    pub error_code: FfiErrorCode,
    pub http_status: u16,
    pub body: *const c_char,
    pub error_message: *const c_char,
}

/// Invoked exactly once per call with the caller's `user_state`.
pub type FfiCallCallback =
    Option<extern "C" fn(user_state: *mut c_void, outcome: *const FfiCallOutcome)>;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Error codes returned in `FfiAuthResult`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    ChallengeProcessing = 1,
    InvalidArgument = 2,
    CertificateRejected = 3,
    FactoryFailure = 4,
    CallSettled = 5,
    Config = 6,
    Panic = 7,
    NullArg = 8,
}

impl From<&TransportError> for FfiErrorCode {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::ChallengeProcessing(_) => FfiErrorCode::ChallengeProcessing,
            TransportError::InvalidArgument(_) => FfiErrorCode::InvalidArgument,
            TransportError::CertificateRejected { .. } => FfiErrorCode::CertificateRejected,
            TransportError::FactoryFailure(_) => FfiErrorCode::FactoryFailure,
            TransportError::CallSettled => FfiErrorCode::CallSettled,
            TransportError::Config(_) => FfiErrorCode::Config,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiRejectReason {
    None = 0,
    Expired = 1,
    NotYetValid = 2,
    ChainInvalid = 3,
}

impl From<&RejectReason> for FfiRejectReason {
    fn from(r: &RejectReason) -> Self {
        match r {
            RejectReason::Expired => FfiRejectReason::Expired,
            RejectReason::NotYetValid => FfiRejectReason::NotYetValid,
            RejectReason::ChainInvalid(_) => FfiRejectReason::ChainInvalid,
        }
    }
}

/// Tag that tells `authlink_free_result` what `FfiAuthResult::data` points to.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiDataTag {
    None = 0,
    /// `data` is an `FfiHttpRequest` to re-send.
    Retry = 1,
}

/// Result envelope for challenge processing and trust evaluation.
///
/// On success `error_code` is `Ok` and `error_message` is null. After
/// `authlink_session_on_challenge`, `data_tag = Retry` means `data` holds the
/// rewritten request and `schemes` the offered schemes, comma-separated;
/// `data_tag = None` means the response was final and `http_status` carries
/// its status. On failure `error_code` describes the category and
/// `error_message` is a human-readable C string.
#[repr(C)]
pub struct FfiAuthResult {
    pub error_code: FfiErrorCode,
    pub error_message: *mut c_char,
    pub http_status: u16,
    pub reject_reason: FfiRejectReason,
    pub schemes: *mut c_char,
    pub data_tag: FfiDataTag,
    pub data: *mut c_void,
}

impl FfiAuthResult {
    fn base(error_code: FfiErrorCode, error_message: *mut c_char) -> Self {
        FfiAuthResult {
            error_code,
            error_message,
            http_status: 0,
            reject_reason: FfiRejectReason::None,
            schemes: std::ptr::null_mut(),
            data_tag: FfiDataTag::None,
            data: std::ptr::null_mut(),
        }
    }

    /// Build a success result for a final response.
    pub(crate) fn done(http_status: u16) -> *mut Self {
        Box::into_raw(Box::new(FfiAuthResult {
            http_status,
            ..Self::base(FfiErrorCode::Ok, std::ptr::null_mut())
        }))
    }

    /// Build a success result carrying the request to re-send.
    pub(crate) fn retry(request: HttpRequest, schemes: Vec<String>) -> *mut Self {
        Box::into_raw(Box::new(FfiAuthResult {
            schemes: to_c_string(schemes.join(",")),
            data_tag: FfiDataTag::Retry,
            data: FfiHttpRequest::from_core(request) as *mut c_void,
            ..Self::base(FfiErrorCode::Ok, std::ptr::null_mut())
        }))
    }

    /// Build a success result with no payload (e.g. an accepted chain).
    pub(crate) fn ok_empty() -> *mut Self {
        Box::into_raw(Box::new(Self::base(FfiErrorCode::Ok, std::ptr::null_mut())))
    }

    /// Build an error result from a `TransportError`.
    pub(crate) fn from_error(err: TransportError) -> *mut Self {
        let reject_reason = match &err {
            TransportError::CertificateRejected { reason } => reason.into(),
            _ => FfiRejectReason::None,
        };
        Box::into_raw(Box::new(FfiAuthResult {
            reject_reason,
            ..Self::base((&err).into(), to_c_string(err.to_string()))
        }))
    }

    /// Build an error result for a null argument.
    pub(crate) fn null_arg(name: &str) -> *mut Self {
        let msg = format!("null argument: {name}");
        Box::into_raw(Box::new(Self::base(FfiErrorCode::NullArg, to_c_string(msg))))
    }

    /// Build an error result for a caught panic.
    pub(crate) fn panic(msg: &str) -> *mut Self {
        Box::into_raw(Box::new(Self::base(FfiErrorCode::Panic, to_c_string(msg))))
    }
}
