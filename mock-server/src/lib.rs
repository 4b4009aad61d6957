use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::State,
    http::{
        header::{COOKIE, SET_COOKIE, WWW_AUTHENTICATE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "sid";

#[derive(Debug, Default)]
pub struct Backend {
    sessions: HashSet<String>,
    challenges: u64,
    served: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub challenges: u64,
    pub served: u64,
    pub active_sessions: usize,
}

pub type Db = Arc<RwLock<Backend>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Backend::default()));
    Router::new()
        .route("/soap", post(soap))
        .route("/admin/expire", post(expire_sessions))
        .route("/stats", get(stats))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Session id presented in the request's `Cookie` headers, if any.
fn presented_sid(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

async fn soap(
    State(db): State<Db>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, StatusCode> {
    let action = headers
        .get("soapaction")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let mut backend = db.write().await;
    if let Some(sid) = presented_sid(&headers) {
        if backend.sessions.contains(&sid) {
            backend.served += 1;
            debug!(%action, "request served");
            let envelope = format!(
                "<Envelope><Body><Response action=\"{action}\" bytes=\"{}\"/></Body></Envelope>",
                body.len()
            );
            return Ok((StatusCode::OK, envelope).into_response());
        }
    }

    let sid = Uuid::new_v4().simple().to_string();
    backend.sessions.insert(sid.clone());
    backend.challenges += 1;
    info!(%action, "issuing session challenge");

    let mut out = HeaderMap::new();
    out.append(WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
    out.append(WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
    let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={sid}; Path=/; HttpOnly"))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    out.append(SET_COOKIE, cookie);
    Ok((StatusCode::UNAUTHORIZED, out, String::new()).into_response())
}

async fn expire_sessions(State(db): State<Db>) -> StatusCode {
    let mut backend = db.write().await;
    let dropped = backend.sessions.len();
    backend.sessions.clear();
    info!(dropped, "sessions expired");
    StatusCode::NO_CONTENT
}

async fn stats(State(db): State<Db>) -> Json<Stats> {
    let backend = db.read().await;
    Json(Stats {
        challenges: backend.challenges,
        served: backend.served,
        active_sessions: backend.sessions.len(),
    })
}
