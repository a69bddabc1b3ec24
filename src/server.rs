//!
//! memberdesk HTTP server
//! ----------------------
//! Axum boundary over the authentication core. The view layer proper lives
//! elsewhere; these endpoints are what it talks to.
//!
//! Responsibilities:
//! - Session management with an HttpOnly cookie keyed registry.
//! - Login-request, confirmation, logout and whoami endpoints delegating
//!   to the identity services.
//! - Startup provisioning of the instance admin account.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::i18n::Locale;
use crate::identity::{
    new_shared_context, AuthenticationService, ConfirmationService, RequestHandle, RequestScope,
    ResponseHandle, SessionStore, SharedAuthContext,
};
use crate::links::{LinkBuilder, CONFIRMATION_PARAM};
use crate::mail::MailTransport;
use crate::users::{User, UserDirectory, UserRole};

const SESSION_COOKIE: &str = "memberdesk_session";

/// How long a durable browser session stays valid without a new login.
const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Cookie-keyed durable session store: one authentication context per
/// browser session, bound to this server instance. Entries expire after
/// a fixed TTL, and a login through an existing session retires the old
/// session id (a confirmation click always mints a fresh one).
pub struct SessionRegistry {
    ttl: Duration,
    sessions: parking_lot::RwLock<HashMap<String, (SharedAuthContext, Instant)>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_ttl(SESSION_TTL)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn new_session_id() -> String {
        let mut bytes = [0u8; 16];
        let _ = getrandom::getrandom(&mut bytes);
        let mut sid = String::with_capacity(32);
        use std::fmt::Write as _;
        for b in &bytes {
            let _ = write!(&mut sid, "{:02x}", b);
        }
        sid
    }

    pub fn lookup(&self, session_id: &str) -> Option<SharedAuthContext> {
        let now = Instant::now();
        let expired = {
            let map = self.sessions.read();
            match map.get(session_id) {
                Some((context, expires_at)) => {
                    if *expires_at > now {
                        return Some(context.clone());
                    }
                    true
                }
                None => false,
            }
        };
        if expired {
            self.sessions.write().remove(session_id);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionStore for SessionRegistry {
    fn save(&self, context: &SharedAuthContext, request: &RequestHandle, response: &ResponseHandle) {
        let now = Instant::now();
        let sid = Self::new_session_id();
        {
            let mut map = self.sessions.write();
            // Retire the session id the login arrived under; the caller
            // only ever sees the fresh one.
            if let Some(old_sid) = &request.session_id {
                map.remove(old_sid);
            }
            map.retain(|_, (_, expires_at)| *expires_at > now);
            map.insert(sid.clone(), (context.clone(), now + self.ttl));
        }
        response.push_cookie(format!(
            "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/",
            SESSION_COOKIE, sid
        ));
    }

    fn invalidate(&self, request: &RequestHandle) {
        if let Some(sid) = &request.session_id {
            self.sessions.write().remove(sid);
        }
    }
}

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthenticationService>,
    pub confirmations: Arc<ConfirmationService>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        mail: Arc<dyn MailTransport>,
        links: LinkBuilder,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let auth = Arc::new(AuthenticationService::new(
            users.clone(),
            registry.clone() as Arc<dyn SessionStore>,
        ));
        let confirmations = Arc::new(ConfirmationService::new(users, mail, auth.clone(), links));
        Self {
            auth,
            confirmations,
            registry,
        }
    }
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE
    ))
    .unwrap()
}

/// Builds the request scope for an inbound request: the session's existing
/// authentication context when the cookie resolves, a fresh anonymous one
/// otherwise.
fn scope_for(state: &AppState, headers: &HeaderMap) -> RequestScope {
    let session_id = parse_cookie(headers, SESSION_COOKIE);
    let context = session_id
        .as_deref()
        .and_then(|sid| state.registry.lookup(sid))
        .unwrap_or_else(new_shared_context);
    RequestScope::new(context, RequestHandle { session_id }, ResponseHandle::new())
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(json!({"status": "error", "code": self.code_str(), "error": self.message()})),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct LoginRequestPayload {
    email: String,
    #[serde(default)]
    locale: Option<String>,
}

/// Always answers 202 regardless of whether the email is known, so the
/// endpoint cannot be used to enumerate registered addresses.
async fn request_login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequestPayload>,
) -> impl IntoResponse {
    let locale = payload
        .locale
        .as_deref()
        .map(Locale::parse)
        .unwrap_or_default();
    state
        .confirmations
        .send_confirmation_mail(locale, &payload.email);
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
}

async fn confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(token) = params.get(CONFIRMATION_PARAM) else {
        return AppError::user("missing_parameter", "missing confirmation id").into_response();
    };
    let scope = scope_for(&state, &headers);
    if !state.confirmations.confirm_and_login(&scope, token) {
        return AppError::gone(
            "confirmation_invalid",
            "confirmation link is invalid, already used or expired",
        )
        .into_response();
    }
    let mut h = HeaderMap::new();
    if let Some(cookie) = scope.current_response().and_then(|r| r.take_cookie()) {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            h.insert("Set-Cookie", value);
        }
    }
    (StatusCode::OK, h, Json(json!({"status": "ok"}))).into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let scope = scope_for(&state, &headers);
    let redirect = state.auth.logout_default(&scope);
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    (
        StatusCode::OK,
        h,
        Json(json!({"status": "ok", "redirect": redirect})),
    )
}

async fn whoami(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let scope = scope_for(&state, &headers);
    match state.auth.logged_in_user(&scope) {
        Some(user) => (StatusCode::OK, Json(json!({"status": "ok", "user": user}))).into_response(),
        None => AppError::auth("not_logged_in", "no authenticated user").into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/login", post(request_login))
        .route("/confirm", get(confirm))
        .route("/api/logout", post(logout))
        .route("/api/whoami", get(whoami))
        .with_state(state)
}

/// Makes sure an instance admin exists so a freshly provisioned portal can
/// be logged into at all.
pub fn ensure_instance_admin(users: &dyn UserDirectory, admin_email: &str) {
    if users.lookup_by_email(admin_email).is_none() {
        users.upsert(User::new("Instance Admin", admin_email, UserRole::Admin));
        info!("Provisioned instance admin '{}'.", admin_email);
    }
}

/// Start the memberdesk HTTP server bound to the given port.
pub async fn run(
    http_port: u16,
    base_url: &str,
    users: Arc<dyn UserDirectory>,
    mail: Arc<dyn MailTransport>,
    admin_email: &str,
) -> anyhow::Result<()> {
    ensure_instance_admin(users.as_ref(), admin_email);

    let state = AppState::new(users, mail, LinkBuilder::new(base_url));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    info!("memberdesk listening on {} (base url {})", addr, base_url);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
