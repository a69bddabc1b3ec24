use std::any::Any;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::principal::UserPrincipal;
use crate::users::{User, UserDirectory};

/// Where the caller lands after logging out.
pub const LOGOUT_SUCCESS_URL: &str = "/login";

/// Per-session holder of at most one installed principal.
///
/// The slot is deliberately type-erased: other code paths may install
/// foreign principal types, and the typed reader degrades those to
/// "no user" instead of failing.
#[derive(Default)]
pub struct AuthContext {
    principal: Option<Box<dyn Any + Send + Sync>>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn install<P: Any + Send + Sync>(&mut self, principal: P) {
        self.principal = Some(Box::new(principal));
    }

    pub fn is_empty(&self) -> bool {
        self.principal.is_none()
    }

    /// The held principal, if it is ours. Empty slots and foreign
    /// principal types both read as `None`.
    pub fn user_principal(&self) -> Option<&UserPrincipal> {
        self.principal
            .as_deref()
            .and_then(|p| p.downcast_ref::<UserPrincipal>())
    }
}

/// One logical browser session owns exactly one of these handles.
pub type SharedAuthContext = Arc<RwLock<AuthContext>>;

pub fn new_shared_context() -> SharedAuthContext {
    Arc::new(RwLock::new(AuthContext::anonymous()))
}

/// Opaque view of the inbound request, carrying the durable session id
/// when the caller presented one.
#[derive(Debug, Clone, Default)]
pub struct RequestHandle {
    pub session_id: Option<String>,
}

/// Outbound side of the pair: a sink the session store can queue a
/// cookie on for the HTTP layer to flush.
#[derive(Default)]
pub struct ResponseHandle {
    set_cookie: Mutex<Option<String>>,
}

impl ResponseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_cookie(&self, cookie: String) {
        *self.set_cookie.lock() = Some(cookie);
    }

    pub fn take_cookie(&self) -> Option<String> {
        self.set_cookie.lock().take()
    }
}

/// Durable session persistence. Implementations decide what "durable"
/// means (cookie-keyed registry in the server, nothing in batch jobs).
pub trait SessionStore: Send + Sync {
    fn save(&self, context: &SharedAuthContext, request: &RequestHandle, response: &ResponseHandle);
    fn invalidate(&self, request: &RequestHandle);
}

/// No-op store for execution contexts without a session notion.
pub struct NullSessionStore;

impl SessionStore for NullSessionStore {
    fn save(&self, _: &SharedAuthContext, _: &RequestHandle, _: &ResponseHandle) {}
    fn invalidate(&self, _: &RequestHandle) {}
}

/// The surrounding execution context of one operation: the session's
/// authentication context plus the request/response pair when one exists.
/// Batch jobs and tests run detached, which skips session persistence.
///
/// The context slot is rebindable: a successful login points the scope at
/// a freshly created context handle instead of installing the principal
/// into the inbound one, so a context an attacker planted (session
/// fixation) never observes the new authentication.
pub struct RequestScope {
    context: RwLock<SharedAuthContext>,
    request: Option<RequestHandle>,
    response: Option<ResponseHandle>,
}

impl RequestScope {
    pub fn new(context: SharedAuthContext, request: RequestHandle, response: ResponseHandle) -> Self {
        Self {
            context: RwLock::new(context),
            request: Some(request),
            response: Some(response),
        }
    }

    pub fn detached(context: SharedAuthContext) -> Self {
        Self {
            context: RwLock::new(context),
            request: None,
            response: None,
        }
    }

    pub fn context(&self) -> SharedAuthContext {
        self.context.read().clone()
    }

    fn rebind(&self, fresh: SharedAuthContext) {
        *self.context.write() = fresh;
    }

    pub fn current_request(&self) -> Option<&RequestHandle> {
        self.request.as_ref()
    }

    pub fn current_response(&self) -> Option<&ResponseHandle> {
        self.response.as_ref()
    }
}

/// Binds authenticated principals to sessions and answers "who is logged
/// in". Login is all-or-nothing from the caller's perspective: on success
/// the scope's context is replaced wholesale with a freshly built one, so
/// a context from a previous authentication is never mutated in place.
pub struct AuthenticationService {
    users: Arc<dyn UserDirectory>,
    sessions: Arc<dyn SessionStore>,
}

impl AuthenticationService {
    pub fn new(users: Arc<dyn UserDirectory>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { users, sessions }
    }

    /// Authenticates the user behind `email` into the scope's session.
    /// An unknown email leaves the context untouched and returns false.
    /// The principal goes into a freshly created context handle that
    /// replaces the scope's current one wholesale; the inbound context is
    /// never written to. Without a request/response pair the login still
    /// succeeds in-process but is not persisted past the current call
    /// (degraded, not fatal).
    pub fn login(&self, scope: &RequestScope, email: &str) -> bool {
        let Some(user) = self.users.lookup_by_email(email) else {
            warn!("User with email '{}' not found.", email);
            return false;
        };

        let mut context = AuthContext::anonymous();
        context.install(UserPrincipal::new(user));
        let fresh: SharedAuthContext = Arc::new(RwLock::new(context));
        scope.rebind(fresh.clone());

        match (scope.current_request(), scope.current_response()) {
            (Some(request), Some(response)) => {
                self.sessions.save(&fresh, request, response);
            }
            _ => {
                warn!("No request/response pair available; authentication context not saved to session.");
            }
        }

        info!("User with email '{}' successfully logged in.", email);
        true
    }

    pub fn logged_in_user(&self, scope: &RequestScope) -> Option<User> {
        let context = scope.context();
        let user = context.read().user_principal().map(|p| p.user().clone());
        user
    }

    pub fn is_user_logged_in(&self, scope: &RequestScope) -> bool {
        self.logged_in_user(scope).is_some()
    }

    /// Clears the session's authentication and hands back the location the
    /// caller should redirect to. Logging out while not authenticated is a
    /// warning, not an error; the redirect happens either way.
    pub fn logout(&self, scope: &RequestScope, location: &str) -> String {
        match self.logged_in_user(scope) {
            None => {
                warn!("No authenticated user found; logout skipped.");
            }
            Some(user) => {
                // Clearing in place logs out every alias of this context.
                let context = scope.context();
                *context.write() = AuthContext::anonymous();
                if let Some(request) = scope.current_request() {
                    self.sessions.invalidate(request);
                }
                info!("User with email '{}' successfully logged out.", user.email);
            }
        }
        location.to_string()
    }

    pub fn logout_default(&self, scope: &RequestScope) -> String {
        self.logout(scope, LOGOUT_SUCCESS_URL)
    }
}
