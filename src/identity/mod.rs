//! Central identity and session management for passwordless login.
//! Keep the public surface thin and split implementation across sub-modules.

mod confirmation;
mod principal;
mod session;

pub use confirmation::{
    ConfirmationService, ConfirmationStore, PendingConfirmation, CONFIRMATION_CAP, CONFIRMATION_TTL,
};
pub use principal::{Authority, UserPrincipal};
pub use session::{
    new_shared_context, AuthContext, AuthenticationService, NullSessionStore, RequestHandle,
    RequestScope, ResponseHandle, SessionStore, SharedAuthContext, LOGOUT_SUCCESS_URL,
};
