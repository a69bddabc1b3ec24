//! End-to-end login flow tests: confirmation issuance, single-use token
//! consumption, role derivation and session persistence, exercised through
//! the library API the way the HTTP layer consumes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memberdesk::i18n::Locale;
use memberdesk::identity::{
    new_shared_context, Authority, AuthenticationService, ConfirmationService, ConfirmationStore,
    NullSessionStore, RequestHandle, RequestScope, ResponseHandle, SessionStore,
};
use memberdesk::links::LinkBuilder;
use memberdesk::mail::MemoryMailer;
use memberdesk::server::SessionRegistry;
use memberdesk::users::{InMemoryUserDirectory, User, UserDirectory, UserRole};

const BASE_URL: &str = "https://members.example.org";

struct Portal {
    users: Arc<InMemoryUserDirectory>,
    mailer: Arc<MemoryMailer>,
    auth: Arc<AuthenticationService>,
    confirmations: ConfirmationService,
}

fn portal_with(sessions: Arc<dyn SessionStore>) -> Portal {
    let users = Arc::new(InMemoryUserDirectory::new());
    users.upsert(User::new("Alice", "alice@example.com", UserRole::User));
    users.upsert(User::new("Bob", "bob@example.com", UserRole::Admin));
    let mailer = Arc::new(MemoryMailer::new());
    let auth = Arc::new(AuthenticationService::new(users.clone(), sessions));
    let confirmations = ConfirmationService::new(
        users.clone(),
        mailer.clone(),
        auth.clone(),
        LinkBuilder::new(BASE_URL),
    );
    Portal {
        users,
        mailer,
        auth,
        confirmations,
    }
}

fn portal() -> Portal {
    portal_with(Arc::new(NullSessionStore))
}

/// Pulls the confirmation token out of the emailed link.
fn extract_token(body: &str) -> String {
    let start = body.find("id=").expect("link in mail body") + 3;
    body[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

#[test]
fn confirmation_flow_logs_alice_in_exactly_once() {
    let p = portal();
    p.confirmations
        .send_confirmation_mail(Locale::English, "alice@example.com");

    let sent = p.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.com");
    assert_eq!(sent[0].subject, "Please confirm your email address");
    assert!(sent[0].body.contains(&format!("{BASE_URL}/confirm?id=")));
    assert!(sent[0].body.contains("5 minutes"));

    let token = extract_token(&sent[0].body);
    let scope = RequestScope::detached(new_shared_context());

    assert!(p.confirmations.confirm_and_login(&scope, &token));
    let user = p.auth.logged_in_user(&scope).expect("alice logged in");
    assert_eq!(user.name, "Alice");
    assert_eq!(user.email, "alice@example.com");

    // The link is single use.
    assert!(!p.confirmations.confirm_and_login(&scope, &token));
}

#[test]
fn unknown_email_sends_nothing_and_stores_nothing() {
    let p = portal();
    p.confirmations
        .send_confirmation_mail(Locale::English, "ghost@example.com");
    assert!(p.mailer.sent().is_empty());
    assert_eq!(p.confirmations.store().live_len(), 0);
}

#[test]
fn admin_confirmation_grants_user_and_admin_authorities() {
    let p = portal();
    p.confirmations
        .send_confirmation_mail(Locale::English, "bob@example.com");
    let token = extract_token(&p.mailer.sent()[0].body);

    let scope = RequestScope::detached(new_shared_context());
    assert!(p.confirmations.confirm_and_login(&scope, &token));

    let context = scope.context();
    let context = context.read();
    let principal = context.user_principal().expect("bob's principal");
    assert!(principal.has_authority(Authority::User));
    assert!(principal.has_authority(Authority::Admin));
}

#[test]
fn german_locale_localizes_the_mail() {
    let p = portal();
    p.confirmations
        .send_confirmation_mail(Locale::German, "alice@example.com");
    let sent = p.mailer.sent();
    assert_eq!(sent[0].subject, "Bitte bestätige deine E-Mail-Adresse");
    assert!(sent[0].body.contains("5 Minuten"));
}

/// Directory whose lookups can be switched off, to model a user record
/// vanishing between confirmation issuance and the confirmation click.
struct SwitchableDirectory {
    inner: InMemoryUserDirectory,
    enabled: AtomicBool,
}

impl UserDirectory for SwitchableDirectory {
    fn lookup_by_email(&self, email: &str) -> Option<User> {
        if self.enabled.load(Ordering::SeqCst) {
            self.inner.lookup_by_email(email)
        } else {
            None
        }
    }

    fn upsert(&self, user: User) -> User {
        self.inner.upsert(user)
    }
}

#[test]
fn token_is_burned_even_when_the_login_itself_fails() {
    let users = Arc::new(SwitchableDirectory {
        inner: InMemoryUserDirectory::new(),
        enabled: AtomicBool::new(true),
    });
    users.upsert(User::new("Alice", "alice@example.com", UserRole::User));
    let mailer = Arc::new(MemoryMailer::new());
    let auth = Arc::new(AuthenticationService::new(
        users.clone(),
        Arc::new(NullSessionStore),
    ));
    let confirmations = ConfirmationService::new(
        users.clone(),
        mailer.clone(),
        auth,
        LinkBuilder::new(BASE_URL),
    );

    confirmations.send_confirmation_mail(Locale::English, "alice@example.com");
    let token = extract_token(&mailer.sent()[0].body);

    // The record vanishes before the link is clicked.
    users.enabled.store(false, Ordering::SeqCst);
    let scope = RequestScope::detached(new_shared_context());
    assert!(!confirmations.confirm_and_login(&scope, &token));

    // Anti-replay wins over retryability: the token stays unusable even
    // after the record comes back.
    users.enabled.store(true, Ordering::SeqCst);
    assert!(!confirmations.confirm_and_login(&scope, &token));
}

#[test]
fn expired_token_is_rejected() {
    let users = Arc::new(InMemoryUserDirectory::new());
    users.upsert(User::new("Alice", "alice@example.com", UserRole::User));
    let mailer = Arc::new(MemoryMailer::new());
    let auth = Arc::new(AuthenticationService::new(
        users.clone(),
        Arc::new(NullSessionStore),
    ));
    let confirmations = ConfirmationService::with_store(
        ConfirmationStore::new(Duration::from_millis(30), 1_000),
        users,
        mailer.clone(),
        auth,
        LinkBuilder::new(BASE_URL),
    );

    confirmations.send_confirmation_mail(Locale::English, "alice@example.com");
    let token = extract_token(&mailer.sent()[0].body);

    std::thread::sleep(Duration::from_millis(80));
    let scope = RequestScope::detached(new_shared_context());
    assert!(!confirmations.confirm_and_login(&scope, &token));
}

#[test]
fn mail_outage_still_stores_the_token() {
    let users = Arc::new(InMemoryUserDirectory::new());
    users.upsert(User::new("Alice", "alice@example.com", UserRole::User));
    let mailer = Arc::new(MemoryMailer::failing());
    let auth = Arc::new(AuthenticationService::new(
        users.clone(),
        Arc::new(NullSessionStore),
    ));
    let confirmations =
        ConfirmationService::new(users, mailer, auth, LinkBuilder::new(BASE_URL));

    // The send fails internally; the caller sees nothing and the token is
    // already stored, issued before the send was attempted.
    confirmations.send_confirmation_mail(Locale::English, "alice@example.com");
    assert_eq!(confirmations.store().live_len(), 1);
}

#[test]
fn session_persists_through_the_registry_until_logout() {
    let registry = Arc::new(SessionRegistry::new());
    let p = portal_with(registry.clone() as Arc<dyn SessionStore>);

    p.confirmations
        .send_confirmation_mail(Locale::English, "alice@example.com");
    let token = extract_token(&p.mailer.sent()[0].body);

    // First request: confirmation click with a request/response pair.
    let scope = RequestScope::new(
        new_shared_context(),
        RequestHandle::default(),
        ResponseHandle::new(),
    );
    assert!(p.confirmations.confirm_and_login(&scope, &token));

    let cookie = scope
        .current_response()
        .and_then(|r| r.take_cookie())
        .expect("session cookie issued");
    let sid: String = cookie
        .split(';')
        .next()
        .and_then(|kv| kv.split('=').nth(1))
        .unwrap()
        .to_string();

    // Later request in the same browser session observes the login.
    let context = registry.lookup(&sid).expect("session registered");
    let later = RequestScope::new(
        context,
        RequestHandle {
            session_id: Some(sid.clone()),
        },
        ResponseHandle::new(),
    );
    assert_eq!(p.auth.logged_in_user(&later).unwrap().name, "Alice");

    // Logout tears the durable session down.
    let redirect = p.auth.logout_default(&later);
    assert_eq!(redirect, "/login");
    assert!(registry.lookup(&sid).is_none());
    assert!(!p.auth.is_user_logged_in(&later));
}

#[test]
fn each_confirmation_gets_a_distinct_token() {
    let p = portal();
    p.confirmations
        .send_confirmation_mail(Locale::English, "alice@example.com");
    p.confirmations
        .send_confirmation_mail(Locale::English, "alice@example.com");
    let sent = p.mailer.sent();
    let t1 = extract_token(&sent[0].body);
    let t2 = extract_token(&sent[1].body);
    assert_ne!(t1, t2);
    assert_eq!(p.confirmations.store().live_len(), 2);
}

#[test]
fn planted_session_cookie_cannot_hijack_a_confirmation() {
    // Mallory logs in and plants her own session cookie in Alice's
    // browser; Alice's confirmation click then arrives under Mallory's
    // session id. The login must land in a fresh session Mallory's id
    // cannot reach.
    let registry = Arc::new(SessionRegistry::new());
    let p = portal_with(registry.clone() as Arc<dyn SessionStore>);
    p.users
        .upsert(User::new("Mallory", "mallory@example.com", UserRole::User));

    p.confirmations
        .send_confirmation_mail(Locale::English, "mallory@example.com");
    let mallory_token = extract_token(&p.mailer.sent()[0].body);
    let mallory_scope = RequestScope::new(
        new_shared_context(),
        RequestHandle::default(),
        ResponseHandle::new(),
    );
    assert!(p.confirmations.confirm_and_login(&mallory_scope, &mallory_token));
    let mallory_sid: String = mallory_scope
        .current_response()
        .and_then(|r| r.take_cookie())
        .unwrap()
        .split(';')
        .next()
        .and_then(|kv| kv.split('=').nth(1))
        .unwrap()
        .to_string();

    // Alice's confirmation request carries the planted cookie, so it
    // resolves to Mallory's registered context, exactly as the HTTP
    // layer would build the scope.
    p.confirmations
        .send_confirmation_mail(Locale::English, "alice@example.com");
    let alice_token = extract_token(&p.mailer.sent()[1].body);
    let planted_context = registry.lookup(&mallory_sid).expect("planted session");
    let alice_scope = RequestScope::new(
        planted_context.clone(),
        RequestHandle {
            session_id: Some(mallory_sid.clone()),
        },
        ResponseHandle::new(),
    );
    assert!(p.confirmations.confirm_and_login(&alice_scope, &alice_token));

    // The planted session id is retired outright...
    assert!(registry.lookup(&mallory_sid).is_none());
    // ...and the context it pointed at never saw Alice's principal.
    let through_planted = RequestScope::detached(planted_context);
    assert_ne!(
        p.auth.logged_in_user(&through_planted).map(|u| u.email),
        Some("alice@example.com".to_string())
    );
    // Alice herself is logged in under the fresh session.
    assert_eq!(
        p.auth.logged_in_user(&alice_scope).unwrap().email,
        "alice@example.com"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_let_exactly_one_request_win() {
    let p = portal();
    p.confirmations
        .send_confirmation_mail(Locale::English, "alice@example.com");
    let token = extract_token(&p.mailer.sent()[0].body);

    let confirmations = Arc::new(p.confirmations);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let confirmations = confirmations.clone();
        let token = token.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let scope = RequestScope::detached(new_shared_context());
            confirmations.confirm_and_login(&scope, &token)
        }));
    }
    let results = futures::future::join_all(tasks).await;
    let wins = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
}

#[test]
fn directory_is_reachable_for_record_editing() {
    // The directory upsert used by the member-record features feeds the
    // same records the login resolves.
    let p = portal();
    let carol = p
        .users
        .upsert(User::new("Carol", "carol@example.com", UserRole::User));
    p.confirmations
        .send_confirmation_mail(Locale::English, "carol@example.com");
    let token = extract_token(&p.mailer.sent()[0].body);
    let scope = RequestScope::detached(new_shared_context());
    assert!(p.confirmations.confirm_and_login(&scope, &token));
    assert_eq!(p.auth.logged_in_user(&scope).unwrap().id, carol.id);
}
