use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use tracing::{error, warn};

use super::session::{AuthenticationService, RequestScope};
use crate::i18n::{translate, Locale};
use crate::links::LinkBuilder;
use crate::mail::MailTransport;
use crate::users::UserDirectory;

/// How long an emailed confirmation link stays valid.
pub const CONFIRMATION_TTL: Duration = Duration::from_secs(5 * 60);

/// Hard cap on live pending confirmations; prevents unbounded growth when
/// someone hammers the login endpoint.
pub const CONFIRMATION_CAP: usize = 1_000;

fn new_token() -> String {
    // 256-bit random token, base64url without padding
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// A login that has been requested but not yet confirmed. Owned by the
/// store from `put` until consumption or expiry; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub token: String,
    pub email: String,
}

struct StoreInner {
    entries: HashMap<String, (PendingConfirmation, Instant)>,
    // Insertion order; with a fixed TTL this is also deadline order.
    order: VecDeque<(Instant, String)>,
}

/// Bounded, time-expiring token store. All operations take one lock, so
/// `take_if_present` is an atomic check-and-remove: under concurrent
/// confirmation attempts with the same token at most one caller wins.
pub struct ConfirmationStore {
    ttl: Duration,
    cap: usize,
    inner: Mutex<StoreInner>,
}

impl Default for ConfirmationStore {
    fn default() -> Self {
        Self::new(CONFIRMATION_TTL, CONFIRMATION_CAP)
    }
}

impl ConfirmationStore {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self {
            ttl,
            cap,
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    // Consumed tokens leave stale queue slots behind; a slot only drops the
    // map entry when the deadlines still match.
    fn drop_if_current(inner: &mut StoreInner, token: &str, deadline: Instant) {
        if let Some((_, entry_deadline)) = inner.entries.get(token) {
            if *entry_deadline == deadline {
                inner.entries.remove(token);
            }
        }
    }

    fn prune(inner: &mut StoreInner, now: Instant) {
        while inner
            .order
            .front()
            .is_some_and(|(deadline, _)| *deadline <= now)
        {
            let (deadline, token) = inner.order.pop_front().unwrap();
            Self::drop_if_current(inner, &token, deadline);
        }
    }

    pub fn put(&self, record: PendingConfirmation) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, now);
        // Evict oldest live entries before exceeding the cap.
        while inner.entries.len() >= self.cap {
            let Some((deadline, token)) = inner.order.pop_front() else {
                break;
            };
            Self::drop_if_current(&mut inner, &token, deadline);
        }
        let deadline = now + self.ttl;
        inner
            .entries
            .insert(record.token.clone(), (record.clone(), deadline));
        inner.order.push_back((deadline, record.token));
    }

    /// Atomic lookup-and-remove. Absent, already consumed and expired
    /// tokens are indistinguishable to the caller.
    pub fn take_if_present(&self, token: &str) -> Option<PendingConfirmation> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (record, deadline) = inner.entries.remove(token)?;
        if deadline <= now {
            return None;
        }
        Some(record)
    }

    /// Number of live (unexpired) pending confirmations.
    pub fn live_len(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, Instant::now());
        inner.entries.len()
    }
}

/// Issues email login confirmations and validates them on return.
pub struct ConfirmationService {
    store: ConfirmationStore,
    users: Arc<dyn UserDirectory>,
    mail: Arc<dyn MailTransport>,
    auth: Arc<AuthenticationService>,
    links: LinkBuilder,
}

impl ConfirmationService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        mail: Arc<dyn MailTransport>,
        auth: Arc<AuthenticationService>,
        links: LinkBuilder,
    ) -> Self {
        Self::with_store(ConfirmationStore::default(), users, mail, auth, links)
    }

    pub fn with_store(
        store: ConfirmationStore,
        users: Arc<dyn UserDirectory>,
        mail: Arc<dyn MailTransport>,
        auth: Arc<AuthenticationService>,
        links: LinkBuilder,
    ) -> Self {
        Self {
            store,
            users,
            mail,
            auth,
            links,
        }
    }

    pub fn store(&self) -> &ConfirmationStore {
        &self.store
    }

    /// Sends a login confirmation email to `email`.
    ///
    /// An unknown email is a deliberate no-op apart from a warning log, so
    /// the caller cannot probe which addresses are registered. Mail
    /// transport failures are logged and swallowed; the token is already
    /// stored at that point, so a later retry email can still be issued.
    pub fn send_confirmation_mail(&self, locale: Locale, email: &str) {
        if self.users.lookup_by_email(email).is_none() {
            warn!("User with email '{}' not found.", email);
            return;
        }

        let token = new_token();
        self.store.put(PendingConfirmation {
            token: token.clone(),
            email: email.to_string(),
        });

        let link = self.links.confirmation_link(&token);
        let timeout = self.confirmation_timeout_text(locale);
        let subject = translate("confirmation.email.subject", locale, &[]);
        let message = translate(
            "confirmation.email.message",
            locale,
            &[link.as_str(), timeout.as_str()],
        );

        if let Err(e) = self.mail.send(email, &subject, &message) {
            error!(
                "Unable to send mail with subject '{}' to '{}': {}",
                subject, email, e
            );
        }
    }

    /// Human-readable validity period, also shown on the confirmation page.
    pub fn confirmation_timeout_text(&self, locale: Locale) -> String {
        let minutes = (self.store.ttl.as_secs() / 60).to_string();
        translate("confirmation.timeout", locale, &[minutes.as_str()])
    }

    /// Validates `token` and logs in the associated user.
    ///
    /// The token is removed before the login is attempted, so it is burned
    /// exactly once even when the login itself fails (anti-replay wins
    /// over retryability).
    pub fn confirm_and_login(&self, scope: &RequestScope, token: &str) -> bool {
        match self.store.take_if_present(token) {
            Some(pending) => self.auth.login(scope, &pending.email),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pending(token: &str) -> PendingConfirmation {
        PendingConfirmation {
            token: token.to_string(),
            email: "user@example.com".to_string(),
        }
    }

    #[test]
    fn take_consumes_the_entry_exactly_once() {
        let store = ConfirmationStore::default();
        store.put(pending("t1"));
        assert!(store.take_if_present("t1").is_some());
        assert!(store.take_if_present("t1").is_none());
    }

    #[test]
    fn take_misses_on_unknown_token() {
        let store = ConfirmationStore::default();
        assert!(store.take_if_present("never-issued").is_none());
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let store = ConfirmationStore::new(Duration::from_millis(30), 10);
        store.put(pending("t1"));
        assert_eq!(store.live_len(), 1);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(store.live_len(), 0);
        assert!(store.take_if_present("t1").is_none());
    }

    #[test]
    fn live_entries_never_exceed_the_cap() {
        let store = ConfirmationStore::new(Duration::from_secs(60), 3);
        for i in 0..10 {
            store.put(pending(&format!("t{i}")));
            assert!(store.live_len() <= 3);
        }
        // Oldest entries were evicted, newest survive.
        assert!(store.take_if_present("t0").is_none());
        assert!(store.take_if_present("t9").is_some());
    }

    #[test]
    fn concurrent_takes_let_exactly_one_caller_win() {
        let store = Arc::new(ConfirmationStore::default());
        store.put(pending("contested"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store.take_if_present("contested").is_some()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn reissued_token_is_not_dropped_by_a_stale_queue_entry() {
        // Consume a token, re-put it (fresh deadline), then make sure the
        // stale queue slot from the first put cannot evict the new entry.
        let store = ConfirmationStore::new(Duration::from_millis(30), 10);
        store.put(pending("t1"));
        assert!(store.take_if_present("t1").is_some());
        thread::sleep(Duration::from_millis(50));
        store.put(pending("t1"));
        assert_eq!(store.live_len(), 1);
        assert!(store.take_if_present("t1").is_some());
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert!(a.len() >= 43); // 32 bytes base64url
    }
}
