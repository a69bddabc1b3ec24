//! Translation lookup for user-facing text (confirmation emails and the
//! confirmation page). Bundles are compiled in; English is the fallback
//! locale, and a missing key yields a visible placeholder instead of an
//! error, so a broken translation never breaks a login flow.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    English,
    German,
}

impl Locale {
    /// Parses a language tag ("de", "de-CH", "en-US", ...). Unknown
    /// languages fall back to English.
    pub fn parse(tag: &str) -> Locale {
        let lang = tag.split(['-', '_']).next().unwrap_or("");
        if lang.eq_ignore_ascii_case("de") {
            Locale::German
        } else {
            Locale::English
        }
    }

    pub fn language_code(&self) -> &'static str {
        match self {
            Locale::English => "en",
            Locale::German => "de",
        }
    }
}

// Bundle entries are [english, german] patterns with positional {0}/{1} args.
static BUNDLES: Lazy<HashMap<&'static str, [&'static str; 2]>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "confirmation.email.subject",
        [
            "Please confirm your email address",
            "Bitte bestätige deine E-Mail-Adresse",
        ],
    );
    m.insert(
        "confirmation.email.message",
        [
            "Hello,\n\nto log in, please confirm your email address by opening the following link:\n\n{0}\n\nThe link is valid for {1}. If you did not request this email, you can safely ignore it.\n\nYour memberdesk team",
            "Hallo,\n\num dich anzumelden, bestätige bitte deine E-Mail-Adresse über den folgenden Link:\n\n{0}\n\nDer Link ist {1} gültig. Wenn du diese E-Mail nicht angefordert hast, kannst du sie ignorieren.\n\nDein memberdesk-Team",
        ],
    );
    m.insert(
        "confirmation.timeout",
        ["{0} minutes", "{0} Minuten"],
    );
    m
});

/// Resolves `key` for `locale` and substitutes positional arguments.
/// A missing key returns `!{lang}: {key}` instead of failing.
pub fn translate(key: &str, locale: Locale, args: &[&str]) -> String {
    let Some(patterns) = BUNDLES.get(key) else {
        return format!("!{}: {}", locale.language_code(), key);
    };
    let pattern = match locale {
        Locale::English => patterns[0],
        Locale::German => patterns[1],
    };
    let mut out = pattern.to_string();
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("{{{}}}", i), arg);
    }
    out
}
