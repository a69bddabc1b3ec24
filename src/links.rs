//! Absolute link construction for outbound emails. The base URL comes from
//! configuration at startup; the builder is passed to the services that
//! need it rather than living in ambient process state.

pub const CONFIRMATION_PATH: &str = "/confirm";
pub const CONFIRMATION_PARAM: &str = "id";

#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base_url: String,
}

impl LinkBuilder {
    /// `base_url` is the externally visible origin of this instance,
    /// e.g. `https://members.example.org`. A trailing slash is dropped.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute confirmation URL carrying the token as a percent-encoded
    /// query parameter.
    pub fn confirmation_link(&self, token: &str) -> String {
        format!(
            "{}{}?{}={}",
            self.base_url,
            CONFIRMATION_PATH,
            CONFIRMATION_PARAM,
            urlencoding::encode(token)
        )
    }
}
