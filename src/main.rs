use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use memberdesk::mail::LogMailer;
use memberdesk::users::InMemoryUserDirectory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let http_port = std::env::var("MEMBERDESK_HTTP_PORT").unwrap_or_else(|_| "8080".to_string());
    let base_url = std::env::var("MEMBERDESK_BASE_URL")
        .unwrap_or_else(|_| format!("http://localhost:{http_port}"));
    let mail_from = std::env::var("MEMBERDESK_MAIL_FROM")
        .unwrap_or_else(|_| "noreply@memberdesk.local".to_string());
    let mail_reply_to = std::env::var("MEMBERDESK_MAIL_REPLY_TO").unwrap_or_default();
    let admin_email = std::env::var("MEMBERDESK_ADMIN_EMAIL")
        .unwrap_or_else(|_| "admin@memberdesk.local".to_string());
    info!(
        target: "memberdesk",
        "memberdesk starting: RUST_LOG='{}', http_port={}, base_url='{}', mail_from='{}', admin='{}'",
        rust_log, http_port, base_url, mail_from, admin_email
    );

    let http_port: u16 = http_port.parse().unwrap_or(8080);
    let users = Arc::new(InMemoryUserDirectory::new());
    let mail = Arc::new(LogMailer::new(&mail_from, Some(&mail_reply_to)));

    memberdesk::server::run(http_port, &base_url, users, mail, &admin_email).await
}
