pub mod error;
pub mod i18n;
pub mod identity;
pub mod links;
pub mod mail;
pub mod server;
pub mod users;
