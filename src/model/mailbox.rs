//! Mailbox records supplied by the mailbox repository.

use serde::{Deserialize, Serialize};

/// How the outbound connection is secured. Chosen per mailbox, never auto-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportSecurity {
    /// TLS from the first byte, negotiated by the library.
    #[default]
    Implicit,
    /// Plaintext connect, STARTTLS upgrade, then authenticate.
    StartTls,
}

/// A configured mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: String,
    /// Primary address of the mailbox.
    pub address: String,
    /// Domain that outbound `From` addresses must belong to.
    pub domain: String,
    #[serde(default)]
    pub display_name: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    #[serde(skip_serializing)]
    pub smtp_password: String,
    #[serde(default)]
    pub security: TransportSecurity,
    #[serde(default)]
    pub outbound_enabled: bool,
}

impl Mailbox {
    /// Minimal mailbox for `address`, with outbound disabled.
    pub fn new(id: impl Into<String>, address: &str) -> Self {
        let address = address.trim().to_lowercase();
        let domain = crate::model::address::domain_of(&address).to_string();
        Self {
            id: id.into(),
            smtp_host: format!("smtp.{domain}"),
            smtp_port: 465,
            smtp_username: address.clone(),
            smtp_password: String::new(),
            address,
            domain,
            display_name: String::new(),
            security: TransportSecurity::Implicit,
            outbound_enabled: false,
        }
    }
}
