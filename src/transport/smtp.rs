//! SMTP delivery through `lettre`.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::debug;

use super::{MailTransport, SendEnvelope};
use crate::config::TransportConfig;
use crate::error::{MailError, Result};
use crate::model::mailbox::{Mailbox, TransportSecurity};

/// Sends through each mailbox's own SMTP server.
///
/// The security mode comes from the mailbox record; it is never auto-detected.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    timeout: Duration,
    hello_name: Option<String>,
}

impl SmtpTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            timeout: config.timeout(),
            hello_name: config.hello_name.clone(),
        }
    }

    fn build(&self, mailbox: &Mailbox) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = mailbox.smtp_host.as_str();
        let builder = match mailbox.security {
            TransportSecurity::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(host),
            TransportSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            }
        }
        .map_err(|e| MailError::Transport(format!("invalid SMTP host '{host}': {e}")))?;

        let mut builder = builder
            .port(mailbox.smtp_port)
            .timeout(Some(self.timeout));
        if !mailbox.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                mailbox.smtp_username.clone(),
                mailbox.smtp_password.clone(),
            ));
        }
        if let Some(name) = &self.hello_name {
            builder = builder.hello_name(ClientId::Domain(name.clone()));
        }
        Ok(builder.build())
    }
}

/// Convert to `lettre`'s validated envelope.
pub fn lettre_envelope(envelope: &SendEnvelope) -> Result<Envelope> {
    let parse = |addr: &str| {
        addr.parse::<Address>()
            .map_err(|e| MailError::validation(format!("invalid address '{addr}': {e}")))
    };
    let from = parse(&envelope.from)?;
    let recipients = envelope
        .recipients
        .iter()
        .map(|r| parse(r))
        .collect::<Result<Vec<_>>>()?;
    Envelope::new(Some(from), recipients)
        .map_err(|e| MailError::validation(format!("invalid envelope: {e}")))
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, mailbox: &Mailbox, envelope: &SendEnvelope, raw: &[u8]) -> Result<()> {
        let envelope = lettre_envelope(envelope)?;
        let mailer = self.build(mailbox)?;
        debug!(
            host = %mailbox.smtp_host,
            port = mailbox.smtp_port,
            security = ?mailbox.security,
            "Connecting to SMTP server"
        );
        let response = mailer
            .send_raw(&envelope, raw)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        debug!(code = %response.code(), "SMTP server accepted message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lettre_envelope_includes_every_recipient() {
        let envelope = SendEnvelope {
            from: "team@acme.com".into(),
            recipients: vec!["a@x.com".into(), "hidden@y.com".into()],
        };
        let converted = lettre_envelope(&envelope).unwrap();
        assert_eq!(converted.to().len(), 2);
        assert_eq!(converted.from().map(|a| a.to_string()).as_deref(), Some("team@acme.com"));
    }

    #[test]
    fn test_lettre_envelope_rejects_bad_address() {
        let envelope = SendEnvelope {
            from: "not an address".into(),
            recipients: vec!["a@x.com".into()],
        };
        assert!(matches!(lettre_envelope(&envelope), Err(MailError::Validation(_))));
    }

    #[test]
    fn test_empty_recipients_rejected() {
        let envelope = SendEnvelope {
            from: "team@acme.com".into(),
            recipients: Vec::new(),
        };
        assert!(lettre_envelope(&envelope).is_err());
    }
}
