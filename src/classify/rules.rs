//! Bounce, autoresponder, internal and sensitive rules.

use crate::model::address::{domain_of, local_part};

use super::dictionary::{sensitive_keyword, sensitive_marker};
use super::RuleContext;

pub fn bounce(ctx: &RuleContext<'_>) -> Option<String> {
    if ctx.headers.contains("x-failed-recipients") {
        return Some("x-failed-recipients header".to_string());
    }

    let content_type = ctx.headers.get_lower("content-type");
    if content_type.contains("multipart/report") && content_type.contains("delivery-status") {
        return Some("delivery status report".to_string());
    }
    if ctx.has_delivery_status || content_type.contains("message/delivery-status") {
        return Some("delivery status part".to_string());
    }

    let return_path = ctx.headers.get_lower("return-path");
    let from = ctx.message.from_address.to_lowercase();
    for candidate in [return_path.as_str(), from.as_str()] {
        let local = local_part(candidate.trim_matches(['<', '>']));
        if local.contains("mailer-daemon") || local.contains("postmaster") {
            return Some(format!("daemon sender {local}"));
        }
    }

    let subject = ctx.message.subject.to_lowercase();
    ctx.dictionaries
        .bounce_phrase(&subject)
        .map(|phrase| format!("bounce subject \"{phrase}\""))
}

pub fn autoresponder(ctx: &RuleContext<'_>) -> Option<String> {
    for header in ["x-autoreply", "x-autorespond", "x-autoresponse", "x-loop"] {
        if ctx.headers.contains(header) {
            return Some(format!("{header} header"));
        }
    }
    if ctx.headers.get_lower("precedence") == "auto_reply" {
        return Some("precedence: auto_reply".to_string());
    }
    let auto_submitted = ctx.headers.get_lower("auto-submitted");
    auto_submitted
        .starts_with("auto-replied")
        .then(|| "auto-submitted: auto-replied".to_string())
}

pub fn internal(ctx: &RuleContext<'_>) -> Option<String> {
    let domain = domain_of(&ctx.message.from_address);
    if domain.is_empty() || ctx.dictionaries.is_free_mail(domain) {
        return None;
    }
    let recipients = ctx.message.recipients();
    if recipients.is_empty() {
        return None;
    }
    recipients
        .iter()
        .all(|r| domain_of(r) == domain)
        .then(|| format!("all recipients on {domain}"))
}

pub fn sensitive(ctx: &RuleContext<'_>) -> Option<String> {
    let subject = ctx.message.subject.to_lowercase();
    if let Some(marker) = sensitive_marker(&subject) {
        return Some(format!("marker {marker}"));
    }
    sensitive_keyword(&subject).map(|(category, keyword)| format!("{category}: {keyword}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::dictionary::Dictionaries;
    use crate::model::message::{Direction, Message};
    use crate::parser::header::HeaderMap;

    fn run(
        rule: fn(&RuleContext<'_>) -> Option<String>,
        msg: &Message,
        headers: &[(&str, &str)],
    ) -> Option<String> {
        let headers = HeaderMap::from_pairs(headers.iter().copied());
        let dictionaries = Dictionaries::default();
        rule(&RuleContext {
            message: msg,
            headers: &headers,
            has_delivery_status: false,
            dictionaries: &dictionaries,
        })
    }

    fn msg(from: &str, to: &[&str], subject: &str) -> Message {
        let mut m = Message::new("mbx", Direction::Inbound);
        m.from_address = from.to_string();
        m.to_addresses = to.iter().map(|s| s.to_string()).collect();
        m.subject = subject.to_string();
        m
    }

    #[test]
    fn test_bounce_signals() {
        let plain = msg("a@x.com", &["b@y.com"], "Hello");
        assert!(run(bounce, &plain, &[("X-Failed-Recipients", "b@y.com")]).is_some());
        assert!(run(
            bounce,
            &plain,
            &[("Content-Type", "multipart/report; report-type=delivery-status; boundary=x")]
        )
        .is_some());
        assert!(run(bounce, &msg("MAILER-DAEMON@x.com", &[], "Hi"), &[]).is_some());
        assert!(run(bounce, &plain, &[("Return-Path", "<postmaster@y.com>")]).is_some());
        assert!(run(bounce, &msg("a@x.com", &[], "Undeliverable: Hello"), &[]).is_some());
        assert_eq!(run(bounce, &plain, &[]), None);
    }

    #[test]
    fn test_bounce_from_delivery_status_part() {
        let m = msg("notifications@relay.net", &["b@y.com"], "Your message");
        let headers = HeaderMap::from_pairs([("Content-Type", "multipart/mixed; boundary=x")]);
        let dictionaries = Dictionaries::default();
        let reason = bounce(&RuleContext {
            message: &m,
            headers: &headers,
            has_delivery_status: true,
            dictionaries: &dictionaries,
        });
        assert_eq!(reason.as_deref(), Some("delivery status part"));
    }

    #[test]
    fn test_autoresponder_signals() {
        let m = msg("a@x.com", &["b@y.com"], "Out of office");
        assert!(run(autoresponder, &m, &[("X-Autoreply", "yes")]).is_some());
        assert!(run(autoresponder, &m, &[("X-Loop", "a@x.com")]).is_some());
        assert!(run(autoresponder, &m, &[("Precedence", "auto_reply")]).is_some());
        assert!(run(autoresponder, &m, &[("Auto-Submitted", "auto-replied (vacation)")]).is_some());
        assert_eq!(run(autoresponder, &m, &[("Auto-Submitted", "no")]), None);
    }

    #[test]
    fn test_internal_requires_shared_corporate_domain() {
        assert!(run(internal, &msg("a@acme.com", &["b@acme.com", "c@acme.com"], "x"), &[]).is_some());
        assert_eq!(run(internal, &msg("a@acme.com", &["b@acme.com", "c@other.com"], "x"), &[]), None);
        assert_eq!(run(internal, &msg("a@gmail.com", &["b@gmail.com"], "x"), &[]), None);
        assert_eq!(run(internal, &msg("a@acme.com", &[], "x"), &[]), None);
    }

    #[test]
    fn test_sensitive_reason_names_category() {
        let m = msg("a@x.com", &["b@y.com"], "Payroll adjustments for March");
        assert_eq!(run(sensitive, &m, &[]).as_deref(), Some("financial: payroll"));
        let m = msg("a@x.com", &["b@y.com"], "***RESTRICTED*** board notes");
        assert_eq!(run(sensitive, &m, &[]).as_deref(), Some("marker ***restricted***"));
    }
}
