//! Bulk-mail detection.
//!
//! Header checks only run when the message shows no sign of having been
//! forwarded by a person, since forwarding rewrites exactly the headers they
//! look at. Sender heuristics run regardless.

use crate::model::address::{canonicalize, domain_of, local_part, EmailAddress};

use super::RuleContext;

/// Ordered bulk checks; the first reason wins.
pub fn detect(ctx: &RuleContext<'_>) -> Option<String> {
    if !is_forwarded(ctx) {
        let header_checks: [fn(&RuleContext<'_>) -> Option<String>; 5] = [
            reply_to_mismatch,
            return_path_mismatch,
            list_unsubscribe,
            bulk_precedence,
            sender_mismatch,
        ];
        if let Some(reason) = header_checks.iter().find_map(|check| check(ctx)) {
            return Some(reason);
        }
    }

    let sender_checks: [fn(&RuleContext<'_>) -> Option<String>; 3] =
        [role_account, system_generated_local, sending_subdomain];
    sender_checks.iter().find_map(|check| check(ctx))
}

/// `Resent-From`, `X-Forwarded-*` or a forward marker in the subject.
pub fn is_forwarded(ctx: &RuleContext<'_>) -> bool {
    if ["resent-from", "x-forwarded-for", "x-forwarded-to"]
        .iter()
        .any(|h| ctx.headers.contains(h))
    {
        return true;
    }
    let subject = ctx.message.subject.trim_start().to_lowercase();
    ["fwd:", "fw:", "fwd :", "fw :", "[fwd"]
        .iter()
        .any(|m| subject.starts_with(m))
}

fn first_address(value: &str) -> Option<String> {
    EmailAddress::parse_list(value)
        .iter()
        .find_map(EmailAddress::canonical)
}

fn reply_to_mismatch(ctx: &RuleContext<'_>) -> Option<String> {
    let reply_to = first_address(ctx.headers.get("reply-to")?)?;
    (!ctx.message.from_address.is_empty() && reply_to != ctx.message.from_address)
        .then(|| format!("reply-to {reply_to} differs from sender"))
}

fn return_path_mismatch(ctx: &RuleContext<'_>) -> Option<String> {
    let raw = ctx.headers.get("return-path")?;
    let path = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    if path.is_empty() {
        return Some("empty return-path".to_string());
    }
    let from_domain = domain_of(&ctx.message.from_address);
    let path_domain = canonicalize(path)
        .map(|p| domain_of(&p).to_string())
        .unwrap_or_default();
    (!from_domain.is_empty() && !path_domain.is_empty() && path_domain != from_domain)
        .then(|| format!("return-path domain {path_domain} differs from {from_domain}"))
}

fn list_unsubscribe(ctx: &RuleContext<'_>) -> Option<String> {
    ctx.headers
        .contains("list-unsubscribe")
        .then(|| "list-unsubscribe header".to_string())
}

fn bulk_precedence(ctx: &RuleContext<'_>) -> Option<String> {
    let precedence = ctx.headers.get_lower("precedence");
    matches!(precedence.as_str(), "bulk" | "list" | "junk")
        .then(|| format!("precedence: {precedence}"))
}

fn sender_mismatch(ctx: &RuleContext<'_>) -> Option<String> {
    let sender = first_address(ctx.headers.get("sender")?)?;
    (!ctx.message.from_address.is_empty() && sender != ctx.message.from_address)
        .then(|| format!("sender {sender} differs from from"))
}

fn role_account(ctx: &RuleContext<'_>) -> Option<String> {
    let local = local_part(&ctx.message.from_address);
    let base = local.split('+').next().unwrap_or(local);
    ctx.dictionaries
        .is_role_account(base)
        .then(|| format!("role account {base}"))
}

/// Tracking tokens and VERP-style local parts (`bounces+a1b2c3=...`,
/// `msprvs1=...`, long digit runs).
fn system_generated_local(ctx: &RuleContext<'_>) -> Option<String> {
    let local = local_part(&ctx.message.from_address);
    if local.is_empty() {
        return None;
    }
    let digits = local.chars().filter(char::is_ascii_digit).count();
    let looks_generated = local.contains('=')
        || local.starts_with("bounce")
        || digits >= 8
        || (local.len() >= 20 && local.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    looks_generated.then(|| format!("system-generated local part {local}"))
}

fn sending_subdomain(ctx: &RuleContext<'_>) -> Option<String> {
    let domain = domain_of(&ctx.message.from_address);
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    super::dictionary::SENDING_SUBDOMAINS
        .contains(&labels[0])
        .then(|| format!("sending subdomain {domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::dictionary::Dictionaries;
    use crate::model::message::{Direction, Message};
    use crate::parser::header::HeaderMap;

    fn check(from: &str, subject: &str, headers: &[(&str, &str)]) -> Option<String> {
        let mut msg = Message::new("mbx", Direction::Inbound);
        msg.from_address = from.to_string();
        msg.subject = subject.to_string();
        let headers = HeaderMap::from_pairs(headers.iter().copied());
        let dictionaries = Dictionaries::default();
        detect(&RuleContext {
            message: &msg,
            headers: &headers,
            has_delivery_status: false,
            dictionaries: &dictionaries,
        })
    }

    #[test]
    fn test_header_signals() {
        assert!(check("a@shop.com", "Sale", &[("List-Unsubscribe", "<mailto:u@shop.com>")]).is_some());
        assert!(check("a@shop.com", "Sale", &[("Precedence", "Bulk")]).is_some());
        assert!(check("a@shop.com", "Sale", &[("Reply-To", "b@other.com")]).is_some());
        assert!(check("a@shop.com", "Sale", &[("Return-Path", "<>")]).is_some());
        assert!(check("a@shop.com", "Sale", &[("Return-Path", "<x@esp.net>")]).is_some());
        assert!(check("a@shop.com", "Sale", &[("Sender", "esp@esp.net")]).is_some());
    }

    #[test]
    fn test_matching_headers_are_not_bulk() {
        assert_eq!(
            check(
                "alice@acme.com",
                "Lunch",
                &[("Reply-To", "Alice <ALICE@acme.com>"), ("Return-Path", "<alice@acme.com>")]
            ),
            None
        );
    }

    #[test]
    fn test_forwarding_suppresses_header_checks_only() {
        assert_eq!(
            check("alice@acme.com", "Fwd: Sale", &[("List-Unsubscribe", "<x>")]),
            None
        );
        assert_eq!(
            check("alice@acme.com", "Sale", &[("X-Forwarded-For", "bob@acme.com"), ("Precedence", "bulk")]),
            None
        );
        assert!(check("noreply@acme.com", "Fwd: Sale", &[]).is_some());
    }

    #[test]
    fn test_sender_heuristics() {
        assert!(check("no-reply@acme.com", "Hi", &[]).is_some());
        assert!(check("newsletter+eu@acme.com", "Hi", &[]).is_some());
        assert!(check("msprvs1=abc=bounces@acme.com", "Hi", &[]).is_some());
        assert!(check("user20240101123@acme.com", "Hi", &[]).is_some());
        assert!(check("ceo@news.acme.com", "Hi", &[]).is_some());
        assert_eq!(check("ceo@acme.com", "Hi", &[]), None);
        assert_eq!(check("ceo@acme.co.uk", "Hi", &[]), None);
    }
}
