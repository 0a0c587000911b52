//! Word lists consulted by the classification rules.

use std::collections::HashSet;

use crate::config::ClassifierConfig;

/// Consumer mailbox providers. Mail between two addresses on one of these
/// domains is never "internal".
pub const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "yahoo.co.uk",
    "ymail.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "aol.com",
    "icloud.com",
    "me.com",
    "mac.com",
    "gmx.com",
    "gmx.de",
    "gmx.net",
    "web.de",
    "mail.com",
    "proton.me",
    "protonmail.com",
    "zoho.com",
    "yandex.com",
    "yandex.ru",
    "mail.ru",
    "qq.com",
    "163.com",
];

/// Local parts of shared, non-personal mailboxes.
pub const ROLE_ACCOUNTS: &[&str] = &[
    "noreply",
    "no-reply",
    "no_reply",
    "donotreply",
    "do-not-reply",
    "do_not_reply",
    "notifications",
    "notification",
    "notify",
    "newsletter",
    "newsletters",
    "news",
    "marketing",
    "updates",
    "mailer",
    "alerts",
    "digest",
    "promo",
    "promotions",
    "offers",
    "deals",
];

/// Leading labels of dedicated sending subdomains (`news.example.com`).
pub const SENDING_SUBDOMAINS: &[&str] = &[
    "mail", "email", "e", "em", "news", "newsletter", "mg", "send", "bounce", "bounces", "mkt",
    "mailer", "marketing", "campaign", "info",
];

/// Subject phrases of delivery failure notices.
pub const BOUNCE_PHRASES: &[&str] = &[
    "undeliverable",
    "undelivered mail",
    "delivery status notification",
    "delivery failure",
    "delivery has failed",
    "failure notice",
    "mail delivery failed",
    "mail delivery subsystem",
    "returned mail",
    "returned to sender",
    "could not be delivered",
    "message not delivered",
    "nondeliverable",
    "non-delivery",
    "unzustellbar",
    "no se puede entregar",
    "non recapitabile",
];

/// Sensitive subject keywords, by category.
pub const SENSITIVE_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "confidentiality",
        &["confidential", "privileged", "proprietary", "do not forward", "internal only", "nda"],
    ),
    (
        "financial",
        &["bank account", "wire transfer", "iban", "salary", "payroll", "tax return", "earnings"],
    ),
    (
        "legal",
        &["lawsuit", "litigation", "subpoena", "settlement", "attorney-client", "legal hold"],
    ),
    (
        "personal",
        &["passport", "social security", "ssn", "medical", "diagnosis", "date of birth"],
    ),
    (
        "security",
        &["password", "credentials", "security incident", "breach", "vulnerability", "2fa code"],
    ),
    (
        "m&a",
        &["merger", "acquisition", "due diligence", "term sheet", "letter of intent"],
    ),
    (
        "hr",
        &["termination", "disciplinary", "performance review", "layoff", "grievance", "resignation"],
    ),
];

/// Explicit classification markers, matched anywhere in the subject.
pub const SENSITIVE_MARKERS: &[&str] = &[
    "[confidential]",
    "[restricted]",
    "[secret]",
    "***restricted***",
    "***confidential***",
    "top secret",
    "strictly confidential",
    "classification: confidential",
    "classification: restricted",
];

/// Built-in lists plus configured additions, lower-cased.
#[derive(Debug, Clone)]
pub struct Dictionaries {
    pub free_mail_domains: HashSet<String>,
    pub role_accounts: HashSet<String>,
    pub bounce_phrases: Vec<String>,
}

impl Default for Dictionaries {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

impl Dictionaries {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let lower = |s: &String| s.trim().to_lowercase();
        Self {
            free_mail_domains: FREE_MAIL_DOMAINS
                .iter()
                .map(|s| s.to_string())
                .chain(config.extra_free_mail_domains.iter().map(lower))
                .collect(),
            role_accounts: ROLE_ACCOUNTS
                .iter()
                .map(|s| s.to_string())
                .chain(config.extra_role_accounts.iter().map(lower))
                .collect(),
            bounce_phrases: BOUNCE_PHRASES
                .iter()
                .map(|s| s.to_string())
                .chain(config.extra_bounce_phrases.iter().map(lower))
                .collect(),
        }
    }

    pub fn is_free_mail(&self, domain: &str) -> bool {
        self.free_mail_domains.contains(domain)
    }

    pub fn is_role_account(&self, local: &str) -> bool {
        self.role_accounts.contains(local)
    }

    /// First bounce phrase contained in `subject_lower`.
    pub fn bounce_phrase<'a>(&'a self, subject_lower: &str) -> Option<&'a str> {
        self.bounce_phrases
            .iter()
            .find(|p| subject_lower.contains(p.as_str()))
            .map(String::as_str)
    }
}

/// `(category, keyword)` of the first sensitive keyword in `subject_lower`,
/// matched on word boundaries.
pub fn sensitive_keyword(subject_lower: &str) -> Option<(&'static str, &'static str)> {
    SENSITIVE_CATEGORIES.iter().find_map(|(category, words)| {
        words
            .iter()
            .find(|w| contains_word(subject_lower, w))
            .map(|w| (*category, *w))
    })
}

/// First explicit marker present in `subject_lower`.
pub fn sensitive_marker(subject_lower: &str) -> Option<&'static str> {
    SENSITIVE_MARKERS
        .iter()
        .copied()
        .find(|m| subject_lower.contains(m))
}

/// `needle` occurs in `haystack` with no alphanumeric neighbours.
pub fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        if !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric) {
            return true;
        }
        from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}
