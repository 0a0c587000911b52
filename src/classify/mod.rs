//! Heuristic message classification.
//!
//! Rules run in a fixed order and the first one that fires decides:
//! bounce, autoresponder, bulk, internal, sensitive, otherwise ok.

pub mod bulk;
pub mod dictionary;
pub mod rules;

use serde::Serialize;

use crate::config::ClassifierConfig;
use crate::model::message::{Classification, Message};
use crate::parser::header::HeaderMap;
use crate::parser::normalize::Normalized;

use self::dictionary::Dictionaries;

/// Inputs every rule sees.
pub struct RuleContext<'a> {
    pub message: &'a Message,
    pub headers: &'a HeaderMap,
    /// A `message/delivery-status` part was found in the body.
    pub has_delivery_status: bool,
    pub dictionaries: &'a Dictionaries,
}

/// A rule returns the reason it matched.
pub type Rule = fn(&RuleContext<'_>) -> Option<String>;

/// The rule chain, in precedence order.
pub const RULES: &[(Classification, Rule)] = &[
    (Classification::Bounce, rules::bounce),
    (Classification::Autoresponder, rules::autoresponder),
    (Classification::Bulk, bulk::detect),
    (Classification::Internal, rules::internal),
    (Classification::Sensitive, rules::sensitive),
];

/// Outcome of classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub classification: Classification,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    dictionaries: Dictionaries,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            dictionaries: Dictionaries::from_config(config),
        }
    }

    /// Classify a normalized message, body signals included.
    pub fn classify_normalized(&self, normalized: &Normalized) -> Verdict {
        Self::run(RuleContext {
            message: &normalized.message,
            headers: &normalized.headers,
            has_delivery_status: normalized.has_delivery_status,
            dictionaries: &self.dictionaries,
        })
    }

    /// Classify from the message and its headers alone.
    pub fn classify(&self, message: &Message, headers: &HeaderMap) -> Verdict {
        Self::run(RuleContext {
            message,
            headers,
            has_delivery_status: false,
            dictionaries: &self.dictionaries,
        })
    }

    fn run(ctx: RuleContext<'_>) -> Verdict {
        RULES
            .iter()
            .find_map(|(class, rule)| {
                rule(&ctx).map(|reason| Verdict {
                    classification: *class,
                    reason,
                })
            })
            .unwrap_or(Verdict {
                classification: Classification::Ok,
                reason: String::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::Direction;

    fn classify(from: &str, to: &[&str], subject: &str, headers: &[(&str, &str)]) -> Verdict {
        let mut msg = Message::new("mbx", Direction::Inbound);
        msg.from_address = from.to_string();
        msg.to_addresses = to.iter().map(|s| s.to_string()).collect();
        msg.subject = subject.to_string();
        Classifier::default().classify(&msg, &HeaderMap::from_pairs(headers.iter().copied()))
    }

    #[test]
    fn test_plain_personal_mail_is_ok() {
        let v = classify("alice@acme.com", &["bob@other.org"], "Lunch tomorrow?", &[]);
        assert_eq!(v.classification, Classification::Ok);
        assert!(v.reason.is_empty());
    }

    #[test]
    fn test_bulk_wins_over_sensitive() {
        let v = classify(
            "alice@acme.com",
            &["bob@other.org"],
            "Confidential: merger plans",
            &[("List-Unsubscribe", "<https://acme.com/u>")],
        );
        assert_eq!(v.classification, Classification::Bulk);
    }

    #[test]
    fn test_bounce_wins_over_autoresponder() {
        let v = classify(
            "mailer-daemon@acme.com",
            &["bob@other.org"],
            "Delivery Status Notification",
            &[("Auto-Submitted", "auto-replied")],
        );
        assert_eq!(v.classification, Classification::Bounce);
    }

    #[test]
    fn test_internal_wins_over_sensitive() {
        let v = classify("alice@acme.com", &["bob@acme.com"], "Salary review", &[]);
        assert_eq!(v.classification, Classification::Internal);
    }

    #[test]
    fn test_sensitive_between_domains() {
        let v = classify("alice@acme.com", &["bob@other.org"], "Salary review", &[]);
        assert_eq!(v.classification, Classification::Sensitive);
        assert_eq!(v.reason, "financial: salary");
    }
}
