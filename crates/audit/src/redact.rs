//! PII scrubbing for audit payloads: field names in the sensitive set are
//! replaced wholesale; remaining strings go through pattern detectors for
//! emails, phone numbers and 16-digit card numbers.

use std::sync::LazyLock;

use regex::Regex;

pub const EMAIL_TOKEN: &str = "[EMAIL_REDACTED]";
pub const PHONE_TOKEN: &str = "[PHONE_REDACTED]";
pub const CARD_TOKEN: &str = "[CARD_REDACTED]";
pub const FIELD_TOKEN: &str = "[PII_REDACTED]";

/// Field names whose values are dropped regardless of content. Kept in sync
/// with the column policy's PII set.
const PII_FIELDS: &[&str] = &[
    "email",
    "phone",
    "address",
    "address_line1",
    "address_line2",
    "contact_name",
    "card_last_four",
    "ssn",
    "tax_id",
];

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email pattern")
});

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").expect("phone pattern")
});

static CARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").expect("card pattern")
});

fn is_pii_field(key: &str) -> bool {
    PII_FIELDS
        .iter()
        .any(|field| field.eq_ignore_ascii_case(key))
}

/// Scrub one string through the pattern detectors. Card numbers run first
/// so a 16-digit number is not half-eaten by the phone pattern.
pub fn redact_text(text: &str) -> String {
    let result = CARD_RE.replace_all(text, CARD_TOKEN);
    let result = EMAIL_RE.replace_all(&result, EMAIL_TOKEN);
    PHONE_RE.replace_all(&result, PHONE_TOKEN).into_owned()
}

pub fn redact_value(value: &serde_json::Value) -> serde_json::Value {
    redact_value_preserving(value, &[])
}

/// Scrub a JSON tree. Top-level keys listed in `preserve_keys` keep their
/// value verbatim (the SQL query text is itself audit evidence).
pub fn redact_value_preserving(
    value: &serde_json::Value,
    preserve_keys: &[&str],
) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                if preserve_keys.iter().any(|p| p.eq_ignore_ascii_case(key)) {
                    out.insert(key.clone(), item.clone());
                } else if is_pii_field(key) && !item.is_null() {
                    out.insert(key.clone(), serde_json::Value::String(FIELD_TOKEN.to_string()));
                } else {
                    out.insert(key.clone(), redact_value_preserving(item, &[]));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| redact_value_preserving(item, &[]))
                .collect(),
        ),
        serde_json::Value::String(s) => serde_json::Value::String(redact_text(s)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_emails_phones_and_cards() {
        assert_eq!(
            redact_text("reach ana.lyst@example.com or 415-555-0134"),
            format!("reach {} or {}", EMAIL_TOKEN, PHONE_TOKEN)
        );
        assert_eq!(redact_text("card 4111 1111 1111 1111 on file"), format!("card {} on file", CARD_TOKEN));
        assert_eq!(redact_text("nothing sensitive here"), "nothing sensitive here");
    }

    #[test]
    fn card_pattern_wins_over_phone_pattern() {
        let out = redact_text("4111-1111-1111-1111");
        assert_eq!(out, CARD_TOKEN);
        assert!(!out.contains(PHONE_TOKEN));
    }

    #[test]
    fn pii_field_names_are_dropped_case_insensitively() {
        let value = serde_json::json!({
            "Email": "ana.lyst@example.com",
            "SSN": "123-45-6789",
            "mrr": 4200,
        });
        let redacted = redact_value(&value);
        assert_eq!(redacted["Email"], FIELD_TOKEN);
        assert_eq!(redacted["SSN"], FIELD_TOKEN);
        assert_eq!(redacted["mrr"], 4200);
    }

    #[test]
    fn nested_structures_are_traversed() {
        let value = serde_json::json!({
            "rows": [
                {"email": "a@b.co", "note": "call 415-555-0134"},
                {"email": null}
            ]
        });
        let redacted = redact_value(&value);
        assert_eq!(redacted["rows"][0]["email"], FIELD_TOKEN);
        assert_eq!(
            redacted["rows"][0]["note"],
            format!("call {}", PHONE_TOKEN)
        );
        assert_eq!(redacted["rows"][1]["email"], serde_json::Value::Null);
    }

    #[test]
    fn preserved_keys_keep_query_text_verbatim() {
        let value = serde_json::json!({
            "query": "SELECT email FROM reporting.customers LIMIT 10",
            "note": "owner is a@b.co",
        });
        let redacted = redact_value_preserving(&value, &["query"]);
        assert_eq!(
            redacted["query"],
            "SELECT email FROM reporting.customers LIMIT 10"
        );
        assert_eq!(redacted["note"], format!("owner is {}", EMAIL_TOKEN));
    }

    #[test]
    fn redacted_output_never_contains_the_original_match() {
        let inputs = [
            "ana.lyst@example.com",
            "415.555.0134",
            "4111111111111111",
        ];
        for input in inputs {
            let out = redact_text(&format!("x {} y", input));
            assert!(!out.contains(input), "{} survived redaction", input);
        }
    }
}
