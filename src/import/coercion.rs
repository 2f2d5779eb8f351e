//! Custom field coercion.
//!
//! Sheet cells arrive as strings. Custom field columns are turned into typed
//! values here, following the column key:
//!
//! - `Birthdate mm/dd/yyyy` carries a date hint and is parsed as a date
//! - `Append Tags` appends to a `;` separated multivalue field
//! - `CLEAR IT` / `CLEARIT` queues the field for nulling
//! - `true` / `false` / `x` become booleans
//!
//! Anything else is assigned verbatim.

use crate::models::{CrmRecord, FieldValue};
use chrono::{Datelike, NaiveDate};

/// Cell values that clear a field instead of setting it.
pub const CLEAR_TOKENS: [&str; 2] = ["CLEAR IT", "CLEARIT"];

/// Column key prefix marking an append to a multivalue field.
pub const APPEND_PREFIX: &str = "Append ";

/// A date format a column key may name as a trailing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatePattern {
    pub token: &'static str,
    format: &'static str,
}

/// Supported date patterns, in the order they are tried.
pub const DATE_PATTERNS: [DatePattern; 6] = [
    DatePattern { token: "dd/mm/yyyy", format: "%d/%m/%Y" },
    DatePattern { token: "dd-mm-yyyy", format: "%d-%m-%Y" },
    DatePattern { token: "mm/dd/yyyy", format: "%m/%d/%Y" },
    DatePattern { token: "mm/dd/yy", format: "%m/%d/%y" },
    DatePattern { token: "mm-dd-yyyy", format: "%m-%d-%Y" },
    DatePattern { token: "yyyy-mm-dd", format: "%Y-%m-%d" },
];

impl DatePattern {
    fn parse(&self, value: &str) -> Option<NaiveDate> {
        let date = NaiveDate::parse_from_str(value, self.format).ok()?;
        // Four-digit patterns happily accept "24" as the year 24.
        if self.token.ends_with("yyyy") || self.token.starts_with("yyyy") {
            (date.year() >= 1000).then_some(date)
        } else {
            Some(date)
        }
    }
}

/// Result of coercing one custom field cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Set { field: String, value: FieldValue },
    Clear { field: String },
    InvalidDate { field: String, value: String },
}

pub fn is_clear_token(value: &str) -> bool {
    CLEAR_TOKENS.contains(&value.trim())
}

/// Checkbox semantics used by campaign and flag columns.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "on" | "true" | "1"
    )
}

/// Split a trailing date pattern token off a column key.
///
/// ```rust
/// use crm_import::import::coercion::split_date_hint;
///
/// let (field, hint) = split_date_hint("Birthdate mm/dd/yyyy");
/// assert_eq!(field, "Birthdate");
/// assert_eq!(hint.map(|p| p.token), Some("mm/dd/yyyy"));
///
/// assert_eq!(split_date_hint("Nickname").1, None);
/// ```
pub fn split_date_hint(key: &str) -> (&str, Option<DatePattern>) {
    for pattern in DATE_PATTERNS {
        if let Some(field) = key.strip_suffix(pattern.token) {
            return (field.trim_end(), Some(pattern));
        }
    }
    (key, None)
}

/// Parse a date, trying the hinted pattern first and then every pattern in order.
pub fn parse_date(value: &str, hint: Option<DatePattern>) -> Option<NaiveDate> {
    let value = value.trim();
    hint.into_iter()
        .chain(DATE_PATTERNS.into_iter().filter(|p| Some(*p) != hint))
        .find_map(|pattern| pattern.parse(value))
}

/// Parse a currency cell: `$` and `,` are stripped, the result rounded to cents.
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value.chars().filter(|c| *c != '$' && *c != ',').collect();
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite())
        .map(|amount| (amount * 100.0).round() / 100.0)
}

/// Coerce a custom field cell against the field's current value.
///
/// # Arguments
/// * `key` - column key after the `<Entity> Custom ` prefix
/// * `raw` - trimmed, non-empty cell value
/// * `current` - the field's existing text value, used by append keys
pub fn coerce_value(key: &str, raw: &str, current: Option<&str>) -> Coerced {
    let (key, append) = match key.strip_prefix(APPEND_PREFIX) {
        Some(rest) => (rest, true),
        None => (key, false),
    };
    let (field, hint) = split_date_hint(key);
    let field = field.to_string();

    if is_clear_token(raw) {
        return Coerced::Clear { field };
    }

    if hint.is_some() {
        return match parse_date(raw, hint) {
            Some(date) => Coerced::Set {
                field,
                value: FieldValue::Date(date),
            },
            None => Coerced::InvalidDate {
                field,
                value: raw.to_string(),
            },
        };
    }

    if append {
        let value = match current.filter(|c| !c.is_empty()) {
            Some(existing) if existing.split(';').any(|v| v.trim() == raw) => existing.to_string(),
            Some(existing) => format!("{};{}", existing, raw),
            None => raw.to_string(),
        };
        return Coerced::Set {
            field,
            value: FieldValue::Text(value),
        };
    }

    let value = match raw.to_ascii_lowercase().as_str() {
        "true" => FieldValue::Bool(true),
        "false" => FieldValue::Bool(false),
        _ if raw == "x" || raw == "X" => FieldValue::Bool(true),
        _ => FieldValue::Text(raw.to_string()),
    };
    Coerced::Set { field, value }
}

/// Apply every custom field cell of a row to a record.
///
/// Appends read the value already staged on `record` first, then `existing`.
/// Returns the number of fields that failed to coerce.
pub fn apply_custom_fields<'a>(
    record: &mut CrmRecord,
    existing: Option<&CrmRecord>,
    cells: impl IntoIterator<Item = (&'a str, &'a str)>,
    row: usize,
) -> usize {
    let mut failures = 0;
    for (key, raw) in cells {
        let current = {
            let field = split_date_hint(key.strip_prefix(APPEND_PREFIX).unwrap_or(key)).0;
            record
                .fields
                .get(field)
                .or_else(|| existing.and_then(|e| e.fields.get(field)))
                .map(|v| v.to_string())
        };

        match coerce_value(key, raw, current.as_deref()) {
            Coerced::Set { field, value } => record.set(field, value),
            Coerced::Clear { field } => record.null_field(&field),
            Coerced::InvalidDate { field, value } => {
                log::warn!(
                    "row {}: could not parse date '{}' for {} {}, leaving it unset",
                    row,
                    value,
                    record.kind,
                    field
                );
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn set(field: &str, value: FieldValue) -> Coerced {
        Coerced::Set {
            field: field.to_string(),
            value,
        }
    }

    #[test]
    fn test_date_hint_uses_named_pattern() {
        assert_eq!(
            coerce_value("Birthdate dd/mm/yyyy", "03/04/2020", None),
            set("Birthdate", NaiveDate::from_ymd_opt(2020, 4, 3).unwrap().into())
        );
        assert_eq!(
            coerce_value("Birthdate mm/dd/yyyy", "03/04/2020", None),
            set("Birthdate", NaiveDate::from_ymd_opt(2020, 3, 4).unwrap().into())
        );
    }

    #[test]
    fn test_date_hint_falls_back_to_other_patterns() {
        assert_eq!(
            coerce_value("Joined dd/mm/yyyy", "2021-12-31", None),
            set("Joined", NaiveDate::from_ymd_opt(2021, 12, 31).unwrap().into())
        );
    }

    #[test]
    fn test_two_digit_year() {
        assert_eq!(
            parse_date("12/25/99", split_date_hint("X mm/dd/yy").1),
            NaiveDate::from_ymd_opt(1999, 12, 25)
        );
    }

    #[test]
    fn test_unparsable_date_is_reported() {
        assert_eq!(
            coerce_value("Birthdate mm/dd/yyyy", "someday", None),
            Coerced::InvalidDate {
                field: "Birthdate".to_string(),
                value: "someday".to_string()
            }
        );
    }

    #[test]
    fn test_booleans() {
        assert_eq!(coerce_value("Vip", "TRUE", None), set("Vip", true.into()));
        assert_eq!(coerce_value("Vip", "false", None), set("Vip", false.into()));
        assert_eq!(coerce_value("Vip", "x", None), set("Vip", true.into()));
        assert_eq!(coerce_value("Vip", "yes", None), set("Vip", "yes".into()));
    }

    #[test]
    fn test_clear_tokens() {
        for token in CLEAR_TOKENS {
            assert_eq!(
                coerce_value("Nickname", token, None),
                Coerced::Clear {
                    field: "Nickname".to_string()
                }
            );
        }
        assert_eq!(
            coerce_value("Append Tags", "CLEARIT", Some("a;b")),
            Coerced::Clear {
                field: "Tags".to_string()
            }
        );
    }

    #[test]
    fn test_append_skips_existing_value() {
        assert_eq!(coerce_value("Append Tags", "Gold", None), set("Tags", "Gold".into()));
        assert_eq!(
            coerce_value("Append Tags", "Gold", Some("Silver")),
            set("Tags", "Silver;Gold".into())
        );
        assert_eq!(
            coerce_value("Append Tags", "Gold", Some("Silver;Gold")),
            set("Tags", "Silver;Gold".into())
        );
    }

    #[test]
    fn test_append_compares_whole_entries() {
        assert_eq!(
            coerce_value("Append Tags", "Tag", Some("Tags")),
            set("Tags", "Tags;Tag".into())
        );
        assert_eq!(
            coerce_value("Append Tags", "Tag", Some("Tags; Tag")),
            set("Tags", "Tags; Tag".into())
        );
    }

    #[test]
    fn test_verbatim_value() {
        assert_eq!(coerce_value("Nickname", "Jo", None), set("Nickname", "Jo".into()));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("$1,250.456"), Some(1250.46));
        assert_eq!(parse_amount("25"), Some(25.0));
        assert_eq!(parse_amount("twenty"), None);
    }

    #[test]
    fn test_apply_custom_fields_appends_against_existing_record() {
        let mut existing = CrmRecord::with_id(EntityKind::Contact, "003");
        existing.set("Tags", "Silver");
        let mut record = CrmRecord::with_id(EntityKind::Contact, "003");

        let failures = apply_custom_fields(
            &mut record,
            Some(&existing),
            [("Append Tags", "Gold"), ("Since mm/dd/yyyy", "nope"), ("Nickname", "CLEAR IT")],
            2,
        );

        assert_eq!(failures, 1);
        assert_eq!(record.text("Tags"), Some("Silver;Gold"));
        assert!(record.fields.get("Since").is_none());
        assert_eq!(record.fields_to_null, vec!["Nickname".to_string()]);
    }
}
