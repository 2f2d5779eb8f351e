//! Sheet rows and the header conventions used to read them.

use crate::import::coercion::{self, DatePattern, is_clear_token, is_truthy, split_date_hint};
use crate::models::{EntityKind, fields};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Columns whose values are tried as contact emails, primary first.
pub const EMAIL_COLUMNS: [&str; 4] = [
    "Contact Email",
    "Contact Personal Email",
    "Contact Work Email",
    "Contact Other Email",
];

/// Last name given to inserted contacts that have none.
pub const ANONYMOUS_LAST_NAME: &str = "Anonymous";

pub const PHONE_COLUMNS: [&str; 4] = [
    "Contact Phone",
    "Contact Home Phone",
    "Contact Mobile Phone",
    "Contact Work Phone",
];

static EMAIL_LIST_REGEX: OnceLock<Regex> = OnceLock::new();
static NON_ALPHANUMERIC_REGEX: OnceLock<Regex> = OnceLock::new();
static NON_DIGIT_REGEX: OnceLock<Regex> = OnceLock::new();

fn email_list_regex() -> &'static Regex {
    EMAIL_LIST_REGEX.get_or_init(|| Regex::new(r"[,;]").expect("Invalid email list regex"))
}

fn non_alphanumeric_regex() -> &'static Regex {
    NON_ALPHANUMERIC_REGEX
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9]").expect("Invalid street regex"))
}

fn non_digit_regex() -> &'static Regex {
    NON_DIGIT_REGEX.get_or_init(|| Regex::new(r"\D").expect("Invalid phone regex"))
}

/// Normalize an email cell: first list entry, lowercased, no whitespace.
///
/// ```rust
/// use crm_import::import::row::normalize_email;
///
/// assert_eq!(normalize_email(" Jane@X.com ; other@x.com"), Some("jane@x.com".to_string()));
/// assert_eq!(normalize_email("n/a"), None);
/// ```
pub fn normalize_email(value: &str) -> Option<String> {
    let first = email_list_regex().split(value).next().unwrap_or_default();
    let email: String = first
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if email.is_empty() || email == "na" || email == "n/a" || is_clear_token(value) {
        None
    } else {
        Some(email)
    }
}

/// Streets compare on lowercase alphanumerics only, so `123 Main St.` matches `123 main st`.
pub fn normalize_street(value: &str) -> String {
    non_alphanumeric_regex().replace_all(value, "").to_lowercase()
}

pub fn normalize_phone(value: &str) -> String {
    non_digit_regex().replace_all(value, "").to_string()
}

/// `Some Donor Name` -> (`Some Donor`, `Name`).
pub fn split_full_name(full_name: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = full_name.split_whitespace().collect();
    match parts.split_last() {
        None => (None, None),
        Some((last, [])) => (None, Some(last.to_string())),
        Some((last, rest)) => (Some(rest.join(" ")), Some(last.to_string())),
    }
}

/// A caller-supplied external reference cell: `<Entity> ExtRef <field>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtRef {
    pub field: String,
    pub value: String,
}

/// One `Organization N` column group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrganizationRef {
    pub slot: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub ext_refs: Vec<ExtRef>,
    /// `(field, value)` pairs for the organization's billing address.
    pub address: Vec<(&'static str, String)>,
}

/// A campaign membership requested by a row, by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignRef {
    Id(String),
    Name(String),
}

/// Who a campaign membership column group applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOwner {
    Account,
    Contact,
}

impl CampaignOwner {
    fn prefix(&self) -> &'static str {
        match self {
            CampaignOwner::Account => "Account Campaign",
            CampaignOwner::Contact => "Contact Campaign",
        }
    }
}

/// One data row of an import sheet.
#[derive(Debug, Clone)]
pub struct ImportRow {
    /// Sheet row number; headers are row 1, data starts at row 2.
    pub number: usize,
    raw: BTreeMap<String, String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Normalized emails from [`EMAIL_COLUMNS`], in column order.
    pub emails: Vec<String>,
    /// Set during the first pass when the row must be inserted in the second.
    pub deferred_to_second_pass: bool,
}

impl ImportRow {
    /// Build a row from `(header, cell)` pairs. Cells are trimmed; blank cells are dropped.
    pub fn new<K, V>(number: usize, cells: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: AsRef<str>,
    {
        let raw: BTreeMap<String, String> = cells
            .into_iter()
            .filter_map(|(k, v)| {
                let v = v.as_ref().trim();
                (!v.is_empty()).then(|| (k.into().trim().to_string(), v.to_string()))
            })
            .collect();

        let mut row = Self {
            number,
            raw,
            first_name: None,
            last_name: None,
            emails: Vec::new(),
            deferred_to_second_pass: false,
        };

        row.first_name = row.lookup_value("Contact First Name").map(str::to_string);
        row.last_name = row.lookup_value("Contact Last Name").map(str::to_string);
        if row.first_name.is_none() && row.last_name.is_none() {
            if let Some(full_name) = row.lookup_value("Contact Full Name") {
                let (first, last) = split_full_name(full_name);
                row.first_name = first;
                row.last_name = last;
            }
        }

        let mut emails: Vec<String> = Vec::new();
        for column in EMAIL_COLUMNS {
            if let Some(email) = row.value(column).and_then(normalize_email) {
                if !emails.contains(&email) {
                    emails.push(email);
                }
            }
        }
        row.emails = emails;
        row
    }

    /// Non-blank cell value.
    pub fn value(&self, column: &str) -> Option<&str> {
        self.raw.get(column).map(String::as_str)
    }

    /// Cell value usable as a lookup key: the clear sentinel never identifies anything.
    pub fn lookup_value(&self, column: &str) -> Option<&str> {
        self.value(column).filter(|v| !is_clear_token(v))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether any non-blank cell sits under a column starting with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.raw.keys().any(|k| k.starts_with(prefix))
    }

    pub fn is_truthy(&self, column: &str) -> bool {
        self.value(column).is_some_and(is_truthy)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.lookup_value("Account ID")
    }

    pub fn account_name(&self) -> Option<&str> {
        self.lookup_value("Account Name")
    }

    /// Account a second-pass insert lands in: `Account Name`, else `<Last><suffix>`.
    pub fn household_name(&self, suffix: &str) -> String {
        match self.account_name() {
            Some(name) => name.to_string(),
            None => format!(
                "{}{}",
                self.last_name.as_deref().unwrap_or(ANONYMOUS_LAST_NAME),
                suffix
            ),
        }
    }

    pub fn contact_id(&self) -> Option<&str> {
        self.lookup_value("Contact ID")
    }

    /// `First Last`, or whichever half is present.
    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        )
        .trim()
        .to_string()
    }

    /// Key into the contact by-name index, when both name halves are present.
    pub fn name_key(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last).to_lowercase()),
            _ => None,
        }
    }

    pub fn has_contact_lookup_key(&self) -> bool {
        self.contact_id().is_some()
            || !self.ext_refs(EntityKind::Contact).is_empty()
            || !self.emails.is_empty()
            || self.last_name.is_some()
    }

    /// Every `<Entity> ExtRef <field>` cell on the row, in column order.
    pub fn ext_refs(&self, kind: EntityKind) -> Vec<ExtRef> {
        let Some(prefix) = kind.column_prefix() else {
            return Vec::new();
        };
        let prefix = format!("{} ExtRef ", prefix);
        self.ext_refs_with_prefix(&prefix)
    }

    fn ext_refs_with_prefix(&self, prefix: &str) -> Vec<ExtRef> {
        self.raw
            .iter()
            .filter(|(_, v)| !is_clear_token(v))
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix).map(|field| ExtRef {
                    field: field.to_string(),
                    value: v.clone(),
                })
            })
            .collect()
    }

    /// `(key, value)` cells of `<Entity> Custom <key>` columns.
    pub fn custom_fields(&self, kind: EntityKind) -> Vec<(&str, &str)> {
        let Some(prefix) = kind.column_prefix() else {
            return Vec::new();
        };
        let prefix = format!("{} Custom ", prefix);
        self.raw
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix.as_str()).map(|key| (key, v.as_str())))
            .collect()
    }

    /// Street candidates for name matching, normalized.
    pub fn street_candidates(&self) -> Vec<String> {
        [
            "Contact Mailing Street",
            "Account Billing Street",
            "Account Shipping Street",
            "Original Street",
        ]
        .into_iter()
        .filter_map(|column| self.lookup_value(column))
        .map(normalize_street)
        .filter(|s| !s.is_empty())
        .collect()
    }

    /// Phone candidates for name matching, digits only.
    pub fn phone_candidates(&self) -> Vec<String> {
        PHONE_COLUMNS
            .into_iter()
            .filter_map(|column| self.lookup_value(column))
            .map(normalize_phone)
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Parse a currency column. `None` when blank, `Some(Err(raw))` when unparsable.
    pub fn amount(&self, column: &str) -> Option<Result<f64, String>> {
        self.lookup_value(column)
            .map(|raw| coercion::parse_amount(raw).ok_or_else(|| raw.to_string()))
    }

    /// Parse a date column that may carry a pattern suffix, e.g. `Donation Date mm/dd/yyyy`.
    /// `None` when no such column is filled, `Some(Err(raw))` when unparsable.
    pub fn date(&self, column: &str) -> Option<Result<NaiveDate, String>> {
        let (hint, raw) = self.raw.iter().find_map(|(k, v)| {
            let rest = k.strip_prefix(column)?;
            if rest.is_empty() {
                return Some((None::<DatePattern>, v));
            }
            match split_date_hint(k) {
                (field, Some(pattern)) if field == column => Some((Some(pattern), v)),
                _ => None,
            }
        })?;
        if is_clear_token(raw) {
            return None;
        }
        Some(coercion::parse_date(raw, hint).ok_or_else(|| raw.clone()))
    }

    /// Filled `Organization N` groups, for N in `1..=slots`.
    pub fn organizations(&self, slots: usize) -> Vec<OrganizationRef> {
        (1..=slots)
            .filter_map(|slot| {
                let prefix = format!("Organization {}", slot);
                let column = |suffix: &str| {
                    self.lookup_value(&format!("{} {}", prefix, suffix))
                        .map(str::to_string)
                };
                let organization = OrganizationRef {
                    slot,
                    id: column("ID"),
                    name: column("Name"),
                    role: column("Role"),
                    ext_refs: self.ext_refs_with_prefix(&format!("{} ExtRef ", prefix)),
                    address: [
                        ("Billing Street", fields::BILLING_STREET),
                        ("Billing City", fields::BILLING_CITY),
                        ("Billing State", fields::BILLING_STATE),
                        ("Billing Postal Code", fields::BILLING_POSTAL_CODE),
                        ("Billing Country", fields::BILLING_COUNTRY),
                    ]
                    .into_iter()
                    .filter_map(|(suffix, field)| column(suffix).map(|v| (field, v)))
                    .collect(),
                };
                let filled = organization.id.is_some()
                    || organization.name.is_some()
                    || !organization.ext_refs.is_empty();
                filled.then_some(organization)
            })
            .collect()
    }

    pub fn has_organizations(&self, slots: usize) -> bool {
        !self.organizations(slots).is_empty()
    }

    /// Campaign memberships requested for the account or contact.
    ///
    /// Three header styles are read: `<Owner> Campaign ID|Name`,
    /// `<Owner> Campaign N ID|Name`, and checkbox columns
    /// `<Owner> Campaign Name <Campaign>` holding a truthy value.
    pub fn campaigns(&self, owner: CampaignOwner, slots: usize) -> Vec<CampaignRef> {
        let prefix = owner.prefix();
        let mut groups = vec![prefix.to_string()];
        groups.extend((1..=slots).map(|slot| format!("{} {}", prefix, slot)));

        let mut campaigns = Vec::new();
        for group in groups {
            if let Some(id) = self.lookup_value(&format!("{} ID", group)) {
                campaigns.push(CampaignRef::Id(id.to_string()));
            } else if let Some(name) = self.lookup_value(&format!("{} Name", group)) {
                campaigns.push(CampaignRef::Name(name.to_string()));
            }
        }

        let checkbox_prefix = format!("{} Name ", prefix);
        for (column, value) in self.columns() {
            if let Some(name) = column.strip_prefix(checkbox_prefix.as_str()) {
                if is_truthy(value) && !name.trim().is_empty() {
                    campaigns.push(CampaignRef::Name(name.trim().to_string()));
                }
            }
        }
        campaigns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[(&str, &str)]) -> ImportRow {
        ImportRow::new(2, cells.iter().copied())
    }

    #[test]
    fn test_blank_cells_are_dropped() {
        let r = row(&[("Contact First Name", "  "), ("Contact Last Name", " Doe ")]);
        assert_eq!(r.value("Contact First Name"), None);
        assert_eq!(r.last_name.as_deref(), Some("Doe"));
    }

    #[test]
    fn test_full_name_is_split_when_halves_missing() {
        let r = row(&[("Contact Full Name", "Mary Ann Smith")]);
        assert_eq!(r.first_name.as_deref(), Some("Mary Ann"));
        assert_eq!(r.last_name.as_deref(), Some("Smith"));
        assert_eq!(r.name_key().as_deref(), Some("mary ann smith"));
    }

    #[test]
    fn test_emails_are_normalized_and_deduplicated() {
        let r = row(&[
            ("Contact Email", "Jane@X.com, other@x.com"),
            ("Contact Personal Email", "jane@x.com"),
            ("Contact Work Email", "N/A"),
            ("Contact Other Email", "J. Doe @work.org"),
        ]);
        assert_eq!(r.emails, vec!["jane@x.com", "j.doe@work.org"]);
    }

    #[test]
    fn test_clear_token_is_not_a_lookup_key() {
        let r = row(&[("Contact Email", "CLEAR IT"), ("Contact ID", "CLEARIT")]);
        assert!(r.emails.is_empty());
        assert!(r.contact_id().is_none());
        assert!(!r.has_contact_lookup_key());
    }

    #[test]
    fn test_ext_refs_and_custom_fields() {
        let r = row(&[
            ("Contact ExtRef SourceId", "77"),
            ("Recurring Donation ExtRef SourceId", "rd-1"),
            ("Contact Custom Nickname", "Jo"),
            ("Contact Custom Append Tags", "Gold"),
        ]);
        assert_eq!(
            r.ext_refs(EntityKind::Contact),
            vec![ExtRef {
                field: "SourceId".to_string(),
                value: "77".to_string()
            }]
        );
        assert!(r.ext_refs(EntityKind::Donation).is_empty());
        assert_eq!(
            r.custom_fields(EntityKind::Contact),
            vec![("Append Tags", "Gold"), ("Nickname", "Jo")]
        );
    }

    #[test]
    fn test_organizations() {
        let r = row(&[
            ("Organization 1 Name", "Acme"),
            ("Organization 1 Role", "Board"),
            ("Organization 1 Billing City", "Springfield"),
            ("Organization 2 Role", "Orphan role"),
            ("Organization 3 ExtRef OrgCode", "A-9"),
        ]);
        let orgs = r.organizations(5);
        assert_eq!(orgs.len(), 2);
        assert_eq!(orgs[0].name.as_deref(), Some("Acme"));
        assert_eq!(orgs[0].role.as_deref(), Some("Board"));
        assert_eq!(orgs[0].address, vec![("BillingCity", "Springfield".to_string())]);
        assert_eq!(orgs[1].slot, 3);
        assert_eq!(orgs[1].ext_refs[0].value, "A-9");
    }

    #[test]
    fn test_campaign_header_styles() {
        let r = row(&[
            ("Contact Campaign 1 ID", "701A"),
            ("Contact Campaign 2 Name", "Gala"),
            ("Contact Campaign Name Newsletter", "Yes"),
            ("Contact Campaign Name Volunteers", "no"),
            ("Account Campaign Name", "Spring Appeal"),
        ]);
        assert_eq!(
            r.campaigns(CampaignOwner::Contact, 5),
            vec![
                CampaignRef::Id("701A".to_string()),
                CampaignRef::Name("Gala".to_string()),
                CampaignRef::Name("Newsletter".to_string()),
            ]
        );
        assert_eq!(
            r.campaigns(CampaignOwner::Account, 5),
            vec![CampaignRef::Name("Spring Appeal".to_string())]
        );
    }

    #[test]
    fn test_amount_and_hinted_date() {
        let r = row(&[
            ("Donation Amount", "$1,000"),
            ("Donation Date mm/dd/yyyy", "02/03/2024"),
            ("Recurring Donation Amount", "lots"),
        ]);
        assert_eq!(r.amount("Donation Amount"), Some(Ok(1000.0)));
        assert_eq!(r.amount("Recurring Donation Amount"), Some(Err("lots".to_string())));
        assert_eq!(
            r.date("Donation Date"),
            Some(Ok(NaiveDate::from_ymd_opt(2024, 2, 3).unwrap()))
        );
        assert_eq!(r.date("Recurring Donation Start Date"), None);
    }

    #[test]
    fn test_address_and_phone_candidates() {
        let r = row(&[
            ("Contact Mailing Street", "123 Main St."),
            ("Original Street", "PO Box 9"),
            ("Contact Mobile Phone", "(555) 010-2000"),
        ]);
        assert_eq!(r.street_candidates(), vec!["123mainst", "pobox9"]);
        assert_eq!(r.phone_candidates(), vec!["5550102000"]);
    }
}
