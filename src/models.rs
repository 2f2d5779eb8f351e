//! Record and field types shared by the CRM port and the import engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Entity types the import engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Contact,
    RecurringDonation,
    Donation,
    Campaign,
    CampaignMember,
    Note,
    Affiliation,
    AccountContactRelation,
}

impl EntityKind {
    /// Header prefix used by `<Entity> Custom <Field>` and `<Entity> ExtRef <Field>` columns.
    pub fn column_prefix(&self) -> Option<&'static str> {
        match self {
            EntityKind::Account => Some("Account"),
            EntityKind::Contact => Some("Contact"),
            EntityKind::RecurringDonation => Some("Recurring Donation"),
            EntityKind::Donation => Some("Donation"),
            EntityKind::Campaign => Some("Campaign"),
            _ => None,
        }
    }

    /// Entities that accept custom and external-reference columns.
    pub fn sheet_entities() -> [EntityKind; 5] {
        [
            EntityKind::Account,
            EntityKind::Contact,
            EntityKind::RecurringDonation,
            EntityKind::Donation,
            EntityKind::Campaign,
        ]
    }

    /// Three-character prefix used when a store mints ids for this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            EntityKind::Account => "001",
            EntityKind::Contact => "003",
            EntityKind::RecurringDonation => "a0A",
            EntityKind::Donation => "006",
            EntityKind::Campaign => "701",
            EntityKind::CampaignMember => "00v",
            EntityKind::Note => "002",
            EntityKind::Affiliation => "a0B",
            EntityKind::AccountContactRelation => "07k",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Account => "account",
            EntityKind::Contact => "contact",
            EntityKind::RecurringDonation => "recurring donation",
            EntityKind::Donation => "donation",
            EntityKind::Campaign => "campaign",
            EntityKind::CampaignMember => "campaign member",
            EntityKind::Note => "note",
            EntityKind::Affiliation => "affiliation",
            EntityKind::AccountContactRelation => "account contact relation",
        };
        f.write_str(name)
    }
}

/// Well-known system field names.
pub mod fields {
    pub const NAME: &str = "Name";
    pub const DESCRIPTION: &str = "Description";
    pub const OWNER_ID: &str = "OwnerId";
    pub const RECORD_TYPE_ID: &str = "RecordTypeId";
    pub const ACCOUNT_ID: &str = "AccountId";
    pub const CONTACT_ID: &str = "ContactId";
    pub const CAMPAIGN_ID: &str = "CampaignId";

    pub const PHONE: &str = "Phone";
    pub const WEBSITE: &str = "Website";
    pub const TYPE: &str = "Type";
    pub const BILLING_STREET: &str = "BillingStreet";
    pub const BILLING_CITY: &str = "BillingCity";
    pub const BILLING_STATE: &str = "BillingState";
    pub const BILLING_POSTAL_CODE: &str = "BillingPostalCode";
    pub const BILLING_COUNTRY: &str = "BillingCountry";
    pub const SHIPPING_STREET: &str = "ShippingStreet";
    pub const SHIPPING_CITY: &str = "ShippingCity";
    pub const SHIPPING_STATE: &str = "ShippingState";
    pub const SHIPPING_POSTAL_CODE: &str = "ShippingPostalCode";
    pub const SHIPPING_COUNTRY: &str = "ShippingCountry";

    pub const SALUTATION: &str = "Salutation";
    pub const FIRST_NAME: &str = "FirstName";
    pub const LAST_NAME: &str = "LastName";
    pub const EMAIL: &str = "Email";
    pub const PERSONAL_EMAIL: &str = "PersonalEmail";
    pub const WORK_EMAIL: &str = "WorkEmail";
    pub const OTHER_EMAIL: &str = "OtherEmail";
    pub const HOME_PHONE: &str = "HomePhone";
    pub const MOBILE_PHONE: &str = "MobilePhone";
    pub const WORK_PHONE: &str = "WorkPhone";
    pub const MAILING_STREET: &str = "MailingStreet";
    pub const MAILING_CITY: &str = "MailingCity";
    pub const MAILING_STATE: &str = "MailingState";
    pub const MAILING_POSTAL_CODE: &str = "MailingPostalCode";
    pub const MAILING_COUNTRY: &str = "MailingCountry";

    pub const AMOUNT: &str = "Amount";
    pub const STATUS: &str = "Status";
    pub const INSTALLMENT_PERIOD: &str = "InstallmentPeriod";
    pub const DATE_ESTABLISHED: &str = "DateEstablished";
    pub const NEXT_PAYMENT_DATE: &str = "NextPaymentDate";
    pub const CLOSE_DATE: &str = "CloseDate";
    pub const STAGE_NAME: &str = "StageName";
    pub const LEAD_SOURCE: &str = "LeadSource";

    pub const PARENT_ID: &str = "ParentId";
    pub const TITLE: &str = "Title";
    pub const BODY: &str = "Body";

    pub const ORGANIZATION_ID: &str = "OrganizationId";
    pub const ROLE: &str = "Role";
    pub const IS_ACTIVE: &str = "IsActive";

    /// Contact fields that participate in email matching, primary first.
    pub const EMAIL_FIELDS: [&str; 4] = [EMAIL, PERSONAL_EMAIL, WORK_EMAIL, OTHER_EMAIL];
    /// Contact fields that participate in phone matching.
    pub const PHONE_FIELDS: [&str; 4] = [PHONE, HOME_PHONE, MOBILE_PHONE, WORK_PHONE];
}

/// A typed field value.
///
/// Serialized untagged so store snapshots stay readable; variant order matters
/// for deserialization (a `yyyy-mm-dd` string becomes a date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Loose equality used by query filters: same variant and value, or same rendering.
    pub fn loosely_equals(&self, other: &FieldValue) -> bool {
        self == other || self.to_string() == other.to_string()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(value) => write!(f, "{}", value),
            FieldValue::Number(value) => write!(f, "{}", value),
            FieldValue::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            FieldValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

/// Ordered mapping of field name to typed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet(BTreeMap<String, FieldValue>);

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    /// Text value of a field; empty strings read as absent.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .and_then(FieldValue::as_text)
            .filter(|value| !value.is_empty())
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite this set's values with every value in `other`.
    pub fn merge(&mut self, other: &FieldSet) {
        for (field, value) in other.iter() {
            self.0.insert(field.clone(), value.clone());
        }
    }
}

/// A record as read from or written to the CRM store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: FieldSet,
    /// Fields the store should clear on write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_to_null: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Parent account snapshot, populated on contacts returned by lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Box<CrmRecord>>,
}

impl CrmRecord {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            id: None,
            fields: FieldSet::new(),
            fields_to_null: Vec::new(),
            created_at: None,
            account: None,
        }
    }

    pub fn with_id(kind: EntityKind, id: impl Into<String>) -> Self {
        let mut record = Self::new(kind);
        record.id = Some(id.into());
        record
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.text(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.set(field, value);
    }

    /// Queue a field to be cleared, dropping any value set for it.
    pub fn null_field(&mut self, field: &str) {
        self.fields.remove(field);
        if !self.fields_to_null.iter().any(|f| f == field) {
            self.fields_to_null.push(field.to_string());
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        self.text(fields::ACCOUNT_ID)
    }

    /// `First Last` for contacts, `Name` for everything else.
    pub fn display_name(&self) -> String {
        match self.kind {
            EntityKind::Contact => {
                let first = self.text(fields::FIRST_NAME).unwrap_or_default();
                let last = self.text(fields::LAST_NAME).unwrap_or_default();
                format!("{} {}", first, last).trim().to_string()
            }
            _ => self.text(fields::NAME).unwrap_or_default().to_string(),
        }
    }
}

/// Handle to a record that either exists in the store or is staged for insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordRef {
    Stored(String),
    Staged { kind: EntityKind, key: String },
}

impl RecordRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            RecordRef::Stored(id) => Some(id),
            RecordRef::Staged { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_field_drops_value_once() {
        let mut record = CrmRecord::new(EntityKind::Contact);
        record.set(fields::EMAIL, "a@x.com");
        record.null_field(fields::EMAIL);
        record.null_field(fields::EMAIL);

        assert!(record.text(fields::EMAIL).is_none());
        assert_eq!(record.fields_to_null, vec![fields::EMAIL.to_string()]);
    }

    #[test]
    fn test_field_value_untagged_round_trip() {
        let json = r#"{"a":true,"b":12.5,"c":"2024-03-01","d":"hello"}"#;
        let set: FieldSet = serde_json::from_str(json).unwrap();

        assert_eq!(set.get("a"), Some(&FieldValue::Bool(true)));
        assert_eq!(set.get("b"), Some(&FieldValue::Number(12.5)));
        assert_eq!(
            set.get("c"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()))
        );
        assert_eq!(set.text("d"), Some("hello"));
    }

    #[test]
    fn test_loose_equality_compares_rendering() {
        assert!(FieldValue::Number(25.0).loosely_equals(&FieldValue::from("25")));
        assert!(!FieldValue::Number(25.0).loosely_equals(&FieldValue::from("26")));
    }

    #[test]
    fn test_contact_display_name() {
        let mut contact = CrmRecord::new(EntityKind::Contact);
        contact.set(fields::LAST_NAME, "Doe");
        assert_eq!(contact.display_name(), "Doe");
        contact.set(fields::FIRST_NAME, "Jane");
        assert_eq!(contact.display_name(), "Jane Doe");
    }
}
