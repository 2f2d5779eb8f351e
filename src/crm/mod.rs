//! CRM store port.
//!
//! The import engine never talks to a vendor API directly. Everything it needs
//! from the store goes through [`CrmPort`]:
//!
//! 1. **Bulk lookups** - by id, external reference, name and email, one call per key type
//! 2. **Single writes** - `insert` / `update`, used when an id is needed immediately
//! 3. **Batched writes** - `batch_insert` / `batch_update`, applied on `batch_flush`
//! 4. **Queries** - relationship existence checks with no typed accessor
//!
//! [`memory::InMemoryCrm`] implements the port over a JSON snapshot.

pub mod memory;

use crate::models::{CrmRecord, EntityKind, FieldValue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use memory::InMemoryCrm;

/// Errors surfaced by a CRM store adapter.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{kind} lookup failed: {message}")]
    Lookup { kind: EntityKind, message: String },
    #[error("{kind} write failed: {message}")]
    Write { kind: EntityKind, message: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("batch flush failed: {0}")]
    Flush(String),
}

/// How the store models contact/organization affiliations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffiliationModel {
    /// A dedicated affiliation join record per (contact, organization).
    JoinObject,
    /// A primary account on the contact plus account/contact relation records.
    PrimaryAccount,
}

impl FromStr for AffiliationModel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "join" | "join-object" | "affiliation" => Ok(AffiliationModel::JoinObject),
            "primary" | "primary-account" | "relation" => Ok(AffiliationModel::PrimaryAccount),
            other => Err(format!("unknown affiliation model: {}", other)),
        }
    }
}

impl fmt::Display for AffiliationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffiliationModel::JoinObject => f.write_str("join-object"),
            AffiliationModel::PrimaryAccount => f.write_str("primary-account"),
        }
    }
}

/// Equality query over one entity kind. Adapters render it into their own query language.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmQuery {
    pub kind: EntityKind,
    pub filters: Vec<(String, FieldValue)>,
}

impl CrmQuery {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }
}

impl fmt::Display for CrmQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (i, (field, value)) in self.filters.iter().enumerate() {
            let joiner = if i == 0 { " where" } else { " and" };
            write!(f, "{} {} = '{}'", joiner, field, value)?;
        }
        Ok(())
    }
}

/// Contract consumed by the import engine.
///
/// Lookups by id must accept both the full id and its short prefix form.
/// Contacts returned by lookups carry their parent account in `CrmRecord::account`.
#[async_trait]
pub trait CrmPort: Send + Sync {
    /// Capability flag selecting the affiliation strategy for a run.
    fn affiliation_model(&self) -> AffiliationModel;

    async fn find_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<CrmRecord>, CrmError>;

    async fn find_by_ext_ref(
        &self,
        kind: EntityKind,
        field: &str,
        values: &[String],
    ) -> Result<Vec<CrmRecord>, CrmError>;

    /// Case-insensitive name lookup. Contacts match on `First Last`.
    async fn find_by_names(&self, kind: EntityKind, names: &[String]) -> Result<Vec<CrmRecord>, CrmError>;

    /// Case-insensitive match against every contact email field.
    async fn find_contacts_by_emails(&self, emails: &[String]) -> Result<Vec<CrmRecord>, CrmError>;

    /// Insert a record and return its new id.
    async fn insert(&self, record: &CrmRecord) -> Result<String, CrmError>;

    async fn update(&self, record: &CrmRecord) -> Result<(), CrmError>;

    async fn batch_insert(&self, record: &CrmRecord) -> Result<(), CrmError>;

    async fn batch_update(&self, record: &CrmRecord) -> Result<(), CrmError>;

    /// Apply every queued batch write, returning the ids of queued inserts in queue order.
    async fn batch_flush(&self) -> Result<Vec<String>, CrmError>;

    async fn query_list_auto_paged(&self, query: &CrmQuery) -> Result<Vec<CrmRecord>, CrmError>;

    async fn query_single(&self, query: &CrmQuery) -> Result<Option<CrmRecord>, CrmError>;
}
