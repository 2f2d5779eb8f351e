//! Contact/organization affiliations.
//!
//! Stores model affiliations one of two ways, reported by
//! [`CrmPort::affiliation_model`]. One strategy is picked per run and used for
//! every row; the two are never mixed.

use crate::crm::{AffiliationModel, CrmError, CrmPort, CrmQuery};
use crate::import::indices::{MatchContext, SeenRelationshipSet};
use crate::models::{CrmRecord, EntityKind, fields};
use async_trait::async_trait;

/// Status written on new affiliation join records.
pub const CURRENT_STATUS: &str = "Current";

/// One requested (contact, organization) link.
#[derive(Debug, Clone, Copy)]
pub struct AffiliationLink<'a> {
    pub contact_id: &'a str,
    /// The contact's primary account, if it has one.
    pub contact_account_id: Option<&'a str>,
    pub organization_id: &'a str,
    pub role: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffiliationOutcome {
    /// The pair was already related.
    AlreadyLinked,
    Created,
    /// An existing relationship was reused, possibly with a role update.
    Updated,
}

#[async_trait]
pub trait AffiliationStrategy: Send + Sync {
    fn model(&self) -> AffiliationModel;

    /// Entity kind holding the relationship records.
    fn relationship_kind(&self) -> EntityKind;

    /// Load every existing (contact, organization) pair.
    async fn load_seen(&self, port: &dyn CrmPort) -> Result<SeenRelationshipSet, CrmError> {
        let kind = self.relationship_kind();
        let records = port.query_list_auto_paged(&CrmQuery::new(kind)).await?;
        let mut seen = SeenRelationshipSet::new();
        for record in &records {
            if let (Some(contact), Some(org)) = (
                record.text(fields::CONTACT_ID),
                record.text(self.organization_field()),
            ) {
                seen.insert(contact, org);
            }
        }
        Ok(seen)
    }

    /// Field on the relationship record naming the organization.
    fn organization_field(&self) -> &'static str;

    async fn affiliate(
        &self,
        port: &dyn CrmPort,
        ctx: &mut MatchContext,
        link: AffiliationLink<'_>,
    ) -> Result<AffiliationOutcome, CrmError>;
}

/// Pick the strategy matching the store's capability flag.
pub fn strategy_for(model: AffiliationModel) -> Box<dyn AffiliationStrategy> {
    match model {
        AffiliationModel::JoinObject => Box::new(JoinObjectAffiliations),
        AffiliationModel::PrimaryAccount => Box::new(PrimaryAccountAffiliations),
    }
}

/// Insert-only affiliation join records.
pub struct JoinObjectAffiliations;

#[async_trait]
impl AffiliationStrategy for JoinObjectAffiliations {
    fn model(&self) -> AffiliationModel {
        AffiliationModel::JoinObject
    }

    fn relationship_kind(&self) -> EntityKind {
        EntityKind::Affiliation
    }

    fn organization_field(&self) -> &'static str {
        fields::ORGANIZATION_ID
    }

    async fn affiliate(
        &self,
        port: &dyn CrmPort,
        ctx: &mut MatchContext,
        link: AffiliationLink<'_>,
    ) -> Result<AffiliationOutcome, CrmError> {
        if ctx
            .seen_relationships
            .contains(link.contact_id, link.organization_id)
        {
            return Ok(AffiliationOutcome::AlreadyLinked);
        }

        let mut affiliation = CrmRecord::new(EntityKind::Affiliation);
        affiliation.set(fields::CONTACT_ID, link.contact_id);
        affiliation.set(fields::ORGANIZATION_ID, link.organization_id);
        affiliation.set(fields::STATUS, CURRENT_STATUS);
        if let Some(role) = link.role {
            affiliation.set(fields::ROLE, role);
        }

        let key = format!("{}::{}", link.contact_id, link.organization_id);
        ctx.writes.stage_insert(port, Some(key), affiliation).await?;
        ctx.seen_relationships
            .insert(link.contact_id, link.organization_id);
        Ok(AffiliationOutcome::Created)
    }
}

/// Primary account on the contact plus account/contact relation records.
pub struct PrimaryAccountAffiliations;

impl PrimaryAccountAffiliations {
    fn relation_query(link: &AffiliationLink<'_>) -> CrmQuery {
        CrmQuery::new(EntityKind::AccountContactRelation)
            .filter(fields::CONTACT_ID, link.contact_id)
            .filter(fields::ACCOUNT_ID, link.organization_id)
    }

    async fn upsert_relation(
        &self,
        port: &dyn CrmPort,
        ctx: &mut MatchContext,
        link: &AffiliationLink<'_>,
    ) -> Result<AffiliationOutcome, CrmError> {
        let existing = port.query_single(&Self::relation_query(link)).await?;
        match existing {
            Some(relation) => {
                let role_missing = relation.text(fields::ROLE).is_none();
                if let (Some(role), true, Some(id)) = (link.role, role_missing, relation.id) {
                    let mut update = CrmRecord::with_id(EntityKind::AccountContactRelation, id);
                    update.set(fields::ROLE, role);
                    ctx.writes.stage_update(update);
                }
                Ok(AffiliationOutcome::Updated)
            }
            None => {
                let mut relation = CrmRecord::new(EntityKind::AccountContactRelation);
                relation.set(fields::CONTACT_ID, link.contact_id);
                relation.set(fields::ACCOUNT_ID, link.organization_id);
                relation.set(fields::IS_ACTIVE, true);
                if let Some(role) = link.role {
                    relation.set(fields::ROLE, role);
                }
                let key = format!("{}::{}", link.contact_id, link.organization_id);
                ctx.writes.stage_insert(port, Some(key), relation).await?;
                Ok(AffiliationOutcome::Created)
            }
        }
    }
}

#[async_trait]
impl AffiliationStrategy for PrimaryAccountAffiliations {
    fn model(&self) -> AffiliationModel {
        AffiliationModel::PrimaryAccount
    }

    fn relationship_kind(&self) -> EntityKind {
        EntityKind::AccountContactRelation
    }

    fn organization_field(&self) -> &'static str {
        fields::ACCOUNT_ID
    }

    async fn affiliate(
        &self,
        port: &dyn CrmPort,
        ctx: &mut MatchContext,
        link: AffiliationLink<'_>,
    ) -> Result<AffiliationOutcome, CrmError> {
        if ctx
            .seen_relationships
            .contains(link.contact_id, link.organization_id)
        {
            return Ok(AffiliationOutcome::AlreadyLinked);
        }

        if link.contact_account_id.is_none() {
            // Not batched: the relation lookup below must see the new primary account.
            let mut update = CrmRecord::with_id(EntityKind::Contact, link.contact_id);
            update.set(fields::ACCOUNT_ID, link.organization_id);
            port.update(&update).await?;
            if let Some(handle) = ctx.contacts.by_id(link.contact_id) {
                ctx.contacts.apply_update(handle, &update);
            }
            log::debug!(
                "set primary account of contact {} to {}",
                link.contact_id,
                link.organization_id
            );
        }

        let outcome = self.upsert_relation(port, ctx, &link).await?;
        ctx.seen_relationships
            .insert(link.contact_id, link.organization_id);
        Ok(outcome)
    }
}
