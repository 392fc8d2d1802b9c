use itertools::Itertools;
use std::collections::{HashMap, HashSet};

use crate::model::{
    ManyToMany, ManyToManyPlan, OneToMany, OneToManyPlan, RecordId, Relationship, Row, RowWrite,
    SyncEntry, SyncPlan, SyncReport, SyncTarget,
};
use crate::store::{RelationStore, RelationTransaction, StoreError};

/// Diffs a working list against the persisted relationship and applies the result
pub struct Reconciler;

impl Reconciler {
    /// Computes the operations a pass would apply, without touching a store
    pub fn plan(relationship: &Relationship, current: &[Row], working: &[Row]) -> SyncPlan {
        match relationship {
            Relationship::ManyToMany(_) => SyncPlan::ManyToMany(Self::plan_many_to_many(current, working)),
            Relationship::OneToMany(_) => SyncPlan::OneToMany(Self::plan_one_to_many(current, working)),
        }
    }

    /// Persisted ids missing from the working list, in persisted order
    fn removed_ids(current: &[Row], working: &[Row]) -> Vec<RecordId> {
        let kept: HashSet<RecordId> = working.iter().filter_map(|row| row.id).collect();
        current
            .iter()
            .filter_map(|row| row.id)
            .filter(|id| !kept.contains(id))
            .unique()
            .collect()
    }

    pub fn plan_many_to_many(current: &[Row], working: &[Row]) -> ManyToManyPlan {
        let detach = Self::removed_ids(current, working);

        // A repeated key keeps its first position and takes the last attributes.
        let mut entries: Vec<SyncEntry> = Vec::with_capacity(working.len());
        let mut positions: HashMap<SyncTarget, usize> = HashMap::new();
        for row in working {
            let target = SyncTarget::from(row.key());
            let attributes = row.attributes().clone();
            match positions.get(&target) {
                Some(&index) => entries[index].attributes = attributes,
                None => {
                    positions.insert(target.clone(), entries.len());
                    entries.push(SyncEntry { target, attributes });
                }
            }
        }

        ManyToManyPlan { detach, entries }
    }

    pub fn plan_one_to_many(current: &[Row], working: &[Row]) -> OneToManyPlan {
        let delete = Self::removed_ids(current, working);
        let writes = working
            .iter()
            .map(|row| match row.id {
                Some(id) => RowWrite::Update {
                    id,
                    attributes: row.attributes().clone(),
                },
                None => RowWrite::Create {
                    temp_id: row.temp_id.clone(),
                    attributes: row.attributes().clone(),
                },
            })
            .collect();

        OneToManyPlan { delete, writes }
    }

    /// Runs one reconciliation pass inside a store transaction.
    ///
    /// The persisted set is read inside the transaction. Any store error rolls the
    /// whole pass back and is returned unchanged.
    pub async fn synchronize<S: RelationStore + ?Sized>(
        store: &S,
        relationship: &Relationship,
        working: &[Row],
    ) -> Result<SyncReport, StoreError> {
        let mut tx = store.begin().await?;

        match Self::run_pass(tx.as_mut(), relationship, working).await {
            Ok(report) => {
                tx.commit().await?;
                if report.is_empty() {
                    log::info!(
                        "Synchronized {} of {} {}: nothing to do",
                        relationship.related_table(),
                        relationship.parent().table,
                        relationship.parent().id
                    );
                } else {
                    log::info!(
                        "Synchronized {} of {} {}: {} detached, {} deleted, {} updated, {} created, {} skipped",
                        relationship.related_table(),
                        relationship.parent().table,
                        relationship.parent().id,
                        report.detached.len(),
                        report.deleted.len(),
                        report.updated.len(),
                        report.created.len(),
                        report.skipped.len()
                    );
                }
                Ok(report)
            }
            Err(e) => {
                log::warn!(
                    "Synchronizing {} of {} {} failed, rolling back: {}",
                    relationship.related_table(),
                    relationship.parent().table,
                    relationship.parent().id,
                    e
                );
                if let Err(rollback_error) = tx.rollback().await {
                    log::error!("Rollback failed: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    async fn run_pass(
        tx: &mut dyn RelationTransaction,
        relationship: &Relationship,
        working: &[Row],
    ) -> Result<SyncReport, StoreError> {
        let current = tx.fetch_related(relationship).await?;

        match relationship {
            Relationship::ManyToMany(rel) => {
                let plan = Self::plan_many_to_many(&current, working);
                Self::apply_many_to_many(tx, rel, &plan).await
            }
            Relationship::OneToMany(rel) => {
                let plan = Self::plan_one_to_many(&current, working);
                Self::apply_one_to_many(tx, rel, &plan).await
            }
        }
    }

    async fn apply_many_to_many(
        tx: &mut dyn RelationTransaction,
        rel: &ManyToMany,
        plan: &ManyToManyPlan,
    ) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();

        if !plan.detach.is_empty() {
            log::debug!("Detaching {} ids [{}]", rel.related_table, plan.detach.iter().join(", "));
            tx.detach(rel, &plan.detach).await?;
            report.detached = plan.detach.clone();
        }

        log::debug!("Syncing {} {} associations", plan.entries.len(), rel.related_table);
        let outcome = tx.sync_associations(rel, &plan.entries).await?;
        let new_targets = plan.entries.iter().filter_map(|entry| match &entry.target {
            SyncTarget::New(temp_id) => Some(temp_id.clone()),
            SyncTarget::Existing(_) => None,
        });
        report.assigned_ids = new_targets.zip(outcome.created.iter().copied()).collect();
        report.members = outcome.members;
        report.created = outcome.created;
        report.updated = outcome.updated;

        Ok(report)
    }

    async fn apply_one_to_many(
        tx: &mut dyn RelationTransaction,
        rel: &OneToMany,
        plan: &OneToManyPlan,
    ) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();

        if !plan.delete.is_empty() {
            log::debug!("Deleting {} ids [{}]", rel.related_table, plan.delete.iter().join(", "));
            tx.delete_by_ids(rel, &plan.delete).await?;
            report.deleted = plan.delete.clone();
        }

        for write in &plan.writes {
            match write {
                RowWrite::Update { id, attributes } => {
                    if tx.update_by_id(rel, *id, attributes).await? {
                        report.updated.push(*id);
                        report.members.push(*id);
                    } else {
                        log::warn!(
                            "{} {} is not owned by {} {}, update skipped",
                            rel.related_table,
                            id,
                            rel.parent.table,
                            rel.parent.id
                        );
                        report.skipped.push(*id);
                    }
                }
                RowWrite::Create { temp_id, attributes } => {
                    let id = tx.create_owned(rel, attributes).await?;
                    if let Some(temp_id) = temp_id {
                        report.assigned_ids.insert(temp_id.clone(), id);
                    }
                    report.created.push(id);
                    report.members.push(id);
                }
            }
        }

        Ok(report)
    }
}
