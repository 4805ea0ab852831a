use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::ClusterId;
use crate::registry::ChangeSetId;
use crate::vcs::Revision;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryKind {
    Resolution { cluster_id: ClusterId },
    Rollback { reverts: Vec<ChangeSetId> },
}

/// One commit the merge queue landed on the integration branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub revision: Revision,
    pub parent: Revision,
    pub entry_key: String,
    pub kind: DeliveryKind,
    /// Change sets and the heads they were delivered at
    pub members: Vec<(ChangeSetId, Revision)>,
    pub delivered_at: DateTime<Utc>,
}

impl Delivery {
    pub fn change_sets(&self) -> Vec<ChangeSetId> {
        self.members.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self.kind, DeliveryKind::Rollback { .. })
    }
}

/// Which change sets each integration commit carries
#[derive(Debug, Clone, Default)]
pub struct ProvenanceMap {
    deliveries: Vec<Delivery>,
    by_revision: BTreeMap<Revision, usize>,
}

impl ProvenanceMap {
    pub fn from_deliveries(deliveries: Vec<Delivery>) -> Self {
        let mut map = Self::default();
        for delivery in deliveries {
            map.insert(delivery);
        }
        map
    }

    /// False when the revision is already recorded
    pub fn insert(&mut self, delivery: Delivery) -> bool {
        if self.by_revision.contains_key(&delivery.revision) {
            return false;
        }
        self.by_revision.insert(delivery.revision.clone(), self.deliveries.len());
        self.deliveries.push(delivery);
        true
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    pub fn at(&self, revision: &Revision) -> Option<&Delivery> {
        self.by_revision.get(revision).map(|&i| &self.deliveries[i])
    }

    pub fn change_sets_at(&self, revision: &Revision) -> Vec<ChangeSetId> {
        self.at(revision).map(Delivery::change_sets).unwrap_or_default()
    }

    /// Change sets currently live on the integration branch: delivered and
    /// not reverted by a later rollback
    pub fn active(&self) -> BTreeMap<ChangeSetId, Revision> {
        let mut active = BTreeMap::new();
        for delivery in &self.deliveries {
            match &delivery.kind {
                DeliveryKind::Resolution { .. } => {
                    for (id, head) in &delivery.members {
                        active.insert(id.clone(), head.clone());
                    }
                }
                DeliveryKind::Rollback { reverts } => {
                    for id in reverts {
                        active.remove(id);
                    }
                }
            }
        }
        active
    }

    pub fn active_change_sets(&self) -> Vec<ChangeSetId> {
        self.active().into_keys().collect()
    }

    /// Whether `id` is live at exactly `head`
    pub fn is_delivered(&self, id: &ChangeSetId, head: &Revision) -> bool {
        self.active().get(id) == Some(head)
    }

    pub fn reverted(&self) -> BTreeSet<ChangeSetId> {
        let active = self.active();
        self.deliveries
            .iter()
            .filter(|d| !d.is_rollback())
            .flat_map(|d| d.change_sets())
            .filter(|id| !active.contains_key(id))
            .collect()
    }

    /// The live delivery that carried `id`
    pub fn latest_delivery_of(&self, id: &ChangeSetId) -> Option<&Delivery> {
        let head = self.active().get(id).cloned()?;
        self.deliveries
            .iter()
            .rev()
            .filter(|d| !d.is_rollback())
            .find(|d| d.members.iter().any(|(member, at)| member == id && at == &head))
    }
}
