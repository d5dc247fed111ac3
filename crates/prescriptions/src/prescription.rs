use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medipaw_catalog::ProductId;
use medipaw_core::{AggregateId, DomainError, DomainResult, UserId};

/// Prescription identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrescriptionId(pub AggregateId);

impl PrescriptionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PrescriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Prescription review lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrescriptionStatus {
    Pending,
    Approved,
    Rejected,
}

/// Reviewer verdict, applied one-shot via [`Prescription::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum ReviewDecision {
    Approve {
        /// Per-product quantities the reviewer signed off on.
        quantities: BTreeMap<ProductId, u32>,
        notes: Option<String>,
    },
    Reject {
        notes: Option<String>,
    },
}

/// An uploaded prescription document and its review state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: PrescriptionId,
    pub user_id: UserId,
    /// Reference to the uploaded document (storage URL or object key).
    pub document_ref: String,
    pub status: PrescriptionStatus,
    /// Reviewer-chosen (product, approved quantity) pairs; empty until approved.
    pub approved_quantities: BTreeMap<ProductId, u32>,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Prescription {
    pub fn upload(
        id: PrescriptionId,
        user_id: UserId,
        document_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let document_ref = document_ref.into();
        if document_ref.trim().is_empty() {
            return Err(DomainError::validation("document reference cannot be empty"));
        }
        Ok(Self {
            id,
            user_id,
            document_ref,
            status: PrescriptionStatus::Pending,
            approved_quantities: BTreeMap::new(),
            admin_notes: None,
            created_at: now,
            decided_at: None,
        })
    }

    /// Apply the reviewer's verdict.
    ///
    /// Only `Pending → Approved` and `Pending → Rejected` exist; a decided
    /// prescription is immutable and re-review requires a new upload.
    pub fn decide(&mut self, decision: ReviewDecision, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != PrescriptionStatus::Pending {
            return Err(DomainError::invariant(
                "prescription is already decided; upload a new one for re-review",
            ));
        }

        match decision {
            ReviewDecision::Approve { quantities, notes } => {
                if quantities.is_empty() {
                    return Err(DomainError::validation(
                        "approval must name at least one product quantity",
                    ));
                }
                if quantities.values().any(|qty| *qty == 0) {
                    return Err(DomainError::validation(
                        "approved quantities must be positive",
                    ));
                }
                self.status = PrescriptionStatus::Approved;
                self.approved_quantities = quantities;
                self.admin_notes = notes;
            }
            ReviewDecision::Reject { notes } => {
                self.status = PrescriptionStatus::Rejected;
                self.admin_notes = notes;
            }
        }

        self.decided_at = Some(now);
        Ok(())
    }

    /// Quantity the reviewer approved for one product, if any.
    pub fn approved_quantity_for(&self, product_id: ProductId) -> Option<u32> {
        self.approved_quantities.get(&product_id).copied()
    }
}

/// In-memory prescription registry.
///
/// The fulfillment workflow reads from it; only the review workflow
/// (`decide`) writes to it.
#[derive(Debug, Default)]
pub struct PrescriptionDirectory {
    prescriptions: RwLock<HashMap<PrescriptionId, Prescription>>,
}

impl PrescriptionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload(
        &self,
        user_id: UserId,
        document_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Prescription> {
        let prescription = Prescription::upload(
            PrescriptionId::new(AggregateId::new()),
            user_id,
            document_ref,
            now,
        )?;

        let mut prescriptions = self
            .prescriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        prescriptions.insert(prescription.id, prescription.clone());
        Ok(prescription)
    }

    /// Apply a review decision and return the updated record.
    pub fn decide(
        &self,
        id: PrescriptionId,
        decision: ReviewDecision,
        now: DateTime<Utc>,
    ) -> DomainResult<Prescription> {
        let mut prescriptions = self
            .prescriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let prescription = prescriptions.get_mut(&id).ok_or(DomainError::NotFound)?;
        prescription.decide(decision, now)?;
        Ok(prescription.clone())
    }

    pub fn get(&self, id: PrescriptionId) -> Option<Prescription> {
        self.prescriptions
            .read()
            .ok()
            .and_then(|prescriptions| prescriptions.get(&id).cloned())
    }

    pub fn for_user(&self, user_id: UserId) -> Vec<Prescription> {
        self.prescriptions
            .read()
            .map(|prescriptions| {
                prescriptions
                    .values()
                    .filter(|p| p.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
