//! Capability gates derived from upstream status.
//!
//! All predicates are total and side-effect free. Each one lists its own accepted statuses
//! even where they overlap: the queue and payment services evolve separately, and a status
//! that opens the record need not always prove payment.

use crate::draft::ClinicalDraft;
use crate::snapshot::{DiscountMode, PaymentStatus, VisitStatus, VisitStatusSnapshot};
use serde::Serialize;
use std::fmt;

/// Operation guarded by a gate. Carried by [`EditorError::GateDenied`](crate::EditorError).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Open,
    Edit,
    Finalise,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Open => "open",
            Capability::Edit => "edit",
            Capability::Finalise => "finalise",
        })
    }
}

/// True if the visit is known to be paid for.
///
/// A visit status past intake counts as proof of payment, because the queue only advances a
/// visit after payment clears; the payment service's own field may lag behind.
pub fn is_paid(snapshot: &VisitStatusSnapshot) -> bool {
    let paid_marker = matches!(snapshot.payment_status, Some(PaymentStatus::Paid));
    let paid_discount = matches!(
        snapshot.discount_mode,
        Some(DiscountMode::Waived | DiscountMode::DiscountedPaid)
    );
    let advanced = matches!(
        snapshot.visit_status,
        VisitStatus::Queued
            | VisitStatus::Waiting
            | VisitStatus::Called
            | VisitStatus::Calling
            | VisitStatus::InVisit
            | VisitStatus::InProgress
    );

    paid_marker || paid_discount || advanced
}

/// True if the record may be opened (viewed).
pub fn can_open(snapshot: &VisitStatusSnapshot) -> bool {
    is_paid(snapshot)
        || matches!(
            snapshot.visit_status,
            VisitStatus::InVisit | VisitStatus::InProgress | VisitStatus::Called | VisitStatus::Calling
        )
}

/// True if the record may be edited: the clinician has been connected to the patient.
pub fn can_edit(snapshot: &VisitStatusSnapshot) -> bool {
    matches!(
        snapshot.visit_status,
        VisitStatus::InVisit | VisitStatus::InProgress | VisitStatus::Called | VisitStatus::Calling
    )
}

/// True if the record may be finalised: editable, and saved explicitly at least once.
pub fn can_finalize(draft: &ClinicalDraft, snapshot: &VisitStatusSnapshot) -> bool {
    can_edit(snapshot) && !draft.is_draft()
}

/// All four gate flags evaluated against one snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GateFlags {
    pub is_paid: bool,
    pub can_open: bool,
    pub can_edit: bool,
    pub can_finalize: bool,
}

impl GateFlags {
    pub fn evaluate(draft: &ClinicalDraft, snapshot: &VisitStatusSnapshot) -> Self {
        Self {
            is_paid: is_paid(snapshot),
            can_open: can_open(snapshot),
            can_edit: can_edit(snapshot),
            can_finalize: can_finalize(draft, snapshot),
        }
    }
}
