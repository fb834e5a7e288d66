//! Upstream visit and payment status, as seen by the editor.
//!
//! The queue service owns `visitStatus`; the payment service owns `paymentStatus` and
//! `discountMode`. Both publish independently, so a snapshot may be briefly inconsistent.
//! Status strings are matched case-insensitively and `_` is accepted in place of `-`.
//! Anything unrecognised becomes `Unknown`, which no gate accepts.

use crate::{EditorError, EditorResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;

fn normalise_token(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['_', ' '], "-")
}

macro_rules! wire_token_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                // FromStr is infallible for status tokens
                Ok(raw.parse::<$ty>().unwrap_or(<$ty>::Unknown))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Visit lifecycle as reported by the queue service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VisitStatus {
    Registered,
    Queued,
    Waiting,
    Called,
    Calling,
    InVisit,
    InProgress,
    Completed,
    Cancelled,
    #[default]
    Unknown,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Registered => "registered",
            VisitStatus::Queued => "queued",
            VisitStatus::Waiting => "waiting",
            VisitStatus::Called => "called",
            VisitStatus::Calling => "calling",
            VisitStatus::InVisit => "in-visit",
            VisitStatus::InProgress => "in-progress",
            VisitStatus::Completed => "completed",
            VisitStatus::Cancelled => "cancelled",
            VisitStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for VisitStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match normalise_token(s).as_str() {
            "registered" => VisitStatus::Registered,
            "queued" => VisitStatus::Queued,
            "waiting" => VisitStatus::Waiting,
            "called" => VisitStatus::Called,
            "calling" => VisitStatus::Calling,
            "in-visit" => VisitStatus::InVisit,
            "in-progress" => VisitStatus::InProgress,
            "completed" => VisitStatus::Completed,
            "cancelled" | "canceled" => VisitStatus::Cancelled,
            _ => VisitStatus::Unknown,
        })
    }
}

wire_token_serde!(VisitStatus);

/// Settlement state as reported by the payment service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    Pending,
    Refunded,
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match normalise_token(s).as_str() {
            "paid" => PaymentStatus::Paid,
            "unpaid" => PaymentStatus::Unpaid,
            "pending" => PaymentStatus::Pending,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Unknown,
        })
    }
}

wire_token_serde!(PaymentStatus);

/// Discount path applied by the payment service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscountMode {
    /// The full fee was waived.
    Waived,
    /// A discount was applied and the remainder settled.
    DiscountedPaid,
    /// A discount was requested but not yet approved.
    PendingApproval,
    Unknown,
}

impl DiscountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountMode::Waived => "waived",
            DiscountMode::DiscountedPaid => "discounted-paid",
            DiscountMode::PendingApproval => "pending-approval",
            DiscountMode::Unknown => "unknown",
        }
    }
}

impl FromStr for DiscountMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match normalise_token(s).as_str() {
            "waived" => DiscountMode::Waived,
            "discounted-paid" => DiscountMode::DiscountedPaid,
            "pending-approval" => DiscountMode::PendingApproval,
            _ => DiscountMode::Unknown,
        })
    }
}

wire_token_serde!(DiscountMode);

/// Read-only view of the upstream status fields for one visit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitStatusSnapshot {
    #[serde(default)]
    pub visit_status: VisitStatus,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default)]
    pub discount_mode: Option<DiscountMode>,
}

impl VisitStatusSnapshot {
    pub fn new(visit_status: VisitStatus) -> Self {
        Self {
            visit_status,
            payment_status: None,
            discount_mode: None,
        }
    }

    pub fn with_payment(mut self, payment_status: PaymentStatus) -> Self {
        self.payment_status = Some(payment_status);
        self
    }

    pub fn with_discount(mut self, discount_mode: DiscountMode) -> Self {
        self.discount_mode = Some(discount_mode);
        self
    }

    /// Parse a snapshot from the JSON published by the queue/payment bridge.
    ///
    /// # Errors
    ///
    /// Returns [`EditorError::InvalidSnapshot`] naming the failing field when the JSON does
    /// not have the snapshot shape (unknown status *values* are not errors).
    pub fn parse_json(json_text: &str) -> EditorResult<Self> {
        let mut deserializer = serde_json::Deserializer::from_str(json_text);
        serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
            let path = err.path().to_string();
            let path = if path.is_empty() || path == "." {
                "<root>".to_string()
            } else {
                path
            };
            EditorError::InvalidSnapshot(format!("schema mismatch at {path}: {}", err.inner()))
        })
    }
}

/// Supplier of the latest status snapshot.
///
/// Gate checks call [`StatusSource::current`] every time; the engine never keeps its own copy.
pub trait StatusSource: Send + Sync {
    fn current(&self) -> VisitStatusSnapshot;
}

impl StatusSource for watch::Receiver<VisitStatusSnapshot> {
    fn current(&self) -> VisitStatusSnapshot {
        self.borrow().clone()
    }
}
