//! Prescription records and the dispensation gate.
//!
//! Uploads create `Pending` prescriptions; an admin review decides them
//! exactly once. The gate answers, per order line, whether a controlled
//! product may be dispensed; it never mutates anything.

pub mod gate;
pub mod prescription;

pub use gate::{evaluate, GateResolution};
pub use prescription::{
    Prescription, PrescriptionDirectory, PrescriptionId, PrescriptionStatus, ReviewDecision,
};
