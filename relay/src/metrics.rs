//! Metrics contains the counters recorded by the relays and reconcilers.
//!
//! Values go through the [`metrics`](::metrics) facade; `main` installs the Prometheus exporter.

use ::metrics::{counter, describe_counter};
use strum::IntoStaticStr;

use crate::Role;

const REQUESTS: &str = "relay_requests_total";
const RECONCILES: &str = "relay_reconciles_total";
const RECONCILE_FAILURES: &str = "relay_reconcile_failures_total";

/// Outcome is how a relay disposed of an admission request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    /// The namespace was out of scope and the request was allowed locally.
    Skipped,
    /// The delegate's verdict was returned.
    Relayed,
    /// The relay produced a fail verdict.
    Failed,
    /// The request body was not an admission review.
    Invalid,
}

/// Describe registers help text for every counter.
pub fn describe() {
    describe_counter!(REQUESTS, "Admission requests handled, by role and outcome.");
    describe_counter!(RECONCILES, "Webhook configuration reconciles, by role.");
    describe_counter!(
        RECONCILE_FAILURES,
        "Webhook configuration reconciles that failed, by role."
    );
}

pub fn request(role: Role, outcome: Outcome) {
    let role: &'static str = role.into();
    let outcome: &'static str = outcome.into();
    counter!(REQUESTS, "role" => role, "outcome" => outcome).increment(1);
}

pub fn reconciled(role: Role) {
    let role: &'static str = role.into();
    counter!(RECONCILES, "role" => role).increment(1);
}

pub fn reconcile_failed(role: Role) {
    let role: &'static str = role.into();
    counter!(RECONCILE_FAILURES, "role" => role).increment(1);
}
