//! Filter decides whether a namespace is in scope for the relays.

use std::collections::BTreeMap;

/// Label a namespace must carry for an opt-in relay to act on it.
pub const INCLUSION_LABEL: &str = "admission-relay.dev/include";

/// Value [`INCLUSION_LABEL`] must have for the namespace to be included.
pub const INCLUSION_VALUE: &str = "true";

/// Labels is the label set of a namespace.
pub type Labels = BTreeMap<String, String>;

/// EnforcementMode is the process-wide namespace policy, fixed at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Every namespace is in scope.
    #[default]
    DefaultEnabled,
    /// Only namespaces labeled `INCLUSION_LABEL=INCLUSION_VALUE` are in scope.
    OptIn,
}

impl From<bool> for EnforcementMode {
    /// Maps the "require label" setting onto a mode.
    fn from(require_label: bool) -> Self {
        if require_label {
            EnforcementMode::OptIn
        } else {
            EnforcementMode::DefaultEnabled
        }
    }
}

/// Should_enforce reports whether a namespace with `labels` is subject to the relay.
///
/// A missing label set is treated the same as one without the inclusion key.
pub fn should_enforce(mode: EnforcementMode, labels: Option<&Labels>) -> bool {
    match mode {
        EnforcementMode::DefaultEnabled => true,
        EnforcementMode::OptIn => labels
            .and_then(|l| l.get(INCLUSION_LABEL))
            .is_some_and(|v| v == INCLUSION_VALUE),
    }
}
