//! Environment constraints and their evaluation.
//!
//! The host supplies an [`EnvironmentSnapshot`] (pushed through
//! `Scheduler::set_context` or polled from an [`EnvironmentProvider`]); the
//! [`ConstraintEvaluator`] decides whether a task's [`TaskConstraints`] hold
//! against it. Evaluation is pure and repeated on every tick.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Battery percentage at or above which the battery is not considered low.
pub const BATTERY_NOT_LOW_THRESHOLD: u8 = 20;

/// Default free-storage threshold (bytes) below which storage is considered low.
pub const DEFAULT_STORAGE_LOW_THRESHOLD: u64 = 512 * 1024 * 1024;

/// Network condition a task needs before it may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    /// No network needed.
    #[default]
    NotRequired,
    /// Any connection.
    Connected,
    /// A connection that is not metered.
    Unmetered,
    /// A connection that is not roaming.
    NotRoaming,
    /// Any connection; metered connections are accepted.
    Metered,
}

/// Run the task only after the host reports a change to a content URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentTrigger {
    /// Watched URI.
    pub uri: String,
    /// Also fire for URIs below `uri`.
    pub trigger_for_descendants: bool,
}

impl ContentTrigger {
    /// Watch exactly `uri`.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            trigger_for_descendants: false,
        }
    }

    /// Also fire for URIs below the watched one.
    #[must_use]
    pub const fn with_descendants(mut self) -> Self {
        self.trigger_for_descendants = true;
        self
    }

    fn matches(&self, changed: &str) -> bool {
        if changed == self.uri {
            return true;
        }
        if !self.trigger_for_descendants {
            return false;
        }
        changed.strip_prefix(self.uri.as_str()).is_some_and(|rest| {
            !rest.is_empty() && (self.uri.ends_with('/') || rest.starts_with('/'))
        })
    }
}

/// Preconditions a task needs from its environment. Unset fields always hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Network requirement.
    pub network: NetworkRequirement,
    /// Device must be charging.
    pub requires_charging: bool,
    /// Device must be idle.
    pub requires_device_idle: bool,
    /// Battery must be at or above [`BATTERY_NOT_LOW_THRESHOLD`].
    pub requires_battery_not_low: bool,
    /// Free storage must be at or above the evaluator's threshold.
    pub requires_storage_not_low: bool,
    /// Content change that must have been reported.
    pub content_trigger: Option<ContentTrigger>,
}

impl TaskConstraints {
    /// Constraints that always hold.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Require a network condition.
    #[must_use]
    pub const fn with_network(mut self, network: NetworkRequirement) -> Self {
        self.network = network;
        self
    }

    /// Require the device to be charging.
    #[must_use]
    pub const fn with_charging(mut self, required: bool) -> Self {
        self.requires_charging = required;
        self
    }

    /// Require the device to be idle.
    #[must_use]
    pub const fn with_device_idle(mut self, required: bool) -> Self {
        self.requires_device_idle = required;
        self
    }

    /// Require the battery not to be low.
    #[must_use]
    pub const fn with_battery_not_low(mut self, required: bool) -> Self {
        self.requires_battery_not_low = required;
        self
    }

    /// Require storage not to be low.
    #[must_use]
    pub const fn with_storage_not_low(mut self, required: bool) -> Self {
        self.requires_storage_not_low = required;
        self
    }

    /// Require a content change.
    #[must_use]
    pub fn with_content_trigger(mut self, trigger: ContentTrigger) -> Self {
        self.content_trigger = Some(trigger);
        self
    }

    /// No constraint is set.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }
}

/// Host-reported device state. Read-only to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Any network connection is up.
    pub has_network: bool,
    /// The active connection is metered.
    pub network_is_metered: bool,
    /// The active connection is roaming.
    pub is_roaming: bool,
    /// The device is charging.
    pub is_charging: bool,
    /// The device is idle.
    pub is_idle: bool,
    /// Battery percentage, 0–100.
    pub battery_level: u8,
    /// Free storage in bytes.
    pub available_storage: u64,
    /// Content URIs the host reports as changed.
    #[serde(default)]
    pub changed_content: BTreeSet<String>,
}

/// Supplies environment snapshots to the scheduler.
///
/// Any `Fn() -> EnvironmentSnapshot` closure is a provider.
pub trait EnvironmentProvider: Send + Sync {
    /// Current device state.
    fn snapshot(&self) -> EnvironmentSnapshot;
}

impl<F> EnvironmentProvider for F
where
    F: Fn() -> EnvironmentSnapshot + Send + Sync,
{
    fn snapshot(&self) -> EnvironmentSnapshot {
        self()
    }
}

/// A single precondition that failed evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmetConstraint {
    /// Network requirement not met.
    Network(NetworkRequirement),
    /// Not charging.
    Charging,
    /// Not idle.
    DeviceIdle,
    /// Battery low.
    BatteryNotLow,
    /// Storage low.
    StorageNotLow,
    /// Watched content has not changed.
    ContentTrigger,
}

/// Evaluates [`TaskConstraints`] against an [`EnvironmentSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintEvaluator {
    storage_low_threshold: u64,
}

impl Default for ConstraintEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_STORAGE_LOW_THRESHOLD)
    }
}

impl ConstraintEvaluator {
    /// Create an evaluator with the platform's low-storage threshold in bytes.
    #[must_use]
    pub const fn new(storage_low_threshold: u64) -> Self {
        Self {
            storage_low_threshold,
        }
    }

    /// Low-storage threshold in bytes.
    #[must_use]
    pub const fn storage_low_threshold(&self) -> u64 {
        self.storage_low_threshold
    }

    /// Whether every constraint holds.
    #[must_use]
    pub fn is_satisfied(&self, constraints: &TaskConstraints, env: &EnvironmentSnapshot) -> bool {
        Self::network_ok(constraints.network, env)
            && (!constraints.requires_charging || env.is_charging)
            && (!constraints.requires_device_idle || env.is_idle)
            && (!constraints.requires_battery_not_low || Self::battery_ok(env))
            && (!constraints.requires_storage_not_low || self.storage_ok(env))
            && constraints
                .content_trigger
                .as_ref()
                .is_none_or(|trigger| Self::content_ok(trigger, env))
    }

    /// Every constraint that does not hold, in a stable order.
    #[must_use]
    pub fn unmet(
        &self,
        constraints: &TaskConstraints,
        env: &EnvironmentSnapshot,
    ) -> Vec<UnmetConstraint> {
        let mut unmet = Vec::new();
        if !Self::network_ok(constraints.network, env) {
            unmet.push(UnmetConstraint::Network(constraints.network));
        }
        if constraints.requires_charging && !env.is_charging {
            unmet.push(UnmetConstraint::Charging);
        }
        if constraints.requires_device_idle && !env.is_idle {
            unmet.push(UnmetConstraint::DeviceIdle);
        }
        if constraints.requires_battery_not_low && !Self::battery_ok(env) {
            unmet.push(UnmetConstraint::BatteryNotLow);
        }
        if constraints.requires_storage_not_low && !self.storage_ok(env) {
            unmet.push(UnmetConstraint::StorageNotLow);
        }
        if let Some(trigger) = &constraints.content_trigger {
            if !Self::content_ok(trigger, env) {
                unmet.push(UnmetConstraint::ContentTrigger);
            }
        }
        unmet
    }

    const fn network_ok(requirement: NetworkRequirement, env: &EnvironmentSnapshot) -> bool {
        match requirement {
            NetworkRequirement::NotRequired => true,
            NetworkRequirement::Connected | NetworkRequirement::Metered => env.has_network,
            NetworkRequirement::Unmetered => env.has_network && !env.network_is_metered,
            NetworkRequirement::NotRoaming => env.has_network && !env.is_roaming,
        }
    }

    const fn battery_ok(env: &EnvironmentSnapshot) -> bool {
        env.battery_level >= BATTERY_NOT_LOW_THRESHOLD
    }

    const fn storage_ok(&self, env: &EnvironmentSnapshot) -> bool {
        env.available_storage >= self.storage_low_threshold
    }

    fn content_ok(trigger: &ContentTrigger, env: &EnvironmentSnapshot) -> bool {
        env.changed_content.iter().any(|uri| trigger.matches(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORKS: [NetworkRequirement; 5] = [
        NetworkRequirement::NotRequired,
        NetworkRequirement::Connected,
        NetworkRequirement::Unmetered,
        NetworkRequirement::NotRoaming,
        NetworkRequirement::Metered,
    ];

    fn bit(mask: u32, n: u32) -> bool {
        mask & (1 << n) != 0
    }

    /// Independent model of a single network gate.
    fn network_expected(requirement: NetworkRequirement, env: &EnvironmentSnapshot) -> bool {
        match requirement {
            NetworkRequirement::NotRequired => true,
            NetworkRequirement::Connected | NetworkRequirement::Metered => env.has_network,
            NetworkRequirement::Unmetered => env.has_network && !env.network_is_metered,
            NetworkRequirement::NotRoaming => env.has_network && !env.is_roaming,
        }
    }

    #[test]
    fn truth_table_is_exhaustive() {
        let evaluator = ConstraintEvaluator::new(100);

        // 4 boolean constraints x 5 network requirements, against
        // 7 binary environment dimensions.
        for network in NETWORKS {
            for constraint_mask in 0..16u32 {
                let constraints = TaskConstraints::none()
                    .with_network(network)
                    .with_charging(bit(constraint_mask, 0))
                    .with_device_idle(bit(constraint_mask, 1))
                    .with_battery_not_low(bit(constraint_mask, 2))
                    .with_storage_not_low(bit(constraint_mask, 3));

                for env_mask in 0..128u32 {
                    let env = EnvironmentSnapshot {
                        has_network: bit(env_mask, 0),
                        network_is_metered: bit(env_mask, 1),
                        is_roaming: bit(env_mask, 2),
                        is_charging: bit(env_mask, 3),
                        is_idle: bit(env_mask, 4),
                        battery_level: if bit(env_mask, 5) { 20 } else { 19 },
                        available_storage: if bit(env_mask, 6) { 100 } else { 99 },
                        changed_content: BTreeSet::new(),
                    };

                    let any_unmet = !network_expected(network, &env)
                        || (constraints.requires_charging && !env.is_charging)
                        || (constraints.requires_device_idle && !env.is_idle)
                        || (constraints.requires_battery_not_low && env.battery_level < 20)
                        || (constraints.requires_storage_not_low && env.available_storage < 100);

                    assert_eq!(
                        evaluator.is_satisfied(&constraints, &env),
                        !any_unmet,
                        "constraints={constraints:?} env={env:?}"
                    );
                    assert_eq!(
                        evaluator.unmet(&constraints, &env).is_empty(),
                        !any_unmet
                    );
                }
            }
        }
    }

    #[test]
    fn unset_constraints_always_hold() {
        let evaluator = ConstraintEvaluator::default();
        assert!(TaskConstraints::none().is_unconstrained());
        assert!(evaluator.is_satisfied(&TaskConstraints::none(), &EnvironmentSnapshot::default()));
    }

    #[test]
    fn metered_accepts_metered_connections() {
        let evaluator = ConstraintEvaluator::default();
        let env = EnvironmentSnapshot {
            has_network: true,
            network_is_metered: true,
            ..EnvironmentSnapshot::default()
        };
        let metered = TaskConstraints::none().with_network(NetworkRequirement::Metered);
        let unmetered = TaskConstraints::none().with_network(NetworkRequirement::Unmetered);
        assert!(evaluator.is_satisfied(&metered, &env));
        assert_eq!(
            evaluator.unmet(&unmetered, &env),
            vec![UnmetConstraint::Network(NetworkRequirement::Unmetered)]
        );
    }

    #[test]
    fn content_trigger_matches_exact_and_descendants() {
        let evaluator = ConstraintEvaluator::default();
        let mut env = EnvironmentSnapshot::default();
        let exact = TaskConstraints::none().with_content_trigger(ContentTrigger::new("content://photos"));
        let nested = TaskConstraints::none()
            .with_content_trigger(ContentTrigger::new("content://photos").with_descendants());

        assert!(!evaluator.is_satisfied(&exact, &env));

        env.changed_content.insert("content://photos/42".into());
        assert!(!evaluator.is_satisfied(&exact, &env));
        assert!(evaluator.is_satisfied(&nested, &env));

        env.changed_content.clear();
        env.changed_content.insert("content://photosets".into());
        assert!(!evaluator.is_satisfied(&nested, &env));

        env.changed_content.insert("content://photos".into());
        assert!(evaluator.is_satisfied(&exact, &env));
    }

    #[test]
    fn closures_are_providers() {
        let provider = || EnvironmentSnapshot {
            battery_level: 80,
            ..EnvironmentSnapshot::default()
        };
        assert_eq!(provider.snapshot().battery_level, 80);
    }
}
