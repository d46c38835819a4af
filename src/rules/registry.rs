//! Copy-on-write rule registry

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{AlertRule, InvalidRuleError};

type RuleMap = BTreeMap<String, Arc<AlertRule>>;

/// Point-in-time view of the registered rules
///
/// Cloning is cheap; later registry mutations never show up in an
/// existing snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    rules: Arc<RuleMap>,
    version: u64,
}

impl RuleSnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<AlertRule>> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AlertRule>> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Registry version this snapshot was taken at
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Holds validated alert rules
pub struct RuleRegistry {
    current: RwLock<RuleSnapshot>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(RuleSnapshot::default()),
        }
    }

    /// Validate and insert a rule, replacing any rule with the same name
    ///
    /// Returns the replaced rule, if any.
    pub fn upsert(&self, rule: AlertRule) -> Result<Option<Arc<AlertRule>>, InvalidRuleError> {
        rule.validate()?;

        if rule.window < rule.frequency {
            tracing::warn!(
                rule = %rule.name,
                window = ?rule.window,
                frequency = ?rule.frequency,
                "Rule window is shorter than its frequency; some telemetry will never be evaluated"
            );
        }

        let mut current = self.current.write();
        let mut rules = RuleMap::clone(&current.rules);
        let previous = rules.insert(rule.name.clone(), Arc::new(rule));
        *current = RuleSnapshot {
            rules: Arc::new(rules),
            version: current.version + 1,
        };

        Ok(previous)
    }

    /// Remove a rule; absent names are not an error
    pub fn remove(&self, name: &str) -> Option<Arc<AlertRule>> {
        let mut current = self.current.write();
        if !current.rules.contains_key(name) {
            return None;
        }

        let mut rules = RuleMap::clone(&current.rules);
        let removed = rules.remove(name);
        *current = RuleSnapshot {
            rules: Arc::new(rules),
            version: current.version + 1,
        };

        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<AlertRule>> {
        self.current.read().rules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current.read().rules.contains_key(name)
    }

    /// Current immutable view of all rules
    pub fn snapshot(&self) -> RuleSnapshot {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.current.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
