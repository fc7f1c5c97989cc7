// Process-owned registry of prepared behavior specs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::spec::BehaviorSpec;
use super::BehaviorError;
use crate::stats::OperationQuality;

#[derive(Debug, Clone, Default)]
pub struct BehaviorSpecRegistry {
    specs: HashMap<String, Arc<BehaviorSpec>>,
}

impl BehaviorSpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare and register every spec, then check async references resolve
    pub fn from_specs(specs: impl IntoIterator<Item = BehaviorSpec>) -> Result<Self, BehaviorError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        for name in registry.specs.keys() {
            registry.reachable(name)?;
        }
        Ok(registry)
    }

    /// Later registrations under the same name replace earlier ones
    pub fn register(&mut self, spec: BehaviorSpec) -> Result<Arc<BehaviorSpec>, BehaviorError> {
        let spec = Arc::new(spec.prepare()?);
        debug!(spec = %spec.name, operations = spec.num_operations(), "registered behavior spec");
        self.specs.insert(spec.name.clone(), spec.clone());
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Result<Arc<BehaviorSpec>, BehaviorError> {
        self.specs
            .get(name)
            .cloned()
            .ok_or_else(|| BehaviorError::UnknownSpec(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// `root` followed by every spec it can start, depth first
    fn reachable(&self, root: &str) -> Result<Vec<Arc<BehaviorSpec>>, BehaviorError> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let spec = self.get(&name)?;
            for op in (0..spec.num_operations()).rev() {
                if let Some(child) = spec.async_behavior(op) {
                    stack.push(child.to_string());
                }
            }
            order.push(spec);
        }
        Ok(order)
    }

    /// Quality bars for every operation a user of `root` can run
    ///
    /// Operation names shared between specs keep the first definition.
    pub fn operation_qualities(&self, root: &str) -> Result<Vec<OperationQuality>, BehaviorError> {
        let mut names = HashSet::new();
        let mut qualities = Vec::new();
        for spec in self.reachable(root)? {
            for quality in spec.operation_qualities() {
                if names.insert(quality.name.clone()) {
                    qualities.push(quality);
                }
            }
        }
        Ok(qualities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::spec::fixtures::two_state;

    #[test]
    fn test_missing_async_spec_rejected() {
        let err = BehaviorSpecRegistry::from_specs([two_state("user", Some("auction"))]).unwrap_err();
        assert!(matches!(err, BehaviorError::UnknownSpec(ref name) if name == "auction"));
    }

    #[test]
    fn test_qualities_cover_reachable_specs() {
        let registry = BehaviorSpecRegistry::from_specs([
            two_state("user", Some("auction")),
            two_state("auction", None),
            two_state("unused", None),
        ])
        .unwrap();
        let names: Vec<String> = registry
            .operation_qualities("user")
            .unwrap()
            .into_iter()
            .map(|q| q.name)
            .collect();
        assert_eq!(names, vec!["user-a", "user-b", "auction-a", "auction-b"]);
        assert!(registry.get("nope").is_err());
    }
}
