use crate::error::{ConfigurationError, PolicyKind};
use std::{collections::HashMap, sync::Arc};

pub trait NamedPolicy {
  fn name(&self) -> &'static str;
}

/// Maps the policy names used in cluster configuration to their implementations.
///
/// Names are matched case-insensitively. Resolution happens when a configuration is applied, so an
/// unknown name is rejected as a [`ConfigurationError`] instead of failing a request later.
#[derive(Debug)]
pub struct PolicyRegistry<P: ?Sized> {
  kind: PolicyKind,
  default_name: &'static str,
  policies: HashMap<String, Arc<P>>,
}

impl<P: ?Sized + NamedPolicy> PolicyRegistry<P> {
  pub fn new(kind: PolicyKind, default_name: &'static str) -> PolicyRegistry<P> {
    PolicyRegistry {
      kind,
      default_name,
      policies: HashMap::new(),
    }
  }

  /// Adds a policy, replacing any policy previously registered under the same name.
  pub fn register(&mut self, policy: Arc<P>) -> &mut PolicyRegistry<P> {
    self.policies.insert(policy.name().to_lowercase(), policy);
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<P>> {
    self.policies.get(&name.to_lowercase()).cloned()
  }

  /// Resolves `name`, falling back to the registry's default when the configuration names none.
  pub fn resolve(&self, cluster: &str, name: Option<&str>) -> Result<Arc<P>, ConfigurationError> {
    let name = name.unwrap_or(self.default_name);
    self.get(name).ok_or_else(|| ConfigurationError::UnknownPolicy {
      cluster: cluster.to_string(),
      kind: self.kind,
      name: name.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug)]
  struct Alpha;

  impl NamedPolicy for Alpha {
    fn name(&self) -> &'static str {
      "Alpha"
    }
  }

  fn registry() -> PolicyRegistry<dyn NamedPolicy> {
    let mut registry: PolicyRegistry<dyn NamedPolicy> = PolicyRegistry::new(PolicyKind::LoadBalancing, "Alpha");
    registry.register(Arc::new(Alpha));
    registry
  }

  #[test]
  pub fn resolve_is_case_insensitive() {
    let registry = registry();

    assert_eq!(registry.resolve("c1", Some("aLPHA")).unwrap().name(), "Alpha");
  }

  #[test]
  pub fn resolve_without_name_uses_default() {
    let registry = registry();

    assert_eq!(registry.resolve("c1", None).unwrap().name(), "Alpha");
  }

  #[test]
  pub fn resolve_unknown_name_is_configuration_error() {
    let registry = registry();

    match registry.resolve("c1", Some("Beta")) {
      Err(ConfigurationError::UnknownPolicy { cluster, kind, name }) => {
        assert_eq!(cluster, "c1");
        assert_eq!(kind, PolicyKind::LoadBalancing);
        assert_eq!(name, "Beta");
      }
      other => panic!("unexpected result: {:?}", other.map(|p| p.name())),
    }
  }
}
