use super::{KeyProtection, SessionAffinityPolicy, CUSTOM_HEADER};
use crate::{configuration::SessionAffinityConfig, policy::NamedPolicy};
use hyper::{
  header::{HeaderName, HeaderValue},
  Body, Request, Response,
};
use log::error;

/// Carries the affinity key in a request header and returns it in a response header of the same
/// name.
#[derive(Debug)]
pub struct CustomHeaderSessionAffinity {
  protection: KeyProtection,
}

impl CustomHeaderSessionAffinity {
  pub fn new(protection: KeyProtection) -> CustomHeaderSessionAffinity {
    CustomHeaderSessionAffinity { protection }
  }
}

impl NamedPolicy for CustomHeaderSessionAffinity {
  fn name(&self) -> &'static str {
    CUSTOM_HEADER
  }
}

impl SessionAffinityPolicy for CustomHeaderSessionAffinity {
  fn protection(&self) -> &KeyProtection {
    &self.protection
  }

  // Several values are joined with ',' which never decodes, so they end up as an extraction failure.
  fn read_protected_key(&self, request: &Request<Body>, config: &SessionAffinityConfig) -> Option<String> {
    let values: Vec<_> = request
      .headers()
      .get_all(config.affinity_key_name.as_str())
      .iter()
      .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
      .collect();
    if values.is_empty() {
      None
    } else {
      Some(values.join(","))
    }
  }

  fn write_protected_key(&self, response: &mut Response<Body>, config: &SessionAffinityConfig, protected_key: &str) {
    let name = match HeaderName::from_bytes(config.affinity_key_name.as_bytes()) {
      Ok(name) => name,
      Err(e) => {
        error!("invalid affinity header name {}: {}", config.affinity_key_name, e);
        return;
      }
    };
    match HeaderValue::from_str(protected_key) {
      Ok(value) => {
        response.headers_mut().insert(name, value);
      }
      Err(e) => error!("unable to write affinity header {}: {}", config.affinity_key_name, e),
    }
  }
}
