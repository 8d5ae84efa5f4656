use super::{KeyProtection, SessionAffinityPolicy, COOKIE};
use crate::{configuration::SessionAffinityConfig, policy::NamedPolicy};
use cookie::Cookie;
use hyper::{
  header::{HeaderValue, COOKIE as COOKIE_HEADER, SET_COOKIE},
  Body, Request, Response,
};
use log::error;

/// Carries the affinity key in a cookie named after `affinity_key_name`.
#[derive(Debug)]
pub struct CookieSessionAffinity {
  protection: KeyProtection,
}

impl CookieSessionAffinity {
  pub fn new(protection: KeyProtection) -> CookieSessionAffinity {
    CookieSessionAffinity { protection }
  }
}

impl NamedPolicy for CookieSessionAffinity {
  fn name(&self) -> &'static str {
    COOKIE
  }
}

impl SessionAffinityPolicy for CookieSessionAffinity {
  fn protection(&self) -> &KeyProtection {
    &self.protection
  }

  fn read_protected_key(&self, request: &Request<Body>, config: &SessionAffinityConfig) -> Option<String> {
    request
      .headers()
      .get_all(COOKIE_HEADER)
      .iter()
      .filter_map(|header| header.to_str().ok())
      .flat_map(|header| header.split(';'))
      .find_map(|cookie_str| {
        let cookie = Cookie::parse(cookie_str.trim()).ok()?;
        if cookie.name() == config.affinity_key_name {
          Some(cookie.value().to_string())
        } else {
          None
        }
      })
  }

  fn write_protected_key(&self, response: &mut Response<Body>, config: &SessionAffinityConfig, protected_key: &str) {
    let settings = &config.cookie;
    let mut builder = Cookie::build(config.affinity_key_name.clone(), protected_key.to_string())
      .http_only(settings.http_only)
      .secure(settings.secure);
    if let Some(path) = &settings.path {
      builder = builder.path(path.clone());
    }
    if let Some(domain) = &settings.domain {
      builder = builder.domain(domain.clone());
    }
    if let Some(same_site) = settings.same_site {
      builder = builder.same_site(same_site.into());
    }
    if let Some(max_age_ms) = settings.max_age_ms {
      let max_age_ms = i64::try_from(max_age_ms).unwrap_or(i64::MAX);
      builder = builder.max_age(cookie::time::Duration::milliseconds(max_age_ms));
    }
    let cookie = builder.finish();

    match HeaderValue::from_str(&cookie.to_string()) {
      Ok(value) => {
        response.headers_mut().append(SET_COOKIE, value);
      }
      Err(e) => error!("unable to write affinity cookie {}: {}", config.affinity_key_name, e),
    }
  }
}
