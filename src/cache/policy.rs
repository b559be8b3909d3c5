//! Request classification: which caching strategy and store govern a request.
//!
//! Policies are evaluated in declaration order and the first match wins. The
//! table always ends in a catch-all, so exactly one policy applies to any
//! request.

use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::StoreLimits;
use crate::net::{Method, Request};

pub const IMAGES_CACHE: &str = "images-cache";
pub const FONTS_CACHE: &str = "fonts-cache";
pub const STATIC_CACHE: &str = "static-resources-cache";
pub const API_CACHE: &str = "api-cache";
pub const PAGES_CACHE: &str = "pages-cache";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"];
const FONT_EXTENSIONS: &[&str] = &["woff", "woff2", "ttf", "otf", "eot"];
const STATIC_EXTENSIONS: &[&str] = &["js", "css", "json", "webmanifest"];

const READ_METHODS: &[Method] = &[Method::Get, Method::Head];
const WRITE_METHODS: &[Method] = &[Method::Post, Method::Put, Method::Patch, Method::Delete];

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  StaleWhileRevalidate,
  NetworkFirst,
  NetworkOnly,
}

/// What a mutating request does when the network is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
  /// Return the error to the caller
  Surface,
  /// Store in the domain's mutation queue and report "accepted"
  Queue,
  /// Append to the failed-request log and return the error
  Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPattern {
  /// Last path segment ends in one of these extensions (case-insensitive)
  Extensions(&'static [&'static str]),
  /// Path starts with the prefix
  PathPrefix(&'static str),
  /// The document root (`/` or `/index.html`)
  Root,
  Any,
}

impl RequestPattern {
  fn matches_path(&self, path: &str) -> bool {
    match self {
      RequestPattern::Extensions(extensions) => {
        let segment = path.rsplit('/').next().unwrap_or_default();
        match segment.rsplit_once('.') {
          Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|e| *e == ext)
          }
          _ => false,
        }
      }
      RequestPattern::PathPrefix(prefix) => path.starts_with(prefix),
      RequestPattern::Root => path == "/" || path == "/index.html",
      RequestPattern::Any => true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMatcher {
  pub pattern: RequestPattern,
  /// Restrict to these methods; `None` accepts any
  pub methods: Option<&'static [Method]>,
}

impl RequestMatcher {
  pub fn new(pattern: RequestPattern) -> Self {
    Self {
      pattern,
      methods: None,
    }
  }

  pub fn methods(mut self, methods: &'static [Method]) -> Self {
    self.methods = Some(methods);
    self
  }

  pub fn matches(&self, request: &Request) -> bool {
    let method_ok = self
      .methods
      .map(|methods| methods.contains(&request.method))
      .unwrap_or(true);
    method_ok && self.pattern.matches_path(request.url.path())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  /// Short label used in logs
  pub name: &'static str,
  pub matcher: RequestMatcher,
  pub strategy: Strategy,
  /// Backing store; `None` for network-only policies
  pub store_name: Option<String>,
  pub max_entries: usize,
  pub max_age: Duration,
  pub cacheable_statuses: BTreeSet<u16>,
  pub on_failure: FailureAction,
}

impl CachePolicy {
  pub fn new(name: &'static str, matcher: RequestMatcher, strategy: Strategy) -> Self {
    Self {
      name,
      matcher,
      strategy,
      store_name: None,
      max_entries: 0,
      max_age: Duration::zero(),
      cacheable_statuses: BTreeSet::from([200]),
      on_failure: FailureAction::Surface,
    }
  }

  pub fn with_store(mut self, store_name: &str, max_entries: usize, max_age: Duration) -> Self {
    self.store_name = Some(store_name.to_string());
    self.max_entries = max_entries;
    self.max_age = max_age;
    self
  }

  pub fn on_failure(mut self, action: FailureAction) -> Self {
    self.on_failure = action;
    self
  }

  pub fn cacheable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
    self.cacheable_statuses = statuses.into_iter().collect();
    self
  }

  pub fn is_cacheable(&self, status: u16) -> bool {
    self.cacheable_statuses.contains(&status)
  }
}

#[derive(Debug, Clone)]
pub struct CachePolicyTable {
  policies: Vec<CachePolicy>,
}

impl CachePolicyTable {
  /// Build a table from `policies`, appending a network-only catch-all.
  pub fn new(mut policies: Vec<CachePolicy>) -> Self {
    policies.push(
      CachePolicy::new(
        "fallback",
        RequestMatcher::new(RequestPattern::Any),
        Strategy::NetworkOnly,
      )
      .on_failure(FailureAction::Record),
    );
    Self { policies }
  }

  /// The table the agent runs with unless configured otherwise.
  pub fn defaults() -> Self {
    Self::new(vec![
      CachePolicy::new(
        "images",
        RequestMatcher::new(RequestPattern::Extensions(IMAGE_EXTENSIONS)).methods(READ_METHODS),
        Strategy::CacheFirst,
      )
      .with_store(IMAGES_CACHE, 100, Duration::days(30)),
      CachePolicy::new(
        "fonts",
        RequestMatcher::new(RequestPattern::Extensions(FONT_EXTENSIONS)).methods(READ_METHODS),
        Strategy::CacheFirst,
      )
      .with_store(FONTS_CACHE, 30, Duration::days(365)),
      CachePolicy::new(
        "static",
        RequestMatcher::new(RequestPattern::Extensions(STATIC_EXTENSIONS)).methods(READ_METHODS),
        Strategy::StaleWhileRevalidate,
      )
      .with_store(STATIC_CACHE, 60, Duration::days(7)),
      CachePolicy::new(
        "api-read",
        RequestMatcher::new(RequestPattern::PathPrefix("/api/")).methods(READ_METHODS),
        Strategy::NetworkFirst,
      )
      .with_store(API_CACHE, 50, Duration::minutes(5)),
      CachePolicy::new(
        "api-write",
        RequestMatcher::new(RequestPattern::PathPrefix("/api/")).methods(WRITE_METHODS),
        Strategy::NetworkOnly,
      )
      .on_failure(FailureAction::Queue),
      CachePolicy::new(
        "document",
        RequestMatcher::new(RequestPattern::Root).methods(READ_METHODS),
        Strategy::NetworkFirst,
      )
      .with_store(PAGES_CACHE, 20, Duration::days(1)),
    ])
  }

  /// Apply per-store limit overrides from configuration.
  pub fn with_limits(mut self, overrides: &BTreeMap<String, StoreLimits>) -> Self {
    for policy in &mut self.policies {
      let Some(limits) = policy
        .store_name
        .as_ref()
        .and_then(|name| overrides.get(name))
      else {
        continue;
      };
      if let Some(max_entries) = limits.max_entries {
        policy.max_entries = max_entries;
      }
      if let Some(secs) = limits.max_age_secs {
        policy.max_age = Duration::seconds(secs);
      }
    }
    self
  }

  /// First matching policy.
  pub fn select(&self, request: &Request) -> &CachePolicy {
    self
      .policies
      .iter()
      .find(|p| p.matcher.matches(request))
      .unwrap_or_else(|| &self.policies[self.policies.len() - 1])
  }

  /// Names of every store some policy writes to.
  pub fn store_names(&self) -> BTreeSet<&str> {
    self
      .policies
      .iter()
      .filter_map(|p| p.store_name.as_deref())
      .collect()
  }

  pub fn policies(&self) -> &[CachePolicy] {
    &self.policies
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(method: Method, path: &str) -> Request {
    Request::new(
      method,
      Url::parse("https://directory.example.org")
        .unwrap()
        .join(path)
        .unwrap(),
    )
  }

  fn selected(method: Method, path: &str) -> &'static str {
    CachePolicyTable::defaults().select(&request(method, path)).name
  }

  #[test]
  fn test_classifies_by_extension() {
    assert_eq!(selected(Method::Get, "/avatars/42.PNG"), "images");
    assert_eq!(selected(Method::Get, "/fonts/inter.woff2"), "fonts");
    assert_eq!(selected(Method::Get, "/assets/app.js"), "static");
    assert_eq!(selected(Method::Get, "/assets/app.css?v=3"), "static");
  }

  #[test]
  fn test_api_reads_and_writes_use_different_policies() {
    assert_eq!(selected(Method::Get, "/api/members"), "api-read");
    assert_eq!(selected(Method::Post, "/api/gamification/sync"), "api-write");
    assert_eq!(selected(Method::Delete, "/api/members/3"), "api-write");
  }

  #[test]
  fn test_first_match_wins() {
    // An image under /api/ is still an image.
    assert_eq!(selected(Method::Get, "/api/avatars/1.jpg"), "images");
  }

  #[test]
  fn test_document_and_fallback() {
    assert_eq!(selected(Method::Get, "/"), "document");
    assert_eq!(selected(Method::Get, "/index.html"), "document");
    assert_eq!(selected(Method::Get, "/members/42"), "fallback");
    assert_eq!(selected(Method::Post, "/contact"), "fallback");
    // A dot-file is not an extension match.
    assert_eq!(selected(Method::Get, "/.css"), "fallback");
  }

  #[test]
  fn test_fallback_records_failures() {
    let table = CachePolicyTable::defaults();
    let policy = table.select(&request(Method::Post, "/contact"));
    assert_eq!(policy.strategy, Strategy::NetworkOnly);
    assert_eq!(policy.on_failure, FailureAction::Record);
    assert!(policy.store_name.is_none());
  }

  #[test]
  fn test_empty_table_still_selects_catch_all() {
    let table = CachePolicyTable::new(Vec::new());
    assert_eq!(table.select(&request(Method::Get, "/x.png")).name, "fallback");
  }

  #[test]
  fn test_store_names() {
    let table = CachePolicyTable::defaults();
    let names = table.store_names();
    let expected: BTreeSet<&str> =
      [IMAGES_CACHE, FONTS_CACHE, STATIC_CACHE, API_CACHE, PAGES_CACHE].into();
    assert_eq!(names, expected);
  }

  #[test]
  fn test_limit_overrides() {
    let overrides = BTreeMap::from([(
      IMAGES_CACHE.to_string(),
      StoreLimits {
        max_entries: Some(5),
        max_age_secs: Some(60),
      },
    )]);
    let table = CachePolicyTable::defaults().with_limits(&overrides);
    let images = table.select(&request(Method::Get, "/a.png"));
    assert_eq!(images.max_entries, 5);
    assert_eq!(images.max_age, Duration::seconds(60));

    let fonts = table.select(&request(Method::Get, "/a.woff"));
    assert_eq!(fonts.max_entries, 30);
  }

  #[test]
  fn test_cacheable_statuses_default_to_ok() {
    let policy = CachePolicy::new("t", RequestMatcher::new(RequestPattern::Any), Strategy::CacheFirst);
    assert!(policy.is_cacheable(200));
    assert!(!policy.is_cacheable(404));
    let policy = policy.cacheable_statuses([0, 200]);
    assert!(policy.is_cacheable(0));
  }
}
