use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use url::Url;

use crate::config::RoutesConfig;
use crate::http::Request;

/// How a request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Different origin; never intercepted
  CrossOrigin,
  /// Mutating request to a write endpoint; queued when not online
  QueueableWrite,
  /// Any other mutating request; passed through
  Write,
  /// Safe method other than GET, such as HEAD; passed through uncached
  Uncacheable,
  /// Cache-first asset. `image` assets fall back to the offline image.
  StaticAsset { image: bool },
  /// Network-first with a synthetic offline payload as last resort
  ReadEndpoint,
  /// Network-first with the offline page as last resort
  Navigation,
  /// Network-first with cache fallback only
  Default,
}

impl RequestClass {
  pub fn as_str(self) -> &'static str {
    match self {
      RequestClass::CrossOrigin => "cross_origin",
      RequestClass::QueueableWrite => "queueable_write",
      RequestClass::Write => "write",
      RequestClass::Uncacheable => "uncacheable",
      RequestClass::StaticAsset { .. } => "static_asset",
      RequestClass::ReadEndpoint => "read_endpoint",
      RequestClass::Navigation => "navigation",
      RequestClass::Default => "default",
    }
  }
}

/// The portal origin plus the route lists that drive classification.
#[derive(Debug, Clone)]
pub struct RouteTable {
  base: Url,
  read_endpoints: Vec<String>,
  write_endpoints: Vec<String>,
  asset_extensions: Vec<String>,
  asset_path_markers: Vec<String>,
  image_extensions: Vec<String>,
  offline_page: Url,
  offline_image: Url,
  precache: Vec<Url>,
}

impl RouteTable {
  pub fn new(base: Url, routes: &RoutesConfig) -> Result<Self> {
    let join = |path: &str| {
      base
        .join(path)
        .map_err(|e| eyre!("Invalid route '{}': {}", path, e))
    };

    Ok(Self {
      offline_page: join(&routes.offline_page)?,
      offline_image: join(&routes.offline_image)?,
      precache: routes
        .precache
        .iter()
        .map(|p| join(p))
        .collect::<Result<_>>()?,
      read_endpoints: routes.read_endpoints.clone(),
      write_endpoints: routes.write_endpoints.clone(),
      asset_extensions: routes.asset_extensions.clone(),
      asset_path_markers: routes.asset_path_markers.clone(),
      image_extensions: routes.image_extensions.clone(),
      base,
    })
  }

  pub fn with_defaults(base: Url) -> Result<Self> {
    Self::new(base, &RoutesConfig::default())
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// Scheme, host and port all match the portal's.
  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.base.origin()
  }

  /// Classify a request. Cross-origin wins, then writes and other non-GET
  /// methods, then the GET classes in order: assets, read endpoints,
  /// navigations, everything else.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if !self.is_same_origin(&request.url) {
      return RequestClass::CrossOrigin;
    }

    let path = request.url.path();

    if request.is_mutating() {
      return if self.write_endpoints.iter().any(|endpoint| path == endpoint) {
        RequestClass::QueueableWrite
      } else {
        RequestClass::Write
      };
    }

    if request.method != Method::GET {
      return RequestClass::Uncacheable;
    }

    if let Some(image) = self.asset_kind(path) {
      return RequestClass::StaticAsset { image };
    }

    if self.read_endpoints.iter().any(|prefix| matches_prefix(path, prefix)) {
      return RequestClass::ReadEndpoint;
    }

    if request.navigate || request.accepts_html() {
      return RequestClass::Navigation;
    }

    RequestClass::Default
  }

  /// `Some(is_image)` when the path names a static asset.
  fn asset_kind(&self, path: &str) -> Option<bool> {
    let extension = path
      .rsplit('/')
      .next()
      .and_then(|segment| segment.rsplit_once('.'))
      .map(|(_, ext)| ext.to_lowercase());

    let by_extension = extension
      .as_ref()
      .is_some_and(|ext| self.asset_extensions.contains(ext));
    let by_path = self
      .asset_path_markers
      .iter()
      .any(|marker| path.contains(marker.as_str()));

    if !by_extension && !by_path {
      return None;
    }
    Some(extension.is_some_and(|ext| self.image_extensions.contains(&ext)))
  }

  pub fn offline_page_url(&self) -> &Url {
    &self.offline_page
  }

  pub fn offline_image_url(&self) -> &Url {
    &self.offline_image
  }

  pub fn precache_urls(&self) -> &[Url] {
    &self.precache
  }

  /// Resolve a path (or absolute URL) against the portal origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }
}

/// `/api/news` matches `/api/news` and `/api/news/3`, not `/api/newsletter`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
    None => false,
  }
}
