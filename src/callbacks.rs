//! OAuth callback URL resolution.
//!
//! Order for a provider: exact override, then a named route template, then
//! `{admin_api_base}/services/connections/{provider}/callback`. Relative
//! results are joined onto `public_base_url`, or onto the request origin
//! inferred from forwarding headers.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use utoipa::ToSchema;

use crate::config::CallbacksConfig;
use crate::error::{ServiceError, ServiceResult};

pub const CALLBACK_ROUTE: &str = "services.callback";
pub const INSTALLATION_CALLBACK_ROUTE: &str = "services.installation.callback";

/// Named URL templates grouped by route group; placeholders are
/// `{provider}`, `{ref}` and `{id}`.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes mounted by this service under `admin_api_base`.
    pub fn with_services_routes(group: &str, admin_api_base: &str) -> Self {
        let base = admin_api_base.trim_end_matches('/');
        let mut table = Self::new();
        table.insert(
            group,
            CALLBACK_ROUTE,
            format!("{base}/services/connections/{{provider}}/callback"),
        );
        table.insert(
            group,
            INSTALLATION_CALLBACK_ROUTE,
            format!("{base}/services/installations/{{ref}}/callback"),
        );
        table
    }

    pub fn insert(&mut self, group: &str, route: &str, template: impl Into<String>) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(route.to_string(), template.into());
    }

    pub fn template(&self, group: &str, route: &str) -> Option<&str> {
        self.groups.get(group)?.get(route).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CallbackParams {
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CallbackSource {
    Override,
    Route,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CallbackResolution {
    pub provider_id: String,
    pub url: String,
    pub source: CallbackSource,
    pub absolute: bool,
}

/// Request origin `scheme://host` from forwarding headers.
pub fn request_origin(headers: &HeaderMap, tls: bool) -> Option<String> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let scheme = value("x-forwarded-proto")
        .or_else(|| value("x-forwarded-scheme"))
        .unwrap_or(if tls { "https" } else { "http" });
    let host = value("x-forwarded-host").or_else(|| value(header::HOST.as_str()))?;
    Some(format!("{}://{}", scheme.to_ascii_lowercase(), host))
}

#[derive(Debug, Clone)]
pub struct CallbackUrlResolver {
    config: CallbacksConfig,
    admin_api_base: String,
    routes: RouteTable,
}

impl CallbackUrlResolver {
    pub fn new(config: CallbacksConfig, admin_api_base: &str) -> Self {
        let routes = RouteTable::with_services_routes(&config.urlkit_group, admin_api_base);
        Self::with_routes(config, admin_api_base, routes)
    }

    pub fn with_routes(config: CallbacksConfig, admin_api_base: &str, routes: RouteTable) -> Self {
        Self {
            config,
            admin_api_base: admin_api_base.trim_end_matches('/').to_string(),
            routes,
        }
    }

    pub fn config(&self) -> &CallbacksConfig {
        &self.config
    }

    pub fn resolve(
        &self,
        provider_id: &str,
        params: &CallbackParams,
        headers: Option<&HeaderMap>,
    ) -> ServiceResult<CallbackResolution> {
        let provider_id = provider_id.trim();
        if provider_id.is_empty() {
            return Err(ServiceError::validation("provider id is required"));
        }

        if let Some(url) = self.config.provider_url_overrides.get(provider_id) {
            let parsed = Url::parse(url).ok().filter(|u| matches!(u.scheme(), "http" | "https"));
            match parsed {
                Some(parsed) => {
                    return Ok(CallbackResolution {
                        provider_id: provider_id.to_string(),
                        url: parsed.to_string(),
                        source: CallbackSource::Override,
                        absolute: true,
                    });
                }
                None if self.config.strict => {
                    return Err(ServiceError::validation(format!(
                        "callback override for {} must be an absolute http(s) URL",
                        provider_id
                    )));
                }
                None => debug!(provider_id, "Ignoring invalid callback override"),
            }
        }

        let (path, source) = match self.route_path(provider_id, params) {
            Ok(path) => (path, CallbackSource::Route),
            Err(err) if self.config.strict => return Err(err),
            Err(err) => {
                debug!(provider_id, error = %err, "Falling back to default callback path");
                (self.fallback_path(provider_id), CallbackSource::Fallback)
            }
        };

        let origin = self
            .config
            .public_base_url
            .clone()
            .or_else(|| headers.and_then(|h| request_origin(h, false)));
        match origin {
            Some(origin) => {
                let url = join(&origin, &path)?;
                Ok(CallbackResolution {
                    provider_id: provider_id.to_string(),
                    url,
                    source,
                    absolute: true,
                })
            }
            None if self.config.strict => Err(ServiceError::validation(format!(
                "cannot build an absolute callback URL for {}: no public base URL or request host",
                provider_id
            ))),
            None => Ok(CallbackResolution {
                provider_id: provider_id.to_string(),
                url: path,
                source,
                absolute: false,
            }),
        }
    }

    fn route_path(&self, provider_id: &str, params: &CallbackParams) -> ServiceResult<String> {
        let route = self
            .config
            .provider_routes
            .get(provider_id)
            .unwrap_or(&self.config.default_route);
        let template = if route.starts_with('/') {
            route.as_str()
        } else {
            self.routes
                .template(&self.config.urlkit_group, route)
                .ok_or_else(|| {
                    ServiceError::not_found(format!(
                        "route {} is not registered in group {}",
                        route, self.config.urlkit_group
                    ))
                })?
        };
        let reference = params.reference.as_deref().unwrap_or(provider_id);
        let path = template
            .replace("{provider}", provider_id)
            .replace("{ref}", reference)
            .replace("{id}", params.id.as_deref().unwrap_or(reference));
        if path.contains('{') {
            return Err(ServiceError::validation(format!(
                "route {} has unresolved placeholders",
                route
            )));
        }
        Ok(path)
    }

    fn fallback_path(&self, provider_id: &str) -> String {
        format!(
            "{}/services/connections/{}/callback",
            self.admin_api_base, provider_id
        )
    }
}

fn join(origin: &str, path: &str) -> ServiceResult<String> {
    if Url::parse(path).is_ok() {
        return Ok(path.to_string());
    }
    let base = Url::parse(&format!("{}/", origin.trim_end_matches('/')))
        .map_err(|e| ServiceError::validation(format!("invalid callback origin {}: {}", origin, e)))?;
    base.join(path.trim_start_matches('/'))
        .map(|u| u.to_string())
        .map_err(|e| ServiceError::validation(format!("invalid callback path {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> CallbacksConfig {
        CallbacksConfig::default()
    }

    #[test]
    fn override_wins() {
        let mut cfg = config();
        cfg.provider_url_overrides
            .insert("github".into(), "https://hooks.example.com/gh".into());
        let resolver = CallbackUrlResolver::new(cfg, "/admin/api");
        let res = resolver.resolve("github", &CallbackParams::default(), None).unwrap();
        assert_eq!(res.source, CallbackSource::Override);
        assert_eq!(res.url, "https://hooks.example.com/gh");
    }

    #[test]
    fn route_joined_to_forwarded_origin() {
        let resolver = CallbackUrlResolver::new(config(), "/admin/api");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("ops.example.com"));
        headers.insert("host", HeaderValue::from_static("internal:8080"));
        let res = resolver
            .resolve("github", &CallbackParams::default(), Some(&headers))
            .unwrap();
        assert_eq!(res.source, CallbackSource::Route);
        assert_eq!(
            res.url,
            "https://ops.example.com/admin/api/services/connections/github/callback"
        );
    }

    #[test]
    fn provider_route_substitutes_reference() {
        let mut cfg = config();
        cfg.provider_routes
            .insert("google".into(), INSTALLATION_CALLBACK_ROUTE.into());
        cfg.public_base_url = Some("https://app.example.com".into());
        let resolver = CallbackUrlResolver::new(cfg, "/admin/api");
        let params = CallbackParams {
            reference: Some("inst_1".into()),
            id: None,
        };
        let res = resolver.resolve("google", &params, None).unwrap();
        assert_eq!(
            res.url,
            "https://app.example.com/admin/api/services/installations/inst_1/callback"
        );
    }

    #[test]
    fn lenient_mode_falls_back_to_relative_path() {
        let mut cfg = config();
        cfg.default_route = "missing.route".into();
        let resolver = CallbackUrlResolver::new(cfg.clone(), "/admin/api");
        let res = resolver.resolve("github", &CallbackParams::default(), None).unwrap();
        assert_eq!(res.source, CallbackSource::Fallback);
        assert!(!res.absolute);
        assert_eq!(res.url, "/admin/api/services/connections/github/callback");

        cfg.strict = true;
        let strict = CallbackUrlResolver::new(cfg, "/admin/api");
        assert!(strict.resolve("github", &CallbackParams::default(), None).is_err());
    }

    #[test]
    fn strict_mode_requires_origin() {
        let mut cfg = config();
        cfg.strict = true;
        let resolver = CallbackUrlResolver::new(cfg, "/admin/api");
        assert!(resolver.resolve("github", &CallbackParams::default(), None).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost:3000"));
        let res = resolver
            .resolve("github", &CallbackParams::default(), Some(&headers))
            .unwrap();
        assert_eq!(
            res.url,
            "http://localhost:3000/admin/api/services/connections/github/callback"
        );
    }
}
