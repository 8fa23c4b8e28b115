//! Path router for the REST channel.
//!
//! Routes are stored in sorted-by-priority order. Resolution performs a
//! linear scan with a simple path-template matcher that supports `{param}`
//! capture groups (axum style).
//!
//! Resolution is O(R × D) where R = number of routes and D = path depth.

use duplex_kernel::artifact::HttpMethod;
use duplex_kernel::config::RestRouteConfig;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RouterError {
    #[error("duplicate route id '{0}'")]
    DuplicateRoute(String),
}

/// A successful route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub route_id: String,
    /// Contract the route's payloads are validated against.
    pub contract: String,
    pub path_params: HashMap<String, String>,
}

/// Priority-sorted linear route lookup with `{param}` template matching.
#[derive(Debug, Default)]
pub struct TrieRouter {
    /// Routes sorted by descending priority (highest first).
    routes: Vec<RestRouteConfig>,
}

impl TrieRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router from configured routes.
    pub fn from_routes(
        routes: impl IntoIterator<Item = RestRouteConfig>,
    ) -> Result<Self, RouterError> {
        let mut router = Self::new();
        for route in routes {
            router.register(route)?;
        }
        Ok(router)
    }

    /// Match a concrete path against a template such as `/v1/orders/{id}`.
    fn match_path(template: &str, path: &str) -> Option<HashMap<String, String>> {
        let t_parts: Vec<&str> = template.trim_matches('/').split('/').collect();
        let p_parts: Vec<&str> = path.trim_matches('/').split('/').collect();

        if t_parts.len() != p_parts.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (t, p) in t_parts.iter().zip(p_parts.iter()) {
            if let Some(name) = t.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
                if p.is_empty() {
                    return None;
                }
                params.insert(name.to_string(), p.to_string());
            } else if *t != *p {
                return None;
            }
        }
        Some(params)
    }

    pub fn register(&mut self, route: RestRouteConfig) -> Result<(), RouterError> {
        if self.routes.iter().any(|r| r.id == route.id) {
            return Err(RouterError::DuplicateRoute(route.id));
        }
        // Insert maintaining descending priority order.
        let pos = self
            .routes
            .partition_point(|r| r.priority >= route.priority);
        self.routes.insert(pos, route);
        Ok(())
    }

    pub fn resolve(&self, path: &str, method: HttpMethod) -> Option<RouteMatch> {
        self.routes
            .iter()
            .filter(|route| route.methods.contains(&method))
            .find_map(|route| {
                Self::match_path(&route.path_pattern, path).map(|path_params| RouteMatch {
                    route_id: route.id.clone(),
                    contract: route.contract.clone(),
                    path_params,
                })
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
