//! Edge routing table types.

use serde::{Deserialize, Serialize};

/// Backend a request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    StaticAssets,
    GeneratedHtml,
    GeneratedJson,
    Search,
    Live,
}

/// Which request cookies reach the origin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "names")]
pub enum CookiePolicy {
    #[default]
    None,
    All,
    Whitelist(Vec<String>),
}

impl CookiePolicy {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            CookiePolicy::None => false,
            CookiePolicy::All => true,
            CookiePolicy::Whitelist(names) => names.iter().any(|n| n == name),
        }
    }
}

/// One row of the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Glob over the request path (`*` any run, `?` one character)
    pub path_pattern: String,
    pub origin: Origin,
    #[serde(default)]
    pub forward_query_string: bool,
    #[serde(default)]
    pub forward_cookies: CookiePolicy,
}

impl RouteRule {
    pub fn new(path_pattern: &str, origin: Origin) -> Self {
        Self {
            path_pattern: path_pattern.to_string(),
            origin,
            forward_query_string: false,
            forward_cookies: CookiePolicy::None,
        }
    }

    pub fn with_query_string(mut self) -> Self {
        self.forward_query_string = true;
        self
    }

    pub fn with_cookies(mut self, policy: CookiePolicy) -> Self {
        self.forward_cookies = policy;
        self
    }
}
