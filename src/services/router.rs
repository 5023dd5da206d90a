// src/services/router.rs

//! Edge router: first-fit glob matching over the routing table.

use crate::error::{AppError, Result};
use crate::models::{CookiePolicy, Origin, RouteRule};

/// Where a request goes and what travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Index of the matching rule
    pub rule: usize,
    pub origin: Origin,
    pub path: String,
    /// Forwarded query string, without the leading `?`
    pub query: Option<String>,
    /// Forwarded cookies
    pub cookies: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct EdgeRouter {
    rules: Vec<RouteRule>,
}

impl EdgeRouter {
    /// Build a router. The table must end in a rule every path matches.
    pub fn new(rules: Vec<RouteRule>) -> Result<Self> {
        match rules.last() {
            Some(last) if last.path_pattern == "*" => Ok(Self { rules }),
            _ => Err(AppError::validation(
                "routing table must end with the catch-all \"*\"",
            )),
        }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Route a request target such as `/search?q=lo` with its cookies.
    pub fn route(&self, target: &str, cookies: &[(String, String)]) -> RouteDecision {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let path = if path.is_empty() { "/" } else { path };

        let (index, rule) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| glob_match(&rule.path_pattern, path))
            .unwrap_or((self.rules.len() - 1, &self.rules[self.rules.len() - 1]));

        RouteDecision {
            rule: index,
            origin: rule.origin,
            path: path.to_string(),
            query: query
                .filter(|q| rule.forward_query_string && !q.is_empty())
                .map(str::to_string),
            cookies: forwarded_cookies(&rule.forward_cookies, cookies),
        }
    }
}

fn forwarded_cookies(policy: &CookiePolicy, cookies: &[(String, String)]) -> Vec<(String, String)> {
    cookies
        .iter()
        .filter(|(name, _)| policy.allows(name))
        .cloned()
        .collect()
}

/// Glob match where `*` matches any run (including `/`) and `?` one char.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;

    fn router() -> EdgeRouter {
        EdgeRouter::new(Config::default().routes).unwrap()
    }

    fn cookies() -> Vec<(String, String)> {
        vec![
            ("session".to_string(), "abc".to_string()),
            ("theme".to_string(), "dark".to_string()),
        ]
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("/assets/*", "/assets/css/site.css"));
        assert!(glob_match("*.json", "/changelogs/npm/lodash.json"));
        assert!(glob_match("/v?/x", "/v1/x"));
        assert!(!glob_match("/v?/x", "/v10/x"));
        assert!(!glob_match("/search*", "/api/search"));
    }

    #[test]
    fn test_search_forwards_query_only() {
        let decision = router().route("/search?q=lod", &cookies());
        assert_eq!(decision.origin, Origin::Search);
        assert_eq!(decision.query.as_deref(), Some("q=lod"));
        assert!(decision.cookies.is_empty());
    }

    #[test]
    fn test_live_forwards_session() {
        let decision = router().route("/live/socket?room=npm", &cookies());
        assert_eq!(decision.origin, Origin::Live);
        assert_eq!(decision.cookies.len(), 2);
    }

    #[test]
    fn test_first_fit_and_catch_all() {
        let r = router();
        assert_eq!(r.route("/api/status.json", &[]).origin, Origin::GeneratedJson);
        assert_eq!(r.route("/changelogs/npm/lodash.json", &[]).origin, Origin::GeneratedJson);
        assert_eq!(r.route("/assets/site.css", &[]).origin, Origin::StaticAssets);
        assert_eq!(r.route("/favicon.ico", &[]).origin, Origin::StaticAssets);

        let page = r.route("/fragments/npm/lodash.html?x=1", &cookies());
        assert_eq!(page.origin, Origin::GeneratedHtml);
        assert_eq!(page.rule, r.rules().len() - 1);
        assert!(page.query.is_none());
        assert_eq!(r.route("", &[]).path, "/");
    }

    #[test]
    fn test_whitelist_cookie_policy() {
        let router = EdgeRouter::new(vec![
            RouteRule::new("/live*", Origin::Live)
                .with_cookies(CookiePolicy::Whitelist(vec!["session".into()])),
            RouteRule::new("*", Origin::GeneratedHtml),
        ])
        .unwrap();
        let decision = router.route("/live", &cookies());
        assert_eq!(decision.cookies, vec![("session".to_string(), "abc".to_string())]);
    }

    #[test]
    fn test_table_without_catch_all_is_rejected() {
        assert!(EdgeRouter::new(vec![RouteRule::new("/api/*", Origin::GeneratedJson)]).is_err());
        assert!(EdgeRouter::new(Vec::new()).is_err());
    }
}
