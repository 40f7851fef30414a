use crate::rule::{RewriteRule, RuleConfig, RuleError};

/// Ordered, immutable table of rewrite rules.
///
/// Prefixes are checked for overlap when the table is built, so at most one
/// rule can match a given path. Lookups still walk the rules in declaration
/// order and stop at the first match.
#[derive(Debug)]
pub struct Router {
    rules: Vec<RewriteRule>,
}

impl Router {
    pub fn new(rules: Vec<RewriteRule>) -> Result<Self, RuleError> {
        for (index, rule) in rules.iter().enumerate() {
            if let Some(other) = rules[..index].iter().find(|other| rule.overlaps(other)) {
                return Err(RuleError::Overlap {
                    rule: rule.name().to_string(),
                    prefix: rule.prefix().to_string(),
                    other: other.name().to_string(),
                    other_prefix: other.prefix().to_string(),
                });
            }
        }

        Ok(Router { rules })
    }

    pub fn from_config(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let rules = configs
            .iter()
            .map(RewriteRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Router::new(rules)
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    pub fn route(&self, path: &str) -> Option<(&RewriteRule, String)> {
        self.rules
            .iter()
            .find_map(|rule| rule.rewrite(path).map(|destination| (rule, destination)))
    }

    #[allow(dead_code)]
    pub fn resolve(&self, path: &str) -> Option<String> {
        self.route(path).map(|(_, destination)| destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: [(&str, &str); 3] = [
        ("/api/medicine/:path*", "https://dsh-1.onrender.com/:path*"),
        (
            "/api/symptoms/:path*",
            "https://dsh-2.onrender.com/api/predict/:path*",
        ),
        (
            "/api/prescription/:path*",
            "https://dsh-t97y.onrender.com/api/:path*",
        ),
    ];

    fn build(order: &[usize]) -> Router {
        let rules = order
            .iter()
            .map(|&i| RewriteRule::new(None, RULES[i].0, RULES[i].1).unwrap())
            .collect();
        Router::new(rules).unwrap()
    }

    #[test]
    fn resolve_known_paths() {
        let router = build(&[0, 1, 2]);

        assert_eq!(
            router.resolve("/api/medicine/search?q=aspirin").as_deref(),
            Some("https://dsh-1.onrender.com/search?q=aspirin")
        );
        assert_eq!(
            router.resolve("/api/symptoms/check").as_deref(),
            Some("https://dsh-2.onrender.com/api/predict/check")
        );
        assert_eq!(
            router.resolve("/api/prescription/123").as_deref(),
            Some("https://dsh-t97y.onrender.com/api/123")
        );
        assert_eq!(router.resolve("/about"), None);
        assert_eq!(
            router.resolve("/api/medicine/").as_deref(),
            Some("https://dsh-1.onrender.com/")
        );
    }

    #[test]
    fn no_match() {
        let router = build(&[0, 1, 2]);

        // `/api/medicine` lacks the literal prefix's trailing `/`, unlike
        // Next.js where `:path*` also matches zero segments.

        for path in ["/", "/api", "/api/medicine", "/api/other/x", "/API/medicine/x"] {
            assert_eq!(router.resolve(path), None, "{path} should not match");
        }
    }

    #[test]
    fn suffix_is_substituted_verbatim() {
        let router = build(&[0, 1, 2]);

        for suffix in ["", "a", "a/b/c", "x?y=1&z=2", "%20encoded", "trailing/"] {
            assert_eq!(
                router.resolve(&format!("/api/symptoms/{suffix}")),
                Some(format!("https://dsh-2.onrender.com/api/predict/{suffix}"))
            );
        }
    }

    #[test]
    fn route_returns_matched_rule() {
        let router = build(&[0, 1, 2]);

        let (rule, destination) = router.route("/api/prescription/42").unwrap();
        assert_eq!(rule.name(), "/api/prescription/:path*");
        assert_eq!(destination, "https://dsh-t97y.onrender.com/api/42");
    }

    #[test]
    fn order_independence() {
        let paths = [
            "/api/medicine/search?q=aspirin",
            "/api/symptoms/check",
            "/api/prescription/123",
            "/about",
            "/api/medicine/",
        ];
        let reference = build(&[0, 1, 2]);

        for order in [[0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            let permuted = build(&order);
            for path in paths {
                assert_eq!(permuted.resolve(path), reference.resolve(path));
            }
        }
    }

    #[test]
    fn idempotent() {
        let router = build(&[0, 1, 2]);

        let first = router.resolve("/api/medicine/search?q=aspirin");
        for _ in 0..10 {
            assert_eq!(router.resolve("/api/medicine/search?q=aspirin"), first);
        }
    }

    #[test]
    fn overlapping_rules_are_rejected() {
        let rules = vec![
            RewriteRule::new(Some("medicine"), "/api/medicine/*", "https://a/*").unwrap(),
            RewriteRule::new(Some("api"), "/api/*", "https://b/*").unwrap(),
        ];

        assert_eq!(
            Router::new(rules).unwrap_err(),
            RuleError::Overlap {
                rule: "api".to_string(),
                prefix: "/api/".to_string(),
                other: "medicine".to_string(),
                other_prefix: "/api/medicine/".to_string(),
            }
        );
    }

    #[test]
    fn duplicate_prefixes_are_rejected() {
        let rules = vec![
            RewriteRule::new(None, "/api/medicine/*", "https://a/*").unwrap(),
            RewriteRule::new(None, "/api/medicine/:path*", "https://b/:path*").unwrap(),
        ];

        let err = Router::new(rules).unwrap_err();
        assert_eq!(
            err.to_string(),
            "rule `/api/medicine/:path*`: prefix `/api/medicine/` overlaps prefix `/api/medicine/` of rule `/api/medicine/*`"
        );
    }

    #[test]
    fn from_config_reports_offending_rule() {
        let configs = vec![
            RuleConfig {
                name: Some("medicine".to_string()),
                source: "/api/medicine/*".to_string(),
                destination: "https://dsh-1.onrender.com/*".to_string(),
            },
            RuleConfig {
                name: Some("broken".to_string()),
                source: "/api/broken/".to_string(),
                destination: "https://dsh-2.onrender.com/*".to_string(),
            },
        ];

        match Router::from_config(&configs) {
            Err(RuleError::InvalidSource { rule, .. }) => assert_eq!(rule, "broken"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_table_matches_nothing() {
        let router = Router::new(Vec::new()).unwrap();
        assert!(router.rules().is_empty());
        assert_eq!(router.resolve("/api/medicine/x"), None);
    }
}
