//! 访问规则：按顺序匹配的路径允许/拒绝判定。
//!
//! 用户规则优先于全局规则；同一来源内第一条匹配的规则生效，
//! 全部未命中时默认允许。

use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::users::{Settings, User};

#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Prefix(String),
    Regex(RulePattern),
}

/// 预编译的正则；无法编译的表达式永远不匹配。
#[derive(Debug, Clone)]
pub struct RulePattern {
    raw: String,
    compiled: Option<Regex>,
}

impl RulePattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let compiled = match Regex::new(&raw) {
            Ok(regex) => Some(regex),
            Err(err) => {
                warn!(pattern = raw, error = %err, "invalid rule regex, rule disabled");
                None
            }
        };
        Self { raw, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn is_match(&self, path: &str) -> bool {
        self.compiled
            .as_ref()
            .is_some_and(|regex| regex.is_match(path))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct Rule {
    pub matcher: RuleMatcher,
    pub allow: bool,
}

#[derive(Deserialize)]
struct RawRule {
    allow: bool,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    regex: Option<String>,
}

impl TryFrom<RawRule> for Rule {
    type Error = String;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        let matcher = match (raw.path, raw.regex) {
            (Some(path), None) => RuleMatcher::Prefix(path),
            (None, Some(pattern)) => RuleMatcher::Regex(RulePattern::new(pattern)),
            _ => return Err("rule needs exactly one of `path` or `regex`".into()),
        };
        Ok(Rule {
            matcher,
            allow: raw.allow,
        })
    }
}

impl Rule {
    pub fn prefix(path: impl Into<String>, allow: bool) -> Self {
        Self {
            matcher: RuleMatcher::Prefix(path.into()),
            allow,
        }
    }

    pub fn regex(pattern: impl Into<String>, allow: bool) -> Self {
        Self {
            matcher: RuleMatcher::Regex(RulePattern::new(pattern)),
            allow,
        }
    }

    /// 判断规则是否命中给定路径。
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            RuleMatcher::Regex(pattern) => pattern.is_match(path),
        }
    }
}

/// 依次检查用户规则与全局规则，返回路径是否允许访问。
pub fn allowed(path: &str, user_rules: &[Rule], global_rules: &[Rule]) -> bool {
    first_match(path, user_rules)
        .or_else(|| first_match(path, global_rules))
        .unwrap_or(true)
}

fn first_match(path: &str, rules: &[Rule]) -> Option<bool> {
    rules
        .iter()
        .find(|rule| rule.matches(path))
        .map(|rule| rule.allow)
}

/// 末段以 `.` 开头的路径视为隐藏文件。
pub fn is_hidden(path: &str) -> bool {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .is_some_and(|name| name.starts_with('.'))
}

/// 绑定到单个请求用户的规则检查器，可跨线程克隆。
#[derive(Debug, Clone)]
pub struct AccessChecker {
    user: Arc<User>,
    settings: Arc<Settings>,
}

impl AccessChecker {
    pub fn new(user: Arc<User>, settings: Arc<Settings>) -> Self {
        Self { user, settings }
    }

    pub fn check(&self, path: &str) -> bool {
        if self.user.hide_dotfiles && is_hidden(path) {
            return false;
        }
        allowed(path, &self.user.rules, &self.settings.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_rules_take_precedence_over_global() {
        let user_rules = vec![Rule::prefix("/private", false)];
        let global_rules = vec![Rule::prefix("/", true)];

        assert!(!allowed("/private/file", &user_rules, &global_rules));
        assert!(allowed("/public/file", &user_rules, &global_rules));
    }

    #[test]
    fn no_matching_rule_defaults_to_allow() {
        assert!(allowed("/anything/at/all", &[], &[]));
        let global_rules = vec![Rule::prefix("/other", false)];
        assert!(allowed("/anything", &[], &global_rules));
    }

    #[test]
    fn first_matching_rule_wins_within_a_source() {
        let rules = vec![
            Rule::prefix("/docs/public", true),
            Rule::prefix("/docs", false),
        ];
        assert!(allowed("/docs/public/a.txt", &rules, &[]));
        assert!(!allowed("/docs/secret.txt", &rules, &[]));
    }

    #[test]
    fn global_rules_apply_when_user_rules_miss() {
        let user_rules = vec![Rule::prefix("/mine", true)];
        let global_rules = vec![Rule::regex(r"\.env$", false)];
        assert!(!allowed("/project/.env", &user_rules, &global_rules));
        assert!(allowed("/mine/.env", &user_rules, &global_rules));
    }

    #[test]
    fn invalid_regex_never_matches() {
        let rules = vec![Rule::regex("([unclosed", false)];
        assert!(allowed("/([unclosed", &rules, &[]));
    }

    #[test]
    fn rule_deserializes_from_path_or_regex() {
        let rule: Rule = serde_json::from_str(r#"{"path": "/tmp", "allow": false}"#)
            .expect("prefix rule");
        assert!(rule.matches("/tmp/x"));
        assert!(!rule.allow);

        let rule: Rule = serde_json::from_str(r#"{"regex": "^/a/[0-9]+$", "allow": true}"#)
            .expect("regex rule");
        assert!(rule.matches("/a/42"));
        assert!(!rule.matches("/a/b"));

        let invalid = serde_json::from_str::<Rule>(r#"{"allow": true}"#);
        assert!(invalid.is_err());
    }

    #[test]
    fn hidden_paths_detected_by_last_segment() {
        assert!(is_hidden("/dir/.secret"));
        assert!(is_hidden("/.config/"));
        assert!(!is_hidden("/.config/app.toml"));
        assert!(!is_hidden("/"));
        assert!(!is_hidden(""));
    }
}
