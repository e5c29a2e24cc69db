//! # 路径路由规则
//!
//! 将通用入站路径解析到提供商。`prefix/*` 通配语义，
//! 优先级高者胜出，同优先级时前缀更长（更具体）者胜出。

use crate::types::ProviderId;

/// 一条路径路由规则
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// 路径模式，支持尾部 `/*` 通配
    pub pattern: String,
    /// 匹配到的提供商
    pub provider: ProviderId,
    /// 优先级，越大越优先
    pub priority: i32,
}

impl RouteRule {
    /// 创建路由规则
    pub fn new<P: Into<String>>(pattern: P, provider: ProviderId, priority: i32) -> Self {
        Self {
            pattern: pattern.into(),
            provider,
            priority,
        }
    }

    /// 路径是否命中该规则
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if let Some(prefix) = self.pattern.strip_suffix("/*") {
            path == prefix || path.starts_with(&format!("{prefix}/"))
        } else {
            path == self.pattern
        }
    }

    /// 规则具体程度（用于同优先级决胜）
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.pattern.trim_end_matches("/*").len()
    }
}

/// 路由规则表
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// 创建空规则表
    #[must_use]
    pub const fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// 追加规则
    pub fn add(&mut self, rule: RouteRule) {
        self.rules.push(rule);
    }

    /// 规则数量
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 是否为空
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 解析路径所属提供商
    ///
    /// 命中规则中优先级最高者；同优先级时最具体（前缀最长）者胜出。
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&ProviderId> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| (rule.priority, rule.specificity()))
            .map(|rule| &rule.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard_matching() {
        let rule = RouteRule::new("/attendance/*", "powerschool".into(), 0);
        assert!(rule.matches("/attendance/daily"));
        assert!(rule.matches("/attendance"));
        assert!(rule.matches("/attendance/daily/2026-08-06"));
        assert!(!rule.matches("/attendance-report"));

        let exact = RouteRule::new("/roster", "skyward".into(), 0);
        assert!(exact.matches("/roster"));
        assert!(!exact.matches("/roster/1"));
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let mut table = RouteTable::new();
        table.add(RouteRule::new("/attendance/*", "powerschool".into(), 0));
        table.add(RouteRule::new("/attendance/daily/*", "skyward".into(), 0));

        assert_eq!(
            table.resolve("/attendance/daily/today").unwrap().as_str(),
            "skyward"
        );
        assert_eq!(
            table.resolve("/attendance/weekly").unwrap().as_str(),
            "powerschool"
        );
    }

    #[test]
    fn test_priority_beats_specificity() {
        let mut table = RouteTable::new();
        table.add(RouteRule::new("/attendance/daily/*", "skyward".into(), 0));
        table.add(RouteRule::new("/attendance/*", "aeries".into(), 10));

        assert_eq!(
            table.resolve("/attendance/daily/today").unwrap().as_str(),
            "aeries"
        );
    }

    #[test]
    fn test_no_match() {
        let mut table = RouteTable::new();
        table.add(RouteRule::new("/attendance/*", "powerschool".into(), 0));
        assert!(table.resolve("/grades/today").is_none());
    }
}
