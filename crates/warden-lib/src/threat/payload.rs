//! Payload classification against known attack pattern classes
//!
//! Classes are held as an explicit ordered list and evaluated in priority
//! order; the first class with any matching pattern wins, regardless of
//! where in the payload the match occurs.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Attack classes recognized by the inspector, in evaluation priority
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    SqlInjection,
    CrossSiteScripting,
    PathTraversal,
    CommandInjection,
}

impl std::fmt::Display for AttackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackKind::SqlInjection => write!(f, "sql_injection"),
            AttackKind::CrossSiteScripting => write!(f, "xss"),
            AttackKind::PathTraversal => write!(f, "path_traversal"),
            AttackKind::CommandInjection => write!(f, "command_injection"),
        }
    }
}

/// Compiled pattern classes. Built once at engine construction; matching is
/// pure CPU work and safe on the admission path.
pub struct PayloadInspector {
    classes: Vec<(AttackKind, Vec<Regex>)>,
}

impl PayloadInspector {
    pub fn new() -> Self {
        let sqli = compile(&[
            r"(?i)\bunion\b[\s\S]{0,40}\bselect\b",
            r"(?i)'\s*(?:or|and)\b[\s\S]{0,24}=",
            r"(?i)\bor\b\s+\d+\s*=\s*\d+",
            r"(?i)\b(?:insert\s+into|drop\s+table|delete\s+from|truncate\s+table)\b",
            r"(?i)\b(?:sleep|benchmark|load_file)\s*\(",
            r"'[\s\S]{0,40}--",
            r"%27",
        ]);
        let xss = compile(&[
            r"(?i)<\s*script\b",
            r"(?i)javascript\s*:",
            r"(?i)\bon(?:error|load|click|mouseover|focus)\s*=",
            r"(?i)<\s*(?:iframe|object|embed)\b",
            r"(?i)document\.(?:cookie|write)",
        ]);
        let traversal = compile(&[
            r"\.\./",
            r"\.\.\\",
            r"(?i)%2e%2e(?:%2f|%5c)",
            r"(?i)/etc/(?:passwd|shadow)",
            r"(?i)(?:^|[\\/])proc[\\/]self",
        ]);
        let cmd = compile(&[
            r"(?i)[;&|]\s*(?:cat|ls|rm|wget|curl|bash|sh|nc|chmod|chown|python|perl)\b",
            r"\$\(",
            r"`[^`]+`",
            r"(?i)\|\s*(?:bash|sh)\b",
        ]);

        Self {
            classes: vec![
                (AttackKind::SqlInjection, sqli),
                (AttackKind::CrossSiteScripting, xss),
                (AttackKind::PathTraversal, traversal),
                (AttackKind::CommandInjection, cmd),
            ],
        }
    }

    /// Classify a payload. Returns the highest-priority matching class, or
    /// `None` when nothing matches.
    pub fn classify(&self, payload: &str) -> Option<AttackKind> {
        for (kind, patterns) in &self.classes {
            if patterns.iter().any(|p| p.is_match(payload)) {
                return Some(*kind);
            }
        }
        None
    }
}

impl Default for PayloadInspector {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static pattern compiles"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_payload_passes() {
        let inspector = PayloadInspector::new();
        assert_eq!(inspector.classify("/api/metrics?window=60"), None);
        assert_eq!(inspector.classify("/api/users/42"), None);
    }

    #[test]
    fn test_sql_injection_detected() {
        let inspector = PayloadInspector::new();
        assert_eq!(
            inspector.classify("/search?q=' OR 1=1--"),
            Some(AttackKind::SqlInjection)
        );
        assert_eq!(
            inspector.classify("id=1 UNION SELECT password FROM users"),
            Some(AttackKind::SqlInjection)
        );
    }

    #[test]
    fn test_sql_injection_outranks_xss() {
        // Both classes match; SQLi wins on priority, not match position.
        let inspector = PayloadInspector::new();
        assert_eq!(
            inspector.classify("<script>alert(1)</script>?q=' OR 1=1--"),
            Some(AttackKind::SqlInjection)
        );
    }

    #[test]
    fn test_xss_detected() {
        let inspector = PayloadInspector::new();
        assert_eq!(
            inspector.classify("/comment?text=<script>steal()</script>"),
            Some(AttackKind::CrossSiteScripting)
        );
        assert_eq!(
            inspector.classify("<img src=x onerror=alert(1)>"),
            Some(AttackKind::CrossSiteScripting)
        );
    }

    #[test]
    fn test_path_traversal_detected() {
        let inspector = PayloadInspector::new();
        assert_eq!(
            inspector.classify("/static/../../etc/passwd"),
            Some(AttackKind::PathTraversal)
        );
        assert_eq!(
            inspector.classify("/download?f=%2e%2e%2fconfig"),
            Some(AttackKind::PathTraversal)
        );
    }

    #[test]
    fn test_command_injection_detected() {
        let inspector = PayloadInspector::new();
        assert_eq!(
            inspector.classify("/ping?host=8.8.8.8;cat /root/.ssh/id_rsa"),
            Some(AttackKind::CommandInjection)
        );
        assert_eq!(
            inspector.classify("name=$(reboot)"),
            Some(AttackKind::CommandInjection)
        );
    }
}
