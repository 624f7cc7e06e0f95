//! Tool-name glob grammar.
//!
//! `*` matches any run of characters except the `.` namespace separator;
//! `**` crosses separators; a literal `.` matches itself. A bare `*` is the
//! conventional match-everything pattern and is treated as `**`.
//!
//! Compilation piggybacks on `globset` with `/` as the separator: tool names
//! never contain `/` (see the identifier grammar), so rewriting `.` ↔ `/` is
//! bijective and `literal_separator` gives exactly the semantics above.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use amb_domain::error::{Error, Result};

/// A compiled set of tool globs.
#[derive(Debug)]
pub struct ToolGlobSet {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ToolGlobSet {
    /// Compile a pattern list. Invalid patterns fail loudly; profiles are
    /// validated at write time so this should not fire at decision time.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let rewritten = if pattern == "*" {
                "**".to_owned()
            } else {
                pattern.replace('.', "/")
            };
            let glob = GlobBuilder::new(&rewritten)
                .literal_separator(true)
                .build()
                .map_err(|e| Error::Config(format!("invalid tool glob \"{pattern}\": {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to compile tool globs: {e}")))?;
        Ok(Self {
            set,
            patterns: patterns.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        self.set.is_match(tool_name.replace('.', "/"))
    }

    /// The first pattern matching `tool_name`, for policy reporting in audit
    /// records.
    pub fn matched_pattern(&self, tool_name: &str) -> Option<&str> {
        self.set
            .matches(tool_name.replace('.', "/"))
            .first()
            .map(|&i| self.patterns[i].as_str())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> ToolGlobSet {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        ToolGlobSet::compile(&owned).unwrap()
    }

    #[test]
    fn star_stops_at_namespace_separator() {
        let globs = set(&["fs.*"]);
        assert!(globs.matches("fs.read_file"));
        assert!(!globs.matches("fs.admin.wipe"));
        assert!(!globs.matches("other.read_file"));
    }

    #[test]
    fn double_star_crosses_separators() {
        let globs = set(&["fs.**"]);
        assert!(globs.matches("fs.read_file"));
        assert!(globs.matches("fs.admin.wipe"));
    }

    #[test]
    fn bare_star_matches_everything() {
        let globs = set(&["*"]);
        assert!(globs.matches("demo.echo"));
        assert!(globs.matches("plain"));
        assert!(globs.matches("a.b.c"));
    }

    #[test]
    fn infix_star_within_segment() {
        let globs = set(&["*.write_*"]);
        assert!(globs.matches("fs.write_file"));
        assert!(globs.matches("db.write_row"));
        assert!(!globs.matches("fs.read_file"));
        // `*` must not swallow the namespace separator on either side.
        assert!(!globs.matches("a.b.write_file"));
    }

    #[test]
    fn literal_dot_is_literal() {
        let globs = set(&["demo.echo"]);
        assert!(globs.matches("demo.echo"));
        assert!(!globs.matches("demoXecho"));
    }

    #[test]
    fn matched_pattern_reports_the_rule() {
        let globs = set(&["fs.*", "*.write_*"]);
        assert_eq!(globs.matched_pattern("fs.read_file"), Some("fs.*"));
        assert_eq!(globs.matched_pattern("db.write_row"), Some("*.write_*"));
        assert_eq!(globs.matched_pattern("other.thing"), None);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = ToolGlobSet::compile(&["[".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let globs = set(&[]);
        assert!(globs.is_empty());
        assert!(!globs.matches("anything"));
    }
}
