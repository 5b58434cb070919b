//! Production Code Enforcement
//!
//! Production code propagates errors instead of panicking and carries no
//! dead code allowances. Everything from the first test module gate of a file
//! onwards is test code and is exempt, as are the test-utils stub launcher
//! and the test crate itself.

use std::fs;
use std::path::{Path, PathBuf};

/// Source roots holding production code, relative to the workspace root
const PRODUCTION_ROOTS: &[&str] = &["framerelay-core/src", "framerelay-cli/src"];

/// Files compiled only for tests
const EXEMPT_FILES: &[&str] = &["stub.rs"];

/// A forbidden pattern found in production code
#[derive(Debug)]
struct Violation {
    file_path: String,
    line_number: usize,
    rule: &'static str,
    context: String,
}

/// Patterns rejected in production code
fn rule_for(line: &str) -> Option<&'static str> {
    let trimmed = line.trim();
    if trimmed.starts_with("//") {
        return None;
    }
    if trimmed.contains(".unwrap()") {
        return Some("unwrap");
    }
    if trimmed.contains(".expect(") {
        return Some("expect");
    }
    if trimmed.contains("#[allow(") && trimmed.contains("dead_code") {
        return Some("dead_code allowance");
    }
    None
}

/// `#[cfg(test)]` and narrower gates such as `#[cfg(all(test, unix))]`
fn is_test_module_gate(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == "#[cfg(test)]" || trimmed.starts_with("#[cfg(all(test,")
}

/// Checker for production code violations
struct ProductionCodeChecker {
    violations: Vec<Violation>,
    files_checked: usize,
}

impl ProductionCodeChecker {
    fn new() -> Self {
        Self {
            violations: Vec::new(),
            files_checked: 0,
        }
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
    }

    fn find_rust_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::find_rust_files(&path, files)?;
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
        Ok(())
    }

    fn is_exempt(path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| EXEMPT_FILES.iter().any(|exempt| name == *exempt))
    }

    /// Checks `content` up to its first test module
    fn check_source(&mut self, file_path: &str, content: &str) {
        self.files_checked += 1;
        for (index, line) in content.lines().enumerate() {
            if is_test_module_gate(line) {
                break;
            }
            if let Some(rule) = rule_for(line) {
                self.violations.push(Violation {
                    file_path: file_path.to_string(),
                    line_number: index + 1,
                    rule,
                    context: line.trim().to_string(),
                });
            }
        }
    }

    fn check_workspace(&mut self) -> std::io::Result<()> {
        let root = Self::workspace_root();
        let mut files = Vec::new();
        for source_root in PRODUCTION_ROOTS {
            Self::find_rust_files(&root.join(source_root), &mut files)?;
        }

        for file in files.iter().filter(|file| !Self::is_exempt(file)) {
            let content = fs::read_to_string(file)?;
            self.check_source(&file.to_string_lossy(), &content);
        }
        Ok(())
    }

    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Production code enforcement: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }

        for violation in &self.violations {
            println!(
                "{}:{} [{}]",
                violation.file_path, violation.line_number, violation.rule
            );
            println!("  {}", violation.context);
        }
        println!(
            "Found {} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        println!("Return a Result and propagate with `?`, or move the code into a test module.");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_skip_comments_and_fallbacks() {
        assert_eq!(rule_for("let x = value.unwrap();"), Some("unwrap"));
        assert_eq!(rule_for("    file.expect(\"open\")"), Some("expect"));
        assert_eq!(
            rule_for("#[allow(clippy::too_many_lines, dead_code)]"),
            Some("dead_code allowance")
        );
        assert_eq!(rule_for("// calling .unwrap() here would panic"), None);
        assert_eq!(rule_for("let x = value.unwrap_or_default();"), None);
        assert_eq!(rule_for("let err = result.expect_err(\"fails\");"), None);
    }

    #[test]
    fn test_test_modules_are_exempt() {
        let mut checker = ProductionCodeChecker::new();
        let source = r#"
pub fn parse(input: &str) -> Option<u32> {
    input.parse().ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn parses() {
        assert_eq!(super::parse("1").unwrap(), 1);
    }
}
"#;

        checker.check_source("parse.rs", source);

        assert!(checker.violations.is_empty());
    }

    #[test]
    fn test_feature_gates_are_not_test_modules() {
        assert!(is_test_module_gate("#[cfg(test)]"));
        assert!(is_test_module_gate("#[cfg(all(test, unix))]"));
        assert!(!is_test_module_gate("#[cfg(any(test, feature = \"test-utils\"))]"));
    }

    #[test]
    fn test_violation_line_numbers() {
        let mut checker = ProductionCodeChecker::new();
        let source = "fn a() {}\n#[allow(dead_code)]\nfn b() { Some(1).unwrap(); }\n";

        checker.check_source("lib.rs", source);

        assert_eq!(checker.violations.len(), 2);
        assert_eq!(checker.violations[0].line_number, 2);
        assert_eq!(checker.violations[1].rule, "unwrap");
    }

    #[test]
    fn production_code_enforcement() {
        let mut checker = ProductionCodeChecker::new();

        checker
            .check_workspace()
            .expect("Failed to scan production sources");

        assert!(
            checker.report_violations(),
            "Production code violations found - see output above"
        );
    }
}
