//! Static import analyzer (C4, §4.2, §8 scenario 4).
//!
//! Parses the plugin entry source with OXC and walks the full syntax tree — function
//! bodies, blocks, conditionals, loops, `try`/`catch` — for three import forms: static
//! `import` declarations, `require("literal")` calls, and dynamic `import("literal")`
//! expressions, wherever in the tree they appear. Computed dynamic imports (a
//! non-literal argument) are recorded as a warning, not a violation — the runtime
//! module interceptor (`worker.rs`) is the backstop for those, per §4.2/§4.9.

use oxc::allocator::Allocator;
use oxc::ast::ast::{Argument, CallExpression, Expression, ImportDeclaration, ImportExpression, Program};
use oxc::ast_visit::{walk, Visit};
use oxc::parser::Parser;
use oxc::span::{GetSpan, SourceType};

/// Default blocked Node.js built-ins (§4.2): filesystem, process spawning, raw
/// network, HTTP, worker/cluster spawning, the inspector, and VM introspection.
pub const DEFAULT_BLOCKED_MODULES: &[&str] = &[
    "fs",
    "fs/promises",
    "child_process",
    "net",
    "dgram",
    "tls",
    "http",
    "https",
    "http2",
    "worker_threads",
    "cluster",
    "inspector",
    "vm",
];

/// One forbidden-import violation found during static analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportViolation {
    /// Normalized module name (the `node:` prefix stripped, §4.2).
    pub module: String,
    /// Which syntactic form triggered it.
    pub form: ImportForm,
    /// Byte offset into the source where the import appears.
    pub source_position: u32,
}

/// The syntactic shape an import took (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportForm {
    /// `import ... from "mod"`.
    StaticImport,
    /// `require("mod")`.
    Require,
    /// `import("mod")` with a literal argument.
    DynamicImport,
}

impl std::fmt::Display for ImportForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StaticImport => "static import",
            Self::Require => "require()",
            Self::DynamicImport => "dynamic import()",
        };
        f.write_str(s)
    }
}

/// Module allow/block policy resolved from a manifest's sandbox configuration.
#[derive(Debug, Clone, Default)]
pub struct ModulePolicy {
    /// Extra modules to forbid beyond [`DEFAULT_BLOCKED_MODULES`].
    pub blocked_modules: Vec<String>,
    /// Modules to exempt even if they'd otherwise be blocked.
    pub allowed_modules: Vec<String>,
}

impl ModulePolicy {
    /// Whether `normalized_module` is forbidden under this policy.
    #[must_use]
    pub fn is_blocked(&self, normalized_module: &str) -> bool {
        if self.allowed_modules.iter().any(|m| m == normalized_module) {
            return false;
        }
        DEFAULT_BLOCKED_MODULES.contains(&normalized_module)
            || self.blocked_modules.iter().any(|m| m == normalized_module)
    }
}

/// Strip the `node:` runtime-built-in prefix (§4.2).
#[must_use]
pub fn normalize_module_name(name: &str) -> &str {
    name.strip_prefix("node:").unwrap_or(name)
}

/// Parse `source` and report every forbidden static/require/literal-dynamic import.
///
/// `filename` selects the OXC source type (`.ts`/`.tsx`/`.js`/`.jsx`).
///
/// # Errors
///
/// An aggregated message (one line per violation, naming module, form, and source
/// position) if any forbidden import is found, or if `source` fails to parse.
pub fn analyze(source: &str, filename: &str, policy: &ModulePolicy) -> Result<(), String> {
    let allocator = Allocator::default();
    let source_type = SourceType::from_path(filename).unwrap_or_else(|_| SourceType::mjs());

    let parse_result = Parser::new(&allocator, source, source_type).parse();
    if parse_result.panicked || !parse_result.errors.is_empty() {
        let messages: Vec<String> = parse_result.errors.iter().map(|e| format!("{e}")).collect();
        return Err(format!("failed to parse plugin entry {filename}: {}", messages.join("; ")));
    }

    let violations = collect_violations(&parse_result.program, policy);
    if violations.is_empty() {
        return Ok(());
    }

    let lines: Vec<String> = violations
        .iter()
        .map(|v| format!("module '{}' imported via {} at byte offset {}", v.module, v.form, v.source_position))
        .collect();
    Err(format!("forbidden module import(s): {}", lines.join("; ")))
}

fn collect_violations(program: &Program, policy: &ModulePolicy) -> Vec<ImportViolation> {
    let mut walker = ImportWalker { policy, violations: Vec::new() };
    walker.visit_program(program);
    walker.violations
}

/// Visits every statement and expression in the tree — function bodies, blocks,
/// `if`/`try`/loops, arrow functions, class members, all of it — so a forbidden import
/// nested inside a plugin's exported factory function is caught just as reliably as one
/// at the top level.
struct ImportWalker<'p> {
    policy: &'p ModulePolicy,
    violations: Vec<ImportViolation>,
}

impl<'a> Visit<'a> for ImportWalker<'_> {
    fn visit_import_declaration(&mut self, decl: &ImportDeclaration<'a>) {
        if !decl.import_kind.is_type() {
            check_module(
                decl.source.value.as_str(),
                ImportForm::StaticImport,
                decl.span().start,
                self.policy,
                &mut self.violations,
            );
        }
        walk::walk_import_declaration(self, decl);
    }

    fn visit_import_expression(&mut self, expr: &ImportExpression<'a>) {
        if let Expression::StringLiteral(lit) = &expr.source {
            check_module(
                lit.value.as_str(),
                ImportForm::DynamicImport,
                expr.span().start,
                self.policy,
                &mut self.violations,
            );
        } else {
            tracing::warn!(
                "computed dynamic import() argument cannot be statically resolved; \
                 relying on the runtime module interceptor"
            );
        }
        walk::walk_import_expression(self, expr);
    }

    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if let Expression::Identifier(ident) = &call.callee
            && ident.name.as_str() == "require"
            && let Some(Argument::StringLiteral(lit)) = call.arguments.first()
        {
            check_module(lit.value.as_str(), ImportForm::Require, call.span().start, self.policy, &mut self.violations);
        }
        walk::walk_call_expression(self, call);
    }
}

fn check_module(
    raw_name: &str,
    form: ImportForm,
    source_position: u32,
    policy: &ModulePolicy,
    out: &mut Vec<ImportViolation>,
) {
    let normalized = normalize_module_name(raw_name);
    if policy.is_blocked(normalized) {
        out.push(ImportViolation { module: normalized.to_string(), form, source_position });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_4_static_forbidden_import() {
        let source = "import fs from 'node:fs';\nconsole.log(fs);\n";
        let policy = ModulePolicy::default();
        let err = analyze(source, "plugin.js", &policy).unwrap_err();
        assert!(err.contains("fs"), "got: {err}");
    }

    #[test]
    fn allows_non_blocked_imports() {
        let source = "import { z } from 'zod';\n";
        let policy = ModulePolicy::default();
        assert!(analyze(source, "plugin.js", &policy).is_ok());
    }

    #[test]
    fn require_form_detected() {
        let source = "const cp = require('child_process');\n";
        let policy = ModulePolicy::default();
        let err = analyze(source, "plugin.js", &policy).unwrap_err();
        assert!(err.contains("child_process"));
        assert!(err.contains("require()"));
    }

    #[test]
    fn literal_dynamic_import_detected() {
        let source = "async function run() { await import('net'); }\n";
        let policy = ModulePolicy::default();
        let err = analyze(source, "plugin.js", &policy).unwrap_err();
        assert!(err.contains("net"));
    }

    #[test]
    fn require_nested_inside_block_and_conditional_is_detected() {
        let source = "function factory() {\n  if (true) {\n    const cp = require('child_process');\n    return cp;\n  }\n}\n";
        let policy = ModulePolicy::default();
        let err = analyze(source, "plugin.js", &policy).unwrap_err();
        assert!(err.contains("child_process"));
    }

    #[test]
    fn computed_dynamic_import_is_not_a_static_failure() {
        let source = "async function run(name) { await import(name); }\n";
        let policy = ModulePolicy::default();
        assert!(analyze(source, "plugin.js", &policy).is_ok());
    }

    #[test]
    fn allowed_modules_override_default_blocklist() {
        let source = "import fs from 'fs';\n";
        let policy = ModulePolicy { blocked_modules: vec![], allowed_modules: vec!["fs".to_string()] };
        assert!(analyze(source, "plugin.js", &policy).is_ok());
    }

    #[test]
    fn caller_supplied_blocked_module() {
        let source = "import { z } from 'zod';\n";
        let policy = ModulePolicy { blocked_modules: vec!["zod".to_string()], allowed_modules: vec![] };
        assert!(analyze(source, "plugin.js", &policy).is_err());
    }

    #[test]
    fn unparseable_source_fails() {
        let source = "const x = ;;; {{{";
        let policy = ModulePolicy::default();
        assert!(analyze(source, "plugin.js", &policy).is_err());
    }
}
