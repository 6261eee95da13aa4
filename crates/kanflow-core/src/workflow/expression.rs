//! Template and condition evaluator for workflow inputs, gates and loops.
//!
//! Expressions are evaluated against a JSON context object:
//! - `{{task.title}}` -- dot-path lookup, numeric segments index arrays
//! - `status == "ready"` -- equality, compared as strings
//! - `a and b`, `a or b` -- boolean composition, `or` binds looser than `and`
//!
//! Operator tokens that appear inside quoted literals are never split on, so
//! `status == "on and off"` is a single comparison.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Render a template, replacing every `{{ expr }}` placeholder.
///
/// Placeholders that do not resolve are left verbatim.
pub fn render_template(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len + 2;
        out.push_str(&rest[..start]);

        let inner = &rest[start + 2..end - 2];
        match evaluate(inner, context) {
            Some(value) => out.push_str(&value_to_string(&value)),
            None => out.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

/// Evaluate an expression to a value.
///
/// Returns `None` when a plain path does not resolve. Comparisons and
/// boolean compositions always produce a `Value::Bool`.
pub fn evaluate(expr: &str, context: &Value) -> Option<Value> {
    let expr = strip_braces(expr);

    let disjuncts = split_unquoted(expr, " or ");
    if disjuncts.len() > 1 {
        let any = disjuncts.iter().any(|part| evaluate_truthy(part, context));
        return Some(Value::Bool(any));
    }

    let conjuncts = split_unquoted(expr, " and ");
    if conjuncts.len() > 1 {
        let all = conjuncts.iter().all(|part| evaluate_truthy(part, context));
        return Some(Value::Bool(all));
    }

    if let Some((left, right)) = split_once_unquoted(expr, "==") {
        return Some(Value::Bool(compare_equal(left, right, context)));
    }

    evaluate_operand(expr, context)
}

/// Evaluate an expression as a boolean condition.
pub fn evaluate_condition(expr: &str, context: &Value) -> bool {
    evaluate(expr, context).is_some_and(|v| is_truthy(&v))
}

/// Truthy means the boolean `true` or the string `"true"`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    }
}

/// Look up a dot-separated path. Numeric segments index into arrays.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Convert a JSON value to the string used in templates and comparisons.
///
/// Whole-number floats print without a trailing `.0`.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Strip one layer of surrounding single or double quotes.
pub fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Split on the first occurrence of `op` that is not inside quotes.
pub fn split_once_unquoted<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    unquoted_positions(expr, op)
        .first()
        .map(|&pos| (&expr[..pos], &expr[pos + op.len()..]))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Remove a single `{{ ... }}` wrapper around the whole expression.
fn strip_braces(expr: &str) -> &str {
    let trimmed = expr.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        // `{{a}} == {{b}}` is two placeholders, not one wrapper.
        if !inner.contains("}}") && !inner.contains("{{") {
            return inner.trim();
        }
    }
    trimmed
}

fn evaluate_truthy(part: &str, context: &Value) -> bool {
    evaluate(part, context).is_some_and(|v| is_truthy(&v))
}

fn compare_equal(left: &str, right: &str, context: &Value) -> bool {
    let Some(left_value) = evaluate_operand(left, context) else {
        return false;
    };
    let right_value = strip_quotes(strip_braces(right));
    value_to_string(&left_value) == right_value
}

/// An operand is a quoted literal, `true`/`false`, or a path.
fn evaluate_operand(operand: &str, context: &Value) -> Option<Value> {
    let operand = strip_braces(operand);
    if is_quoted(operand) {
        return Some(Value::String(strip_quotes(operand).to_string()));
    }
    if let Some(v) = resolve_path(context, operand) {
        return Some(v.clone());
    }
    match operand {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => None,
    }
}

fn is_quoted(s: &str) -> bool {
    let s = s.trim();
    s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
}

/// Split on every unquoted occurrence of `op`.
fn split_unquoted<'a>(expr: &'a str, op: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut last = 0;
    for pos in unquoted_positions(expr, op) {
        parts.push(&expr[last..pos]);
        last = pos + op.len();
    }
    parts.push(&expr[last..]);
    parts
}

/// Byte offsets of non-overlapping occurrences of `op` outside quotes.
fn unquoted_positions(expr: &str, op: &str) -> Vec<usize> {
    let bytes = expr.as_bytes();
    let op_bytes = op.as_bytes();
    let mut positions = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if bytes[i..].starts_with(op_bytes) => {
                positions.push(i);
                i += op_bytes.len();
                continue;
            }
            None => {}
        }
        i += 1;
    }
    positions
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "task": { "title": "Add login", "priority": 2 },
            "plan": {
                "stories": [
                    { "title": "Form" },
                    { "title": "Session" }
                ],
                "score": 42.0,
                "ratio": 0.5
            },
            "status": "waiting and ready",
            "done": "true",
            "approved": true,
            "rejected": false
        })
    }

    // -----------------------------------------------------------------------
    // Path resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_resolve_nested_path() {
        let c = ctx();
        assert_eq!(resolve_path(&c, "task.title"), Some(&json!("Add login")));
        assert_eq!(resolve_path(&c, "plan.stories.1.title"), Some(&json!("Session")));
        assert_eq!(resolve_path(&c, "plan.stories.7.title"), None);
        assert_eq!(resolve_path(&c, "task.missing.deep"), None);
        assert_eq!(resolve_path(&c, ""), None);
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    #[test]
    fn test_render_template_resolves_paths() {
        let out = render_template("Implement {{task.title}} (p{{ task.priority }})", &ctx());
        assert_eq!(out, "Implement Add login (p2)");
    }

    #[test]
    fn test_render_template_leaves_unresolved_placeholders() {
        let out = render_template("Hello {{user.name}}, see {{task.title}}", &ctx());
        assert_eq!(out, "Hello {{user.name}}, see Add login");
    }

    #[test]
    fn test_render_template_unterminated_placeholder() {
        let out = render_template("before {{task.title", &ctx());
        assert_eq!(out, "before {{task.title");
    }

    #[test]
    fn test_render_template_serializes_objects() {
        let out = render_template("{{plan.stories.0}}", &ctx());
        assert_eq!(out, r#"{"title":"Form"}"#);
    }

    #[test]
    fn test_whole_floats_print_without_fraction() {
        assert_eq!(value_to_string(&json!(42.0)), "42");
        assert_eq!(value_to_string(&json!(0.5)), "0.5");
        assert_eq!(value_to_string(&json!(7)), "7");
        assert_eq!(render_template("{{plan.score}}", &ctx()), "42");
    }

    // -----------------------------------------------------------------------
    // Equality
    // -----------------------------------------------------------------------

    #[test]
    fn test_equality_compares_as_strings() {
        let c = ctx();
        assert!(evaluate_condition("task.priority == \"2\"", &c));
        assert!(evaluate_condition("task.priority == 2", &c));
        assert!(evaluate_condition("{{ plan.score == '42' }}", &c));
        assert!(!evaluate_condition("task.title == \"Other\"", &c));
    }

    #[test]
    fn test_equality_with_unresolved_left_is_false() {
        assert!(!evaluate_condition("missing.path == \"undefined\"", &ctx()));
    }

    #[test]
    fn test_equality_with_placeholder_operands() {
        assert!(evaluate_condition("{{task.priority}} == \"2\"", &ctx()));
    }

    // -----------------------------------------------------------------------
    // Boolean composition
    // -----------------------------------------------------------------------

    #[test]
    fn test_and_inside_quotes_is_not_split() {
        let c = ctx();
        assert!(evaluate_condition(
            "status == \"waiting and ready\" and done == \"true\"",
            &c
        ));
        assert!(!evaluate_condition(
            "status == \"waiting and ready\" and done == \"false\"",
            &c
        ));
    }

    #[test]
    fn test_or_inside_quotes_is_not_split() {
        let c = json!({ "mode": "this or that" });
        assert!(evaluate_condition("mode == 'this or that'", &c));
    }

    #[test]
    fn test_or_binds_looser_than_and() {
        let c = ctx();
        // (rejected and approved) or approved
        assert!(evaluate_condition("rejected and approved or approved", &c));
        // rejected or (approved and rejected)
        assert!(!evaluate_condition("rejected or approved and rejected", &c));
    }

    #[test]
    fn test_truthiness() {
        let c = ctx();
        assert!(evaluate_condition("{{approved}}", &c));
        assert!(evaluate_condition("done", &c));
        assert!(!evaluate_condition("rejected", &c));
        assert!(!evaluate_condition("task.title", &c));
        assert!(!evaluate_condition("{{nothing.here}}", &c));
        assert!(evaluate_condition("true", &c));
    }

    #[test]
    fn test_evaluate_returns_raw_values_for_paths() {
        let c = ctx();
        let stories = evaluate("{{plan.stories}}", &c).unwrap();
        assert_eq!(stories.as_array().map(Vec::len), Some(2));
        assert!(evaluate("{{plan.missing}}", &c).is_none());
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("'abc'"), "abc");
        assert_eq!(strip_quotes(" abc "), "abc");
        assert_eq!(strip_quotes("\""), "\"");
    }
}
