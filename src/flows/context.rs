//! Flow context values.
//!
//! A flow run accumulates variables in a [`Context`]: a string-keyed map of
//! JSON values (null, bool, number, string, list, map). The helpers here give
//! total, never-panicking access to those values by dotted path, which is what
//! templates and transition conditions are written against.

use serde_json::{Map, Value};

/// Per-run variable store.
pub type Context = Map<String, Value>;

/// Read-only view over flow variables layered on top of engine-provided facts
/// (`contact`, `customer_profile`, `trigger_message`).
///
/// Flow variables are consulted first; a fact is only visible when no flow
/// variable of the same top-level name exists.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    vars: &'a Context,
    facts: Option<&'a Context>,
}

impl<'a> Scope<'a> {
    /// Scope over flow variables only.
    pub fn new(vars: &'a Context) -> Self {
        Self { vars, facts: None }
    }

    /// Scope over flow variables with facts underneath.
    pub fn with_facts(vars: &'a Context, facts: &'a Context) -> Self {
        Self {
            vars,
            facts: Some(facts),
        }
    }

    /// Look up a top-level name.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.vars
            .get(name)
            .or_else(|| self.facts.and_then(|f| f.get(name)))
    }

    /// Look up a dotted path such as `product_options.0.sku`.
    pub fn lookup(&self, path: &str) -> Option<&'a Value> {
        let mut segments = path.split('.').map(str::trim);
        let head = segments.next().filter(|s| !s.is_empty())?;
        let mut current = self.get(head)?;
        for segment in segments {
            current = step_into(current, segment)?;
        }
        Some(current)
    }
}

/// Descend one path segment into a value.
///
/// Numeric segments index into lists; any segment may key into a map.
pub fn step_into<'v>(value: &'v Value, segment: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => {
            let index: i64 = segment.parse().ok()?;
            let index = if index < 0 {
                items.len().checked_sub(index.unsigned_abs() as usize)?
            } else {
                index as usize
            };
            items.get(index)
        }
        _ => None,
    }
}

/// Resolve a dotted path inside a single value.
pub fn lookup_in<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(value, |current, segment| step_into(current, segment))
}

/// Write `value` at a dotted path, creating intermediate maps as needed.
///
/// Existing non-map intermediates are replaced by maps.
pub fn set_path(target: &mut Context, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = target;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

/// Truthiness used by conditions and template boolean operators.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Whether a value counts as "missing" for `default(...)`-style fallbacks.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Render a value as message text.
///
/// Strings render raw, null renders empty, structured values render as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare two values the way flow authors expect: numerically when both
/// sides are numbers, otherwise by rendered text.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => display(a) == display(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn test_lookup_nested_and_indexed() {
        let vars = ctx(json!({"product_options": [{"sku": "A"}, {"sku": "B"}]}));
        let scope = Scope::new(&vars);
        assert_eq!(scope.lookup("product_options.1.sku"), Some(&json!("B")));
        assert_eq!(scope.lookup("product_options.-1.sku"), Some(&json!("B")));
        assert_eq!(scope.lookup("product_options.5"), None);
        assert_eq!(scope.lookup("missing.path"), None);
    }

    #[test]
    fn test_vars_shadow_facts() {
        let vars = ctx(json!({"contact": {"name": "override"}}));
        let facts = ctx(json!({"contact": {"name": "Alice"}, "trigger_message": {"text_content": "hi"}}));
        let scope = Scope::with_facts(&vars, &facts);
        assert_eq!(scope.lookup("contact.name"), Some(&json!("override")));
        assert_eq!(scope.lookup("trigger_message.text_content"), Some(&json!("hi")));
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut target = Context::new();
        set_path(&mut target, "a.b.c", json!(1));
        set_path(&mut target, "a.d", json!("x"));
        assert_eq!(Value::Object(target), json!({"a": {"b": {"c": 1}, "d": "x"}}));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!("retail")));
        assert!(is_truthy(&json!([{"sku": "A"}])));
    }

    #[test]
    fn test_display_and_equality() {
        assert_eq!(display(&json!(null)), "");
        assert_eq!(display(&json!("x")), "x");
        assert_eq!(display(&json!(5)), "5");
        assert!(loosely_equal(&json!(5), &json!(5.0)));
        assert!(loosely_equal(&json!("5"), &json!(5)));
        assert!(!loosely_equal(&json!("retail"), &json!("other")));
    }
}
