//! `$$name$$` token replacement over task parameter trees.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::models::GlobalVars;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$(\w+)\$\$").expect("valid regex"));

/// Returns a copy of `params` with every resolvable token inside string values replaced.
///
/// Objects and arrays are walked recursively; keys and non-string scalars pass through.
pub fn substitute(params: &Value, globals: &GlobalVars) -> Value {
    match params {
        Value::String(text) => Value::String(substitute_str(text, globals)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, globals))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), substitute(value, globals)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn substitute_str(text: &str, globals: &GlobalVars) -> String {
    if !text.contains("$$") {
        return text.to_string();
    }

    TOKEN_RE
        .replace_all(text, |captures: &Captures<'_>| {
            let name = &captures[1];
            match lookup(globals, name) {
                Some(replacement) => replacement,
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

fn lookup(globals: &GlobalVars, name: &str) -> Option<String> {
    let value = globals
        .get(name)
        .or_else(|| globals.get(&format!("$${name}")))?;

    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn globals(value: Value) -> GlobalVars {
        match value {
            Value::Object(map) => map,
            _ => GlobalVars::new(),
        }
    }

    #[test]
    fn replaces_tokens_in_nested_strings() {
        let vars = globals(json!({ "root": "D:\\Jobs", "tile": 12 }));
        let params = json!({
            "path": "$$root$$\\city",
            "nested": { "list": ["$$tile$$", 4, true, null] },
        });

        let result = substitute(&params, &vars);
        assert_eq!(
            result,
            json!({
                "path": "D:\\Jobs\\city",
                "nested": { "list": ["12", 4, true, null] },
            })
        );
    }

    #[test]
    fn unresolved_token_is_left_byte_for_byte() {
        let vars = globals(json!({ "other": "x" }));
        let text = "prefix $$missing$$ suffix";
        assert_eq!(substitute_str(text, &vars), text);
    }

    #[test]
    fn null_global_leaves_token() {
        let vars = globals(json!({ "$$current_task_id": null }));
        assert_eq!(
            substitute_str("$$current_task_id$$", &vars),
            "$$current_task_id$$"
        );
    }

    #[test]
    fn reserved_keys_resolve_through_prefix_fallback() {
        let vars = globals(json!({ "$$project_path": "C:/Projects/city.PhotoMeshXML" }));
        assert_eq!(
            substitute_str("$$project_path$$", &vars),
            "C:/Projects/city.PhotoMeshXML"
        );
    }

    #[test]
    fn text_without_tokens_is_unchanged() {
        let vars = globals(json!({ "a": "b" }));
        let params = json!({ "path": "C:/plain/$path$", "n": 3.5 });
        assert_eq!(substitute(&params, &vars), params);
    }

    #[test]
    fn object_values_insert_json_text() {
        let vars = globals(json!({ "dict": { "1": "a" } }));
        assert_eq!(substitute_str("$$dict$$", &vars), r#"{"1":"a"}"#);
    }
}
