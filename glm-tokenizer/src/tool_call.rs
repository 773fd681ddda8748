//! Tool-call grammars emitted by the ChatGLM3 and GLM-4 chat models.

use glm_core::FunctionMessage;
use serde_json::{Map, Value};

const CODE_FENCE: &str = "```";

/// Body of the first fenced code block, without the fence lines. Text without
/// a fence is returned trimmed.
pub fn extract_code(text: &str) -> String {
    let Some(open) = text.find(CODE_FENCE) else {
        return text.trim().to_string();
    };
    let after_fence = &text[open + CODE_FENCE.len()..];
    // Skip the language tag on the opening line.
    let body = match after_fence.find('\n') {
        Some(nl) => &after_fence[nl + 1..],
        None => after_fence,
    };
    let body = match body.find(CODE_FENCE) {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim_end_matches('\n').to_string()
}

/// Turn ChatGLM3's `tool_call(k=v, ...)` into a JSON object string.
/// Returns `None` when the text holds no call.
pub fn parse_tool_call_arguments(text: &str) -> Option<String> {
    let code = extract_code(text);
    let start = code.find("tool_call(")? + "tool_call(".len();
    let end = code.rfind(')')?;
    if end < start {
        return None;
    }
    let mut args = Map::new();
    for part in split_top_level(&code[start..end]) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=')?;
        args.insert(key.trim().to_string(), python_literal(value.trim()));
    }
    Some(Value::Object(args).to_string())
}

/// GLM-4 function calls: a bare function name on the first line, then a JSON
/// object with the arguments.
pub fn parse_function_call(text: &str) -> Option<FunctionMessage> {
    let (name, rest) = text.trim_start().split_once('\n')?;
    let name = name.trim();
    let is_identifier = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !is_identifier {
        return None;
    }
    let arguments: Value = serde_json::from_str(rest.trim()).ok()?;
    if !arguments.is_object() {
        return None;
    }
    Some(FunctionMessage {
        name: name.to_string(),
        arguments: arguments.to_string(),
    })
}

/// Split on commas outside quotes and brackets.
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

fn python_literal(value: &str) -> Value {
    match value {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }
    if let Some(s) = unquote(value) {
        return Value::String(s);
    }
    if let Ok(v) = serde_json::from_str(value) {
        return v;
    }
    // Python containers with single-quoted strings.
    let swapped = value
        .replace('\'', "\"")
        .replace("True", "true")
        .replace("False", "false")
        .replace("None", "null");
    serde_json::from_str(&swapped).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn unquote(value: &str) -> Option<String> {
    let mut chars = value.chars();
    let q = chars.next()?;
    if (q != '\'' && q != '"') || value.len() < 2 || !value.ends_with(q) {
        return None;
    }
    let inner = &value[1..value.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_code() {
        let text = "```python\nprint(1)\nprint(2)\n```";
        assert_eq!(extract_code(text), "print(1)\nprint(2)");
        assert_eq!(extract_code("  x = 1 "), "x = 1");
    }

    #[test]
    fn parses_keyword_arguments() {
        let text = "```python\ntool_call(city='Beijing', days=3, metric=True, tags=['a', 'b'])\n```";
        let args: Value = serde_json::from_str(&parse_tool_call_arguments(text).unwrap()).unwrap();
        assert_eq!(args["city"], "Beijing");
        assert_eq!(args["days"], 3);
        assert_eq!(args["metric"], true);
        assert_eq!(args["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn commas_inside_strings_do_not_split() {
        let args = parse_tool_call_arguments("tool_call(q=\"a, b\", n=None)").unwrap();
        let args: Value = serde_json::from_str(&args).unwrap();
        assert_eq!(args["q"], "a, b");
        assert!(args["n"].is_null());
    }

    #[test]
    fn no_call_yields_none() {
        assert!(parse_tool_call_arguments("just text").is_none());
    }

    #[test]
    fn glm4_function_call() {
        let call = parse_function_call("get_weather\n{\"location\": \"Beijing\"}").unwrap();
        assert_eq!(call.name, "get_weather");
        let args: Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(args["location"], "Beijing");

        assert!(parse_function_call("Hello there\n{\"a\": 1}").is_none());
        assert!(parse_function_call("get_weather\nnot json").is_none());
        assert!(parse_function_call("single line").is_none());
    }
}
