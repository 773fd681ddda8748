use glm_core::{ChatMessage, GlmError, Result, ToolCallMessage};
use minijinja::Environment;

/// A minijinja chat template. The render context exposes `messages`, each
/// with `role`, `content`, `has_image` and `tool_calls` (`type`, `name`,
/// `arguments`, `input`).
#[derive(Debug)]
pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn new(template_str: &str) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template_owned("chat", template_str.to_string())
            .map_err(|e| GlmError::Template(format!("template parse error: {e}")))?;
        Ok(Self { env })
    }

    pub fn render(&self, messages: &[ChatMessage]) -> Result<String> {
        let tmpl = self
            .env
            .get_template("chat")
            .map_err(|e| GlmError::Template(e.to_string()))?;

        let msgs: Vec<minijinja::Value> = messages
            .iter()
            .map(|m| {
                let tool_calls: Vec<minijinja::Value> =
                    m.tool_calls.iter().map(tool_call_value).collect();
                minijinja::context! {
                    role => m.role.as_str(),
                    content => m.content.as_str(),
                    has_image => m.image.is_some(),
                    tool_calls => tool_calls,
                }
            })
            .collect();

        tmpl.render(minijinja::context! { messages => msgs })
            .map_err(|e| GlmError::Template(e.to_string()))
    }
}

fn tool_call_value(call: &ToolCallMessage) -> minijinja::Value {
    let fields: Vec<(&str, &str)> = match call {
        ToolCallMessage::Function(f) => vec![
            ("type", ToolCallMessage::TYPE_FUNCTION),
            ("name", f.name.as_str()),
            ("arguments", f.arguments.as_str()),
        ],
        ToolCallMessage::Code(c) => vec![
            ("type", ToolCallMessage::TYPE_CODE),
            ("input", c.input.as_str()),
        ],
    };
    fields
        .into_iter()
        .map(|(k, v)| (k, minijinja::Value::from(v)))
        .collect()
}
