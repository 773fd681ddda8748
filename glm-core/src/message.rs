use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::image::Image;
use crate::GlmError;

/// Speaker of a conversation turn. The lowercase names are wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Observation,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => ChatMessage::ROLE_SYSTEM,
            Role::User => ChatMessage::ROLE_USER,
            Role::Assistant => ChatMessage::ROLE_ASSISTANT,
            Role::Observation => ChatMessage::ROLE_OBSERVATION,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = GlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ChatMessage::ROLE_SYSTEM => Ok(Role::System),
            ChatMessage::ROLE_USER => Ok(Role::User),
            ChatMessage::ROLE_ASSISTANT => Ok(Role::Assistant),
            ChatMessage::ROLE_OBSERVATION => Ok(Role::Observation),
            other => Err(GlmError::InvalidInput(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMessage {
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMessage {
    pub input: String,
}

/// A structured request emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolCallMessage {
    Function(FunctionMessage),
    Code(CodeMessage),
}

impl ToolCallMessage {
    pub const TYPE_FUNCTION: &'static str = "function";
    pub const TYPE_CODE: &'static str = "code";

    pub fn function(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        ToolCallMessage::Function(FunctionMessage {
            name: name.into(),
            arguments: arguments.into(),
        })
    }

    pub fn code(input: impl Into<String>) -> Self {
        ToolCallMessage::Code(CodeMessage {
            input: input.into(),
        })
    }

    /// The discriminating `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolCallMessage::Function(_) => Self::TYPE_FUNCTION,
            ToolCallMessage::Code(_) => Self::TYPE_CODE,
        }
    }
}

impl fmt::Display for ToolCallMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCallMessage::Function(func) => write!(
                f,
                "ToolCallMessage(type=\"function\", name={:?}, arguments={:?})",
                func.name, func.arguments
            ),
            ToolCallMessage::Code(code) => {
                write!(f, "ToolCallMessage(type=\"code\", input={:?})", code.input)
            }
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub image: Option<Image>,
    pub tool_calls: Vec<ToolCallMessage>,
}

impl ChatMessage {
    pub const ROLE_SYSTEM: &'static str = "system";
    pub const ROLE_USER: &'static str = "user";
    pub const ROLE_ASSISTANT: &'static str = "assistant";
    pub const ROLE_OBSERVATION: &'static str = "observation";

    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn observation(content: impl Into<String>) -> Self {
        Self::new(Role::Observation, content)
    }

    pub fn with_image(mut self, image: Image) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallMessage>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChatMessage(role={:?}, content={:?}", self.role.as_str(), self.content)?;
        if let Some(image) = &self.image {
            write!(f, ", image={image:?}")?;
        }
        if !self.tool_calls.is_empty() {
            f.write_str(", tool_calls=[")?;
            for (i, call) in self.tool_calls.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{call}")?;
            }
            f.write_str("]")?;
        }
        f.write_str(")")
    }
}
