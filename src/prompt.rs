//! Our prompt data type.

use handlebars::Handlebars;
use serde_json::Map;
use toml_span::{DeserError, de_helpers::TableHelper};

use crate::prelude::*;

/// A JSON Object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = Map<String, Value>;

/// A chat completion prompt, usually loaded from TOML.
///
/// ```toml
/// developer = "You fix OCR errors."
///
/// [[messages]]
/// user = "Clean up:\n\n{{text}}"
/// ```
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    pub developer: Option<String>,

    /// Messages.
    pub messages: Vec<Message>,
}

impl ChatPrompt {
    /// Parse a prompt from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self> {
        parse_toml_prompt(toml).map_err(|err| anyhow!("cannot parse prompt: {:?}", err.errors))
    }

    /// Load a prompt from a TOML file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let toml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read prompt {:?}", path.display()))?;
        Self::from_toml(&toml).with_context(|| format!("in {:?}", path.display()))
    }

    /// Render the prompt as an OpenAI-style array of messages.
    pub fn render_messages(&self, bindings: &JsonObject) -> Result<Value> {
        let mut handlebars = Handlebars::new();
        // We're producing prompts, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);

        let mut messages = Vec::new();
        if let Some(developer) = &self.developer {
            messages.push(json!({
                "role": "system",
                "content": handlebars.render_template(developer, bindings)?,
            }));
        }
        for message in &self.messages {
            let user = handlebars.render_template(&message.user, bindings)?;
            messages.push(json!({ "role": "user", "content": user }));
            if let Some(assistant) = &message.assistant {
                let assistant = handlebars.render_template(assistant, bindings)?;
                messages.push(json!({ "role": "assistant", "content": assistant }));
            }
        }
        Ok(Value::Array(messages))
    }
}

/// Parse and deserialize in one step, so that parse errors and shape errors
/// are reported the same way.
fn parse_toml_prompt(toml: &str) -> Result<ChatPrompt, DeserError> {
    let mut value = toml_span::de::parse(toml)?;
    <ChatPrompt as toml_span::Deserialize>::deserialize(&mut value)
}

impl<'de> toml_span::Deserialize<'de> for ChatPrompt {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let developer = th.optional::<String>("developer");
        let messages = th.required::<Vec<Message>>("messages")?;
        th.finalize(None)?;
        Ok(Self {
            developer,
            messages,
        })
    }
}

/// A user message, and optionally an example response.
#[derive(Debug, Clone)]
pub struct Message {
    /// The user message.
    pub user: String,

    /// The assistant response (optional).
    pub assistant: Option<String>,
}

impl<'de> toml_span::Deserialize<'de> for Message {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let user = th.required::<String>("user")?;
        let assistant = th.optional::<String>("assistant");
        th.finalize(None)?;
        Ok(Self { user, assistant })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = r#"
developer = "Fix OCR mistakes."

[[messages]]
user = "Example: {{example}}"
assistant = "Fixed example"

[[messages]]
user = "Text: {{text}}"
"#;

    #[test]
    fn renders_messages_without_escaping() {
        let prompt = ChatPrompt::from_toml(PROMPT).unwrap();
        let mut bindings = JsonObject::new();
        bindings.insert("example".to_owned(), json!("a & b"));
        bindings.insert("text".to_owned(), json!("<tag>"));
        let messages = prompt.render_messages(&bindings).unwrap();
        assert_eq!(
            messages,
            json!([
                { "role": "system", "content": "Fix OCR mistakes." },
                { "role": "user", "content": "Example: a & b" },
                { "role": "assistant", "content": "Fixed example" },
                { "role": "user", "content": "Text: <tag>" },
            ])
        );
    }

    #[test]
    fn missing_bindings_are_errors() {
        let prompt = ChatPrompt::from_toml(PROMPT).unwrap();
        assert!(prompt.render_messages(&JsonObject::new()).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ChatPrompt::from_toml("messages = []\nsurprise = 1\n").unwrap_err();
        assert!(err.to_string().contains("cannot parse prompt"), "{err}");
    }
}
