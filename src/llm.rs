//! OpenAI-compatible chat completions client and knowledge prompts.
//!
//! The model is treated as a black box: send a prompt, get text back. This
//! module owns deterministic prompt construction (templates serialized as
//! pretty-printed JSON so the model sees stable formatting) and strict
//! enforcement of the "response must be parseable JSON" contract. The
//! [`KnowledgeModel`] trait is the seam the orchestrator depends on, so
//! pipeline behavior is testable against fakes.

use crate::config::Settings;
use crate::error::ModelError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You are an expert educational content analyzer. Your task is to extract knowledge points \
from course material and structure them according to a provided JSON template.

CRITICAL INSTRUCTIONS:
1. Extract ONLY knowledge points that are actually present in the provided text
2. Follow the EXACT structure of the provided JSON template
3. Fill in the template with relevant content from the text
4. If a section in the template has no corresponding content in the text, use null or empty values
5. Maintain the original JSON structure and field names
6. Ensure all output is valid JSON format

QUALITY REQUIREMENTS:
- Extract key concepts, definitions, examples, and important details
- Summarize complex topics clearly and concisely
- Preserve important technical terms and terminology
- Maintain logical connections between related concepts";

const MERGE_SYSTEM_PROMPT: &str = "\
You are an expert at consolidating educational content. Your task is to merge multiple \
knowledge point extractions into a single, comprehensive JSON structure.

INSTRUCTIONS:
1. Combine all knowledge points from different chapters
2. Eliminate duplicates while preserving unique information
3. Organize content logically within the target structure
4. Ensure comprehensive coverage of all topics
5. Maintain the exact JSON structure provided
6. Return ONLY the merged JSON, no additional text";

/// Request/response capability for knowledge extraction and merging.
///
/// Both operations must return a JSON object; anything else (including
/// unparseable text) is a [`ModelError`] for that single call.
#[async_trait]
pub trait KnowledgeModel: Send + Sync {
    /// Fill `template` from one chapter's text. One model call.
    async fn extract_chapter(
        &self,
        chapter_content: &str,
        template: &Value,
    ) -> Result<Value, ModelError>;

    /// Consolidate all per-chapter results into the template shape. One
    /// model call; inputs are read-only.
    async fn merge_knowledge(
        &self,
        chapter_results: &[Value],
        template: &Value,
    ) -> Result<Value, ModelError>;
}

/// Chat completions client for any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from settings. The per-request timeout converts a hung
    /// model call into a regular call failure.
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.llm_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    /// Send one chat completion request and return the raw response text.
    async fn chat(&self, messages: Vec<Message>) -> Result<String, ModelError> {
        debug!(model = %self.model, "Sending chat completion request");

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let response: ChatCompletionResponse = response.json().await?;

        if let Some(usage) = &response.usage {
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "Chat completion finished"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)
    }

    /// Send a chat completion and parse the response as a JSON object.
    async fn chat_json(&self, messages: Vec<Message>) -> Result<Value, ModelError> {
        let response = self.chat(messages).await?;
        debug!(chars = response.len(), "Raw model response received");
        ensure_object(parse_llm_json(&response)?)
    }
}

#[async_trait]
impl KnowledgeModel for ChatClient {
    async fn extract_chapter(
        &self,
        chapter_content: &str,
        template: &Value,
    ) -> Result<Value, ModelError> {
        self.chat_json(build_extraction_messages(chapter_content, template))
            .await
    }

    async fn merge_knowledge(
        &self,
        chapter_results: &[Value],
        template: &Value,
    ) -> Result<Value, ModelError> {
        self.chat_json(build_merge_messages(chapter_results, template))
            .await
    }
}

/// Messages for one chapter extraction call.
pub fn build_extraction_messages(chapter_content: &str, template: &Value) -> Vec<Message> {
    let user_prompt = format!(
        "Please analyze the following course chapter and extract knowledge points according \
         to the provided JSON structure.\n\n\
         CHAPTER CONTENT:\n{chapter_content}\n\n\
         JSON STRUCTURE TEMPLATE:\n{template}\n\n\
         Extract the knowledge points from the chapter content and fill the JSON template \
         accordingly. Return ONLY the filled JSON structure, no additional text or explanations.",
        template = pretty_json(template),
    );

    vec![
        Message::system(EXTRACTION_SYSTEM_PROMPT),
        Message::user(user_prompt),
    ]
}

/// Messages for the single merge call.
pub fn build_merge_messages(chapter_results: &[Value], template: &Value) -> Vec<Message> {
    let user_prompt = format!(
        "Please merge the following extracted knowledge points into the target JSON structure:\n\n\
         EXTRACTED KNOWLEDGE POINTS:\n{results}\n\n\
         TARGET JSON STRUCTURE:\n{template}\n\n\
         Merge all knowledge points into a comprehensive, well-organized JSON structure.",
        results = pretty_json(&Value::Array(chapter_results.to_vec())),
        template = pretty_json(template),
    );

    vec![Message::system(MERGE_SYSTEM_PROMPT), Message::user(user_prompt)]
}

/// Canonical template serialization: pretty-printed so the model sees stable
/// formatting across calls.
fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).expect("JSON value serialization is infallible")
}

/// Parse a model response as JSON, tolerating markdown code fences around
/// the payload.
pub fn parse_llm_json(response: &str) -> Result<Value, ModelError> {
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    serde_json::from_str(json_str).map_err(|e| ModelError::InvalidJson {
        detail: format!(
            "{e}: {}",
            json_str.chars().take(200).collect::<String>()
        ),
    })
}

/// The extraction contract requires a template-shaped object at top level.
fn ensure_object(value: Value) -> Result<Value, ModelError> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(ModelError::NotAnObject)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json() {
        let value = parse_llm_json(r#"{"topics": ["a"]}"#).unwrap();
        assert_eq!(value, json!({"topics": ["a"]}));
    }

    #[test]
    fn strips_json_code_fences() {
        let response = "Here you go:\n```json\n{\"topics\": []}\n```\nDone.";
        let value = parse_llm_json(response).unwrap();
        assert_eq!(value, json!({"topics": []}));
    }

    #[test]
    fn strips_anonymous_code_fences() {
        let response = "```\n{\"k\": 1}\n```";
        let value = parse_llm_json(response).unwrap();
        assert_eq!(value, json!({"k": 1}));
    }

    #[test]
    fn rejects_non_json_response() {
        let err = parse_llm_json("I could not find any knowledge points.").unwrap_err();
        assert!(matches!(err, ModelError::InvalidJson { .. }));
    }

    #[test]
    fn rejects_non_object_top_level() {
        let err = ensure_object(json!(["a", "b"])).unwrap_err();
        assert!(matches!(err, ModelError::NotAnObject));
    }

    #[test]
    fn extraction_prompt_embeds_pretty_template_and_content() {
        let template = json!({"topics": [], "concepts": []});
        let messages = build_extraction_messages("Gradient descent minimizes loss.", &template);

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, Role::System));
        let user = &messages[1].content;
        assert!(user.contains("Gradient descent minimizes loss."));
        // Pretty-printed template, one key per line
        assert!(user.contains("\"topics\": []"));
    }

    #[test]
    fn merge_prompt_serializes_results_as_array() {
        let template = json!({"topics": []});
        let results = vec![json!({"topics": ["a"]}), json!({"topics": ["b"]})];
        let messages = build_merge_messages(&results, &template);

        let user = &messages[1].content;
        assert!(user.contains("EXTRACTED KNOWLEDGE POINTS:"));
        assert!(user.trim_start().starts_with("Please merge"));
        assert!(user.contains("\"a\""));
        assert!(user.contains("\"b\""));
    }
}
