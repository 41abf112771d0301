use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;

use crate::app_config::{AzureOpenAiConfig, ModelConfig};
use crate::error::AppResult;
use crate::HttpClient;

/// Seam over the chat-completions endpoint so the retry and reconciliation
/// logic can run against a scripted service in tests.
pub trait CompletionApi {
    fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> impl Future<Output = AppResult<ChatApiResponse>> + Send;
}

/// Azure OpenAI chat deployment, driven in JSON output mode.
#[derive(Clone)]
pub struct AzureChatApi {
    http_client: HttpClient,
    endpoint: String,
    deployment: String,
    api_version: String,
    subscription_key: String,
    temperature: f64,
    max_tokens: u32,
}

impl AzureChatApi {
    pub fn new(http_client: HttpClient, azure: &AzureOpenAiConfig, model: &ModelConfig) -> Self {
        Self {
            http_client,
            endpoint: azure.endpoint.trim_end_matches('/').to_string(),
            deployment: azure.deployment.clone(),
            api_version: azure.api_version.clone(),
            subscription_key: azure.subscription_key.clone(),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

impl CompletionApi for AzureChatApi {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> AppResult<ChatApiResponse> {
        let resp = self
            .http_client
            .post(self.chat_url())
            .header("api-key", &self.subscription_key)
            .json(&json!(
              {
                "messages": [
                  {
                    "role": "system",
                    "content": system_prompt
                  },
                  {
                    "role": "user",
                    "content": user_prompt
                  }
                ],
                "response_format": { "type": "json_object" },
                "temperature": self.temperature,
                "max_tokens": self.max_tokens
              }
            ))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parsed = serde_json::from_value::<ChatApiResponseOrError>(resp.clone())
            .context(format!("Could not parse chat response: {}", resp))?;

        match parsed {
            ChatApiResponseOrError::Error(error) => {
                Err(anyhow!("Chat API error: {:?}", error).into())
            }
            ChatApiResponseOrError::Response(parsed) => Ok(parsed),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: PromptUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}
