use serde::{Deserialize, Serialize};

use super::provider::{LlmError, LlmProvider, LlmResult, ModelInput, ModelOutput};
use crate::agent::{Message, Role};
use crate::http::client::HttpClient;

const MAX_ERROR_BODY_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(
        http: HttpClient,
        api_key: Option<String>,
        model: String,
        base_url: String,
    ) -> LlmResult<Self> {
        let api_key = api_key
            .filter(|v| !v.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        Ok(Self {
            http,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn build_request(input: &ModelInput) -> GeminiGenerateRequest {
        let contents = input
            .messages
            .iter()
            .filter_map(|message| {
                gemini_role(message).map(|role| GeminiContent {
                    role: role.to_string(),
                    parts: vec![GeminiPart {
                        text: message.content.clone(),
                    }],
                })
            })
            .collect();

        let system_instruction = (!input.system_instruction.trim().is_empty()).then(|| {
            GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: input.system_instruction.clone(),
                }],
            }
        });

        GeminiGenerateRequest {
            contents,
            system_instruction,
        }
    }

    fn extract_text(resp: GeminiGenerateResponse) -> LlmResult<String> {
        for candidate in resp.candidates {
            let Some(content) = candidate.content else {
                continue;
            };
            let text = content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("");
            let text = text.trim();
            if !text.is_empty() {
                return Ok(text.to_string());
            }
        }

        Err(LlmError::EmptyResponse)
    }
}

/// Observations are fed back as user turns; Gemini only knows `user` and `model`.
fn gemini_role(message: &Message) -> Option<&'static str> {
    match message.role {
        Role::System => None,
        Role::User | Role::Observation => Some("user"),
        Role::Assistant => Some("model"),
    }
}

impl LlmProvider for GeminiProvider {
    async fn generate(&self, input: ModelInput) -> LlmResult<ModelOutput> {
        let payload = Self::build_request(&input);
        let resp = self
            .http
            .post_json(
                &self.endpoint(),
                &[("key", self.api_key.as_str())],
                &payload,
            )
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        if !(200..300).contains(&resp.status) {
            let body = resp
                .body
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect::<String>();
            return Err(LlmError::HttpStatus {
                status: resp.status,
                body,
            });
        }

        let parsed = serde_json::from_str::<GeminiGenerateResponse>(&resp.body)
            .map_err(|err| LlmError::Parse(err.to_string()))?;
        let text = Self::extract_text(parsed)?;
        Ok(ModelOutput { text })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}
