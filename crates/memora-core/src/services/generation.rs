//! Text generation seam.
//!
//! Every model call in the pipeline goes through [`TextGenerator`], so the
//! HTTP client can be swapped for a scripted one in tests. Structured
//! replies are parsed in one place, [`generate_structured`], which keeps
//! "the model answered but the answer was unusable" apart from transport
//! failures.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use memora_llm::{ChatMessage, ChatOptions, LlmService};

use crate::Error;

/// Failure of a single generation call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    /// The model replied, but not in the requested shape.
    #[error("unparseable generation output: {0}")]
    Parse(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("generation failed: {0}")]
    Transport(String),
}

impl From<GenerationError> for Error {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Parse(message) => Error::GenerationParse {
                attempts: 1,
                message,
            },
            other => Error::Llm(other.to_string()),
        }
    }
}

/// A chat model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, GenerationError>;
}

#[async_trait]
impl TextGenerator for LlmService {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, GenerationError> {
        self.chat(messages, options)
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))
    }
}

/// Generate free text under a deadline.
pub async fn generate_text(
    generator: &dyn TextGenerator,
    messages: &[ChatMessage],
    options: &ChatOptions,
    timeout: Duration,
) -> Result<String, GenerationError> {
    match tokio::time::timeout(timeout, generator.generate(messages, options)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?timeout, "Generation call timed out");
            Err(GenerationError::Timeout(timeout))
        }
    }
}

/// Generate a JSON reply matching `schema` and deserialize it into `T`.
pub async fn generate_structured<T: DeserializeOwned>(
    generator: &dyn TextGenerator,
    messages: &[ChatMessage],
    schema: Value,
    timeout: Duration,
) -> Result<T, GenerationError> {
    let options = ChatOptions::json(schema);
    let text = generate_text(generator, messages, &options, timeout).await?;

    let json = memora_llm::extract_json(&text).ok_or_else(|| {
        debug!(reply_len = text.len(), "No JSON object in generation reply");
        GenerationError::Parse("reply contains no JSON object".to_string())
    })?;

    serde_json::from_value(json).map_err(|e| GenerationError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    struct Stalled;

    #[async_trait]
    impl TextGenerator for Stalled {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[derive(Debug, Deserialize)]
    struct Reply {
        answer: u32,
    }

    #[tokio::test]
    async fn test_structured_reply_inside_fence() {
        let generator = Fixed("Sure:\n```json\n{\"answer\": 42}\n```");
        let reply: Reply =
            generate_structured(&generator, &[], json!({}), Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(reply.answer, 42);
    }

    #[tokio::test]
    async fn test_wrong_shape_is_parse_error() {
        let generator = Fixed("{\"answer\": \"many\"}");
        let err = generate_structured::<Reply>(&generator, &[], json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Parse(_)));
        assert!(matches!(Error::from(err), Error::GenerationParse { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_prose_is_parse_error() {
        let generator = Fixed("I could not find anything.");
        let err = generate_structured::<Reply>(&generator, &[], json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Parse(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_not_a_parse_error() {
        let err = generate_text(
            &Stalled,
            &[],
            &ChatOptions::default(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));
        assert!(matches!(Error::from(err), Error::Llm(_)));
    }
}
