use std::sync::Arc;

use mnemo_agents::{GenerationRequest, ModelRouter, RoleContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub primary_emotion: String,
    pub intensity: i64,
    pub explanation: String,
}

impl Sentiment {
    pub fn neutral() -> Self {
        Self {
            primary_emotion: "neutral".to_string(),
            intensity: 3,
            explanation: String::new(),
        }
    }
}

/// How the reply should shift given the user's emotional state.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneAdjustment {
    pub temperature: f32,
    pub tone_guidance: String,
}

/// Classifies the emotion in a user message via the model router.
///
/// Any failure, model or parse, collapses to the neutral default so a broken
/// sentiment path can never block a reply.
pub struct SentimentAnalyzer {
    router: Arc<ModelRouter>,
}

impl SentimentAnalyzer {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    pub async fn analyze(&self, text: &str) -> Sentiment {
        let mut request = GenerationRequest::from_prompt(build_sentiment_prompt(text));
        request.role_context = RoleContext {
            name: "Sentiment Analyzer".into(),
            personality: "Analytical and perceptive".into(),
            speaking_style: "Precise and structured".into(),
            knowledge_areas: "Emotional intelligence, psychology, language patterns".into(),
            behaviors: "Analyzes emotions accurately, provides structured responses".into(),
            tone_guidance: None,
        };
        request.options.temperature = 0.1;
        request.options.max_tokens = 200;
        request.options.bypass_cache = true;

        match self.router.generate(&request, true).await {
            Ok((response, model)) => {
                let sentiment = parse_sentiment_response(&response);
                debug!(
                    model,
                    emotion = %sentiment.primary_emotion,
                    intensity = sentiment.intensity,
                    "sentiment analyzed"
                );
                sentiment
            }
            Err(e) => {
                warn!("sentiment analysis failed: {e}");
                Sentiment::neutral()
            }
        }
    }

    /// Temperature shift and tone hint for the detected emotion family.
    pub fn adjustment(sentiment: &Sentiment) -> ToneAdjustment {
        let emotion = sentiment.primary_emotion.as_str();
        let intensity = sentiment.intensity as f32;

        let (temperature, guidance) = match emotion {
            "happiness" | "excitement" | "gratitude" => (
                0.6 + intensity * 0.05,
                format!("The user seems {emotion}. Respond with matching positive energy and enthusiasm."),
            ),
            "sadness" | "disappointment" => (
                0.7 - intensity * 0.05,
                format!("The user seems {emotion}. Respond with empathy, warmth, and support."),
            ),
            "anger" | "disgust" => (
                0.7 - intensity * 0.06,
                format!("The user seems {emotion}. Respond calmly and with understanding, avoiding escalation."),
            ),
            "fear" | "anxiety" => (
                0.7 - intensity * 0.04,
                format!("The user seems {emotion}. Respond with reassurance and support."),
            ),
            "confusion" => (
                0.7 - intensity * 0.05,
                "The user seems confused. Respond with clarity and helpful guidance.".to_string(),
            ),
            "surprise" => (
                0.6 + intensity * 0.04,
                "The user seems surprised. Acknowledge this and provide context or explanation."
                    .to_string(),
            ),
            _ => (0.7, "Respond in a balanced, conversational tone.".to_string()),
        };

        ToneAdjustment {
            temperature: temperature.clamp(0.4, 0.9),
            tone_guidance: guidance,
        }
    }
}

fn build_sentiment_prompt(text: &str) -> String {
    format!(
        "You have exceptional emotional perception. Analyze the emotional tone of the \
         following message with nuance and depth:\n\
         \n\
         \"{text}\"\n\
         \n\
         Identify the primary emotion expressed. Rate the intensity on a scale of 1-5, \
         where 1 is very mild and 5 is very intense.\n\
         \n\
         Primary emotions to consider: happiness, excitement, gratitude, sadness, \
         disappointment, anger, disgust, fear, anxiety, surprise, confusion, neutral.\n\
         \n\
         Respond in JSON format:\n\
         {{\n\
             \"primary_emotion\": \"emotion_name\",\n\
             \"intensity\": intensity_value,\n\
             \"explanation\": \"brief explanation with evidence from the text\"\n\
         }}"
    )
}

fn parse_sentiment_response(response: &str) -> Sentiment {
    let (start, end) = match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => return Sentiment::neutral(),
    };

    let value: serde_json::Value = match serde_json::from_str(&response[start..=end]) {
        Ok(value) => value,
        Err(_) => return Sentiment::neutral(),
    };

    let primary_emotion = value
        .get("primary_emotion")
        .and_then(|v| v.as_str())
        .unwrap_or("neutral")
        .to_lowercase();
    let intensity = value
        .get("intensity")
        .and_then(|v| v.as_i64())
        .unwrap_or(3)
        .clamp(1, 5);
    let explanation = value
        .get("explanation")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Sentiment {
        primary_emotion,
        intensity,
        explanation,
    }
}
