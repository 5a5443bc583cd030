//! Intent Classification
//!
//! Maps a normalized turn (text plus optional vision caption) into one of
//! a closed set of intents with extracted parameters. Classification never
//! fails outright: model errors, malformed output, and unknown labels all
//! degrade to `GeneralChat`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::llm::{extract_json, LlmClient};
use crate::memory::MemorySummary;

/// Closed intent categories. `GeneralChat` is the explicit fallback
/// variant; downstream stages may rely on this set being exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    CalendarQuery,
    MailSearch,
    DriveSearch,
    WeatherQuery,
    DocQuery,
    GeneralChat,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CalendarQuery => "calendar.query",
            Self::MailSearch => "mail.search",
            Self::DriveSearch => "drive.search",
            Self::WeatherQuery => "weather.query",
            Self::DocQuery => "doc.query",
            Self::GeneralChat => "general.chat",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "calendar.query" => Some(Self::CalendarQuery),
            "mail.search" => Some(Self::MailSearch),
            "drive.search" => Some(Self::DriveSearch),
            "weather.query" => Some(Self::WeatherQuery),
            "doc.query" => Some(Self::DocQuery),
            "general.chat" => Some(Self::GeneralChat),
            _ => None,
        }
    }
}

/// Parameters extracted alongside the category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentParams {
    /// e.g. "today", "tomorrow", "week"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    /// Mail sender filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Free-text search query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Location for weather lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One classified turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedIntent {
    pub intent: Intent,
    pub params: IntentParams,
    /// True when classification fell back to the default category
    /// (model error or malformed output).
    pub degraded: bool,
}

impl ClassifiedIntent {
    fn fallback() -> Self {
        Self {
            intent: Intent::GeneralChat,
            params: IntentParams::default(),
            degraded: true,
        }
    }
}

/// Strict model output contract for the classification stage.
#[derive(Deserialize)]
struct IntentJson {
    intent: String,
    #[serde(default)]
    params: IntentParams,
}

/// Model-assisted intent classifier. Pure over its inputs plus one model
/// call behind the `LlmClient` seam.
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Classify one normalized turn.
    pub async fn classify(
        &self,
        text: &str,
        memory: &MemorySummary,
        now: chrono::DateTime<chrono::Utc>,
    ) -> ClassifiedIntent {
        let prompt = format!(
            r#"Classify this user request into exactly one intent.

Intents:
- calendar.query: schedule, events, appointments, availability
- mail.search: inbox, emails, messages from someone
- drive.search: files, documents, spreadsheets
- weather.query: weather, temperature, forecast
- doc.query: questions answered from the user's indexed documents
- general.chat: everything else

Current time: {}
{}
Request: "{}"

Return one JSON object only:
{{"intent": "<label>", "params": {{"time_range": null, "sender": null, "query": null, "location": null}}}}"#,
            now.to_rfc3339(),
            memory.render(),
            text
        );

        let response = match self.llm.generate(&prompt).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "intent model call failed; defaulting to general.chat");
                return ClassifiedIntent::fallback();
            }
        };

        let Some(json) = extract_json(&response) else {
            warn!("intent output had no JSON object; defaulting to general.chat");
            return ClassifiedIntent::fallback();
        };

        match serde_json::from_str::<IntentJson>(json) {
            Ok(parsed) => match Intent::from_label(&parsed.intent) {
                Some(intent) => ClassifiedIntent {
                    intent,
                    params: parsed.params,
                    degraded: false,
                },
                None => {
                    warn!(label = %parsed.intent, "unknown intent label; defaulting to general.chat");
                    ClassifiedIntent::fallback()
                }
            },
            Err(e) => {
                warn!(error = %e, "malformed intent JSON; defaulting to general.chat");
                ClassifiedIntent::fallback()
            }
        }
    }
}
