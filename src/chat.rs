//! Conversational layer: intent detection, filter extraction from free
//! text, retrieval through the hybrid search engine, and per-session
//! history kept in Redis.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::auth::{DataType, RbacManager, Role};
use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::llm::{extract_json, ChatMessage, LanguageModel};
use crate::models::ModelRegistry;
use crate::property::{PropertyFilters, DUBAI_AREAS, PROPERTY_TYPES};
use crate::redis_backend::RedisManager;
use crate::search::{HybridSearchEngine, SearchHit, SearchParams};

const MAX_MESSAGE_CHARS: usize = 4000;
const MAX_SESSION_ID_CHARS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PropertySearch,
    MarketInfo,
    Valuation,
    Investment,
    Legal,
    General,
}

impl Intent {
    /// Intents that are answered from retrieved listings.
    pub fn needs_retrieval(self) -> bool {
        matches!(self, Intent::PropertySearch | Intent::Valuation | Intent::Investment)
    }
}

const INTENT_KEYWORDS: &[(Intent, &[&str])] = &[
    (
        Intent::PropertySearch,
        &["buy", "rent", "looking for", "find", "search", "show me", "apartment", "villa", "townhouse", "penthouse", "bedroom", "studio", "flat"],
    ),
    (
        Intent::MarketInfo,
        &["market", "trend", "average price", "prices in", "demand", "supply", "forecast"],
    ),
    (
        Intent::Valuation,
        &["worth", "value", "valuation", "appraise", "how much is", "price per sq"],
    ),
    (
        Intent::Investment,
        &["invest", "roi", "rental yield", "yield", "return", "off-plan", "off plan", "capital gain"],
    ),
    (
        Intent::Legal,
        &["legal", "law", "visa", "golden visa", "freehold", "leasehold", "rera", "contract", "ejari", "title deed", "mortgage"],
    ),
];

/// Rule-based classifier; always yields at least one intent.
pub fn detect_intents_by_keywords(message: &str) -> Vec<Intent> {
    let lower = message.to_lowercase();
    let mut intents: Vec<Intent> = INTENT_KEYWORDS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(intent, _)| *intent)
        .collect();
    if intents.is_empty() {
        intents.push(Intent::General);
    }
    intents
}

const AREA_ALIASES: &[(&str, &str)] = &[
    ("jvc", "Jumeirah Village Circle"),
    ("jlt", "Jumeirah Lake Towers"),
    ("jbr", "Jumeirah Beach Residence"),
    ("marina", "Dubai Marina"),
    ("downtown", "Downtown Dubai"),
    ("the palm", "Palm Jumeirah"),
    ("dubai hills", "Dubai Hills Estate"),
    ("creek harbour", "Dubai Creek Harbour"),
    ("silicon oasis", "Dubai Silicon Oasis"),
];

fn bedrooms_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})\s*-?\s*(?:bed(?:room)?s?|br|bhk)\b").expect("valid bedrooms pattern")
    })
}

fn budget_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(under|below|less than|max(?:imum)?|up to|within|budget(?: of| is)?|above|over|more than|at least|from|min(?:imum)?)\s*(aed\s*)?(\d[\d,]*(?:\.\d+)?)\s*(?:(m|mn|million|k|thousand|aed|dirhams?)\b)?(?:\s*([a-z]+))?",
        )
        .expect("valid budget pattern")
    })
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*(m|mn|million)\b").expect("valid amount pattern")
    })
}

/// Words after a number that make it a count or a distance, not money.
const NON_MONEY_WORDS: &[&str] = &[
    "bed", "br", "bhk", "bath", "room", "min", "hour", "hr", "km", "kilomet", "meter", "metre", "mile", "sq",
    "year", "yr", "floor", "stor", "car", "people", "person",
];

fn is_non_money_word(word: &str) -> bool {
    let word = word.to_lowercase();
    NON_MONEY_WORDS.iter().any(|w| word.starts_with(w))
}

/// AED value of a matched amount, or `None` when nothing marks it as money.
/// Bare numbers of five digits or more count as AED; smaller bare numbers
/// only count when the message talks about a budget or price, where
/// "budget of 3" means millions.
fn parse_amount(number: &str, unit: Option<&str>, money_context: bool) -> Option<f64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    match unit.map(str::to_lowercase).as_deref() {
        Some("m") | Some("mn") | Some("million") => Some(value * 1_000_000.0),
        Some("k") | Some("thousand") => Some(value * 1_000.0),
        Some(_) => Some(value),
        None if value >= 10_000.0 => Some(value),
        None if money_context && value < 1_000.0 => Some(value * 1_000_000.0),
        None if money_context => Some(value),
        None => None,
    }
}

/// Best-effort structured filters from a free-text message.
pub fn extract_filters(message: &str) -> PropertyFilters {
    let lower = message.to_lowercase();
    let mut filters = PropertyFilters::default();

    filters.location = DUBAI_AREAS
        .iter()
        .find(|area| lower.contains(&area.to_lowercase()))
        .map(|area| area.to_string())
        .or_else(|| {
            let words = lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            AREA_ALIASES
                .iter()
                .find(|(alias, _)| words.contains(alias))
                .map(|(_, area)| area.to_string())
        });

    filters.property_type = PROPERTY_TYPES
        .iter()
        .find(|kind| lower.contains(&kind.to_lowercase()))
        .map(|kind| kind.to_string())
        .or_else(|| lower.contains("flat").then(|| "Apartment".to_string()));

    if lower.contains("studio") {
        filters.bedrooms = Some(0);
    } else if let Some(caps) = bedrooms_re().captures(message) {
        filters.bedrooms = caps[1].parse().ok();
    }

    let money_context = ["budget", "price", "aed", "dirham"].iter().any(|w| lower.contains(w));
    let mut found_budget = false;
    for caps in budget_re().captures_iter(message) {
        if caps.get(5).is_some_and(|w| is_non_money_word(w.as_str())) {
            continue;
        }
        let unit = caps
            .get(4)
            .map(|m| m.as_str())
            .or_else(|| caps.get(2).map(|_| "aed"));
        let Some(amount) = parse_amount(&caps[3], unit, money_context) else {
            continue;
        };
        match caps[1].to_lowercase().as_str() {
            "above" | "over" | "more than" | "at least" | "from" | "min" | "minimum" => {
                filters.min_price = Some(amount)
            }
            _ => filters.max_price = Some(amount),
        }
        found_budget = true;
    }
    if !found_budget {
        if let Some(caps) = amount_re().captures(message) {
            filters.max_price = parse_amount(&caps[1], Some(&caps[2]), true);
        }
    }
    if let (Some(min), Some(max)) = (filters.min_price, filters.max_price) {
        if min > max {
            filters.min_price = Some(max);
            filters.max_price = Some(min);
        }
    }
    filters
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
    #[serde(default)]
    pub intents: Vec<Intent>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub answer: String,
    pub intents: Vec<Intent>,
    pub filters: PropertyFilters,
    pub sources: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct IntentReply {
    #[serde(default)]
    intents: Vec<serde_json::Value>,
    #[serde(default)]
    filters: Option<PropertyFilters>,
}

const INTENT_PROMPT: &str = "You classify messages sent to a Dubai real-estate assistant. \
Reply with JSON only: {\"intents\": [...], \"filters\": {\"location\": null, \"property_type\": null, \
\"min_price\": null, \"max_price\": null, \"bedrooms\": null}}. Allowed intents: property_search, \
market_info, valuation, investment, legal, general. A message may have several intents. Prices are in AED.";

const ANSWER_PROMPT: &str = "You are a knowledgeable Dubai real-estate assistant. Answer using the \
listings and documents provided as context when they are relevant, quote prices in AED, and say so \
plainly when the context does not contain the answer. Do not invent listings.";

pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_CHARS
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid session id: {:?}", session_id)))
    }
}

/// Sessions are scoped to their owner; another user naming the same
/// session id gets a separate, empty history.
fn history_key(user_id: &str, session_id: &str) -> String {
    format!("chat:{}:{}", user_id, session_id)
}

/// Registry tasks whose active model overrides the configured one.
const CHAT_TASK: &str = "chat";
const INTENT_TASK: &str = "intent";

pub struct ChatService {
    engine: Arc<HybridSearchEngine>,
    llm: Arc<dyn LanguageModel>,
    models: Arc<ModelRegistry>,
    redis: Arc<RedisManager>,
    rbac: RbacManager,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        engine: Arc<HybridSearchEngine>,
        llm: Arc<dyn LanguageModel>,
        models: Arc<ModelRegistry>,
        redis: Arc<RedisManager>,
        config: ChatConfig,
    ) -> Self {
        Self {
            engine,
            llm,
            models,
            redis,
            rbac: RbacManager::new(),
            config,
        }
    }

    async fn complete(&self, task: &str, messages: &[ChatMessage]) -> Result<String> {
        let active = match self.models.active_for(task).await {
            Ok(record) => record,
            Err(e) => {
                warn!(task, "model registry lookup failed, using the configured model: {}", e);
                None
            }
        };
        match active {
            Some(record) => {
                debug!(task, model = %record.name, "using registry model");
                self.llm.complete_with_model(&record.name, messages).await
            }
            None => self.llm.complete(messages).await,
        }
    }

    /// Ask the model for intents and filters, falling back to keyword rules
    /// when the call fails or the reply is unusable.
    pub async fn detect_intents(&self, message: &str) -> (Vec<Intent>, Option<PropertyFilters>) {
        let messages = [ChatMessage::system(INTENT_PROMPT), ChatMessage::user(message)];
        let reply = match self.complete(INTENT_TASK, &messages).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Intent detection failed, using keyword rules: {}", e);
                return (detect_intents_by_keywords(message), None);
            }
        };

        let parsed = extract_json(&reply).and_then(|v| serde_json::from_value::<IntentReply>(v).ok());
        match parsed {
            Some(reply) => {
                let intents = unique_intents(reply.intents);
                if intents.is_empty() {
                    (detect_intents_by_keywords(message), reply.filters)
                } else {
                    (intents, reply.filters)
                }
            }
            None => {
                debug!("Unparseable intent reply, using keyword rules");
                (detect_intents_by_keywords(message), None)
            }
        }
    }

    #[instrument(skip(self, message), fields(user_id = %user_id, session_id = %session_id, role = %role))]
    pub async fn respond(&self, user_id: &str, session_id: &str, message: &str, role: Role) -> Result<ChatResponse> {
        validate_session_id(session_id)?;
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::InvalidInput("message cannot be empty".to_string()));
        }
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(Error::InvalidInput(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        self.rbac.require(role, DataType::Property)?;

        let (intents, model_filters) = self.detect_intents(message).await;
        let filters = merge_filters(extract_filters(message), model_filters);

        let mut sources = Vec::new();
        if intents.iter().any(|i| i.needs_retrieval()) {
            let params = SearchParams::new(message)
                .with_filters(filters.clone())
                .with_limit(self.config.context_results);
            match self.engine.search(params).await {
                Ok(response) => sources = response.results,
                Err(e) => warn!("Retrieval failed, answering without context: {}", e),
            }
        }
        for hit in &mut sources {
            let metadata = std::mem::take(&mut hit.metadata);
            hit.metadata = self.rbac.filter_fields(role, DataType::Property, metadata)?;
        }

        let history = self.history(user_id, session_id).await?;
        let prompt = build_prompt(message, &intents, &sources, &history);
        let answer = self.complete(CHAT_TASK, &prompt).await?;

        self.append_turn(
            user_id,
            session_id,
            &ChatTurn {
                user: message.to_string(),
                assistant: answer.clone(),
                intents: intents.clone(),
                timestamp: Utc::now(),
            },
        )
        .await?;

        Ok(ChatResponse {
            session_id: session_id.to_string(),
            answer,
            intents,
            filters,
            sources,
        })
    }

    async fn append_turn(&self, user_id: &str, session_id: &str, turn: &ChatTurn) -> Result<()> {
        let key = history_key(user_id, session_id);
        self.redis.rpush(&key, &serde_json::to_vec(turn)?).await?;
        let keep = self.config.history_turns.max(1) as isize;
        self.redis.ltrim(&key, -keep, -1).await?;
        self.redis.expire(&key, self.config.history_ttl).await
    }

    pub async fn history(&self, user_id: &str, session_id: &str) -> Result<Vec<ChatTurn>> {
        validate_session_id(session_id)?;
        let raw = self.redis.lrange(&history_key(user_id, session_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    warn!(session_id, "skipping undecodable chat turn: {}", e);
                    None
                }
            })
            .collect())
    }

    pub async fn clear_history(&self, user_id: &str, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        self.redis.delete_raw(&history_key(user_id, session_id)).await
    }
}

/// Known intents in first-seen order; unknown labels are skipped.
fn unique_intents(labels: Vec<serde_json::Value>) -> Vec<Intent> {
    let mut intents = Vec::new();
    for intent in labels
        .into_iter()
        .filter_map(|v| serde_json::from_value::<Intent>(v).ok())
    {
        if !intents.contains(&intent) {
            intents.push(intent);
        }
    }
    intents
}

/// Filters found in the text win; the model only fills gaps.
fn merge_filters(text: PropertyFilters, model: Option<PropertyFilters>) -> PropertyFilters {
    let Some(model) = model else {
        return text;
    };
    PropertyFilters {
        location: text.location.or(model.location),
        property_type: text.property_type.or(model.property_type),
        min_price: text.min_price.or(model.min_price),
        max_price: text.max_price.or(model.max_price),
        bedrooms: text.bedrooms.or(model.bedrooms),
    }
}

fn build_prompt(message: &str, intents: &[Intent], sources: &[SearchHit], history: &[ChatTurn]) -> Vec<ChatMessage> {
    let mut system = String::from(ANSWER_PROMPT);
    let labels: Vec<String> = intents
        .iter()
        .filter_map(|i| serde_json::to_value(i).ok())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    system.push_str(&format!("\n\nDetected intents: {}.", labels.join(", ")));
    if !sources.is_empty() {
        system.push_str("\n\nContext:\n");
        for (i, hit) in sources.iter().enumerate() {
            system.push_str(&format!("[{}] {}\n", i + 1, hit.content));
        }
    }

    let mut messages = vec![ChatMessage::system(system)];
    for turn in history {
        messages.push(ChatMessage::user(turn.user.clone()));
        messages.push(ChatMessage::assistant(turn.assistant.clone()));
    }
    messages.push(ChatMessage::user(message));
    messages
}
