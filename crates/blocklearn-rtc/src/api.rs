//! REST collaborator for durable sessions, chat history and ratings.

use async_trait::async_trait;
use blocklearn_shared::protocol::{ChatPayload, MessageType, SessionProposal};
use blocklearn_shared::SenderInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::chat::{ChatMessage, Delivery};
use crate::config::{Endpoints, RoleProfile};
use crate::error::{ApiError, EngineError};

/// An accepted proposal as stored by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub mentor_id: String,
    pub student_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub duration_minutes: u32,
    pub location: String,
    pub notes: String,
}

impl NewSession {
    pub fn from_proposal(
        proposal: &SessionProposal,
        mentor_id: impl Into<String>,
        student_id: impl Into<String>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            mentor_id: mentor_id.into(),
            student_id: student_id.into(),
            scheduled_time: proposal.start_time()?,
            duration_minutes: proposal.duration_minutes,
            location: "Online".to_string(),
            notes: proposal.topic.clone(),
        })
    }

    fn body(&self) -> Value {
        json!({
            "mentor_id": self.mentor_id,
            "student_id": self.student_id,
            "scheduled_at": self.scheduled_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            "duration_minutes": self.duration_minutes,
            "location": self.location,
            "notes": self.notes,
        })
    }
}

/// A chat message as returned by the history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DurableMessage {
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub id: String,
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub sender_id: String,
    #[serde(default)]
    pub sender_first_name: String,
    #[serde(default)]
    pub sender_last_name: String,
    #[serde(default)]
    pub sender_email: Option<String>,
    pub message: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Metadata key carrying the sender's correlation id through the REST store.
const CORRELATION_KEY: &str = "correlation_id";

impl From<DurableMessage> for ChatMessage {
    fn from(m: DurableMessage) -> Self {
        let (correlation_id, metadata) = split_correlation(m.metadata);
        ChatMessage {
            correlation_id: correlation_id.unwrap_or_else(|| format!("durable-{}", m.id)),
            id: m.id,
            sender_id: m.sender_id,
            sender: SenderInfo {
                first_name: m.sender_first_name,
                last_name: m.sender_last_name,
                email: m.sender_email,
            },
            message: m.message,
            created_at: m.created_at,
            message_type: m.message_type,
            metadata,
            delivery: Delivery::Confirmed,
        }
    }
}

/// Body for posting a chat payload. The correlation id rides in `metadata`
/// so history fetched later can be matched against the local copy.
fn message_body(payload: &ChatPayload) -> Value {
    let mut metadata = match &payload.metadata {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".into(), other.clone());
            map
        }
        None => serde_json::Map::new(),
    };
    metadata.insert(
        CORRELATION_KEY.into(),
        Value::String(payload.correlation_id.clone()),
    );
    json!({
        "message": payload.text,
        "messageType": payload.message_type,
        "metadata": metadata,
    })
}

fn split_correlation(metadata: Option<Value>) -> (Option<String>, Option<Value>) {
    let mut map = match metadata {
        Some(Value::Object(map)) => map,
        other => return (None, other),
    };
    let correlation_id = match map.remove(CORRELATION_KEY) {
        Some(Value::String(id)) => Some(id),
        _ => None,
    };
    let rest = if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    };
    (correlation_id, rest)
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

/// Post-session feedback from the learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    pub rating: u8,
    #[serde(default)]
    pub review: String,
    /// Set when the learner files a complaint instead of a review.
    #[serde(default)]
    pub complaint: Option<String>,
}

impl Rating {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(1..=5).contains(&self.rating) {
            return Err(EngineError::InvalidRating(self.rating));
        }
        Ok(())
    }

    fn body(&self, session_id: &str) -> Value {
        let (feedback_type, comment) = match &self.complaint {
            Some(complaint) => ("complaint", complaint.as_str()),
            None => ("review", self.review.as_str()),
        };
        json!({
            "session_id": session_id,
            "rating": self.rating,
            "feedback_type": feedback_type,
            "comment": comment,
        })
    }
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Persist an accepted proposal; returns the durable session id.
    async fn create_session(&self, session: &NewSession) -> Result<String, ApiError>;

    async fn post_message(&self, session_id: &str, payload: &ChatPayload) -> Result<(), ApiError>;

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<DurableMessage>, ApiError>;

    async fn submit_rating(&self, session_id: &str, rating: &Rating) -> Result<(), ApiError>;
}

/// `{ success, message, data }` wrapper used by every endpoint.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiEnvelope<T> {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    #[serde(deserialize_with = "id_from_number_or_string")]
    id: String,
}

/// [`SessionApi`] over HTTP with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: reqwest::Client,
    base: Url,
    endpoints: Endpoints,
    token: Option<String>,
}

impl HttpSessionApi {
    pub fn new(base: &str, endpoints: Endpoints, token: Option<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: Url::parse(base)?,
            endpoints,
            token,
        })
    }

    /// `None` when the profile has no API configured.
    pub fn from_profile(profile: &RoleProfile) -> Option<Result<Self, ApiError>> {
        let base = profile.api_base_url.as_deref()?;
        Some(Self::new(
            base,
            profile.endpoints.clone(),
            profile.auth_token.clone(),
        ))
    }

    fn url(&self, template: &str, session_id: Option<&str>) -> Result<Url, ApiError> {
        let path = match session_id {
            Some(id) => template.replace("{session}", id),
            None => template.to_string(),
        };
        Ok(self.base.join(&path)?)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Option<T>, ApiError> {
        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiEnvelope<Value>>(&text)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or(text);
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiEnvelope<T> =
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;
        if !envelope.success {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: envelope.message.unwrap_or_else(|| "request failed".into()),
            });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, session: &NewSession) -> Result<String, ApiError> {
        let url = self.url(&self.endpoints.create_session, None)?;
        debug!(%url, "creating durable session");
        let created: Option<CreatedSession> = self
            .send(self.request(reqwest::Method::POST, url).json(&session.body()))
            .await?;
        created
            .map(|c| c.id)
            .ok_or_else(|| ApiError::Decode("missing session id".into()))
    }

    async fn post_message(&self, session_id: &str, payload: &ChatPayload) -> Result<(), ApiError> {
        let url = self.url(&self.endpoints.messages, Some(session_id))?;
        let body = message_body(payload);
        self.send::<Value>(self.request(reqwest::Method::POST, url).json(&body))
            .await?;
        Ok(())
    }

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<DurableMessage>, ApiError> {
        let url = self.url(&self.endpoints.messages, Some(session_id))?;
        let messages: Option<Vec<DurableMessage>> =
            self.send(self.request(reqwest::Method::GET, url)).await?;
        Ok(messages.unwrap_or_default())
    }

    async fn submit_rating(&self, session_id: &str, rating: &Rating) -> Result<(), ApiError> {
        let url = self.url(&self.endpoints.feedback, None)?;
        self.send::<Value>(
            self.request(reqwest::Method::POST, url)
                .json(&rating.body(session_id)),
        )
        .await?;
        Ok(())
    }
}
