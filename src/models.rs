use serde::{Deserialize, Serialize};

// ============================================================================
// Domain Events
// These represent state changes that have occurred in the game catalogue
// ============================================================================

/// Base trait for all domain events carried by the dispatch layer
pub trait DomainEvent {
    fn event_type(&self) -> &str;
    fn aggregate_id(&self) -> i64;

    /// Key identifying one logical occurrence of the event.
    /// Redeliveries of the same event share the key.
    fn idempotency_key(&self) -> String;
}

/// Published after a write added a star to a game.
///
/// Wire format: `{"id": 7, "title": "Zelda", "description": "...", "stars": 5}`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StarAdded {
    pub id: i64,
    pub title: String,
    pub description: String,
    #[serde(rename = "stars")]
    pub star_count: i64,
}

impl StarAdded {
    pub fn new(
        id: i64,
        title: impl Into<String>,
        description: impl Into<String>,
        star_count: i64,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            star_count,
        }
    }

    /// Serialize to the JSON payload handed to the transport
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a transport payload. Any error means the message is malformed.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

impl DomainEvent for StarAdded {
    fn event_type(&self) -> &str {
        "StarAdded"
    }

    fn aggregate_id(&self) -> i64 {
        self.id
    }

    fn idempotency_key(&self) -> String {
        // Star counts only grow, so (game, count) names exactly one write.
        format!("{}:{}", self.id, self.star_count)
    }
}
