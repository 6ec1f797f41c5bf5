use super::table::{Row, Value};
use crate::vector::placeholder_vector;

pub const MESSAGES_TABLE: &str = "messages";
pub const CONVERSATIONS_TABLE: &str = "conversations";

/// Key of the typed seed row written and removed while a table is created.
pub const PLACEHOLDER_ID: &str = "__schema_placeholder__";

/// A table the store must always contain.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub key: &'static str,
    pub seed: fn(usize) -> Row,
}

pub fn required_tables() -> [TableSpec; 2] {
    [
        TableSpec {
            name: MESSAGES_TABLE,
            key: "id",
            seed: message_seed,
        },
        TableSpec {
            name: CONVERSATIONS_TABLE,
            key: "id",
            seed: conversation_seed,
        },
    ]
}

pub fn table_spec(name: &str) -> Option<TableSpec> {
    required_tables().into_iter().find(|spec| spec.name == name)
}

fn message_seed(dimensions: usize) -> Row {
    MessageRow {
        id: PLACEHOLDER_ID.to_string(),
        conversation_id: PLACEHOLDER_ID.to_string(),
        role: "user".to_string(),
        content: String::new(),
        search_text: String::new(),
        timestamp: 0,
        message_index: 0,
        vector: placeholder_vector(dimensions),
    }
    .to_row()
}

fn conversation_seed(_dimensions: usize) -> Row {
    Row::new()
        .with("id", Value::Text(PLACEHOLDER_ID.to_string()))
        .with("project", Value::Text(String::new()))
        .with("title", Value::Text(String::new()))
        .with("started_at", Value::Integer(0))
        .with("updated_at", Value::Integer(0))
        .with("message_count", Value::Integer(0))
}

/// Typed view of a `messages` row.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub search_text: String,
    pub timestamp: i64,
    pub message_index: i64,
    pub vector: Vec<f32>,
}

impl MessageRow {
    /// A freshly extracted message: `search_text` mirrors the content and the
    /// vector is the all-zero placeholder.
    #[cfg(test)]
    pub fn unembedded(
        id: &str,
        conversation_id: &str,
        message_index: i64,
        content: &str,
        dimensions: usize,
    ) -> Self {
        Self {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            role: "user".to_string(),
            content: content.to_string(),
            search_text: content.to_string(),
            timestamp: 0,
            message_index,
            vector: placeholder_vector(dimensions),
        }
    }

    pub fn to_row(&self) -> Row {
        Row::new()
            .with("id", Value::Text(self.id.clone()))
            .with("conversation_id", Value::Text(self.conversation_id.clone()))
            .with("role", Value::Text(self.role.clone()))
            .with("content", Value::Text(self.content.clone()))
            .with("search_text", Value::Text(self.search_text.clone()))
            .with("timestamp", Value::Integer(self.timestamp))
            .with("message_index", Value::Integer(self.message_index))
            .with("vector", Value::Vector(self.vector.clone()))
    }

    /// Missing text columns read as empty; a null vector reads as empty, which
    /// still marks the row as needing an embedding.
    pub fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.text("id")?.to_string(),
            conversation_id: row.text("conversation_id").unwrap_or_default().to_string(),
            role: row.text("role").unwrap_or_default().to_string(),
            content: row.text("content").unwrap_or_default().to_string(),
            search_text: row.text("search_text").unwrap_or_default().to_string(),
            timestamp: row.integer("timestamp").unwrap_or_default(),
            message_index: row.integer("message_index").unwrap_or_default(),
            vector: row.vector("vector").map(<[f32]>::to_vec).unwrap_or_default(),
        })
    }
}
