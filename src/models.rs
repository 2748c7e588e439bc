use serde::{Deserialize, Deserializer, Serialize};

/// Note fields the server accepts in a partial update.
pub const EDITABLE_FIELDS: [&str; 3] = ["title", "content", "note_date"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Note {
    pub id: i64,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    pub note_date: String,
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub note_date: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
}

// The content column is nullable server-side.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn is_editable_field(field: &str) -> bool {
    EDITABLE_FIELDS.contains(&field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_tolerates_null_content() {
        let note: Note = serde_json::from_str(
            r#"{"id":4,"title":"Dentist","content":null,"note_date":"2024-05-01T10:00:00.000000Z","user_id":1}"#,
        )
        .unwrap();
        assert_eq!(note.id, 4);
        assert_eq!(note.content, "");

        let missing: Note = serde_json::from_str(
            r#"{"id":5,"title":"Gym","note_date":"2024-05-02","user_id":1}"#,
        )
        .unwrap();
        assert_eq!(missing.content, "");
    }

    #[test]
    fn editable_fields() {
        assert!(is_editable_field("title"));
        assert!(is_editable_field("note_date"));
        assert!(!is_editable_field("user_id"));
    }
}
