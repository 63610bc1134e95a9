use serde::{Deserialize, Serialize};

use crate::firestore::model::DocumentKey;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Fully qualified resource name of a document in this database.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/documents/{}", self.database_name(), key.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_document_names() {
        let db = DatabaseId::default("project");
        let key = DocumentKey::from_string("cities/sf").unwrap();
        assert_eq!(db.database(), DEFAULT_DATABASE_ID);
        assert_eq!(
            db.document_name(&key),
            "projects/project/databases/(default)/documents/cities/sf"
        );
    }
}
