//! Best-effort raw document dumps.
//!
//! When a dump directory is configured, every fetched document is written
//! out as JSON before indexing. Failures are logged and never fail a run;
//! this is a debugging side-channel, not a store of record.

use std::path::PathBuf;

use tracing::warn;

use crate::models::{Document, Source};

#[derive(Clone)]
pub struct RawStore {
    dir: PathBuf,
}

impl RawStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Write one batch; errors are swallowed after a warning.
    pub fn save_batch(&self, source: Source, documents: &[Document]) {
        for doc in documents {
            if let Err(e) = self.save_one(source, doc) {
                warn!(source = %source, doc = %doc.id, error = %e, "raw save failed");
            }
        }
    }

    fn save_one(&self, source: Source, doc: &Document) -> anyhow::Result<()> {
        let dir = self.dir.join(source.as_str());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", sanitize_file_name(&doc.id)));
        std::fs::write(path, serde_json::to_vec_pretty(doc)?)?;
        Ok(())
    }
}

fn sanitize_file_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    #[test]
    fn writes_documents_as_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = RawStore::new(tmp.path().to_path_buf());
        let doc = Document {
            id: "jira_ENG-1".to_string(),
            source: Source::Jira,
            content: "body".to_string(),
            metadata: Metadata::new(),
            pre_chunked: None,
        };
        store.save_batch(Source::Jira, &[doc]);
        assert!(tmp.path().join("jira/jira_ENG-1.json").exists());
    }

    #[test]
    fn odd_ids_become_safe_file_names() {
        assert_eq!(sanitize_file_name("a/b:c d"), "a_b_c_d");
    }
}
