//! Ready-made sources for common cases.
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::item::Item;
use crate::{Error, Source};

/// Source producing one item per file in a local directory.
///
/// Hidden files are skipped, and an optional postfix restricts the listing
/// (e.g. `".json"`). Each item's id is the file name and its payload carries
/// the absolute path under the `"path"` key; reading the content is left to
/// the stages, which may hold open handles in their own workers.
///
/// ```no_run
/// use flowline::helpers::LocalFilesSource;
///
/// let source = LocalFilesSource::new("/var/data/docs").with_postfix(".json");
/// ```
pub struct LocalFilesSource {
    dir_path: PathBuf,
    postfix: String,
    files: Option<std::vec::IntoIter<PathBuf>>,
}

impl LocalFilesSource {
    /// Source over the files of `dir_path`.
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        LocalFilesSource {
            dir_path: dir_path.into(),
            postfix: String::new(),
            files: None,
        }
    }

    /// Only produce files whose name ends with `postfix`.
    pub fn with_postfix(mut self, postfix: impl Into<String>) -> Self {
        self.postfix = postfix.into();
        self
    }

    async fn list_files(&self) -> Result<Vec<PathBuf>, Error> {
        let mut entries = tokio::fs::read_dir(&self.dir_path)
            .await
            .map_err(|e| Error::SourceError(format!("unable to list directory: {e}")))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::SourceError(format!("unable to read directory entry: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(&self.postfix) {
                continue;
            }
            if entry
                .file_type()
                .await
                .map_err(|e| Error::SourceError(format!("unable to stat {name}: {e}")))?
                .is_file()
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Source for LocalFilesSource {
    async fn pop(&mut self) -> Result<Option<Item>, Error> {
        if self.files.is_none() {
            self.files = Some(self.list_files().await?.into_iter());
        }
        let next = self.files.as_mut().and_then(Iterator::next);
        Ok(next.map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut item = Item::with_id(name);
            let _ = item
                .payload
                .insert("path".into(), Value::from(path.to_string_lossy().as_ref()));
            item
        }))
    }
}
