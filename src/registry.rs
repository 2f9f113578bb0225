use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::{
    doc_id::DocumentId,
    error::{Error, Result},
};

/// Document name -> serialized [`DocumentRecord`].
const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Metadata stored per document name.
///
/// Serialized as `"file_name\0page_count"`. The content id is deliberately
/// not stored: it is recomputed from the bytes on disk so the identifier
/// always reflects current content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub file_name: String,
    pub page_count: u32,
}

impl DocumentRecord {
    pub fn serialize(&self) -> Vec<u8> {
        format!("{}\0{}", self.file_name, self.page_count).into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(bytes).ok()?;
        let (file_name, page_count) = s.split_once('\0')?;
        Some(Self {
            file_name: file_name.to_string(),
            page_count: page_count.parse().ok()?,
        })
    }
}

/// A document as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub doc_id: DocumentId,
    pub name: String,
    pub page_count: u32,
}

/// Name-keyed bookkeeping over raw document storage.
///
/// Raw bytes live at `<documents-dir>/<name>/<file-name>`; a redb table
/// holds the file name and page count per document name. Read-only with
/// respect to patches: deletion flows translate names into the ids the
/// patch store needs.
pub struct DocumentRegistry {
    db: Database,
    documents_dir: PathBuf,
}

impl DocumentRegistry {
    pub fn open(db_path: &Path, documents_dir: &Path) -> Result<Self> {
        let db = Database::create(db_path).map_err(|e| {
            Error::StoreUnavailable(format!(
                "cannot open registry at {}: {e}",
                db_path.display()
            ))
        })?;

        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.commit()?;

        std::fs::create_dir_all(documents_dir)
            .map_err(|_| Error::DataDir(documents_dir.to_path_buf()))?;

        Ok(Self {
            db,
            documents_dir: documents_dir.to_path_buf(),
        })
    }

    /// Store a document's bytes under a unique name.
    ///
    /// Returns the content-derived id. Registering an existing name fails;
    /// replace flows delete first.
    pub fn register(
        &self,
        name: &str,
        file_name: &str,
        bytes: &[u8],
        page_count: u32,
    ) -> Result<DocumentId> {
        validate_name(name)?;
        validate_name(file_name)?;

        if self.record(name)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "document '{name}' already exists"
            )));
        }

        let dir = self.documents_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(file_name), bytes)?;

        let record = DocumentRecord {
            file_name: file_name.to_string(),
            page_count,
        };
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(name, record.serialize().as_slice())?;
        }
        txn.commit()?;

        debug!(name, page_count, "registered document");
        Ok(DocumentId::from_content(bytes))
    }

    /// Path of the stored original for a registered document.
    pub fn document_path(&self, name: &str) -> Result<PathBuf> {
        let record = self.record(name)?.ok_or_else(|| Error::NotFound {
            kind: "document",
            name: name.to_string(),
        })?;
        Ok(self.documents_dir.join(name).join(record.file_name))
    }

    /// Resolve one document by name, rehashing its stored bytes.
    pub fn get_by_name(&self, name: &str) -> Result<DocumentInfo> {
        let record = self.record(name)?.ok_or_else(|| Error::NotFound {
            kind: "document",
            name: name.to_string(),
        })?;
        self.info_from_record(name, &record)
    }

    /// Resolve one document by content id, rescanning the stored files.
    pub fn get_by_id(&self, doc_id: &str) -> Result<DocumentInfo> {
        for info in self.list()? {
            if info.doc_id.as_str() == doc_id {
                return Ok(info);
            }
        }
        Err(Error::NotFound {
            kind: "document",
            name: doc_id.to_string(),
        })
    }

    /// Resolve a caller-supplied reference: a name, or failing that an id.
    pub fn resolve(&self, reference: &str) -> Result<DocumentInfo> {
        match self.get_by_name(reference) {
            Ok(info) => Ok(info),
            Err(Error::NotFound { .. }) => self.get_by_id(reference),
            Err(e) => Err(e),
        }
    }

    /// All registered documents. Entries whose stored file has gone
    /// missing are logged and skipped rather than failing the listing.
    pub fn list(&self) -> Result<Vec<DocumentInfo>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;

        let mut documents = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let name = key.value().to_string();
            let Some(record) = DocumentRecord::deserialize(value.value())
            else {
                warn!(name, "skipping document with corrupt registry record");
                continue;
            };
            match self.info_from_record(&name, &record) {
                Ok(info) => documents.push(info),
                Err(e) => {
                    warn!(name, error = %e, "skipping unreadable document");
                }
            }
        }

        Ok(documents)
    }

    /// Remove a document's record and stored bytes, returning its last
    /// known info (the id the patch store delete needs).
    pub fn remove(&self, name: &str) -> Result<DocumentInfo> {
        let info = self.get_by_name(name)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(name)?;
        }
        txn.commit()?;

        let dir = self.documents_dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        debug!(name, doc = %info.doc_id, "removed document");
        Ok(info)
    }

    fn record(&self, name: &str) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table
            .get(name)?
            .and_then(|v| DocumentRecord::deserialize(v.value())))
    }

    fn info_from_record(
        &self,
        name: &str,
        record: &DocumentRecord,
    ) -> Result<DocumentInfo> {
        let path = self.documents_dir.join(name).join(&record.file_name);
        let bytes = std::fs::read(&path)?;
        Ok(DocumentInfo {
            doc_id: DocumentId::from_content(&bytes),
            name: name.to_string(),
            page_count: record.page_count,
        })
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("documents_dir", &self.documents_dir)
            .finish_non_exhaustive()
    }
}

/// Reject names that would escape the documents directory or hide files.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(
            "document name must not be empty".into(),
        ));
    }
    if name.len() > 255 {
        return Err(Error::InvalidArgument(
            "document name exceeds 255 characters".into(),
        ));
    }
    if name.contains('/') || name.contains('\\') || name == ".." {
        return Err(Error::InvalidArgument(format!(
            "document name '{name}' must not contain path separators"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidArgument(format!(
            "document name '{name}' must not start with a dot"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(Error::InvalidArgument(
            "document name must not contain control characters".into(),
        ));
    }
    Ok(())
}
