use std::sync::Arc;

use crate::clock::Clock;
use crate::crypto::field::{decrypt_field, encrypt_field, FieldKey};
use crate::error::{Result, StoreError};
use crate::gateway::{Executor, GatewayError, PersistenceGateway, Row, RowLock, Transaction};
use crate::models::document::{
    DetectedEntity, DetectionMethod, Document, DocumentSummary, RedactionSchema,
};
use crate::observer::StoreOptions;
use crate::params;
use crate::validation::document::PageRequest;

const ENTITY: &str = "document";
const ENTITY_DETECTED: &str = "detected_entity";

const DOCUMENT_COLUMNS: &str =
    "id, user_id, display_name, uploaded_at, last_modified, redaction_schema";

/// Shown in place of a display name that cannot be decrypted when the store
/// runs with [`NameFailurePolicy::Substitute`].
pub const UNREADABLE_NAME: &str = "[unreadable]";

/// What a paginated listing does with a row whose name fails to decrypt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameFailurePolicy {
    /// Return the row with [`UNREADABLE_NAME`] as its name and log a warning.
    #[default]
    Substitute,
    /// Fail the whole page with `StoreError::Decryption`.
    FailPage,
}

/// Persists documents and their detected entities.
///
/// Display names are sealed with the store's [`FieldKey`] on the way in and
/// opened on the way out. Deleting a document removes its entities in the
/// same transaction.
pub struct DocumentStore<G> {
    gateway: Arc<G>,
    clock: Arc<dyn Clock>,
    key: FieldKey,
    name_policy: NameFailurePolicy,
    options: StoreOptions,
}

impl<G: PersistenceGateway> DocumentStore<G> {
    /// Creates a store that seals names under `key_material`.
    ///
    /// # Arguments
    ///
    /// * `gateway` - The persistence backend.
    /// * `clock` - The time source used by `update`.
    /// * `key_material` - At least 16 bytes of secret key material.
    ///
    /// # Returns
    ///
    /// A `Result` containing the store, or `Encryption` if the key is rejected.
    pub fn new(gateway: Arc<G>, clock: Arc<dyn Clock>, key_material: &[u8]) -> Result<Self> {
        Ok(Self::with_key(gateway, clock, FieldKey::new(key_material)?))
    }

    pub fn with_key(gateway: Arc<G>, clock: Arc<dyn Clock>, key: FieldKey) -> Self {
        Self {
            gateway,
            clock,
            key,
            name_policy: NameFailurePolicy::default(),
            options: StoreOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_name_failure_policy(mut self, policy: NameFailurePolicy) -> Self {
        self.name_policy = policy;
        self
    }

    async fn connect(&self, operation: &'static str) -> Result<G::Conn> {
        self.gateway
            .connect()
            .await
            .map_err(|e| StoreError::backend(operation, e))
    }

    async fn begin(&self, operation: &'static str) -> Result<G::Tx> {
        self.gateway
            .begin()
            .await
            .map_err(|e| StoreError::backend(operation, e))
    }

    fn open_name(&self, document_id: i64, sealed: &str) -> Result<String> {
        decrypt_field(sealed, &self.key).map_err(|source| StoreError::Decryption {
            entity: ENTITY,
            key: document_id.to_string(),
            source,
        })
    }

    /// Inserts a document with its name encrypted and writes the assigned id
    /// back onto `document`.
    pub async fn create(&self, document: &mut Document) -> Result<()> {
        const OP: &str = "document.create";

        let sealed = encrypt_field(&document.display_name, &self.key)?;
        let schema = schema_to_json(&document.redaction_schema)?;
        let doc = &*document;

        let id = self
            .options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let row = conn
                    .query_one(
                        "INSERT INTO documents \
                             (user_id, display_name, uploaded_at, last_modified, redaction_schema) \
                         VALUES ($1, $2, $3, $4, $5) RETURNING id",
                        params![doc.user_id, sealed, doc.uploaded_at, doc.last_modified, schema],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                row.get_i64("id").map_err(|e| StoreError::backend(OP, e))
            })
            .await?;

        document.id = id;
        tracing::debug!(document_id = id, user_id = document.user_id, "document created");
        Ok(())
    }

    /// Fetches one document with its name decrypted.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `Decryption` if the stored name cannot be opened
    /// with this store's key.
    pub async fn get_by_id(&self, id: i64) -> Result<Document> {
        const OP: &str = "document.get_by_id";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let row = conn
                    .query_opt(
                        &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"),
                        params![id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?
                    .ok_or_else(|| StoreError::not_found(ENTITY, id))?;

                let mut document = read_document(&row, OP)?;
                document.display_name = self.open_name(document.id, &document.display_name)?;
                Ok(document)
            })
            .await
    }

    /// Lists one page of the user's documents, newest upload first.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The owner of the documents.
    /// * `page` - The 1-indexed page number.
    /// * `page_size` - The number of records per page, at most 500.
    ///
    /// # Returns
    ///
    /// A `Result` containing the page and the user's total document count.
    /// The count comes from its own query and ignores the page window.
    pub async fn get_by_user_id(
        &self,
        user_id: i64,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Document>, i64)> {
        const OP: &str = "document.get_by_user_id";

        self.options
            .run(OP, async {
                let window = PageRequest::new(page, page_size)?;
                let mut conn = self.connect(OP).await?;

                let total = conn
                    .query_one(
                        "SELECT COUNT(*) AS total FROM documents WHERE user_id = $1",
                        params![user_id],
                    )
                    .await
                    .and_then(|row| row.get_i64("total"))
                    .map_err(|e| StoreError::backend(OP, e))?;

                let rows = conn
                    .query(
                        &format!(
                            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE user_id = $1 \
                             ORDER BY uploaded_at DESC, id DESC LIMIT $2 OFFSET $3"
                        ),
                        params![user_id, window.page_size, window.offset()],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                let mut documents = Vec::with_capacity(rows.len());
                for row in &rows {
                    let mut document = read_document(row, OP)?;
                    document.display_name = match self.open_name(document.id, &document.display_name) {
                        Ok(name) => name,
                        Err(err) if self.name_policy == NameFailurePolicy::Substitute => {
                            tracing::warn!(document_id = document.id, error = %err, "document name unreadable");
                            UNREADABLE_NAME.to_string()
                        }
                        Err(err) => return Err(err),
                    };
                    documents.push(document);
                }

                Ok((documents, total))
            })
            .await
    }

    /// Touches `last_modified`. Nothing else about the document changes.
    pub async fn update(&self, document: &mut Document) -> Result<()> {
        const OP: &str = "document.update";

        let now = self.clock.now();
        let id = document.id;

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let affected = conn
                    .execute(
                        "UPDATE documents SET last_modified = $1 WHERE id = $2",
                        params![now, id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if affected == 0 {
                    return Err(StoreError::not_found(ENTITY, id));
                }
                Ok(())
            })
            .await?;

        document.last_modified = now;
        Ok(())
    }

    /// Deletes a document and all of its detected entities atomically.
    ///
    /// The document row is locked first so no entity can be attached while
    /// the cascade runs. Entities go next, then the document row, in one
    /// transaction. If the document row does not exist the transaction is
    /// rolled back and `NotFound` is returned.
    pub async fn delete(&self, id: i64) -> Result<()> {
        const OP: &str = "document.delete";

        self.options
            .run(OP, async {
                // Any early return drops `tx`, which rolls it back.
                let mut tx = self.begin(OP).await?;

                let locked = tx
                    .query_opt(
                        &format!(
                            "SELECT id FROM documents WHERE id = $1{}",
                            self.gateway.lock_clause(RowLock::Update)
                        ),
                        params![id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;
                if locked.is_none() {
                    tx.rollback().await.map_err(|e| StoreError::backend(OP, e))?;
                    return Err(StoreError::not_found(ENTITY, id));
                }

                let entities = tx
                    .execute(
                        "DELETE FROM detected_entities WHERE document_id = $1",
                        params![id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                let documents = tx
                    .execute("DELETE FROM documents WHERE id = $1", params![id])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if documents == 0 {
                    tx.rollback().await.map_err(|e| StoreError::backend(OP, e))?;
                    return Err(StoreError::not_found(ENTITY, id));
                }

                tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
                tracing::debug!(document_id = id, entities, "document deleted");
                Ok(())
            })
            .await
    }

    /// Deletes every document of the user together with their entities.
    ///
    /// One transaction: collect and lock the user's document rows, delete each
    /// one's entities, then delete the documents in a single statement.
    /// Succeeds with `0` when the user has no documents.
    pub async fn delete_by_user_id(&self, user_id: i64) -> Result<u64> {
        const OP: &str = "document.delete_by_user_id";

        self.options
            .run(OP, async {
                let mut tx = self.begin(OP).await?;

                let ids = tx
                    .query(
                        &format!(
                            "SELECT id FROM documents WHERE user_id = $1{}",
                            self.gateway.lock_clause(RowLock::Update)
                        ),
                        params![user_id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?
                    .iter()
                    .map(|row| row.get_i64("id"))
                    .collect::<std::result::Result<Vec<_>, GatewayError>>()
                    .map_err(|e| StoreError::backend(OP, e))?;

                let mut entities = 0;
                for id in &ids {
                    entities += tx
                        .execute(
                            "DELETE FROM detected_entities WHERE document_id = $1",
                            params![*id],
                        )
                        .await
                        .map_err(|e| StoreError::backend(OP, e))?;
                }

                let documents = tx
                    .execute("DELETE FROM documents WHERE user_id = $1", params![user_id])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
                tracing::debug!(user_id, documents, entities, "user documents deleted");
                Ok(documents)
            })
            .await
    }

    /// Lists a document's entities in detection order, each with the name of
    /// the method that found it (if the method is known).
    pub async fn get_detected_entities(&self, document_id: i64) -> Result<Vec<DetectedEntity>> {
        const OP: &str = "document.get_detected_entities";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let rows = conn
                    .query(
                        "SELECT e.id AS id, e.document_id AS document_id, e.method_id AS method_id, \
                                m.name AS method_name, e.entity_name AS entity_name, \
                                e.redaction_schema AS redaction_schema, e.detected_at AS detected_at \
                         FROM detected_entities e \
                         LEFT JOIN detection_methods m ON m.id = e.method_id \
                         WHERE e.document_id = $1 \
                         ORDER BY e.detected_at, e.id",
                        params![document_id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                rows.iter().map(|row| read_detected_entity(row, OP)).collect()
            })
            .await
    }

    /// Attaches an entity to an existing document and writes the assigned id
    /// back onto `entity`.
    ///
    /// # Errors
    ///
    /// `NotFound` naming the document if it does not exist.
    pub async fn add_detected_entity(&self, entity: &mut DetectedEntity) -> Result<()> {
        const OP: &str = "document.add_detected_entity";

        let schema = schema_to_json(&entity.redaction_schema)?;
        let item = &*entity;

        let id = self
            .options
            .run(OP, async {
                let mut tx = self.begin(OP).await?;

                // Shared lock: a concurrent cascade delete waits for this insert
                // to commit, and this lookup waits for a pending delete.
                let present = tx
                    .query_opt(
                        &format!(
                            "SELECT id FROM documents WHERE id = $1{}",
                            self.gateway.lock_clause(RowLock::Share)
                        ),
                        params![item.document_id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;
                if present.is_none() {
                    return Err(StoreError::not_found(ENTITY, item.document_id));
                }

                let id = tx
                    .query_one(
                        "INSERT INTO detected_entities \
                             (document_id, method_id, entity_name, redaction_schema, detected_at) \
                         VALUES ($1, $2, $3, $4, $5) RETURNING id",
                        params![
                            item.document_id,
                            item.method_id,
                            &item.entity_name,
                            schema,
                            item.detected_at
                        ],
                    )
                    .await
                    .and_then(|row| row.get_i64("id"))
                    .map_err(|e| StoreError::backend(OP, e))?;

                tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
                Ok(id)
            })
            .await?;

        entity.id = id;
        Ok(())
    }

    pub async fn delete_detected_entity(&self, id: i64) -> Result<()> {
        const OP: &str = "document.delete_detected_entity";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let affected = conn
                    .execute("DELETE FROM detected_entities WHERE id = $1", params![id])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if affected == 0 {
                    return Err(StoreError::not_found(ENTITY_DETECTED, id));
                }
                Ok(())
            })
            .await
    }

    /// Registers a detection method in the lookup table.
    pub async fn add_detection_method(&self, method: &DetectionMethod) -> Result<()> {
        const OP: &str = "document.add_detection_method";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                conn.execute(
                    "INSERT INTO detection_methods (id, name) VALUES ($1, $2)",
                    params![method.id, &method.name],
                )
                .await
                .map_err(|e| {
                    StoreError::from_gateway(&*self.gateway, OP, "detection_method", e, |field| {
                        match field {
                            "name" => method.name.clone(),
                            _ => method.id.to_string(),
                        }
                    })
                })?;
                Ok(())
            })
            .await
    }

    /// Returns the document header with its decrypted name and entity count.
    ///
    /// # Errors
    ///
    /// `NotFound` when the document does not exist. A document without
    /// entities yields a count of zero.
    pub async fn get_document_summary(&self, document_id: i64) -> Result<DocumentSummary> {
        const OP: &str = "document.get_document_summary";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let row = conn
                    .query_opt(
                        "SELECT d.id AS id, d.display_name AS display_name, \
                                d.uploaded_at AS uploaded_at, d.last_modified AS last_modified, \
                                COUNT(e.id) AS entity_count \
                         FROM documents d \
                         LEFT JOIN detected_entities e ON e.document_id = d.id \
                         WHERE d.id = $1 \
                         GROUP BY d.id, d.display_name, d.uploaded_at, d.last_modified",
                        params![document_id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?
                    .ok_or_else(|| StoreError::not_found(ENTITY, document_id))?;

                let backend = |e: GatewayError| StoreError::backend(OP, e);
                let id = row.get_i64("id").map_err(backend)?;
                let sealed = row.get_string("display_name").map_err(backend)?;

                Ok(DocumentSummary {
                    id,
                    display_name: self.open_name(id, &sealed)?,
                    uploaded_at: row.get_timestamp("uploaded_at").map_err(backend)?,
                    last_modified: row.get_timestamp("last_modified").map_err(backend)?,
                    entity_count: row.get_i64("entity_count").map_err(backend)?,
                })
            })
            .await
    }
}

fn schema_to_json(schema: &RedactionSchema) -> Result<serde_json::Value> {
    schema.to_json().map_err(|source| StoreError::Serialization {
        entity: "redaction_schema",
        source,
    })
}

fn read_schema(row: &Row, operation: &'static str) -> Result<RedactionSchema> {
    let raw = row
        .get_json("redaction_schema")
        .map_err(|e| StoreError::backend(operation, e))?;
    RedactionSchema::from_json(raw).map_err(|source| StoreError::Serialization {
        entity: "redaction_schema",
        source,
    })
}

/// Reads a document row. `display_name` is still sealed.
fn read_document(row: &Row, operation: &'static str) -> Result<Document> {
    let backend = |e: GatewayError| StoreError::backend(operation, e);
    Ok(Document {
        id: row.get_i64("id").map_err(backend)?,
        user_id: row.get_i64("user_id").map_err(backend)?,
        display_name: row.get_string("display_name").map_err(backend)?,
        uploaded_at: row.get_timestamp("uploaded_at").map_err(backend)?,
        last_modified: row.get_timestamp("last_modified").map_err(backend)?,
        redaction_schema: read_schema(row, operation)?,
    })
}

fn read_detected_entity(row: &Row, operation: &'static str) -> Result<DetectedEntity> {
    let backend = |e: GatewayError| StoreError::backend(operation, e);
    Ok(DetectedEntity {
        id: row.get_i64("id").map_err(backend)?,
        document_id: row.get_i64("document_id").map_err(backend)?,
        method_id: row.get_i64("method_id").map_err(backend)?,
        method_name: row.get_opt_string("method_name").map_err(backend)?,
        entity_name: row.get_string("entity_name").map_err(backend)?,
        redaction_schema: read_schema(row, operation)?,
        detected_at: row.get_timestamp("detected_at").map_err(backend)?,
    })
}
