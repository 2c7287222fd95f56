mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use common::{document, epoch, hours, TestContext, NAME_KEY};
use redactor_store::gateway::sqlite::{SqliteConnection, SqliteTransaction};
use redactor_store::{
    DetectedEntity, DetectionMethod, DocumentStore, ErrorClass, Executor, GatewayError,
    NameFailurePolicy, PersistenceGateway, RedactionAction, RedactionRule, RedactionSchema, Row,
    SqlValue, SqliteGateway, StoreError, StoreOptions, TextSpan, Transaction, UNREADABLE_NAME,
};
use serde_json::json;

/// SQLite gateway whose transactions never finish committing, so an
/// operation timeout always lands while the transaction is still open.
struct StalledCommitGateway(SqliteGateway);

struct StalledCommit(SqliteTransaction);

#[async_trait]
impl Executor for StalledCommit {
    async fn execute(&mut self, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError> {
        self.0.execute(stmt, args).await
    }

    async fn query(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError> {
        self.0.query(stmt, args).await
    }

    async fn query_opt(
        &mut self,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Option<Row>, GatewayError> {
        self.0.query_opt(stmt, args).await
    }
}

#[async_trait]
impl Transaction for StalledCommit {
    async fn commit(self) -> Result<(), GatewayError> {
        let _open = self;
        std::future::pending().await
    }

    async fn rollback(self) -> Result<(), GatewayError> {
        self.0.rollback().await
    }
}

#[async_trait]
impl PersistenceGateway for StalledCommitGateway {
    type Conn = SqliteConnection;
    type Tx = StalledCommit;

    async fn connect(&self) -> Result<SqliteConnection, GatewayError> {
        self.0.connect().await
    }

    async fn begin(&self) -> Result<StalledCommit, GatewayError> {
        Ok(StalledCommit(self.0.begin().await?))
    }

    fn classify(&self, err: &GatewayError) -> ErrorClass {
        self.0.classify(err)
    }
}

fn entity(document_id: i64, method_id: i64, name: &str, offset: i64) -> DetectedEntity {
    DetectedEntity {
        id: 0,
        document_id,
        method_id,
        method_name: None,
        entity_name: name.to_string(),
        redaction_schema: RedactionSchema {
            rules: vec![RedactionRule {
                label: name.to_string(),
                action: RedactionAction::Replace {
                    with: "[REDACTED]".to_string(),
                },
                spans: vec![TextSpan { page: 1, start: 0, end: 5 }],
            }],
            ..Default::default()
        },
        detected_at: epoch() + TimeDelta::seconds(offset),
    }
}

async fn count(ctx: &TestContext, table: &str) -> i64 {
    let stmt = format!("SELECT COUNT(*) FROM {table}");
    sqlx::query_scalar::<_, i64>(&stmt)
        .fetch_one(ctx.gateway.pool())
        .await
        .unwrap()
}

async fn break_document_deletes(gateway: &SqliteGateway) {
    sqlx::raw_sql(
        "CREATE TRIGGER fail_document_delete BEFORE DELETE ON documents \
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
    )
    .execute(gateway.pool())
    .await
    .unwrap();
}

#[tokio::test]
async fn names_are_encrypted_at_rest() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();

    let mut doc = document(1, "Payroll March.xlsx", epoch());
    store.create(&mut doc).await.unwrap();
    assert!(doc.id > 0);

    let stored: String = sqlx::query_scalar("SELECT display_name FROM documents WHERE id = $1")
        .bind(doc.id)
        .fetch_one(ctx.gateway.pool())
        .await
        .unwrap();
    assert_ne!(stored, "Payroll March.xlsx");

    assert_eq!(store.get_by_id(doc.id).await.unwrap(), doc);
}

#[tokio::test]
async fn missing_documents_are_not_found() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();

    assert!(store.get_by_id(404).await.unwrap_err().is_not_found());
    assert!(store.delete(404).await.unwrap_err().is_not_found());
    assert!(store.get_document_summary(404).await.unwrap_err().is_not_found());
    assert!(store
        .update(&mut document(1, "x", epoch()))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn wrong_key_is_a_decryption_error() {
    let ctx = TestContext::new().await;
    let mut doc = document(1, "secret.pdf", epoch());
    ctx.documents().create(&mut doc).await.unwrap();

    let other = DocumentStore::new(ctx.gateway.clone(), ctx.clock.clone(), &[0x17; 32]).unwrap();
    assert!(matches!(
        other.get_by_id(doc.id).await,
        Err(StoreError::Decryption { entity: "document", .. })
    ));
    assert!(matches!(
        other.get_document_summary(doc.id).await,
        Err(StoreError::Decryption { .. })
    ));
}

#[tokio::test]
async fn short_keys_are_rejected_at_construction() {
    let ctx = TestContext::new().await;
    assert!(matches!(
        DocumentStore::new(ctx.gateway.clone(), ctx.clock.clone(), b"short"),
        Err(StoreError::Encryption(_))
    ));
}

#[tokio::test]
async fn pagination_counts_independently_of_the_window() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    for i in 0..15 {
        let mut doc = document(2, &format!("doc-{i:02}"), epoch() + TimeDelta::minutes(i));
        store.create(&mut doc).await.unwrap();
    }
    store
        .create(&mut document(3, "someone else", epoch()))
        .await
        .unwrap();

    let (first, total) = store.get_by_user_id(2, 1, 10).await.unwrap();
    assert_eq!((first.len(), total), (10, 15));
    assert_eq!(first[0].display_name, "doc-14");

    let (second, total) = store.get_by_user_id(2, 2, 10).await.unwrap();
    assert_eq!((second.len(), total), (5, 15));
    assert_eq!(second[4].display_name, "doc-00");

    let (beyond, total) = store.get_by_user_id(2, 3, 10).await.unwrap();
    assert_eq!((beyond.len(), total), (0, 15));

    assert!(matches!(
        store.get_by_user_id(2, 0, 10).await,
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(
        store.get_by_user_id(2, i64::MAX, 500).await,
        Err(StoreError::Validation(_))
    ));
}

#[tokio::test]
async fn unreadable_names_follow_the_policy() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut good = document(4, "fine.txt", epoch());
    let mut bad = document(4, "broken.txt", epoch() + hours(1));
    store.create(&mut good).await.unwrap();
    store.create(&mut bad).await.unwrap();

    sqlx::query("UPDATE documents SET display_name = 'not-a-ciphertext' WHERE id = $1")
        .bind(bad.id)
        .execute(ctx.gateway.pool())
        .await
        .unwrap();

    let (page, total) = store.get_by_user_id(4, 1, 10).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(page[0].display_name, UNREADABLE_NAME);
    assert_eq!(page[1].display_name, "fine.txt");

    let strict = ctx
        .documents()
        .with_name_failure_policy(NameFailurePolicy::FailPage);
    assert!(matches!(
        strict.get_by_user_id(4, 1, 10).await,
        Err(StoreError::Decryption { .. })
    ));
}

#[tokio::test]
async fn update_touches_only_last_modified() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut doc = document(1, "draft.docx", epoch());
    store.create(&mut doc).await.unwrap();

    ctx.clock.advance(hours(2));
    let mut edited = doc.clone();
    edited.display_name = "ignored.docx".to_string();
    store.update(&mut edited).await.unwrap();
    assert_eq!(edited.last_modified, epoch() + hours(2));

    let stored = store.get_by_id(doc.id).await.unwrap();
    assert_eq!(stored.display_name, "draft.docx");
    assert_eq!(stored.uploaded_at, epoch());
    assert_eq!(stored.last_modified, epoch() + hours(2));
}

#[tokio::test]
async fn redaction_schemas_round_trip() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();

    let schema = RedactionSchema::from_json(json!({
        "rules": [{"label": "iban", "action": {"type": "mask", "character": "#"}}],
        "engine": {"version": "2.1", "thresholds": [0.5, 0.9]}
    }))
    .unwrap();
    let mut doc = document(1, "bank.pdf", epoch());
    doc.redaction_schema = schema.clone();
    store.create(&mut doc).await.unwrap();
    assert_eq!(store.get_by_id(doc.id).await.unwrap().redaction_schema, schema);

    let mut found = entity(doc.id, 1, "DE89 3704", 0);
    found.redaction_schema = schema.clone();
    store.add_detected_entity(&mut found).await.unwrap();
    let entities = store.get_detected_entities(doc.id).await.unwrap();
    assert_eq!(entities, vec![found]);
}

#[tokio::test]
async fn entities_resolve_their_method_name() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    store
        .add_detection_method(&DetectionMethod { id: 1, name: "regex".to_string() })
        .await
        .unwrap();
    let err = store
        .add_detection_method(&DetectionMethod { id: 2, name: "regex".to_string() })
        .await
        .unwrap_err();
    assert_eq!(err.duplicate_field(), Some("name"));

    let mut doc = document(1, "a.txt", epoch());
    store.create(&mut doc).await.unwrap();
    let mut known = entity(doc.id, 1, "alice@example.com", 0);
    let mut unknown = entity(doc.id, 77, "Bob", 1);
    store.add_detected_entity(&mut known).await.unwrap();
    store.add_detected_entity(&mut unknown).await.unwrap();

    let names: Vec<_> = store
        .get_detected_entities(doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.method_name)
        .collect();
    assert_eq!(names, [Some("regex".to_string()), None]);
}

#[tokio::test]
async fn entities_require_an_existing_document() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let err = store
        .add_detected_entity(&mut entity(999, 1, "x", 0))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(count(&ctx, "detected_entities").await, 0);
}

#[tokio::test]
async fn single_entities_can_be_removed() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut doc = document(1, "a.txt", epoch());
    store.create(&mut doc).await.unwrap();
    let mut e = entity(doc.id, 1, "x", 0);
    store.add_detected_entity(&mut e).await.unwrap();

    store.delete_detected_entity(e.id).await.unwrap();
    assert!(store.delete_detected_entity(e.id).await.unwrap_err().is_not_found());
    assert!(store.get_detected_entities(doc.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn summary_counts_entities() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut doc = document(1, "summary.pdf", epoch());
    store.create(&mut doc).await.unwrap();

    let empty = store.get_document_summary(doc.id).await.unwrap();
    assert_eq!(empty.entity_count, 0);
    assert_eq!(empty.display_name, "summary.pdf");

    for i in 0..3 {
        store
            .add_detected_entity(&mut entity(doc.id, 1, "e", i))
            .await
            .unwrap();
    }
    assert_eq!(store.get_document_summary(doc.id).await.unwrap().entity_count, 3);
}

#[tokio::test]
async fn delete_cascades_to_entities() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut doc = document(1, "cascade.pdf", epoch());
    let mut keep = document(1, "keep.pdf", epoch());
    store.create(&mut doc).await.unwrap();
    store.create(&mut keep).await.unwrap();
    for i in 0..4 {
        store
            .add_detected_entity(&mut entity(doc.id, 1, "e", i))
            .await
            .unwrap();
    }
    store
        .add_detected_entity(&mut entity(keep.id, 1, "e", 0))
        .await
        .unwrap();

    store.delete(doc.id).await.unwrap();

    assert!(store.get_by_id(doc.id).await.unwrap_err().is_not_found());
    assert!(store.get_detected_entities(doc.id).await.unwrap().is_empty());
    assert_eq!(store.get_detected_entities(keep.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_delete_leaves_document_and_entities_untouched() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut doc = document(1, "atomic.pdf", epoch());
    store.create(&mut doc).await.unwrap();
    for i in 0..5 {
        store
            .add_detected_entity(&mut entity(doc.id, 1, "e", i))
            .await
            .unwrap();
    }

    break_document_deletes(&ctx.gateway).await;

    assert!(matches!(
        store.delete(doc.id).await,
        Err(StoreError::Backend { operation: "document.delete", .. })
    ));
    assert_eq!(count(&ctx, "documents").await, 1);
    assert_eq!(count(&ctx, "detected_entities").await, 5);

    assert!(store.delete_by_user_id(1).await.is_err());
    assert_eq!(count(&ctx, "documents").await, 1);
    assert_eq!(count(&ctx, "detected_entities").await, 5);
}

#[tokio::test]
async fn delete_by_user_id_is_atomic_and_idempotent() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    for i in 0..3 {
        let mut doc = document(6, &format!("d{i}"), epoch());
        store.create(&mut doc).await.unwrap();
        store
            .add_detected_entity(&mut entity(doc.id, 1, "e", i))
            .await
            .unwrap();
    }
    let mut other = document(7, "other", epoch());
    store.create(&mut other).await.unwrap();
    store
        .add_detected_entity(&mut entity(other.id, 1, "e", 0))
        .await
        .unwrap();

    assert_eq!(store.delete_by_user_id(6).await.unwrap(), 3);
    assert_eq!(store.delete_by_user_id(6).await.unwrap(), 0);

    assert_eq!(count(&ctx, "documents").await, 1);
    assert_eq!(count(&ctx, "detected_entities").await, 1);
}

#[tokio::test]
async fn timed_out_delete_rolls_back_its_transaction() {
    let ctx = TestContext::new().await;
    let store = ctx.documents();
    let mut doc = document(1, "timeout.pdf", epoch());
    store.create(&mut doc).await.unwrap();
    for i in 0..3 {
        store
            .add_detected_entity(&mut entity(doc.id, 1, "e", i))
            .await
            .unwrap();
    }

    let stalled = Arc::new(StalledCommitGateway((*ctx.gateway).clone()));
    let stalled_store = DocumentStore::new(stalled, ctx.clock.clone(), &NAME_KEY)
        .unwrap()
        .with_options(StoreOptions::default().with_timeout(Duration::from_millis(50)));

    assert!(matches!(
        stalled_store.delete(doc.id).await,
        Err(StoreError::Timeout { operation: "document.delete" })
    ));
    assert!(matches!(
        stalled_store.delete_by_user_id(1).await,
        Err(StoreError::Timeout { operation: "document.delete_by_user_id" })
    ));

    assert_eq!(count(&ctx, "documents").await, 1);
    assert_eq!(count(&ctx, "detected_entities").await, 3);
    assert_eq!(store.get_detected_entities(doc.id).await.unwrap().len(), 3);

    // The connection is usable again once the abandoned transaction is gone.
    store.delete(doc.id).await.unwrap();
    assert_eq!(count(&ctx, "detected_entities").await, 0);
}
