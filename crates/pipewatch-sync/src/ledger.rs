//! Content-addressed evidence ledger.

use std::path::Path;

use chrono::{SubsecRound, Utc};
use pipewatch_core::{Evidence, EvidenceType};
use pipewatch_storage::BlobStore;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::db::{parse_text, parse_ts, parse_uuid, ts};
use crate::IngestError;

#[derive(Debug, Clone)]
pub struct EvidenceLedger {
    store: BlobStore,
}

impl EvidenceLedger {
    pub fn new(evidence_root: impl AsRef<Path>) -> Self {
        Self {
            store: BlobStore::new(evidence_root.as_ref()),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Record an artifact. Identical bytes for the same company and type return
    /// the existing row; otherwise the blob is written before the row exists.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        company_id: &str,
        evidence_type: EvidenceType,
        source_url: &str,
        raw_bytes: &[u8],
        run_id: i64,
    ) -> Result<Evidence, IngestError> {
        let content_hash = BlobStore::sha256_hex(raw_bytes);
        if let Some(existing) = find(conn, company_id, evidence_type, &content_hash).await? {
            return Ok(existing);
        }

        let stored = self
            .store
            .store_bytes(
                company_id,
                evidence_type.as_str(),
                evidence_type.extension_for(source_url),
                raw_bytes,
            )
            .await
            .map_err(|err| IngestError::EvidenceWrite(format!("{err:#}")))?;

        let evidence = Evidence {
            id: Evidence::id_for(company_id, evidence_type, &content_hash),
            company_id: company_id.to_string(),
            evidence_type,
            source_url: source_url.to_string(),
            content_hash,
            stored_path: stored.relative_path.to_string_lossy().replace('\\', "/"),
            byte_size: stored.byte_size as i64,
            // stored at microsecond precision
            fetched_at: Utc::now().trunc_subsecs(6),
        };

        sqlx::query(
            "INSERT INTO evidence \
             (id, company_id, evidence_type, source_url, content_hash, stored_path, byte_size, fetched_at, run_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (company_id, evidence_type, content_hash) DO NOTHING",
        )
        .bind(evidence.id.to_string())
        .bind(&evidence.company_id)
        .bind(evidence.evidence_type.as_str())
        .bind(&evidence.source_url)
        .bind(&evidence.content_hash)
        .bind(&evidence.stored_path)
        .bind(evidence.byte_size)
        .bind(ts(evidence.fetched_at))
        .bind(run_id)
        .execute(&mut *conn)
        .await?;

        debug!(
            evidence_id = %evidence.id,
            path = %evidence.stored_path,
            deduplicated_blob = stored.deduplicated,
            "evidence recorded"
        );
        Ok(evidence)
    }
}

async fn find(
    conn: &mut SqliteConnection,
    company_id: &str,
    evidence_type: EvidenceType,
    content_hash: &str,
) -> Result<Option<Evidence>, IngestError> {
    let row = sqlx::query(
        "SELECT id, company_id, evidence_type, source_url, content_hash, stored_path, byte_size, fetched_at \
         FROM evidence WHERE company_id = ? AND evidence_type = ? AND content_hash = ?",
    )
    .bind(company_id)
    .bind(evidence_type.as_str())
    .bind(content_hash)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|row| {
        Ok(Evidence {
            id: parse_uuid(&row.try_get::<String, _>("id")?)?,
            company_id: row.try_get("company_id")?,
            evidence_type: parse_text(&row.try_get::<String, _>("evidence_type")?)?,
            source_url: row.try_get("source_url")?,
            content_hash: row.try_get("content_hash")?,
            stored_path: row.try_get("stored_path")?,
            byte_size: row.try_get("byte_size")?,
            fetched_at: parse_ts(&row.try_get::<String, _>("fetched_at")?)?,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{begin_run, connect_in_memory, ensure_company, migrate, RunType};
    use pipewatch_core::Company;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identical_bytes_yield_the_same_evidence() {
        let dir = tempdir().expect("tempdir");
        let pool = connect_in_memory().await.expect("pool");
        migrate(&pool).await.expect("migrate");
        ensure_company(&pool, &Company { id: "jnj".into(), name: "J&J".into() })
            .await
            .expect("company");
        let run_id = begin_run(&pool, "jnj", RunType::Pipeline, Duration::from_secs(60))
            .await
            .expect("run");

        let ledger = EvidenceLedger::new(dir.path());
        let mut conn = pool.acquire().await.expect("conn");
        let url = "https://www.jnj.com/pipeline.pdf";

        let first = ledger
            .record(&mut conn, "jnj", EvidenceType::PipelinePdf, url, b"%PDF-1.7 table", run_id)
            .await
            .expect("first");
        let second = ledger
            .record(&mut conn, "jnj", EvidenceType::PipelinePdf, url, b"%PDF-1.7 table", run_id)
            .await
            .expect("second");
        let other = ledger
            .record(&mut conn, "jnj", EvidenceType::PipelinePdf, url, b"%PDF-1.7 table v2", run_id)
            .await
            .expect("other");

        assert_eq!(first, second);
        assert_ne!(first.id, other.id);
        assert!(first.stored_path.starts_with("jnj/pipeline_pdf/"));
        assert!(first.stored_path.ends_with(".pdf"));
        assert!(dir.path().join(&first.stored_path).exists());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evidence")
            .fetch_one(&mut *conn)
            .await
            .expect("count");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn failed_blob_write_inserts_no_row() {
        let dir = tempdir().expect("tempdir");
        // a regular file where the evidence root directory should be
        let blocked_root = dir.path().join("blocked");
        std::fs::write(&blocked_root, b"not a directory").expect("write");

        let pool = connect_in_memory().await.expect("pool");
        migrate(&pool).await.expect("migrate");
        ensure_company(&pool, &Company { id: "jnj".into(), name: "J&J".into() })
            .await
            .expect("company");
        let run_id = begin_run(&pool, "jnj", RunType::Pipeline, Duration::from_secs(60))
            .await
            .expect("run");

        let ledger = EvidenceLedger::new(&blocked_root);
        let mut conn = pool.acquire().await.expect("conn");
        let err = ledger
            .record(&mut conn, "jnj", EvidenceType::PipelineHtml, "https://x", b"<html/>", run_id)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EvidenceWrite(_)));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evidence")
            .fetch_one(&mut *conn)
            .await
            .expect("count");
        assert_eq!(count, 0);
    }
}
