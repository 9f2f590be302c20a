//! SQLite 그래프/메타데이터 저장소 + FTS5 키워드 인덱스
//!
//! 문서/청크 관계와 프레젠테이션 메타데이터(제목, 생성 시각, 링크)를 저장하고,
//! 청크 본문 위에 FTS5 가상 테이블로 키워드 검색을 제공합니다.
//! 저장 위치: ~/.hoerok-rag/graph.db
//!
//! 쓰기 API(upsert_document, insert_chunks)는 인제스천 경로 전용이며,
//! 검색 경로는 읽기만 수행합니다.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use uuid::Uuid;

use crate::retrieval::{
    ChunkRecord, DocumentRecord, GraphStore, KeywordIndex, MetadataStore, ScoredNode,
};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.hoerok-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hoerok-rag")
}

// ============================================================================
// Types
// ============================================================================

/// 새 문서 입력 (인제스천 경로에서 사용)
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub theme: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
}

/// 새 청크 입력
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub node_id: String,
    pub document_id: String,
    pub chunk_index: i32,
    pub text: String,
}

impl NewChunk {
    /// 노드 ID를 새로 발급하며 생성
    pub fn new(document_id: impl Into<String>, chunk_index: i32, text: impl Into<String>) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            chunk_index,
            text: text.into(),
        }
    }
}

/// 저장소 통계
#[derive(Debug, Clone)]
pub struct GraphStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// GraphSqliteStore
// ============================================================================

/// SQLite 기반 그래프 저장소
///
/// 프로세스 전역에서 공유되는 커넥션 핸들입니다 (읽기 위주, 동시 사용 안전).
pub struct GraphSqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl GraphSqliteStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 기본 위치에서 열기 (~/.hoerok-rag/graph.db)
    pub fn open_default() -> Result<Self> {
        let data_dir = get_data_dir();
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        }
        Self::open(&data_dir.join("graph.db"))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL,
                theme TEXT,
                summary TEXT,
                link TEXT
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
            "#,
        )
        .context("Failed to create graph tables")?;

        // FTS5 가상 테이블 (청크 본문 키워드 검색)
        // source: https://www.sqlite.org/fts5.html
        conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                content=chunks,
                content_rowid=rowid
            )",
            [],
        )
        .context("Failed to create FTS5 table")?;

        // FTS5 동기화 트리거
        conn.execute_batch(
            r#"
            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text)
                VALUES('delete', old.rowid, old.text);
            END;
            "#,
        )
        .context("Failed to create FTS5 triggers")?;

        tracing::debug!("Graph store initialized at {:?}", self.db_path);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 문서 저장 (같은 ID면 메타데이터 갱신)
    pub fn upsert_document(&self, doc: &NewDocument) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO documents (id, title, created_at, theme, summary, link)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 created_at = excluded.created_at,
                 theme = excluded.theme,
                 summary = excluded.summary,
                 link = excluded.link",
            params![
                doc.id,
                doc.title,
                doc.created_at.to_rfc3339(),
                doc.theme,
                doc.summary,
                doc.link
            ],
        )
        .context("Failed to upsert document")?;

        tracing::info!("Upserted document {}", doc.id);
        Ok(())
    }

    /// 청크 배치 삽입
    pub fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to start transaction")?;

        for chunk in chunks {
            tx.execute(
                "INSERT OR REPLACE INTO chunks (id, document_id, chunk_index, text)
                 VALUES (?1, ?2, ?3, ?4)",
                params![chunk.node_id, chunk.document_id, chunk.chunk_index, chunk.text],
            )
            .context("Failed to insert chunk")?;
        }

        tx.commit().context("Failed to commit chunks")?;
        Ok(chunks.len())
    }

    /// 문서와 소속 청크 삭제
    pub fn delete_document(&self, document_id: &str) -> Result<bool> {
        let conn = self.lock()?;

        conn.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?;
        let rows = conn.execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;

        Ok(rows > 0)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<GraphStats> {
        let conn = self.lock()?;

        let document_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .unwrap_or(0);
        let chunk_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .unwrap_or(0);

        Ok(GraphStats {
            document_count: document_count as usize,
            chunk_count: chunk_count as usize,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Retrieval Trait Implementations
// ============================================================================

#[async_trait]
impl GraphStore for GraphSqliteStore {
    async fn get_chunk(&self, node_id: &str) -> Result<Option<ChunkRecord>> {
        let conn = self.lock()?;

        let mut stmt =
            conn.prepare("SELECT id, document_id, text FROM chunks WHERE id = ?1")?;

        let chunk = stmt
            .query_row(params![node_id], |row| {
                Ok(ChunkRecord {
                    node_id: row.get(0)?,
                    document_id: row.get(1)?,
                    text: row.get(2)?,
                })
            })
            .ok();

        Ok(chunk)
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.lock()?;

        let mut stmt =
            conn.prepare("SELECT id, title, created_at FROM documents WHERE id = ?1")?;

        let doc = stmt
            .query_row(params![document_id], |row| {
                Ok(DocumentRecord {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: parse_datetime(row.get::<_, String>(2)?),
                })
            })
            .ok();

        Ok(doc)
    }
}

#[async_trait]
impl MetadataStore for GraphSqliteStore {
    async fn get_links(&self, document_ids: &[String]) -> Result<HashMap<String, String>> {
        if document_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.lock()?;

        let placeholders = vec!["?"; document_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, link FROM documents WHERE link IS NOT NULL AND id IN ({})",
            placeholders
        );

        let mut stmt = conn.prepare(&sql)?;
        let links = stmt
            .query_map(rusqlite::params_from_iter(document_ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(links)
    }
}

#[async_trait]
impl KeywordIndex for GraphSqliteStore {
    /// FTS5 키워드 검색
    ///
    /// BM25 스코어를 부호 반전해 양수 관련도로 반환합니다
    /// (FTS5의 bm25()는 좋을수록 더 작은 음수).
    /// source: https://www.sqlite.org/fts5.html#the_bm25_function
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredNode>> {
        let escaped = escape_fts5_query(text);
        if escaped.is_empty() {
            return Ok(vec![]);
        }

        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT c.id, bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks c ON c.rowid = chunks_fts.rowid
            WHERE chunks_fts MATCH ?1
            ORDER BY bm25(chunks_fts)
            LIMIT ?2
            "#,
        )?;

        let results = stmt
            .query_map(params![escaped, k as i64], |row| {
                Ok(ScoredNode {
                    node_id: row.get(0)?,
                    score: -(row.get::<_, f64>(1)?) as f32,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(results)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// RFC3339 문자열을 DateTime<Utc>로 파싱 (실패는 None - 소프트 처리)
fn parse_datetime(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// FTS5 쿼리 이스케이프
///
/// 특수 문자를 제거하고 단어만 추출합니다.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn escape_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn create_test_store() -> (TempDir, GraphSqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = GraphSqliteStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn seed_document(store: &GraphSqliteStore, id: &str, title: &str, link: Option<&str>) {
        store
            .upsert_document(&NewDocument {
                id: id.to_string(),
                title: Some(title.to_string()),
                created_at: Utc::now(),
                theme: Some("개발".to_string()),
                summary: None,
                link: link.map(|l| l.to_string()),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_chunk_and_document_roundtrip() {
        let (_dir, store) = create_test_store();
        seed_document(&store, "doc1", "3월 주간회의", None);

        let chunk = NewChunk::new("doc1", 0, "프로젝트 일정 논의 내용");
        let node_id = chunk.node_id.clone();
        store.insert_chunks(&[chunk]).unwrap();

        let loaded = store.get_chunk(&node_id).await.unwrap().unwrap();
        assert_eq!(loaded.text, "프로젝트 일정 논의 내용");
        assert_eq!(loaded.document_id.as_deref(), Some("doc1"));

        let doc = store.get_document("doc1").await.unwrap().unwrap();
        assert_eq!(doc.title.as_deref(), Some("3월 주간회의"));
        assert!(doc.created_at.is_some());

        assert!(store.get_chunk("missing").await.unwrap().is_none());
        assert!(store.get_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keyword_query_matches_chunk_text() {
        let (_dir, store) = create_test_store();
        seed_document(&store, "doc1", "주간회의", None);

        let c1 = NewChunk::new("doc1", 0, "배포 일정 은 4월 초 로 확정");
        let c2 = NewChunk::new("doc1", 1, "QA 진행 상황 공유");
        let target = c1.node_id.clone();
        store.insert_chunks(&[c1, c2]).unwrap();

        let results = KeywordIndex::query(&store, "배포 일정", 10).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node_id, target);
        // 부호 반전된 BM25는 양수 관련도
        assert!(results[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_keyword_query_empty_after_escape() {
        let (_dir, store) = create_test_store();
        let results = KeywordIndex::query(&store, "!!! ???", 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_get_links_batch() {
        let (_dir, store) = create_test_store();
        seed_document(&store, "doc1", "회의 1", Some("https://notion.so/doc1"));
        seed_document(&store, "doc2", "회의 2", None);

        let links = store
            .get_links(&["doc1".to_string(), "doc2".to_string(), "ghost".to_string()])
            .await
            .unwrap();

        assert_eq!(links.len(), 1);
        assert_eq!(links.get("doc1").map(|s| s.as_str()), Some("https://notion.so/doc1"));
    }

    #[tokio::test]
    async fn test_delete_document_cascades_chunks() {
        let (_dir, store) = create_test_store();
        seed_document(&store, "doc1", "삭제 대상", None);

        let chunk = NewChunk::new("doc1", 0, "삭제될 청크");
        let node_id = chunk.node_id.clone();
        store.insert_chunks(&[chunk]).unwrap();

        assert!(store.delete_document("doc1").unwrap());
        assert!(store.get_chunk(&node_id).await.unwrap().is_none());
        assert!(!store.delete_document("doc1").unwrap());
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = create_test_store();
        seed_document(&store, "doc1", "회의", None);
        store
            .insert_chunks(&[NewChunk::new("doc1", 0, "내용 1"), NewChunk::new("doc1", 1, "내용 2")])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.chunk_count, 2);
    }

    #[test]
    fn test_escape_fts5_query() {
        assert_eq!(escape_fts5_query("배포 일정"), "배포 일정");
        assert_eq!(escape_fts5_query("  "), "");
        assert_eq!(escape_fts5_query("hello:world"), "helloworld");
        assert_eq!(escape_fts5_query("test-query_123"), "test-query_123");
    }
}
