//! LanceDB 벡터 인덱스 - 청크 임베딩 ANN 검색
//!
//! 노드 ID 기준으로 임베딩을 저장하고, 질의 임베딩과의 거리 기반
//! 상위 K개 (node_id, 유사도) 쌍을 반환합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::retrieval::{ScoredNode, VectorIndex};

/// 임베딩 테이블 이름
const TABLE_NAME: &str = "chunk_embeddings";

/// 임베딩 차원 (Gemini gemini-embedding-001 기본값과 일치)
pub const EMBEDDING_DIMENSION: i32 = 768;

// ============================================================================
// Types
// ============================================================================

/// 임베딩 엔트리 (저장용, 인제스천 경로에서 사용)
#[derive(Debug, Clone)]
pub struct EmbeddingEntry {
    /// 청크 노드 ID (chunks.id)
    pub node_id: String,
    /// 소유 문서 ID
    pub document_id: String,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

// ============================================================================
// LanceVectorIndex
// ============================================================================

/// LanceDB 벡터 인덱스 구현
///
/// Apache Arrow 기반 columnar 저장으로 대용량 임베딩에서도 빠른 ANN 검색을 지원합니다.
pub struct LanceVectorIndex {
    db: Connection,
}

impl LanceVectorIndex {
    /// 인덱스 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db })
    }

    /// 임베딩 테이블 스키마
    fn create_schema() -> Schema {
        Schema::new(vec![
            Field::new("node_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    EMBEDDING_DIMENSION,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(entries: &[EmbeddingEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        let node_ids: Vec<&str> = entries.iter().map(|e| e.node_id.as_str()).collect();
        let document_ids: Vec<&str> = entries.iter().map(|e| e.document_id.as_str()).collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            EMBEDDING_DIMENSION,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(Self::create_schema()),
            vec![
                Arc::new(StringArray::from(node_ids)),
                Arc::new(StringArray::from(document_ids)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")?;

        Ok(batch)
    }

    /// 테이블 존재 여부 확인
    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.contains(&TABLE_NAME.to_string()))
            .unwrap_or(false)
    }

    /// 임베딩 배치 삽입 (인제스천 경로 전용)
    pub async fn insert_batch(&self, entries: &[EmbeddingEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let batch = Self::entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if self.table_exists().await {
            let table = self
                .db
                .open_table(TABLE_NAME)
                .execute()
                .await
                .context("Failed to open embeddings table")?;
            table
                .add(batches)
                .execute()
                .await
                .context("Failed to add embeddings")?;
        } else {
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .context("Failed to create embeddings table")?;
        }

        Ok(entries.len())
    }

    /// 문서 단위 임베딩 삭제
    pub async fn delete_by_document_id(&self, document_id: &str) -> Result<()> {
        if !self.table_exists().await {
            return Ok(());
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open table for delete")?;

        // 작은따옴표 이스케이프 - SQL 인젝션 방지
        let filter = format!("document_id = '{}'", document_id.replace('\'', "''"));
        table
            .delete(&filter)
            .await
            .context("Failed to delete embeddings")?;

        Ok(())
    }

    /// 저장된 임베딩 개수
    pub async fn count(&self) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open table for count")?;

        table.count_rows(None).await.context("Failed to count rows")
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredNode>> {
        if !self.table_exists().await {
            return Ok(vec![]);
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open table for search")?;

        let results = table
            .vector_search(embedding.to_vec())
            .context("Failed to create vector search")?
            .limit(k)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = results.try_collect().await?;
        let mut scored = Vec::new();

        for batch in batches {
            let node_ids = batch
                .column_by_name("node_id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| anyhow::anyhow!("Missing node_id column"))?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                // L2 거리를 [0,1] 유사도로 변환
                let similarity = 1.0 / (1.0 + distances.value(i));
                scored.push(ScoredNode {
                    node_id: node_ids.value(i).to_string(),
                    score: similarity,
                });
            }
        }

        Ok(scored)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn create_test_entry(node_id: &str, document_id: &str, seed: f32) -> EmbeddingEntry {
        EmbeddingEntry {
            node_id: node_id.to_string(),
            document_id: document_id.to_string(),
            embedding: vec![seed; EMBEDDING_DIMENSION as usize],
        }
    }

    #[tokio::test]
    async fn test_insert_and_count() {
        let temp_dir = TempDir::new().unwrap();
        let index = LanceVectorIndex::open(&temp_dir.path().join("test.lance"))
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 0);

        let entries = vec![
            create_test_entry("n1", "doc1", 0.1),
            create_test_entry("n2", "doc1", 0.2),
        ];
        assert_eq!(index.insert_batch(&entries).await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_query_returns_scored_node_ids() {
        let temp_dir = TempDir::new().unwrap();
        let index = LanceVectorIndex::open(&temp_dir.path().join("search.lance"))
            .await
            .unwrap();

        let entries = vec![
            create_test_entry("n1", "doc1", 0.1),
            create_test_entry("n2", "doc2", 0.5),
            create_test_entry("n3", "doc3", 0.9),
        ];
        index.insert_batch(&entries).await.unwrap();

        let query = vec![0.1; EMBEDDING_DIMENSION as usize];
        let results = index.query(&query, 2).await.unwrap();

        assert!(!results.is_empty());
        assert!(results.len() <= 2);
        // 동일 벡터가 최상위, 유사도는 (0,1] 범위
        assert_eq!(results[0].node_id, "n1");
        for r in &results {
            assert!(r.score > 0.0 && r.score <= 1.0);
        }
    }

    #[tokio::test]
    async fn test_query_on_empty_index() {
        let temp_dir = TempDir::new().unwrap();
        let index = LanceVectorIndex::open(&temp_dir.path().join("empty.lance"))
            .await
            .unwrap();

        let query = vec![0.1; EMBEDDING_DIMENSION as usize];
        assert!(index.query(&query, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_document_id() {
        let temp_dir = TempDir::new().unwrap();
        let index = LanceVectorIndex::open(&temp_dir.path().join("delete.lance"))
            .await
            .unwrap();

        let entries = vec![
            create_test_entry("n1", "doc1", 0.1),
            create_test_entry("n2", "doc1", 0.2),
            create_test_entry("n3", "doc2", 0.3),
        ];
        index.insert_batch(&entries).await.unwrap();

        index.delete_by_document_id("doc1").await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }
}
