//! 검색 인덱스 트레이트 - 벡터 / 키워드 검색 인터페이스
//!
//! 랭크 퓨전 엔진이 소비하는 두 개의 검색 채널입니다.
//! 구현체는 store 모듈 참조 (LanceDB ANN / SQLite FTS5).

use anyhow::Result;
use async_trait::async_trait;

// ============================================================================
// Types
// ============================================================================

/// 스코어가 붙은 노드 식별자
///
/// 인덱스는 스코어 내림차순으로 정렬된 결과를 반환해야 합니다.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    /// 청크 노드 ID
    pub node_id: String,
    /// 인덱스 고유 스코어 (벡터: 유사도 0~1, 키워드: BM25 기반 양수)
    pub score: f32,
}

impl ScoredNode {
    pub fn new(node_id: impl Into<String>, score: f32) -> Self {
        Self {
            node_id: node_id.into(),
            score,
        }
    }
}

// ============================================================================
// Index Traits
// ============================================================================

/// 벡터 인덱스 (ANN)
///
/// 임베딩과 개수 K를 받아 상위 K개의 (node_id, 유사도) 쌍을 반환합니다.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 유사도 내림차순 상위 k개 검색
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredNode>>;
}

/// 키워드 인덱스 (전문 검색)
///
/// 쿼리 문자열과 개수 K를 받아 상위 K개의 (node_id, 관련도) 쌍을 반환합니다.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// 관련도 내림차순 상위 k개 검색
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredNode>>;
}
