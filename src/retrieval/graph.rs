//! 그래프 / 메타데이터 저장소 트레이트
//!
//! 청크 노드와 소유 문서의 조회 인터페이스입니다.
//! 랭크 퓨전(시간 감쇠용 타임스탬프)과 결과 구체화(본문/제목/링크)가 사용합니다.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

// ============================================================================
// Types
// ============================================================================

/// 청크 노드 레코드
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// 청크 노드 ID
    pub node_id: String,
    /// 청크 전체 텍스트
    pub text: String,
    /// 소유 문서 ID (인제스천 오류로 누락될 수 있음)
    pub document_id: Option<String>,
}

/// 문서 레코드 (프레젠테이션 메타데이터)
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub title: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Store Traits
// ============================================================================

/// 그래프 저장소
///
/// 청크 → 문서 관계를 따라가는 읽기 전용 인터페이스입니다.
/// 쓰기는 인제스천 경로(이 크레이트 범위 밖)만 수행합니다.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// 노드 ID로 청크 조회 (삭제된 노드는 None)
    async fn get_chunk(&self, node_id: &str) -> Result<Option<ChunkRecord>>;

    /// 문서 ID로 문서 메타데이터 조회
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>>;
}

/// 메타데이터 저장소 - 프레젠테이션 링크 배치 조회
///
/// 링크가 없는 문서는 결과 맵에서 빠집니다 (에러 아님).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 문서 ID 목록 → 문서 ID별 링크 매핑
    async fn get_links(&self, document_ids: &[String]) -> Result<HashMap<String, String>>;
}
