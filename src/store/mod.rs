//! Store 모듈 - 검색 트레이트의 구체 구현
//!
//! - sqlite: 문서/청크 그래프 + 프레젠테이션 메타데이터 + FTS5 키워드 인덱스
//! - lance: LanceDB 임베딩 벡터 인덱스 (ANN)
//!
//! 쓰기는 인제스천 경로(이 크레이트 범위 밖)만 수행하며,
//! 질의 경로는 전부 읽기 전용입니다.

mod lance;
mod sqlite;

// Re-exports
pub use lance::{EmbeddingEntry, LanceVectorIndex, EMBEDDING_DIMENSION};
pub use sqlite::{get_data_dir, GraphSqliteStore, GraphStats, NewChunk, NewDocument};
