//! Retrieval 모듈 - 하이브리드 검색 코어
//!
//! - index: 벡터/키워드 인덱스 트레이트
//! - graph: 그래프/메타데이터 저장소 트레이트
//! - fusion: RRF 랭크 퓨전 + 시간 감쇠
//! - materialize: 문서별 소스 그룹 구체화

mod fusion;
mod graph;
mod index;
mod materialize;

// Re-exports
pub use fusion::{
    decay_weight, RankFusionEngine, RankedNode, DECAY_LAMBDA, KEYWORD_DISPLAY_SCALE,
    KEYWORD_THRESHOLD, KEYWORD_WEIGHT, K_RRF, VECTOR_THRESHOLD,
};
pub use graph::{ChunkRecord, DocumentRecord, GraphStore, MetadataStore};
pub use index::{KeywordIndex, ScoredNode, VectorIndex};
pub use materialize::{
    ChunkMetadata, MaterializedSources, ResultMaterializer, SourceChunk, SourceGroup,
    MAX_RESOLVED_CHUNKS, MAX_SOURCE_GROUPS, PREVIEW_CHARS,
};
