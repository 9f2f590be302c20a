//! hoerok-rag - 한국어 회의록 하이브리드 RAG 엔진
//!
//! LanceDB 벡터 검색 + SQLite FTS5 키워드 검색을 RRF로 결합하고,
//! 시간 감쇠 가중치와 문서 단위 그룹화를 거쳐
//! 스트리밍 답변을 생성하는 RAG 백엔드입니다.

pub mod chat;
pub mod cli;
pub mod embedding;
pub mod retrieval;
pub mod service;
pub mod store;
pub mod synthesis;

// Re-exports
pub use chat::{ChatCoordinator, ChatError, StreamEvent, StreamStatus, DEFAULT_TOP_K};
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use retrieval::{
    ChunkRecord, DocumentRecord, GraphStore, KeywordIndex, MaterializedSources, MetadataStore,
    RankFusionEngine, RankedNode, ResultMaterializer, ScoredNode, SourceChunk, SourceGroup,
    VectorIndex,
};
pub use service::{services, shutdown, Services};
pub use store::{
    get_data_dir, EmbeddingEntry, GraphSqliteStore, GraphStats, LanceVectorIndex, NewChunk,
    NewDocument,
};
pub use synthesis::{Answer, AnswerSynthesizer, ContextPassage, GeminiSynthesizer, TokenStream};
