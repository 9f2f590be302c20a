//! 서비스 조립 모듈
//!
//! 저장소, 임베딩, 검색 엔진, 답변 합성기를 묶어 프로세스 전역에서
//! 공유되는 핸들로 만듭니다. 초기화는 지연 수행되며 멱등합니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::chat::ChatCoordinator;
use crate::embedding::{EmbeddingProvider, GeminiEmbedding};
use crate::retrieval::{
    GraphStore, KeywordIndex, MetadataStore, RankFusionEngine, ResultMaterializer, VectorIndex,
};
use crate::store::{get_data_dir, GraphSqliteStore, LanceVectorIndex};
use crate::synthesis::{AnswerSynthesizer, GeminiSynthesizer};

/// 벡터 인덱스 디렉토리 이름 (데이터 디렉토리 하위)
const VECTOR_DIR: &str = "vectors.lance";

// ============================================================================
// Services
// ============================================================================

/// 프로세스 전역 공유 서비스 묶음
pub struct Services {
    pub store: Arc<GraphSqliteStore>,
    pub vector: Arc<LanceVectorIndex>,
    pub fusion: Arc<RankFusionEngine>,
    pub materializer: Arc<ResultMaterializer>,
    pub coordinator: Arc<ChatCoordinator>,
}

impl Services {
    async fn build() -> Result<Arc<Self>> {
        let data_dir = get_data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("데이터 디렉토리 생성 실패: {}", data_dir.display()))?;

        let store = Arc::new(GraphSqliteStore::open_default().context("그래프 저장소 열기 실패")?);
        let vector = Arc::new(
            LanceVectorIndex::open(&data_dir.join(VECTOR_DIR))
                .await
                .context("벡터 인덱스 열기 실패")?,
        );

        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(GeminiEmbedding::from_env().context("임베딩 프로바이더 초기화 실패")?);
        let synthesizer: Arc<dyn AnswerSynthesizer> =
            Arc::new(GeminiSynthesizer::from_env().context("답변 합성기 초기화 실패")?);

        let fusion = Arc::new(RankFusionEngine::new(
            embedder.clone(),
            vector.clone() as Arc<dyn VectorIndex>,
            store.clone() as Arc<dyn KeywordIndex>,
            store.clone() as Arc<dyn GraphStore>,
        ));
        let materializer = Arc::new(ResultMaterializer::new(
            store.clone() as Arc<dyn GraphStore>,
            store.clone() as Arc<dyn MetadataStore>,
        ));
        let coordinator = Arc::new(ChatCoordinator::new(
            fusion.clone(),
            materializer.clone(),
            embedder,
            vector.clone() as Arc<dyn VectorIndex>,
            synthesizer,
        ));

        Ok(Arc::new(Self {
            store,
            vector,
            fusion,
            materializer,
            coordinator,
        }))
    }
}

static SERVICES: Mutex<Option<Arc<Services>>> = Mutex::const_new(None);

/// 공유 서비스 핸들 반환
///
/// 최초 호출 시 저장소 연결과 외부 API 클라이언트를 초기화하며,
/// 이후 호출은 같은 핸들을 재사용합니다.
pub async fn services() -> Result<Arc<Services>> {
    let mut guard = SERVICES.lock().await;
    if let Some(existing) = guard.as_ref() {
        return Ok(existing.clone());
    }

    let built = Services::build().await?;
    *guard = Some(built.clone());

    tracing::info!("공유 서비스 초기화 완료");
    Ok(built)
}

/// 공유 서비스 해제
///
/// 이미 해제된 상태에서 호출해도 무해합니다.
pub async fn shutdown() {
    let mut guard = SERVICES.lock().await;
    if guard.take().is_some() {
        tracing::debug!("공유 서비스 해제됨");
    }
}
