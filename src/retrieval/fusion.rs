//! 랭크 퓨전 엔진 - RRF (Reciprocal Rank Fusion) + 시간 감쇠
//!
//! 벡터 검색과 키워드 검색 결과를 순위 기반으로 통합합니다.
//! 두 채널의 스코어는 스케일이 달라 직접 비교할 수 없으므로
//! 순위만 사용하는 RRF로 병합하고, 문서 최신성에 따라 재가중합니다.
//!
//! RRF Score = sum(weight / (k + rank + 1)), k = 60
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::embedding::EmbeddingProvider;

use super::graph::GraphStore;
use super::index::{KeywordIndex, ScoredNode, VectorIndex};

// ============================================================================
// Constants
// ============================================================================

/// RRF 감쇠 파라미터 (하위 순위의 영향 억제)
pub const K_RRF: f32 = 60.0;

/// 벡터 유사도 관련성 임계값 (미만은 제외)
pub const VECTOR_THRESHOLD: f32 = 0.7;

/// 키워드 관련도 임계값 (미만은 제외)
pub const KEYWORD_THRESHOLD: f32 = 0.5;

/// 키워드 채널 가중치 - 한국어 회의록에서는 정확한 용어 일치의
/// 정밀도가 임베딩 유사도보다 높다는 도메인 사전 지식을 반영
pub const KEYWORD_WEIGHT: f32 = 1.5;

/// 키워드 스코어를 벡터 유사도와 같은 [0,1] 표시 범위로 재조정하는 계수
pub const KEYWORD_DISPLAY_SCALE: f32 = 0.2;

/// 시간 감쇠율 (1일당): weight = exp(-λ * age_days)
pub const DECAY_LAMBDA: f64 = 0.05;

// ============================================================================
// Types
// ============================================================================

/// 퓨전 결과 한 건 - 가중 스코어 내림차순으로 정렬되어 반환됨
#[derive(Debug, Clone)]
pub struct RankedNode {
    /// 청크 노드 ID
    pub node_id: String,
    /// RRF 누적 스코어 × 시간 감쇠 가중치
    pub weighted_score: f32,
    /// 표시용 스코어 (퓨전 전 원본 검색 스코어)
    pub display_score: f32,
}

/// 퓨전 중간 누적 레코드 - 삽입 순서가 동점 처리 순서를 결정
#[derive(Debug)]
struct FusedCandidate {
    node_id: String,
    fused_score: f32,
    display_score: Option<f32>,
}

// ============================================================================
// RankFusionEngine
// ============================================================================

/// 랭크 퓨전 엔진
///
/// 질문 → 임베딩 → (벡터 검색 ∥ 키워드 검색) → RRF 병합 → 시간 감쇠 → 상위 top_k.
pub struct RankFusionEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorIndex>,
    keyword: Arc<dyn KeywordIndex>,
    graph: Arc<dyn GraphStore>,
}

impl RankFusionEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorIndex>,
        keyword: Arc<dyn KeywordIndex>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            embedder,
            vector,
            keyword,
            graph,
        }
    }

    /// 하이브리드 검색 수행
    ///
    /// 두 채널에서 `2 * top_k`개씩 후보를 받아 RRF로 병합합니다.
    /// 양쪽 모두 임계값을 넘는 후보가 없으면 빈 목록을 반환하며,
    /// 호출자는 이를 폴백 신호로 취급해야 합니다 (에러 아님).
    pub async fn fuse(&self, question: &str, top_k: usize) -> Result<Vec<RankedNode>> {
        let embedding = self
            .embedder
            .embed_query(question)
            .await
            .context("Embedding provider failed for question")?;

        let fetch_k = top_k.saturating_mul(2);

        // 벡터/키워드 검색은 순서 의존성이 없으므로 동시 실행
        let (vector_results, keyword_results) = tokio::try_join!(
            self.vector.query(&embedding, fetch_k),
            self.keyword.query(question, fetch_k),
        )?;

        let candidates = accumulate_rrf(&vector_results, &keyword_results);

        if candidates.is_empty() {
            tracing::info!("Hybrid search found no candidates above thresholds");
            return Ok(vec![]);
        }

        let ranked = self.apply_decay_and_rank(candidates, top_k).await;

        tracing::info!(
            "Hybrid search: {} vector + {} keyword results fused into {} nodes",
            vector_results.len(),
            keyword_results.len(),
            ranked.len()
        );

        Ok(ranked)
    }

    /// 시간 감쇠 적용 후 가중 스코어 내림차순 상위 top_k 선택
    ///
    /// 감쇠 가중치는 소유 문서의 생성 시각에서 유도하며,
    /// 문서를 찾지 못한 노드는 패널티 없이 가중치 1.0을 받습니다.
    async fn apply_decay_and_rank(
        &self,
        candidates: Vec<FusedCandidate>,
        top_k: usize,
    ) -> Vec<RankedNode> {
        let now = Utc::now();
        // 같은 문서의 감쇠 가중치는 한 번만 계산
        let mut doc_weights: HashMap<String, f64> = HashMap::new();

        let mut ranked = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let weight = match self.resolve_decay_weight(&candidate.node_id, now, &mut doc_weights).await {
                Some(w) => w,
                None => {
                    tracing::debug!(
                        "No document timestamp for node {}, decay weight defaults to 1.0",
                        candidate.node_id
                    );
                    1.0
                }
            };

            let display_score = candidate.display_score.unwrap_or(0.0);
            ranked.push(RankedNode {
                node_id: candidate.node_id,
                weighted_score: candidate.fused_score * weight as f32,
                display_score,
            });
        }

        // 안정 정렬: 동점은 벡터 패스 삽입 순서, 그다음 키워드 패스 순서 유지
        ranked.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(top_k);
        ranked
    }

    /// 노드 → 청크 → 문서 타임스탬프 → 감쇠 가중치
    ///
    /// 어느 단계든 조회 실패는 소프트 처리 (None 반환).
    async fn resolve_decay_weight(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        doc_weights: &mut HashMap<String, f64>,
    ) -> Option<f64> {
        let chunk = match self.graph.get_chunk(node_id).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Chunk lookup failed for decay weighting ({}): {:#}", node_id, e);
                return None;
            }
        };

        let document_id = chunk.document_id?;

        if let Some(&weight) = doc_weights.get(&document_id) {
            return Some(weight);
        }

        let document = match self.graph.get_document(&document_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    "Document lookup failed for decay weighting ({}): {:#}",
                    document_id,
                    e
                );
                return None;
            }
        };

        let created_at = document.created_at?;
        let age_days = (now - created_at).num_seconds() as f64 / 86_400.0;
        let weight = decay_weight(age_days);
        doc_weights.insert(document_id, weight);
        Some(weight)
    }
}

// ============================================================================
// Pure Fusion Arithmetic
// ============================================================================

/// 한 순위의 RRF 기여분
fn rrf_contribution(weight: f32, rank: usize) -> f32 {
    weight / (K_RRF + rank as f32 + 1.0)
}

/// 시간 감쇠 가중치: exp(-λ * age_days), 항상 (0, 1]
///
/// 미래 타임스탬프(음수 나이)는 0으로 클램프 - 감쇠는 증폭하지 않음.
pub fn decay_weight(age_days: f64) -> f64 {
    (-DECAY_LAMBDA * age_days.max(0.0)).exp()
}

/// 벡터/키워드 패스를 순서대로 수행하고 노드별 RRF 스코어를 누적
///
/// 반환 목록의 순서는 벡터 패스 삽입 순서 → 키워드 패스 순서이며,
/// 이후 안정 정렬의 동점 처리 기준이 됩니다.
fn accumulate_rrf(
    vector_results: &[ScoredNode],
    keyword_results: &[ScoredNode],
) -> Vec<FusedCandidate> {
    let mut candidates: Vec<FusedCandidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    // 벡터 패스: 임계값 미달 제외, 원본 유사도를 표시 스코어로 기록
    for (rank, result) in vector_results.iter().enumerate() {
        if result.score < VECTOR_THRESHOLD {
            tracing::debug!(
                "Skipping vector result {} with score {:.3} < {}",
                result.node_id,
                result.score,
                VECTOR_THRESHOLD
            );
            continue;
        }

        let contribution = rrf_contribution(1.0, rank);
        match index.get(&result.node_id) {
            Some(&i) => candidates[i].fused_score += contribution,
            None => {
                index.insert(result.node_id.clone(), candidates.len());
                candidates.push(FusedCandidate {
                    node_id: result.node_id.clone(),
                    fused_score: contribution,
                    display_score: Some(result.score),
                });
            }
        }
    }

    // 키워드 패스: 1.5배 가중, 벡터 히트가 없는 노드만 표시 스코어 설정
    for (rank, result) in keyword_results.iter().enumerate() {
        if result.score < KEYWORD_THRESHOLD {
            continue;
        }

        let contribution = rrf_contribution(KEYWORD_WEIGHT, rank);
        match index.get(&result.node_id) {
            Some(&i) => candidates[i].fused_score += contribution,
            None => {
                index.insert(result.node_id.clone(), candidates.len());
                candidates.push(FusedCandidate {
                    node_id: result.node_id.clone(),
                    fused_score: contribution,
                    display_score: Some((result.score * KEYWORD_DISPLAY_SCALE).min(1.0)),
                });
            }
        }
    }

    candidates
}

// ============================================================================
// Tests
// ============================================================================
