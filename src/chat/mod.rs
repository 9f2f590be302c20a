//! 채팅 스트리밍 코디네이터 - 질문 한 건의 상태 머신 실행
//!
//! ANALYZING → SEARCHING → SOURCES_FOUND(선택) → GENERATING → (TOKEN)* → DONE
//! 어느 상태에서든 복구 불가능한 실패는 ERROR로 종결됩니다 (역방향 전이 없음).
//!
//! 이벤트는 요청별 mpsc 채널로 전달되며, 수신자가 끊기면 (클라이언트 연결 종료)
//! 전송 실패를 감지해 더 이상의 작업 없이 즉시 종료합니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::embedding::EmbeddingProvider;
use crate::retrieval::{
    MaterializedSources, RankFusionEngine, RankedNode, ResultMaterializer, SourceChunk,
    SourceGroup, VectorIndex,
};
use crate::synthesis::{Answer, AnswerSynthesizer, ContextPassage};

// ============================================================================
// Constants
// ============================================================================

/// 하이브리드 검색 기본 top_k
pub const DEFAULT_TOP_K: usize = 10;

/// 폴백 (순수 벡터) 경로의 top_k
const FALLBACK_TOP_K: usize = 10;

/// 이벤트 채널 버퍼 크기
const CHANNEL_CAPACITY: usize = 32;

/// 합성기 중간 실패 시의 고정 폴백 토큰
const MIDSTREAM_ERROR_TOKEN: &str = "응답 생성 중 오류가 발생했습니다. 다시 시도해주세요.";

/// 토큰이 전혀 생성되지 않았을 때의 고정 메시지
const NO_CONTENT_TOKEN: &str = "죄송합니다. 관련된 정보를 찾을 수 없습니다.";

// 클라이언트에 노출하는 정제된 에러 메시지 (내부 예외 텍스트 비노출)
const ERROR_EMBEDDING: &str = "임베딩 생성 중 오류가 발생했습니다.";
const ERROR_DATABASE: &str = "데이터베이스 연결 오류가 발생했습니다.";
const ERROR_GENERIC: &str = "채팅 응답 생성 중 오류가 발생했습니다.";

// ============================================================================
// Protocol
// ============================================================================

/// 요청 수락 전 거부 사유 (스트림 내 error 프레임과 구분됨)
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("질문을 입력해주세요.")]
    EmptyQuestion,
}

/// 스트림 상태 표시
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Analyzing,
    Searching,
    SourcesFound,
    Generating,
}

/// 개행 구분 JSON 프레임 한 건
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status { status: StreamStatus },
    Sources { sources: Vec<SourceGroup> },
    Token { content: String },
    Done,
    Error { message: String },
}

impl StreamEvent {
    fn status(status: StreamStatus) -> Self {
        StreamEvent::Status { status }
    }

    fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            content: content.into(),
        }
    }
}

// ============================================================================
// ChatCoordinator
// ============================================================================

/// 스트리밍 코디네이터
///
/// 하이브리드 검색 → 구체화 → 답변 합성을 하나의 이벤트 시퀀스로 조율합니다.
/// 요청 간 공유 가변 상태는 없습니다.
pub struct ChatCoordinator {
    fusion: Arc<RankFusionEngine>,
    materializer: Arc<ResultMaterializer>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorIndex>,
    synthesizer: Arc<dyn AnswerSynthesizer>,
}

impl ChatCoordinator {
    pub fn new(
        fusion: Arc<RankFusionEngine>,
        materializer: Arc<ResultMaterializer>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorIndex>,
        synthesizer: Arc<dyn AnswerSynthesizer>,
    ) -> Self {
        Self {
            fusion,
            materializer,
            embedder,
            vector,
            synthesizer,
        }
    }

    /// 질문 한 건의 이벤트 스트림 시작
    ///
    /// 빈 질문은 어떤 이벤트도 방출하기 전에 거부됩니다.
    /// 반환된 수신자를 드롭하면 요청이 취소됩니다.
    pub fn stream(
        self: &Arc<Self>,
        question: &str,
        top_k: usize,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyQuestion);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let coordinator = Arc::clone(self);
        let question = trimmed.to_string();

        tokio::spawn(async move {
            coordinator.run(question, top_k, tx).await;
        });

        Ok(rx)
    }

    /// 상태 머신 본체
    async fn run(&self, question: String, top_k: usize, tx: mpsc::Sender<StreamEvent>) {
        if !emit(&tx, StreamEvent::status(StreamStatus::Analyzing)).await {
            return;
        }

        match self.execute(&question, top_k, &tx).await {
            Ok(true) => {
                let _ = emit(&tx, StreamEvent::Done).await;
            }
            // 클라이언트가 끊겼으면 더 이상 아무것도 방출하지 않음
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Chat stream failed for question {:?}: {:#}", question, e);
                let _ = emit(
                    &tx,
                    StreamEvent::Error {
                        message: sanitize_error(&e).to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// SEARCHING부터 토큰 방출까지. 반환값 false = 수신자 끊김.
    async fn execute(
        &self,
        question: &str,
        top_k: usize,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<bool> {
        if !emit(tx, StreamEvent::status(StreamStatus::Searching)).await {
            return Ok(false);
        }

        let ranked = self.fusion.fuse(question, top_k).await?;

        let (materialized, sources_found) = if ranked.is_empty() {
            tracing::info!("Hybrid retrieval empty, falling back to pure vector search");
            let materialized = self.vector_fallback(question).await?;
            let found = !materialized.groups.is_empty();
            (materialized, found)
        } else {
            (self.materializer.materialize(&ranked).await?, true)
        };

        if sources_found && !emit(tx, StreamEvent::status(StreamStatus::SourcesFound)).await {
            return Ok(false);
        }
        // 원본 프로토콜대로 sources 프레임은 비어 있어도 항상 전송
        if !emit(
            tx,
            StreamEvent::Sources {
                sources: materialized.groups.clone(),
            },
        )
        .await
        {
            return Ok(false);
        }

        if !emit(tx, StreamEvent::status(StreamStatus::Generating)).await {
            return Ok(false);
        }

        // 합성 컨텍스트는 표시용 그룹 컷(5개)과 무관하게 해석된 청크 전체 사용
        let passages = passages_from_chunks(&materialized.chunks);
        let answer = self
            .synthesizer
            .synthesize(question, &passages)
            .await
            .context("Answer synthesis setup failed")?;

        self.emit_tokens(answer, tx).await
    }

    /// 폴백 경로: RRF/감쇠 없이 벡터 인덱스 네이티브 결과만 사용
    async fn vector_fallback(&self, question: &str) -> Result<MaterializedSources> {
        let embedding = self
            .embedder
            .embed_query(question)
            .await
            .context("Embedding provider failed in fallback path")?;

        let results = self.vector.query(&embedding, FALLBACK_TOP_K).await?;

        let ranked: Vec<RankedNode> = results
            .into_iter()
            .map(|r| RankedNode {
                node_id: r.node_id,
                weighted_score: r.score,
                display_score: r.score,
            })
            .collect();

        self.materializer.materialize(&ranked).await
    }

    /// 토큰 루프 - 유일하게 호출자에 노출되는 중단 지점
    ///
    /// 합성기 중간 실패는 고정 폴백 토큰으로 복구해 done까지 진행합니다.
    /// 클라이언트의 이벤트 파서가 항상 깨끗한 종료를 보도록 하기 위함입니다.
    async fn emit_tokens(&self, answer: Answer, tx: &mpsc::Sender<StreamEvent>) -> Result<bool> {
        let mut has_content = false;

        match answer {
            Answer::Streamed(mut tokens) => {
                while let Some(item) = tokens.next().await {
                    match item {
                        Ok(token) => {
                            if token.is_empty() {
                                continue;
                            }
                            has_content = true;
                            if !emit(tx, StreamEvent::token(token)).await {
                                return Ok(false);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Recovering from mid-stream synthesis error: {:#}",
                                e
                            );
                            has_content = true;
                            if !emit(tx, StreamEvent::token(MIDSTREAM_ERROR_TOKEN)).await {
                                return Ok(false);
                            }
                            break;
                        }
                    }
                }
            }
            Answer::Complete(text) => {
                let content = if text.trim().is_empty() {
                    NO_CONTENT_TOKEN.to_string()
                } else {
                    text
                };
                has_content = true;
                if !emit(tx, StreamEvent::token(content)).await {
                    return Ok(false);
                }
            }
        }

        if !has_content && !emit(tx, StreamEvent::token(NO_CONTENT_TOKEN)).await {
            return Ok(false);
        }

        Ok(true)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 이벤트 전송. false = 수신자 드롭 (클라이언트 연결 종료)
async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    if tx.send(event).await.is_err() {
        tracing::debug!("Event receiver dropped, stopping chat stream");
        return false;
    }
    true
}

/// 해석된 청크에서 합성용 컨텍스트 추출 (랭크 순서 유지)
fn passages_from_chunks(chunks: &[SourceChunk]) -> Vec<ContextPassage> {
    chunks
        .iter()
        .map(|chunk| ContextPassage {
            title: chunk.metadata.title.clone(),
            text: chunk.text.clone(),
        })
        .collect()
}

/// 내부 에러를 클라이언트용 정제 메시지로 변환
///
/// 내부 예외 텍스트는 로그에만 남기고 절대 클라이언트로 내보내지 않습니다.
fn sanitize_error(e: &anyhow::Error) -> &'static str {
    let chain = format!("{:#}", e).to_lowercase();
    if chain.contains("embedding") || chain.contains("임베딩") {
        ERROR_EMBEDDING
    } else if chain.contains("sqlite") || chain.contains("lance") || chain.contains("database") {
        ERROR_DATABASE
    } else {
        ERROR_GENERIC
    }
}

// ============================================================================
// Tests
// ============================================================================
