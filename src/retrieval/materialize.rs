//! 결과 구체화 - 랭킹된 노드 ID를 문서별 소스 그룹으로 변환
//!
//! 상위 노드를 그래프 저장소에서 해석해 본문/제목/타임스탬프를 붙이고,
//! 소유 문서 기준으로 그룹화한 뒤 프레젠테이션 링크를 배치 조회합니다.
//! 링크 보강은 best-effort: 실패해도 그룹은 link 없이 반환됩니다.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use super::fusion::RankedNode;
use super::graph::{GraphStore, MetadataStore};

// ============================================================================
// Constants
// ============================================================================

/// 미리보기 최대 길이 (문자 단위 - 한글 안전)
pub const PREVIEW_CHARS: usize = 200;

/// 쿼리당 해석하는 최대 청크 수 (그룹화 전)
pub const MAX_RESOLVED_CHUNKS: usize = 10;

/// 최종 반환 소스 그룹 최대 수
pub const MAX_SOURCE_GROUPS: usize = 5;

/// 소유 문서를 알 수 없는 청크의 합성 그룹 키
const UNKNOWN_DOCUMENT: &str = "unknown";

// ============================================================================
// Types
// ============================================================================

/// 해석된 청크 한 건 (소스 그룹 내부)
#[derive(Debug, Clone, Serialize)]
pub struct SourceChunk {
    /// 청크 전체 텍스트 (후속 답변 합성용)
    pub text: String,
    /// 200자 미리보기
    pub preview: String,
    /// 표시용 스코어 (퓨전 전 원본 검색 스코어)
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// 청크 메타데이터 (원본 와이어 포맷 유지)
#[derive(Debug, Clone, Serialize)]
pub struct ChunkMetadata {
    pub document_id: Option<String>,
    pub title: Option<String>,
    pub created_at: Option<String>,
    /// 퓨전 가중 스코어 (표시용 score와 별개로 보존)
    pub rrf_score: f32,
}

/// 문서 단위 소스 그룹
///
/// 빈 그룹은 절대 생성되지 않습니다 (청크가 있어야 그룹이 생김).
#[derive(Debug, Clone, Serialize)]
pub struct SourceGroup {
    #[serde(rename = "documentId")]
    pub document_id: String,
    pub title: String,
    pub link: Option<String>,
    pub chunks: Vec<SourceChunk>,
}

impl SourceGroup {
    /// 그룹 내 최고 청크 스코어 (그룹 랭킹 기준)
    fn max_score(&self) -> f32 {
        self.chunks
            .iter()
            .map(|c| c.score)
            .fold(f32::MIN, f32::max)
    }
}

/// 구체화 결과
///
/// 그룹 목록은 표시용이라 5개로 잘리지만, 해석된 청크 전체는
/// 답변 합성 컨텍스트로 쓰이므로 잘리지 않고 랭크 순서로 보존됩니다.
pub struct MaterializedSources {
    /// 문서별 소스 그룹 (최대 5개, sources 프레임용)
    pub groups: Vec<SourceGroup>,
    /// 해석된 전체 청크 (랭크 순서, 합성 컨텍스트용)
    pub chunks: Vec<SourceChunk>,
}

// ============================================================================
// ResultMaterializer
// ============================================================================

/// 결과 구체화기
pub struct ResultMaterializer {
    graph: Arc<dyn GraphStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl ResultMaterializer {
    pub fn new(graph: Arc<dyn GraphStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { graph, metadata }
    }

    /// 랭킹된 노드 목록 → 해석된 청크 + 문서별 소스 그룹 (최대 5개)
    ///
    /// 랭킹과 해석 사이에 삭제된 노드는 조용히 건너뜁니다.
    /// 외부 저장소와는 최종적 일관성만 보장되기 때문입니다.
    pub async fn materialize(&self, ranked: &[RankedNode]) -> Result<MaterializedSources> {
        // 그룹 삽입 순서 = 랭크 순서 유지
        let mut resolved: Vec<SourceChunk> = Vec::new();
        let mut groups: Vec<SourceGroup> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for node in ranked.iter().take(MAX_RESOLVED_CHUNKS) {
            let chunk = match self.graph.get_chunk(&node.node_id).await? {
                Some(chunk) => chunk,
                None => {
                    tracing::debug!("Node {} vanished before materialization, skipping", node.node_id);
                    continue;
                }
            };

            let document = match &chunk.document_id {
                Some(doc_id) => self.graph.get_document(doc_id).await.unwrap_or_else(|e| {
                    tracing::warn!("Document lookup failed for {}: {:#}", doc_id, e);
                    None
                }),
                None => None,
            };

            let document_id = chunk
                .document_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_DOCUMENT.to_string());
            let title = document
                .as_ref()
                .and_then(|d| d.title.clone())
                .unwrap_or_else(|| format!("문서 {}...", prefix_chars(&document_id, 8)));

            let source_chunk = SourceChunk {
                preview: make_preview(&chunk.text),
                metadata: ChunkMetadata {
                    document_id: chunk.document_id.clone(),
                    title: document.as_ref().and_then(|d| d.title.clone()),
                    created_at: document
                        .as_ref()
                        .and_then(|d| d.created_at)
                        .map(|t| t.to_rfc3339()),
                    rrf_score: node.weighted_score,
                },
                score: node.display_score,
                text: chunk.text,
            };

            match group_index.get(&document_id) {
                Some(&i) => groups[i].chunks.push(source_chunk.clone()),
                None => {
                    group_index.insert(document_id.clone(), groups.len());
                    groups.push(SourceGroup {
                        document_id,
                        title,
                        link: None,
                        chunks: vec![source_chunk.clone()],
                    });
                }
            }

            resolved.push(source_chunk);
        }

        // 그룹 내 청크는 스코어 내림차순
        for group in &mut groups {
            group
                .chunks
                .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }

        // 그룹은 최고 청크 스코어 기준 내림차순, 상위 5개
        groups.sort_by(|a, b| {
            b.max_score()
                .partial_cmp(&a.max_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        groups.truncate(MAX_SOURCE_GROUPS);

        self.attach_links(&mut groups).await;

        Ok(MaterializedSources {
            groups,
            chunks: resolved,
        })
    }

    /// 프레젠테이션 링크 배치 조회 (best-effort)
    async fn attach_links(&self, groups: &mut [SourceGroup]) {
        let document_ids: Vec<String> = groups
            .iter()
            .map(|g| g.document_id.clone())
            .filter(|id| id != UNKNOWN_DOCUMENT)
            .collect();

        if document_ids.is_empty() {
            return;
        }

        match self.metadata.get_links(&document_ids).await {
            Ok(links) => {
                for group in groups.iter_mut() {
                    group.link = links.get(&group.document_id).cloned();
                }
            }
            Err(e) => {
                tracing::warn!("Link enrichment failed, returning sources without links: {:#}", e);
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 200자 미리보기 생성 (초과 시 말줄임표)
fn make_preview(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

/// 문자 단위 접두사 (UTF-8 경계 안전)
fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::retrieval::graph::{ChunkRecord, DocumentRecord};

    use super::*;

    struct FakeGraph {
        chunks: HashMap<String, ChunkRecord>,
        documents: HashMap<String, DocumentRecord>,
    }

    #[async_trait]
    impl GraphStore for FakeGraph {
        async fn get_chunk(&self, node_id: &str) -> Result<Option<ChunkRecord>> {
            Ok(self.chunks.get(node_id).cloned())
        }

        async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
            Ok(self.documents.get(document_id).cloned())
        }
    }

    struct FakeMetadata {
        links: HashMap<String, String>,
        fail: bool,
    }

    #[async_trait]
    impl MetadataStore for FakeMetadata {
        async fn get_links(&self, document_ids: &[String]) -> Result<HashMap<String, String>> {
            if self.fail {
                anyhow::bail!("metadata store unreachable");
            }
            Ok(document_ids
                .iter()
                .filter_map(|id| self.links.get(id).map(|l| (id.clone(), l.clone())))
                .collect())
        }
    }

    fn chunk(node_id: &str, doc_id: Option<&str>, text: &str) -> (String, ChunkRecord) {
        (
            node_id.to_string(),
            ChunkRecord {
                node_id: node_id.to_string(),
                text: text.to_string(),
                document_id: doc_id.map(|d| d.to_string()),
            },
        )
    }

    fn document(id: &str, title: &str) -> (String, DocumentRecord) {
        (
            id.to_string(),
            DocumentRecord {
                id: id.to_string(),
                title: Some(title.to_string()),
                created_at: Some(Utc::now()),
            },
        )
    }

    fn ranked(node_id: &str, score: f32) -> RankedNode {
        RankedNode {
            node_id: node_id.to_string(),
            weighted_score: score,
            display_score: score,
        }
    }

    fn materializer(graph: FakeGraph, metadata: FakeMetadata) -> ResultMaterializer {
        ResultMaterializer::new(Arc::new(graph), Arc::new(metadata))
    }

    #[tokio::test]
    async fn test_same_document_chunks_merge_into_one_group() {
        let graph = FakeGraph {
            chunks: [
                chunk("n1", Some("docA"), "첫 번째 청크"),
                chunk("n2", Some("docA"), "두 번째 청크"),
            ]
            .into(),
            documents: [document("docA", "주간 회의")].into(),
        };
        let m = materializer(graph, FakeMetadata { links: HashMap::new(), fail: false });

        // 낮은 스코어가 먼저 와도 그룹 내에서는 스코어 내림차순
        let groups = m
            .materialize(&[ranked("n2", 0.4), ranked("n1", 0.9)])
            .await
            .unwrap()
            .groups;

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].document_id, "docA");
        assert_eq!(groups[0].title, "주간 회의");
        assert_eq!(groups[0].chunks.len(), 2);
        assert!(groups[0].chunks[0].score > groups[0].chunks[1].score);
    }

    #[tokio::test]
    async fn test_group_cap_at_five() {
        let mut chunks = HashMap::new();
        let mut documents = HashMap::new();
        let mut input = Vec::new();
        for i in 0..8 {
            let node_id = format!("n{}", i);
            let doc_id = format!("doc{}", i);
            chunks.insert(
                node_id.clone(),
                ChunkRecord {
                    node_id: node_id.clone(),
                    text: format!("청크 {}", i),
                    document_id: Some(doc_id.clone()),
                },
            );
            documents.insert(
                doc_id.clone(),
                DocumentRecord {
                    id: doc_id,
                    title: Some(format!("회의 {}", i)),
                    created_at: Some(Utc::now()),
                },
            );
            input.push(ranked(&node_id, 0.9 - i as f32 * 0.05));
        }
        let m = materializer(
            FakeGraph { chunks, documents },
            FakeMetadata { links: HashMap::new(), fail: false },
        );

        let groups = m.materialize(&input).await.unwrap().groups;

        assert_eq!(groups.len(), MAX_SOURCE_GROUPS);
        for group in &groups {
            assert!(!group.chunks.is_empty());
        }
        for pair in groups.windows(2) {
            assert!(pair[0].chunks[0].score >= pair[1].chunks[0].score);
        }
    }

    /// 노드마다 고유 문서를 가진 그래프와 랭킹 입력 생성
    fn seed_distinct_documents(count: usize) -> (FakeGraph, Vec<RankedNode>) {
        let mut chunks = HashMap::new();
        let mut documents = HashMap::new();
        let mut input = Vec::new();
        for i in 0..count {
            let node_id = format!("n{}", i);
            let doc_id = format!("doc{}", i);
            chunks.insert(
                node_id.clone(),
                ChunkRecord {
                    node_id: node_id.clone(),
                    text: format!("청크 {}", i),
                    document_id: Some(doc_id.clone()),
                },
            );
            documents.insert(
                doc_id.clone(),
                DocumentRecord {
                    id: doc_id,
                    title: Some(format!("회의 {}", i)),
                    created_at: Some(Utc::now()),
                },
            );
            input.push(ranked(&node_id, 0.95 - i as f32 * 0.01));
        }
        (FakeGraph { chunks, documents }, input)
    }

    #[tokio::test]
    async fn test_resolution_cap_at_ten_chunks() {
        let (graph, input) = seed_distinct_documents(12);
        let m = materializer(graph, FakeMetadata { links: HashMap::new(), fail: false });

        let materialized = m.materialize(&input).await.unwrap();

        // 그룹화 전 해석은 상위 10개까지만, 랭크 순서 유지
        assert_eq!(materialized.chunks.len(), MAX_RESOLVED_CHUNKS);
        for (i, chunk) in materialized.chunks.iter().enumerate() {
            assert_eq!(chunk.text, format!("청크 {}", i));
        }
        let group_chunk_total: usize =
            materialized.groups.iter().map(|g| g.chunks.len()).sum();
        assert!(group_chunk_total <= MAX_RESOLVED_CHUNKS);
    }

    #[tokio::test]
    async fn test_resolved_chunks_survive_group_cap() {
        // 해석된 청크가 5개 초과 문서에 걸쳐도 합성 컨텍스트는 잘리지 않음
        let (graph, input) = seed_distinct_documents(7);
        let m = materializer(graph, FakeMetadata { links: HashMap::new(), fail: false });

        let materialized = m.materialize(&input).await.unwrap();

        assert_eq!(materialized.groups.len(), MAX_SOURCE_GROUPS);
        assert_eq!(materialized.chunks.len(), 7);
    }

    #[tokio::test]
    async fn test_missing_node_skipped_silently() {
        let graph = FakeGraph {
            chunks: [chunk("alive", Some("docA"), "남은 청크")].into(),
            documents: [document("docA", "회의록")].into(),
        };
        let m = materializer(graph, FakeMetadata { links: HashMap::new(), fail: false });

        let groups = m
            .materialize(&[ranked("deleted", 0.95), ranked("alive", 0.8)])
            .await
            .unwrap()
            .groups;

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_document_group() {
        let graph = FakeGraph {
            chunks: [chunk("n1", None, "소속 없는 청크")].into(),
            documents: HashMap::new(),
        };
        let m = materializer(graph, FakeMetadata { links: HashMap::new(), fail: false });

        let groups = m.materialize(&[ranked("n1", 0.8)]).await.unwrap().groups;

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].document_id, "unknown");
        assert!(groups[0].link.is_none());
    }

    #[tokio::test]
    async fn test_link_enrichment_attached() {
        let graph = FakeGraph {
            chunks: [chunk("n1", Some("docA"), "본문")].into(),
            documents: [document("docA", "회의록")].into(),
        };
        let m = materializer(
            graph,
            FakeMetadata {
                links: [("docA".to_string(), "https://notion.so/docA".to_string())].into(),
                fail: false,
            },
        );

        let groups = m.materialize(&[ranked("n1", 0.8)]).await.unwrap().groups;
        assert_eq!(groups[0].link.as_deref(), Some("https://notion.so/docA"));
    }

    #[tokio::test]
    async fn test_link_enrichment_failure_degrades_to_none() {
        let graph = FakeGraph {
            chunks: [chunk("n1", Some("docA"), "본문")].into(),
            documents: [document("docA", "회의록")].into(),
        };
        let m = materializer(graph, FakeMetadata { links: HashMap::new(), fail: true });

        let groups = m.materialize(&[ranked("n1", 0.8)]).await.unwrap().groups;
        assert_eq!(groups.len(), 1);
        assert!(groups[0].link.is_none());
    }

    #[test]
    fn test_preview_truncates_korean_text_safely() {
        let text = "회".repeat(250);
        let preview = make_preview(&text);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));

        let short = make_preview("짧은 텍스트");
        assert_eq!(short, "짧은 텍스트");
    }

    #[test]
    fn test_source_group_serialization_uses_camel_case_document_id() {
        let group = SourceGroup {
            document_id: "docA".to_string(),
            title: "회의록".to_string(),
            link: None,
            chunks: vec![],
        };
        let json = serde_json::to_string(&group).unwrap();
        assert!(json.contains("\"documentId\":\"docA\""));
    }
}
