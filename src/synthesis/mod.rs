//! 답변 합성 모듈 - 검색된 청크를 근거로 답변 토큰 스트림 생성
//!
//! Gemini `streamGenerateContent` (SSE)를 사용해 토큰을 지연 생성합니다.
//! 업스트림 응답 형태가 일정하지 않으므로 (스트림 / 단일 텍스트)
//! 태그드 유니언 `Answer`로 한 번 해석한 뒤 코디네이터에 넘깁니다.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::embedding::get_api_key;

// ============================================================================
// Types
// ============================================================================

/// 지연 토큰 스트림
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// 합성 결과 - 토큰 스트림 또는 완성 텍스트
///
/// 코디네이터는 토큰 방출 단계 전에 이 유니언을 한 번 해석합니다.
pub enum Answer {
    /// 토큰 단위 지연 스트림
    Streamed(TokenStream),
    /// 완성된 전체 텍스트 (스트리밍 미지원 경로)
    Complete(String),
}

/// 합성 컨텍스트 한 건 (검색된 청크)
#[derive(Debug, Clone)]
pub struct ContextPassage {
    /// 소유 문서 제목
    pub title: Option<String>,
    /// 청크 전체 텍스트
    pub text: String,
}

// ============================================================================
// AnswerSynthesizer Trait
// ============================================================================

/// 답변 합성기 트레이트
///
/// 질문과 컨텍스트 청크 목록을 받아 답변을 생성합니다.
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn synthesize(&self, question: &str, passages: &[ContextPassage]) -> Result<Answer>;
}

// ============================================================================
// Google Gemini Synthesizer
// ============================================================================

/// Gemini 생성 API 베이스 URL
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// 기본 생성 모델
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Gemini 스트리밍 합성기
pub struct GeminiSynthesizer {
    api_key: String,
    client: reqwest::Client,
    model: String,
}

impl GeminiSynthesizer {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_model(api_key, DEFAULT_MODEL)
    }

    pub fn with_model(api_key: String, model: impl Into<String>) -> Result<Self> {
        // 토큰 스트림이 길어질 수 있으므로 넉넉한 타임아웃
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            model: model.into(),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성 (임베딩과 같은 키)
    pub fn from_env() -> Result<Self> {
        Self::new(get_api_key()?)
    }
}

/// Gemini 생성 요청 본문
#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

/// Gemini SSE 스트림 청크
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<StreamCandidate>,
}

#[derive(Debug, Deserialize)]
struct StreamCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl AnswerSynthesizer for GeminiSynthesizer {
    async fn synthesize(&self, question: &str, passages: &[ContextPassage]) -> Result<Answer> {
        let prompt = build_prompt(question, passages);

        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 8192,
            },
        };

        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse",
            GEMINI_API_BASE, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send generation request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini generation API error ({}): {}", status, body);
        }

        Ok(Answer::Streamed(sse_token_stream(response.bytes_stream())))
    }
}

// ============================================================================
// SSE Parsing
// ============================================================================

/// SSE 응답 바디를 토큰 스트림으로 변환
///
/// `data: {...}` 라인 단위로 파싱하며 스트림 종료는 바디 EOF입니다.
/// EOF 시점에 개행 없이 남은 마지막 라인도 파싱해 토큰 유실을 막습니다.
/// 파싱 실패는 Err 아이템으로 올라가고 코디네이터가 폴백 토큰으로 복구합니다.
fn sse_token_stream<S, B, E>(bytes: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = (
        Box::pin(bytes),
        String::new(),
        VecDeque::<String>::new(),
        false,
    );

    Box::pin(futures::stream::try_unfold(
        state,
        |(mut bytes, mut buf, mut pending, mut done)| async move {
            loop {
                if let Some(token) = pending.pop_front() {
                    return Ok(Some((token, (bytes, buf, pending, done))));
                }
                if done {
                    return Ok(None);
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));
                        while let Some(pos) = buf.find('\n') {
                            let line: String = buf.drain(..=pos).collect();
                            for token in parse_sse_line(line.trim())? {
                                pending.push_back(token);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return Err(anyhow::Error::new(e).context("Token stream transfer failed"))
                    }
                    None => {
                        done = true;
                        // 개행 없이 끝난 잔여 버퍼 플러시
                        if !buf.is_empty() {
                            let rest = std::mem::take(&mut buf);
                            for token in parse_sse_line(rest.trim())? {
                                pending.push_back(token);
                            }
                        }
                    }
                }
            }
        },
    ))
}

/// SSE 라인 한 줄에서 텍스트 토큰 추출
///
/// data 라인이 아니면 빈 목록, 파싱 불가능한 data 페이로드는 에러.
fn parse_sse_line(line: &str) -> Result<Vec<String>> {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => return Ok(vec![]),
    };
    if data.is_empty() {
        return Ok(vec![]);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).context("Malformed chunk in generation stream")?;

    Ok(chunk
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|content| content.parts)
        .map(|part| part.text)
        .filter(|text| !text.is_empty())
        .collect())
}

// ============================================================================
// Prompt
// ============================================================================

/// 회의록 QA 프롬프트 구성
fn build_prompt(question: &str, passages: &[ContextPassage]) -> String {
    let mut prompt = String::from(
        "당신은 회의록 기반 질의응답 어시스턴트입니다.\n\
         아래 회의록 발췌만을 근거로 질문에 한국어로 답변해주세요.\n\
         발췌에 없는 내용은 추측하지 말고, 근거가 부족하면 그렇다고 말해주세요.\n\n",
    );

    for (i, passage) in passages.iter().enumerate() {
        match &passage.title {
            Some(title) => {
                prompt.push_str(&format!("[발췌 {} - {}]\n{}\n\n", i + 1, title, passage.text))
            }
            None => prompt.push_str(&format!("[발췌 {}]\n{}\n\n", i + 1, passage.text)),
        }
    }

    prompt.push_str(&format!("질문: {}\n답변:", question));
    prompt
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[test]
    fn test_parse_sse_line_extracts_tokens() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"안녕"},{"text":"하세요"}]}}]}"#;
        let tokens = parse_sse_line(line).unwrap();
        assert_eq!(tokens, vec!["안녕".to_string(), "하세요".to_string()]);
    }

    #[test]
    fn test_parse_sse_line_ignores_non_data_lines() {
        assert!(parse_sse_line("").unwrap().is_empty());
        assert!(parse_sse_line(": keep-alive").unwrap().is_empty());
        assert!(parse_sse_line("event: ping").unwrap().is_empty());
    }

    #[test]
    fn test_parse_sse_line_skips_empty_parts() {
        // 빈 parts를 반환하는 청크는 토큰 없이 통과 (업스트림 기벽)
        let line = r#"data: {"candidates":[{"content":{"parts":[]}}]}"#;
        assert!(parse_sse_line(line).unwrap().is_empty());

        let no_content = r#"data: {"candidates":[{}]}"#;
        assert!(parse_sse_line(no_content).unwrap().is_empty());
    }

    #[test]
    fn test_parse_sse_line_malformed_payload_is_error() {
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[tokio::test]
    async fn test_sse_stream_flushes_final_line_without_newline() {
        // 마지막 data 라인이 개행 없이 EOF로 끝나도 토큰이 유실되지 않아야 함
        let first = r#"data: {"candidates":[{"content":{"parts":[{"text":"첫"}]}}]}"#;
        let last = r#"data: {"candidates":[{"content":{"parts":[{"text":"끝"}]}}]}"#;
        let body = format!("{}\n{}", first, last);
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(body.into_bytes())];

        let tokens: Vec<String> = sse_token_stream(futures::stream::iter(chunks))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(tokens, vec!["첫".to_string(), "끝".to_string()]);
    }

    #[test]
    fn test_build_prompt_includes_passages_and_question() {
        let passages = vec![
            ContextPassage {
                title: Some("3월 주간회의".to_string()),
                text: "배포 일정은 4월 초로 확정".to_string(),
            },
            ContextPassage {
                title: None,
                text: "QA는 3월 말까지 완료".to_string(),
            },
        ];

        let prompt = build_prompt("배포 일정은?", &passages);

        assert!(prompt.contains("[발췌 1 - 3월 주간회의]"));
        assert!(prompt.contains("[발췌 2]"));
        assert!(prompt.contains("배포 일정은 4월 초로 확정"));
        assert!(prompt.ends_with("질문: 배포 일정은?\n답변:"));
    }
}
