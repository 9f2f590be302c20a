//! CLI 모듈
//!
//! hoerok-rag CLI 명령어 정의 및 구현

use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::chat::DEFAULT_TOP_K;
use crate::embedding::has_api_key;
use crate::service;
use crate::store::{get_data_dir, GraphSqliteStore};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "hoerok-rag")]
#[command(version, about = "한국어 회의록 하이브리드 RAG 엔진", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 질문에 대한 답변을 NDJSON 이벤트 스트림으로 출력
    Ask {
        /// 질문 텍스트
        question: String,

        /// 검색 결과 개수 제한
        #[arg(short, long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },

    /// 하이브리드 검색 결과를 사람이 읽기 좋은 형태로 출력
    Search {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ask { question, top_k } => cmd_ask(&question, top_k).await,
        Commands::Search { query, limit } => cmd_search(&query, limit).await,
        Commands::Status => cmd_status().await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 질문 명령어 (ask)
///
/// 이벤트 프레임을 한 줄에 하나씩 JSON으로 출력합니다.
/// 토큰 프레임이 생성되는 즉시 보이도록 매 프레임마다 플러시합니다.
async fn cmd_ask(question: &str, top_k: usize) -> Result<()> {
    require_api_key()?;

    let services = service::services().await.context("서비스 초기화 실패")?;

    let mut rx = match services.coordinator.stream(question, top_k) {
        Ok(rx) => rx,
        Err(e) => {
            eprintln!("[!] {}", e);
            return Ok(());
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    while let Some(event) = rx.recv().await {
        let line = serde_json::to_string(&event).context("이벤트 직렬화 실패")?;
        writeln!(out, "{}", line)?;
        out.flush()?;
    }

    service::shutdown().await;
    Ok(())
}

/// 검색 명령어 (search)
///
/// 답변 합성 없이 하이브리드 검색과 그룹화 결과만 출력합니다.
async fn cmd_search(query: &str, limit: usize) -> Result<()> {
    require_api_key()?;

    let services = service::services().await.context("서비스 초기화 실패")?;

    let ranked = services
        .fusion
        .fuse(query, limit)
        .await
        .context("하이브리드 검색 실패")?;

    if ranked.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        service::shutdown().await;
        return Ok(());
    }

    let groups = services
        .materializer
        .materialize(&ranked)
        .await
        .context("검색 결과 구체화 실패")?
        .groups;

    println!("\n[OK] 검색 결과 ({} 문서):\n", groups.len());

    for (i, group) in groups.iter().enumerate() {
        println!("{}. {} (문서 ID: {})", i + 1, group.title, group.document_id);

        if let Some(ref link) = group.link {
            println!("   링크: {}", link);
        }

        for chunk in &group.chunks {
            println!("   [점수: {:.4}] {}", chunk.score, chunk.preview);
        }

        println!();
    }

    service::shutdown().await;
    Ok(())
}

/// 상태 명령어 (status)
///
/// API 키 없이도 저장소 통계까지는 확인할 수 있습니다.
async fn cmd_status() -> Result<()> {
    println!("hoerok-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = get_data_dir();
    println!("[*] 데이터 디렉토리: {}", data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match GraphSqliteStore::open_default() {
        Ok(store) => match store.stats() {
            Ok(stats) => {
                println!("[OK] 저장된 문서: {} 건", stats.document_count);
                println!("[OK] 저장된 청크: {} 건", stats.chunk_count);
            }
            Err(e) => {
                println!("[!] 통계 조회 실패: {}", e);
            }
        },
        Err(e) => {
            println!("[!] 그래프 저장소 열기 실패: {}", e);
        }
    }

    if has_api_key() {
        match service::services().await {
            Ok(services) => match services.vector.count().await {
                Ok(count) => {
                    println!("[OK] 벡터 인덱스: {} 청크", count);
                }
                Err(e) => {
                    tracing::debug!("벡터 통계 조회 실패: {}", e);
                }
            },
            Err(e) => {
                tracing::debug!("서비스 초기화 실패: {}", e);
            }
        }
        service::shutdown().await;
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// API 키 미설정 시 안내와 함께 종료
fn require_api_key() -> Result<()> {
    if !has_api_key() {
        anyhow::bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }
    Ok(())
}
