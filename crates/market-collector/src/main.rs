//! OHLCV 수집기 CLI.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use market_core::{init_logging, LogConfig, LogFormat, SeriesKey, Timeframe};
use market_collector::modules::{replay_dead_letters, BackfillRequest};
use market_collector::{CollectorConfig, Pipeline};
use market_data::{HealthStatus, Validator};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "market-collector")]
#[command(about = "OHLCV market data collector", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// 로그 형식 (pretty, json, compact)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// 과거 캔들 백필
    Backfill {
        #[arg(long, default_value = "binance")]
        exchange: String,
        /// 심볼 (예: "BTC/USDT")
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1h")]
        timeframe: Timeframe,
        /// 최근 N일 (`--start`가 없을 때)
        #[arg(long, default_value_t = 30)]
        days: i64,
        /// 시작 시각 (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// 종료 시각 (RFC 3339, 기본: 현재)
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        /// 체크포인트에서 재개
        #[arg(long)]
        resume: bool,
    },

    /// 실시간 캔들 수집
    Stream {
        #[arg(long, default_value = "binance")]
        exchange: String,
        /// 심볼 목록 (쉼표로 구분, 예: "BTC/USDT,ETH/USDT")
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long, default_value = "1m")]
        timeframe: Timeframe,
    },

    /// 상태 점검 (종료 코드 0 정상, 1 저하, 2 비정상)
    Health,

    /// 저장된 시계열 무결성 점검
    Integrity {
        #[arg(long)]
        exchange: Option<String>,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        timeframe: Option<Timeframe>,
    },

    /// 데드레터 관리
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// 백필 체크포인트 목록
    Checkpoints,

    /// 보존 기간이 지난 알림 정리
    PruneAlerts,
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// 항목 목록
    List,
    /// 재검증 후 저장, 성공한 항목은 삭제
    Replay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig::new(cli.log_level.clone()).with_format(cli.log_format))
        .map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    let config = CollectorConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;
    let pipeline = Pipeline::open(config).await.context("파이프라인 초기화 실패")?;

    let exit_code = run(cli.command, &pipeline).await;
    pipeline.close().await;

    match exit_code {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => Err(e),
    }
}

async fn run(command: Commands, pipeline: &Pipeline) -> anyhow::Result<i32> {
    match command {
        Commands::Backfill {
            exchange,
            symbol,
            timeframe,
            days,
            start,
            end,
            resume,
        } => {
            let end = end.unwrap_or_else(Utc::now);
            let start = start.unwrap_or(end - Duration::days(days));
            let request = BackfillRequest {
                symbol,
                timeframe,
                start,
                end,
                resume,
            };

            let job = pipeline.backfill_job(&exchange)?;
            let cancel = shutdown_token();
            let report = job.run(&request, cancel).await?;
            report.log_summary();
            Ok(if report.is_complete() { 0 } else { 1 })
        }

        Commands::Stream {
            exchange,
            symbols,
            timeframe,
        } => {
            if symbols.is_empty() {
                bail!("--symbols가 필요합니다");
            }
            let ingest = pipeline.live_ingest(&exchange)?;
            let stats = ingest.run(&symbols, timeframe, shutdown_token()).await?;
            stats.log_summary();
            Ok(0)
        }

        Commands::Health => {
            let report = pipeline
                .health_monitor()
                .report(pipeline.config.health.max_age())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != HealthStatus::Healthy {
                tracing::warn!(status = ?report.status, "상태 점검 이상");
            }
            Ok(report.status.exit_code())
        }

        Commands::Integrity {
            exchange,
            symbol,
            timeframe,
        } => {
            let series: Vec<SeriesKey> = pipeline
                .storage
                .list_metadata()
                .await?
                .iter()
                .map(|m| m.series_key())
                .filter(|k| exchange.as_ref().map_or(true, |e| &k.exchange == e))
                .filter(|k| symbol.as_ref().map_or(true, |s| &k.symbol == s))
                .filter(|k| timeframe.map_or(true, |t| k.timeframe == t))
                .collect();

            let mut issues = 0;
            for key in &series {
                let report = pipeline.storage.integrity_report(key).await?;
                issues += report.issue_count();
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            tracing::info!(series = series.len(), issues, "무결성 점검 완료");
            Ok(if issues == 0 { 0 } else { 1 })
        }

        Commands::DeadLetter { action } => match action {
            DeadLetterAction::List => {
                let entries = pipeline.dead_letters.list().await?;
                for entry in &entries {
                    println!("{}", serde_json::to_string(entry)?);
                }
                tracing::info!(count = entries.len(), "데드레터 항목");
                Ok(0)
            }
            DeadLetterAction::Replay => {
                let report = replay_dead_letters(
                    &pipeline.dead_letters,
                    &pipeline.storage,
                    &pipeline.registry,
                    Validator::new(),
                )
                .await?;
                report.log_summary();
                Ok(if report.still_failing == 0 { 0 } else { 1 })
            }
        },

        Commands::Checkpoints => {
            for checkpoint in pipeline.checkpoints.list().await? {
                println!(
                    "{}\t{:?}\tlast_completed={}\trecords={}\tupdated={}",
                    checkpoint.series_key(),
                    checkpoint.status,
                    checkpoint
                        .last_completed_timestamp
                        .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
                    checkpoint.records_fetched,
                    checkpoint.updated_at.to_rfc3339(),
                );
            }
            Ok(0)
        }

        Commands::PruneAlerts => {
            let removed = pipeline
                .alerts
                .prune(pipeline.config.alerts.retention())
                .await?;
            tracing::info!(removed, "알림 정리 완료");
            Ok(0)
        }
    }
}

/// Ctrl+C를 받으면 취소되는 토큰.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("종료 신호 수신, 정리 중...");
            trigger.cancel();
        }
    });
    token
}
