//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::config::EngineConfig;
use crate::domain::engine::ExecutionEngine;
use crate::domain::error::StratboxError;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::outcome::{StrategyCode, StrategyContext};
use crate::domain::script::parse;
use crate::domain::validator::Validator;
use crate::ports::data_port::DataPort;

#[derive(Parser, Debug)]
#[command(name = "stratbox", about = "Sandboxed trading strategy runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a strategy file without running it
    Validate {
        #[arg(short, long)]
        strategy: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a strategy over one symbol's bars and print the report as JSON
    Run {
        #[arg(short, long)]
        strategy: PathBuf,
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        code: String,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// JSON object passed to the strategy as `params`
        #[arg(long)]
        params: Option<String>,
        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        memory_mb: Option<u64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub struct RunArgs {
    pub strategy: PathBuf,
    pub data_dir: PathBuf,
    pub code: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub config: Option<PathBuf>,
    pub params: Option<String>,
    pub timeout: Option<u64>,
    pub memory_mb: Option<u64>,
    pub output: Option<PathBuf>,
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Validate { strategy, config } => run_validate(&strategy, config.as_deref()),
        Command::Run {
            strategy,
            data_dir,
            code,
            start,
            end,
            config,
            params,
            timeout,
            memory_mb,
            output,
        } => run_strategy(RunArgs {
            strategy,
            data_dir,
            code,
            start,
            end,
            config,
            params,
            timeout,
            memory_mb,
            output,
        }),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(&e)
        }
    }
}

/// Defaults when no file is given; otherwise the file's values, validated.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, StratboxError> {
    match path {
        Some(path) => EngineConfig::from_config(&FileConfigAdapter::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn read_strategy(path: &Path) -> Result<StrategyCode, StratboxError> {
    Ok(StrategyCode::from(fs::read_to_string(path)?))
}

pub fn run_validate(strategy_path: &Path, config_path: Option<&Path>) -> Result<(), StratboxError> {
    let config = load_engine_config(config_path)?;
    let code = read_strategy(strategy_path)?;
    let verdict = Validator::new(config.validator).check(&code);
    if verdict.is_valid {
        println!("{}: valid", strategy_path.display());
        Ok(())
    } else {
        if let Err(e) = parse(code.as_str()) {
            eprintln!("{}", e.display_with_context(code.as_str()));
        }
        Err(StratboxError::Validation {
            reason: verdict.reason.unwrap_or_default(),
        })
    }
}

fn parse_params(raw: Option<&str>) -> Result<Map<String, JsonValue>, StratboxError> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(StratboxError::ConfigInvalid {
            section: "cli".into(),
            key: "params".into(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

/// Bars for `code`, refusing unknown symbols and empty ranges.
pub fn load_bars(
    port: &dyn DataPort,
    code: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<OhlcvBar>, StratboxError> {
    let symbols = port.list_symbols()?;
    if !symbols.iter().any(|symbol| symbol == code) {
        let available = if symbols.is_empty() {
            "none".to_string()
        } else {
            symbols.join(", ")
        };
        return Err(StratboxError::Data {
            reason: format!("unknown symbol {code} (available: {available})"),
        });
    }
    let bars = port.fetch_ohlcv(code, start, end)?;
    if bars.is_empty() {
        return Err(StratboxError::Data {
            reason: format!("no bars for {code} in the requested range"),
        });
    }
    Ok(bars)
}

pub fn run_strategy(args: RunArgs) -> Result<(), StratboxError> {
    let config = load_engine_config(args.config.as_deref())?
        .with_limit_overrides(args.timeout, args.memory_mb)?;

    let code = read_strategy(&args.strategy)?;
    let params = parse_params(args.params.as_deref())?;
    let bars = load_bars(&CsvAdapter::new(args.data_dir), &args.code, args.start, args.end)?;
    let context = StrategyContext::new(bars).with_params(params);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(async {
        let engine = ExecutionEngine::new(config)?;
        let report = engine.run(&code, context, None).await;
        engine.close().await;
        report
    })?;

    let json = serde_json::to_string_pretty(&report)?;
    match args.output {
        Some(path) => {
            fs::write(&path, json)?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
