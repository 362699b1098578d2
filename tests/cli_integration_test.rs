//! CLI integration tests: config loading, validate and run against real
//! files on disk.

mod common;

use common::*;
use std::path::{Path, PathBuf};
use stratbox::cli::{self, RunArgs};
use stratbox::domain::error::StratboxError;

const STRATEGY: &str = "\
import series

def strategy(data, params):
    up = series.crossover(data['close'], params.get('level', 101.0))
    trades = []
    for i in range(len(up)):
        if up[i] and i + 1 < len(data['close']):
            trades.append({'pnl': data['close'][i + 1] - data['close'][i], 'entry_index': i, 'exit_index': i + 1})
    return {'trades': trades}
";

fn run_args(strategy: &Path, data_dir: &Path, output: Option<PathBuf>) -> RunArgs {
    RunArgs {
        strategy: strategy.to_path_buf(),
        data_dir: data_dir.to_path_buf(),
        code: "BHP".to_string(),
        start: None,
        end: None,
        config: None,
        params: None,
        timeout: None,
        memory_mb: None,
        output,
    }
}

mod config_loading {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = cli::load_engine_config(None).unwrap();
        assert_eq!(config.limits.timeout_seconds, 30);
        assert_eq!(config.limits.memory_limit_mb, 512);
        assert_eq!(config.sandbox.max_call_depth, 64);
    }

    #[test]
    fn reads_every_section() {
        let ini = write_temp_file(
            "[sandbox]\ntimeout_seconds = 5\nmemory_limit_mb = 64\nmax_code_bytes = 1024\nmax_call_depth = 32\n\n[metrics]\nrisk_free_rate = 0.02\nperiods_per_year = 52\ninitial_capital = 5000\n",
            ".ini",
        );
        let config = cli::load_engine_config(Some(ini.path())).unwrap();
        assert_eq!(config.limits.timeout_seconds, 5);
        assert_eq!(config.limits.memory_limit_mb, 64);
        assert_eq!(config.validator.max_code_bytes, 1024);
        assert_eq!(config.sandbox.max_call_depth, 32);
        assert_eq!(config.metrics.periods_per_year, 52);
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let ini = write_temp_file("[sandbox]\ntimeout_seconds = 0\n", ".ini");
        let err = cli::load_engine_config(Some(ini.path())).unwrap_err();
        assert!(matches!(err, StratboxError::ConfigInvalid { .. }), "{err}");
        assert_eq!(err.exit_status(), 2);
    }
}

mod validate_command {
    use super::*;

    #[test]
    fn valid_strategy_passes() {
        let strategy = write_temp_file(STRATEGY, ".py");
        cli::run_validate(strategy.path(), None).unwrap();
    }

    #[test]
    fn disallowed_import_exits_with_validation_status() {
        let strategy = write_temp_file("import subprocess\ntrades = [1]\n", ".py");
        let err = cli::run_validate(strategy.path(), None).unwrap_err();
        assert_eq!(err.exit_status(), 4);
        assert_eq!(
            err.to_string(),
            "strategy rejected: disallowed import 'subprocess' at line 1"
        );
    }

    #[test]
    fn size_limit_comes_from_config() {
        let ini = write_temp_file("[sandbox]\nmax_code_bytes = 10\n", ".ini");
        let strategy = write_temp_file(STRATEGY, ".py");
        let err = cli::run_validate(strategy.path(), Some(ini.path())).unwrap_err();
        assert!(matches!(err, StratboxError::Validation { .. }));
    }

    #[test]
    fn missing_strategy_file_is_io_error() {
        let err = cli::run_validate(Path::new("/nonexistent/strategy.py"), None).unwrap_err();
        assert_eq!(err.exit_status(), 1);
    }
}

mod run_command {
    use super::*;

    #[test]
    fn writes_report_json() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BHP", &make_bars(&[100.0, 102.0, 99.0, 103.0, 104.0, 98.0]));
        let strategy = write_temp_file(STRATEGY, ".py");
        let output = dir.path().join("report.json");

        cli::run_strategy(run_args(strategy.path(), dir.path(), Some(output.clone()))).unwrap();

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(report["metrics"]["trade_count"], 2);
        assert_eq!(report["outcome"]["trade_records"][0]["entry_index"], 1);
        assert_eq!(report["outcome"]["trade_records"][0]["pnl"], -3.0);
        assert_eq!(report["outcome"]["limits_enforced"], cfg!(unix));
    }

    #[test]
    fn params_and_date_range_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BHP", &make_bars(&[100.0, 102.0, 99.0, 103.0, 104.0, 98.0]));
        let strategy = write_temp_file(STRATEGY, ".py");
        let output = dir.path().join("report.json");
        let mut args = run_args(strategy.path(), dir.path(), Some(output.clone()));
        args.params = Some("{\"level\": 102.5}".to_string());
        args.start = chrono::NaiveDate::from_ymd_opt(2024, 1, 3);

        cli::run_strategy(args).unwrap();

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(report["metrics"]["trade_count"], 1);
        assert_eq!(report["outcome"]["trade_records"][0]["pnl"], 1.0);
    }

    #[test]
    fn strategy_without_trades_is_degenerate() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BHP", &make_bars(&[100.0, 100.0, 100.0]));
        let strategy = write_temp_file(STRATEGY, ".py");
        let err = cli::run_strategy(run_args(strategy.path(), dir.path(), None)).unwrap_err();
        assert!(matches!(err, StratboxError::DegenerateResult { bars: 3 }));
    }

    #[test]
    fn timeout_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BHP", &make_bars(&[100.0]));
        let strategy = write_temp_file("while True:\n    pass\n", ".py");
        let mut args = run_args(strategy.path(), dir.path(), None);
        args.timeout = Some(1);
        let err = cli::run_strategy(args).unwrap_err();
        if cfg!(unix) {
            assert_eq!(err.exit_status(), 5, "{err}");
        }
    }

    #[test]
    fn missing_data_is_a_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = write_temp_file(STRATEGY, ".py");
        let err = cli::run_strategy(run_args(strategy.path(), dir.path(), None)).unwrap_err();
        assert_eq!(err.exit_status(), 3);
    }

    #[test]
    fn out_of_range_limit_flags_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "BHP", &make_bars(&[100.0]));
        let strategy = write_temp_file("trades = [1]\n", ".py");
        let mut args = run_args(strategy.path(), dir.path(), None);
        args.timeout = Some(0);
        let err = cli::run_strategy(args).unwrap_err();
        assert!(matches!(err, StratboxError::ConfigInvalid { ref key, .. } if key == "timeout_seconds"));
        assert_eq!(err.exit_status(), 2);

        let mut args = run_args(strategy.path(), dir.path(), None);
        args.memory_mb = Some(0);
        assert_eq!(cli::run_strategy(args).unwrap_err().exit_status(), 2);
    }
}

mod bar_loading {
    use super::*;

    #[test]
    fn unknown_symbol_names_the_available_ones() {
        let port = MockDataPort::new()
            .with_bars("RIO", make_bars(&[1.0]))
            .with_bars("BHP", make_bars(&[1.0]));
        let err = cli::load_bars(&port, "CBA", None, None).unwrap_err();
        assert_eq!(err.exit_status(), 3);
        assert!(err.to_string().contains("available: BHP, RIO"), "{err}");
    }

    #[test]
    fn empty_range_is_a_data_error() {
        let port = MockDataPort::new().with_bars("BHP", make_bars(&[1.0, 2.0]));
        let start = chrono::NaiveDate::from_ymd_opt(2030, 1, 1);
        let err = cli::load_bars(&port, "BHP", start, None).unwrap_err();
        assert!(err.to_string().contains("no bars for BHP"), "{err}");
        assert_eq!(cli::load_bars(&port, "BHP", None, None).unwrap().len(), 2);
    }
}
