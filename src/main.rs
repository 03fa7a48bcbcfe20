//! Service entry point.
//!
//! Subcommands:
//!   init-db            create tables and indexes (idempotent)
//!   tick               run a single tick against PostgreSQL (cron-friendly)
//!   daemon             fixed-cadence loop: rebuild index, tick, sleep
//!   replay SINCE UNTIL regenerate scores/alerts for a historical range
//!
//! Configuration comes from `wxmon.toml` (override with WXMON_CONFIG);
//! the database connection from DATABASE_URL, honoring a `.env` file.

use std::env;
use std::process::ExitCode;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDate, Utc};

use wxmon_service::config::{Settings, DEFAULT_CONFIG_PATH};
use wxmon_service::engine::Engine;
use wxmon_service::logging::{self, LogLevel, Subsystem};
use wxmon_service::replay::replay;
use wxmon_service::stations::StationIndex;
use wxmon_service::store::{PgStore, Store};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    let config_path =
        env::var("WXMON_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let settings = match Settings::load(&config_path) {
        Ok(s) => s,
        Err(e) => {
            // Refuse to start a tick cycle with undefined thresholds.
            eprintln!("fatal: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init_logger(LogLevel::Info, settings.log_file.as_deref());

    let result = match command {
        Some("init-db") => cmd_init_db(),
        Some("tick") => cmd_tick(settings),
        Some("daemon") => cmd_daemon(settings),
        Some("replay") => cmd_replay(settings, &args[2..]),
        _ => {
            eprintln!("usage: wxmon_service <init-db | tick | daemon | replay SINCE UNTIL>");
            eprintln!("  SINCE/UNTIL accept RFC 3339 timestamps or YYYY-MM-DD dates (UTC)");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::error(Subsystem::Daemon, None, &e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_init_db() -> Result<(), String> {
    let mut store = PgStore::from_env().map_err(|e| e.to_string())?;
    store.init_schema().map_err(|e| e.to_string())?;
    logging::info(Subsystem::Store, None, "schema ready");
    Ok(())
}

fn cmd_tick(settings: Settings) -> Result<(), String> {
    let mut store = PgStore::from_env().map_err(|e| e.to_string())?;
    let mut index = StationIndex::new();
    index.rebuild(store.list_stations().map_err(|e| e.to_string())?);

    let mut engine = Engine::new(settings);
    let summary = engine.process_tick(&mut store, &index, Utc::now()).map_err(|e| e.to_string())?;
    println!(
        "tick at {}: {} scored, {} alerts, {} skipped",
        summary.ts, summary.scored, summary.alerts, summary.skipped
    );
    Ok(())
}

fn cmd_daemon(settings: Settings) -> Result<(), String> {
    let mut store = PgStore::from_env().map_err(|e| e.to_string())?;
    let poll = StdDuration::from_secs(settings.poll_interval_seconds);
    let rebuild_every = settings.index_rebuild_every_ticks;

    logging::info(
        Subsystem::Daemon,
        None,
        &format!(
            "daemon started: tick every {}s, neighbor_k={}, window={}m",
            settings.poll_interval_seconds, settings.neighbor_k, settings.rolling_window_minutes
        ),
    );

    let mut engine = Engine::new(settings);
    let mut index = StationIndex::new();
    let mut loop_no: u64 = 0;
    let mut backoff_secs: u64 = 1;

    loop {
        // Index rebuilds happen here, between ticks — never during one.
        if loop_no % rebuild_every == 0 {
            match store.list_stations() {
                Ok(stations) => {
                    index.rebuild(stations);
                    logging::debug(
                        Subsystem::Stations,
                        None,
                        &format!("index rebuilt for {} stations", index.len()),
                    );
                }
                Err(e) => logging::warn(
                    Subsystem::Stations,
                    None,
                    &format!("index rebuild failed, keeping previous: {}", e),
                ),
            }
        }

        match engine.process_tick(&mut store, &index, Utc::now()) {
            Ok(_) => {
                backoff_secs = 1;
                thread::sleep(poll);
            }
            Err(e) => {
                logging::error(Subsystem::Daemon, None, &format!("tick failed: {}", e));
                thread::sleep(StdDuration::from_secs(backoff_secs));
                backoff_secs = (backoff_secs * 2).min(60);
            }
        }
        loop_no += 1;
    }
}

fn cmd_replay(settings: Settings, args: &[String]) -> Result<(), String> {
    let [since_raw, until_raw] = args else {
        return Err("replay needs SINCE and UNTIL".to_string());
    };
    let since = parse_ts(since_raw)?;
    let until = parse_ts(until_raw)?;
    if since >= until {
        return Err(format!("SINCE {} must be before UNTIL {}", since, until));
    }

    let mut store = PgStore::from_env().map_err(|e| e.to_string())?;
    let mut engine = Engine::new(settings);
    let outcome = replay(&mut store, &mut engine, since, until).map_err(|e| e.to_string())?;
    println!(
        "replayed {} ticks: {} pairs scored, {} alerts ({} stale cleared)",
        outcome.ticks, outcome.scored, outcome.alerts, outcome.alerts_cleared
    );
    Ok(())
}

/// Accept an RFC 3339 timestamp or a bare YYYY-MM-DD date (UTC midnight).
fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc());
    }
    Err(format!("cannot parse '{}' as RFC 3339 or YYYY-MM-DD", raw))
}
