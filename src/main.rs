pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod register {
    pub mod code;
    pub mod unit;
    pub mod value;
}
pub mod schema;
pub mod series {
    pub mod collection;
    pub mod generators;
    pub mod interval;
}
pub mod services {
    pub mod fake_data;
    pub mod ingest;
    pub mod interval_group;
    pub mod rollup;
}

use crate::config::Config;
use crate::db::models::Tier;
use crate::db::store::PgReadingStore;
use crate::register::value::utc_timestamp;
use crate::series::interval::{Bucketing, IntervalSpec};
use crate::services::interval_group::{build_interval_group, NoTemplates};
use crate::services::{fake_data, rollup};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

/// `--export` mode: print one label's interval group as JSON instead of rolling up.
#[derive(Debug, Clone, PartialEq)]
struct ExportRequest {
    label: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    interval: IntervalSpec,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct ExportArgs {
    label: Option<String>,
    from: Option<String>,
    to: Option<String>,
    interval: Option<String>,
}

#[derive(Debug)]
struct Cli {
    loaded_env: Option<LoadedEnvFile>,
    export: Option<ExportRequest>,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn export(conn: &mut PgConnection, cfg: &Config, request: &ExportRequest) -> Result<(), String> {
    let tier = match request.interval {
        IntervalSpec::Minutes(_) => Tier::Raw,
        IntervalSpec::Days => Tier::Day,
        IntervalSpec::Months => Tier::Month,
    };
    let window = PgReadingStore::new(conn)
        .load_series(tier, &request.label, request.from, request.to)
        .map_err(|e| format!("loading {} readings for {} failed: {}", tier.as_str(), request.label, e))?;
    info!(
        "Export: {} {} reading series for {} in [{}, {})",
        window.iter().map(|s| s.register_codes().count()).sum::<usize>(),
        tier.as_str(),
        request.label,
        request.from,
        request.to
    );

    let bucketing = Bucketing::new(request.interval, cfg.timezone);
    let group = build_interval_group(&window, bucketing, &[], &NoTemplates)
        .map_err(|e| format!("building interval group failed: {}", e))?;
    let json = serde_json::to_string_pretty(&group).map_err(|e| format!("serializing interval group failed: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn run(export_request: Option<&ExportRequest>) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (timezone={}, rollup_enabled={}, rollup_batch_size={}, fake_data_enabled={}, fake_data_days={})",
        cfg.timezone.name(),
        cfg.rollup_enabled,
        cfg.rollup_batch_size,
        cfg.fake_data_enabled,
        cfg.fake_data_days
    );

    // 2) Connect DB
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    if let Some(request) = export_request {
        return export(&mut conn, &cfg, request);
    }

    // 4) Synthetic readings for development
    if cfg.fake_data_enabled {
        fake_data::run(&mut conn, cfg.fake_data_days.get())?;
    }

    // 5) Rollup raw -> day -> month -> year
    if cfg.rollup_enabled {
        let mut store = PgReadingStore::new(&mut conn);
        rollup::run_all(&mut store, &cfg.timezone, cfg.rollup_batch_size)?;
        info!("Rollup complete");
    } else {
        info!("Rollup disabled via ROLLUP_ENABLED={}", cfg.rollup_enabled);
    }

    Ok(())
}

fn parse_utc_arg(name: &str, value: &str) -> Result<DateTime<Utc>, String> {
    let parsed =
        DateTime::parse_from_rfc3339(value).map_err(|e| format!("`{}` must be an RFC 3339 timestamp: {}", name, e))?;
    utc_timestamp(parsed).map_err(|e| format!("`{}`: {}", name, e))
}

impl ExportArgs {
    fn is_empty(&self) -> bool {
        *self == ExportArgs::default()
    }

    fn into_request(self) -> Result<ExportRequest, String> {
        let missing = |flag: &str| format!("`--export` requires `{}`", flag);
        let label = self.label.ok_or_else(|| "`--from`, `--to` and `--interval` require `--export <label>`".to_string())?;
        let from = parse_utc_arg("--from", &self.from.ok_or_else(|| missing("--from"))?)?;
        let to = parse_utc_arg("--to", &self.to.ok_or_else(|| missing("--to"))?)?;
        if from > to {
            return Err(format!("`--from` {} is after `--to` {}", from, to));
        }
        let interval = self
            .interval
            .ok_or_else(|| missing("--interval"))?
            .parse::<IntervalSpec>()
            .map_err(|e| format!("`--interval`: {}", e))?;
        Ok(ExportRequest {
            label,
            from,
            to,
            interval,
        })
    }
}

fn take_value(slot: &mut Option<String>, flag: &str, value: Option<std::ffi::OsString>) -> Result<(), String> {
    if slot.is_some() {
        return Err(format!("`{}` provided more than once", flag));
    }
    let value = value.ok_or_else(|| format!("`{}` requires a value", flag))?;
    let value = value
        .into_string()
        .map_err(|_| format!("`{}` value contains invalid UTF-8", flag))?;
    *slot = Some(value);
    Ok(())
}

fn configure_env_from_cli() -> Result<Cli, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    let mut export = ExportArgs::default();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some("--export") => take_value(&mut export.label, "--export", args.next())?,
            Some("--from") => take_value(&mut export.from, "--from", args.next())?,
            Some("--to") => take_value(&mut export.to, "--to", args.next())?,
            Some("--interval") => take_value(&mut export.interval, "--interval", args.next())?,
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    let export = if export.is_empty() {
        None
    } else {
        Some(export.into_request()?)
    };

    let loaded_env = if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Some(LoadedEnvFile { path, explicit: true })
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Some(LoadedEnvFile {
                path: default_path,
                explicit: false,
            })
        } else {
            None
        }
    };

    Ok(Cli { loaded_env, export })
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Preserve any value that was already supplied via the process environment.
                if std::env::var_os(&key).is_none() {
                    // Updating process-level environment variables is unsafe on some targets.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(format!("{}:{}: {}", path.display(), index + 1, e));
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let mut parts = without_export.splitn(2, '=');
    let key = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| "missing environment variable name".to_string())?;
    let value_part = parts.next().ok_or_else(|| "missing '=' in assignment".to_string())?;

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = parse_env_value(value_part)?;
    Ok(Some((key.to_string(), value)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_double_quoted(rest)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_single_quoted(rest)
    } else {
        let value = trimmed.splitn(2, '#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

fn parse_double_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            let value = match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '\\' => '\\',
                '"' => '"',
                other => other,
            };
            result.push(value);
            escape = false;
            continue;
        }

        match ch {
            '\\' => escape = true,
            '"' => {
                let remainder = chars.as_str().trim();
                if remainder.is_empty() || remainder.starts_with('#') {
                    return Ok(result);
                } else {
                    return Err("unexpected characters after closing double quote".to_string());
                }
            }
            other => result.push(other),
        }
    }

    if escape {
        Err("unterminated escape sequence in double-quoted value".to_string())
    } else {
        Err("unterminated double-quoted value".to_string())
    }
}

fn parse_single_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch == '\'' {
            let remainder = chars.as_str().trim();
            if remainder.is_empty() || remainder.starts_with('#') {
                return Ok(result);
            } else {
                return Err("unexpected characters after closing single quote".to_string());
            }
        } else {
            result.push(ch);
        }
    }

    Err("unterminated single-quoted value".to_string())
}

fn main() {
    let cli = match configure_env_from_cli() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = cli.loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "meter-rollup {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.export.as_ref()) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn env_assignments() {
        assert_eq!(parse_env_assignment("# comment").unwrap(), None);
        assert_eq!(
            parse_env_assignment("export METER_TIMEZONE=Europe/Oslo # local").unwrap(),
            Some(("METER_TIMEZONE".to_string(), "Europe/Oslo".to_string()))
        );
        assert_eq!(
            parse_env_assignment(r#"DATABASE_URL="postgres://a:b@h/db""#).unwrap(),
            Some(("DATABASE_URL".to_string(), "postgres://a:b@h/db".to_string()))
        );
        assert_eq!(
            parse_env_assignment("ROLLUP_BATCH_SIZE='500'").unwrap(),
            Some(("ROLLUP_BATCH_SIZE".to_string(), "500".to_string()))
        );
        assert!(parse_env_assignment("NO_EQUALS").is_err());
        assert!(parse_env_assignment("BAD KEY=1").is_err());
        assert!(parse_env_assignment(r#"OPEN="unterminated"#).is_err());
    }

    fn args(label: &str, from: &str, to: &str, interval: &str) -> ExportArgs {
        ExportArgs {
            label: Some(label.to_string()),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            interval: Some(interval.to_string()),
        }
    }

    #[test]
    fn export_request_from_args() {
        let request = args("house", "2024-05-01T00:00:00Z", "2024-05-02T00:00:00+00:00", "15-minutes")
            .into_request()
            .unwrap();
        assert_eq!(request.label, "house");
        assert_eq!(request.from, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(request.to, Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        assert_eq!(request.interval, IntervalSpec::Minutes(15));
    }

    #[test]
    fn export_request_rejects_bad_input() {
        let non_utc = args("house", "2024-05-01T02:00:00+02:00", "2024-05-02T00:00:00Z", "1-days");
        assert!(non_utc.into_request().unwrap_err().contains("not UTC"));

        let reversed = args("house", "2024-05-02T00:00:00Z", "2024-05-01T00:00:00Z", "1-days");
        assert!(reversed.into_request().is_err());

        let bad_interval = args("house", "2024-05-01T00:00:00Z", "2024-05-02T00:00:00Z", "7-minutes");
        assert!(bad_interval.into_request().is_err());

        let no_label = ExportArgs {
            label: None,
            ..args("house", "2024-05-01T00:00:00Z", "2024-05-02T00:00:00Z", "1-days")
        };
        assert!(no_label.into_request().is_err());
        assert!(ExportArgs::default().is_empty());
    }
}
