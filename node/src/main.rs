use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use forgeshare_storage::{LedgerReader, SledLedgerStore};
use forgeshare_sync::ReadPool;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

mod commands;
mod config;
mod logging;
mod version;

use commands::print_json;
use config::AppConfig;
use logging::init_logging;
use version::{version_line, FORGESHARE_VERSION};

fn window_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("start")
            .long("start")
            .value_name("TIME")
            .help("Window start: unix seconds, RFC 3339, 'YYYY-MM-DD HH:MM:SS' or 'YYYY-MM-DD'"),
    )
    .arg(
        Arg::new("end")
            .long("end")
            .value_name("TIME")
            .help("Window end (exclusive), same formats as --start"),
    )
}

fn cli() -> Command {
    Command::new("forgeshare")
        .version(FORGESHARE_VERSION)
        .about("Forging reward-sharing ledger")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .subcommand(Command::new("version").about("Print detailed version information"))
        .subcommand(
            Command::new("check-config")
                .about("Validate the configuration and print the normalised plans"),
        )
        .subcommand(
            Command::new("plan")
                .about("Show the present plan, the first allocating plan and the plan at a height")
                .arg(
                    Arg::new("height")
                        .long("height")
                        .value_name("HEIGHT")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("at")
                        .long("at")
                        .value_name("TIME")
                        .help("Evaluate at this time instead of now"),
                ),
        )
        .subcommand(
            Command::new("ledger")
                .about("Allocation rows at a height or over a round (defaults to the latest height)")
                .arg(
                    Arg::new("height")
                        .long("height")
                        .value_name("HEIGHT")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("round")
                        .long("round")
                        .value_name("ROUND")
                        .value_parser(value_parser!(u64))
                        .conflicts_with("height"),
                ),
        )
        .subcommand(Command::new("pending").about("Blocks and rewards since the last paid round"))
        .subcommand(Command::new("lastpaid").about("The most recently settled payment"))
        .subcommand(
            Command::new("status").about("Ledger height, unsettled payments and pending totals"),
        )
        .subcommand(window_args(
            Command::new("stats").about("Forging totals over a time window"),
        ))
        .subcommand(window_args(
            Command::new("commitment")
                .about("Per voter: blocks counted and blocks where the vote was kept"),
        ))
        .subcommand(Command::new("missed").about("Missed slots in rounds without a forged block"))
        .subcommand(window_args(
            Command::new("scan")
                .about("Original and corrected allotments for addresses over a window")
                .arg(
                    Arg::new("addresses")
                        .value_name("ADDRESS")
                        .num_args(1..)
                        .required(true),
                ),
        ))
        .subcommand(window_args(
            Command::new("antibot")
                .about("Voters whose allotments were corrected, with their totals"),
        ))
        .subcommand(
            Command::new("rollback")
                .about("Roll the ledger back to the start of the round holding HEIGHT")
                .arg(
                    Arg::new("height")
                        .value_name("HEIGHT")
                        .value_parser(value_parser!(u64))
                        .required(true),
                )
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Confirm the rollback"),
                ),
        )
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = data_dir.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log_format = format.clone();
    }
}

fn open_ledger(config: &AppConfig) -> Result<SledLedgerStore> {
    let path = config.ledger_path();
    SledLedgerStore::open(&path)
        .with_context(|| format!("Failed to open ledger at {}", path.display()))
}

fn read_pool(config: &AppConfig) -> Result<ReadPool> {
    let reader: Arc<dyn LedgerReader> = Arc::new(open_ledger(config)?);
    Ok(ReadPool::new(
        reader,
        config.engine.read_workers,
        config.engine.read_retries,
    )?)
}

fn window(matches: &ArgMatches) -> Result<(i64, i64)> {
    commands::parse_window(
        matches.get_one::<String>("start"),
        matches.get_one::<String>("end"),
    )
}

async fn dispatch(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let net = config.network;
    match matches.subcommand() {
        Some(("version", _)) => println!("{}", version_line()),
        Some(("check-config", _)) => {
            let book = config.plan_book()?;
            info!(
                delegate = %config.engine.delegate,
                plans = book.steps().len(),
                config = ?config.config_path,
                "Configuration is valid"
            );
            print_json(&book.steps())?;
        }
        Some(("plan", sub)) => {
            let at = sub
                .get_one::<String>("at")
                .map(|s| commands::parse_time(s))
                .transpose()?;
            let book = config.plan_book()?;
            let height = sub.get_one::<u64>("height").copied();
            print_json(&commands::plan_report(&book, height, at))?;
        }
        Some(("ledger", sub)) => {
            let store = open_ledger(config)?;
            let entries = commands::ledger_report(
                &store,
                sub.get_one::<u64>("height").copied(),
                sub.get_one::<u64>("round").copied(),
                &net,
            )?;
            print_json(&entries)?;
        }
        Some(("pending", _)) => print_json(&read_pool(config)?.pending_summary().await?)?,
        Some(("lastpaid", _)) => print_json(&read_pool(config)?.last_paid_summary().await?)?,
        Some(("status", _)) => print_json(&commands::status_report(&read_pool(config)?).await?)?,
        Some(("stats", sub)) => {
            let (start, end) = window(sub)?;
            print_json(&open_ledger(config)?.forging_stats(start, end, &net)?)?;
        }
        Some(("commitment", sub)) => {
            let (start, end) = window(sub)?;
            print_json(&open_ledger(config)?.voter_commitment(start, end, &net)?)?;
        }
        Some(("missed", _)) => {
            let missed = open_ledger(config)?.missed_rounds(&config.engine.delegate, u64::MAX)?;
            print_json(&missed)?;
        }
        Some(("scan", sub)) => {
            let (start, end) = window(sub)?;
            let addresses: Vec<String> = sub
                .get_many::<String>("addresses")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            print_json(&open_ledger(config)?.scan_addresses(&addresses, start, end, &net)?)?;
        }
        Some(("antibot", sub)) => {
            let (start, end) = window(sub)?;
            let store = open_ledger(config)?;
            print_json(&commands::antibot_report(&store, start, end, &net)?)?;
        }
        Some(("rollback", sub)) => {
            let height = sub
                .get_one::<u64>("height")
                .copied()
                .ok_or_else(|| anyhow!("rollback requires a height"))?;
            if !sub.get_flag("yes") {
                anyhow::bail!(
                    "Rolling back deletes ledger rows from the start of the round holding {height}; \
                     re-run with --yes to confirm"
                );
            }
            let _lock = DataDirLock::acquire(&config.data_dir, "rollback")?;
            let store = open_ledger(config)?;
            let target = commands::rollback(&store, height, &net)?;
            println!("Ledger rolled back to height {target}");
        }
        Some((other, _)) => warn!("Unknown subcommand {other}"),
        None => anyhow::bail!("No subcommand given"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let mut config = AppConfig::load(matches.get_one::<String>("config").map(String::as_str))?;
    apply_overrides(&matches, &mut config);
    config.validate()?;
    init_logging(&config)?;

    dispatch(&config, &matches).await
}

/// Exclusive advisory lock on the data directory, released on drop.
struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    fn acquire<P: AsRef<Path>>(data_dir: P, purpose: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(".forgeshare.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running engine or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};purpose={};started={}",
            std::process::id(),
            purpose,
            chrono::Utc::now().timestamp()
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_config(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join(name)
    }

    #[test]
    fn sample_config_is_valid() {
        let path = fixture_config("forgeshare.toml");
        let config = AppConfig::load(path.to_str()).unwrap();
        config.validate().unwrap();
        assert!(!config.engine.delegate.is_empty());
        assert!(config.plan_book().unwrap().first_allocating_plan().is_some());
    }

    #[test]
    fn cli_overrides_config_values() {
        let path = fixture_config("forgeshare.toml");
        let matches = cli().get_matches_from([
            "forgeshare",
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            "/tmp/forgeshare-test",
            "--log-format",
            "json",
            "pending",
        ]);
        let mut config = AppConfig::load(matches.get_one::<String>("config").map(String::as_str))
            .unwrap();
        apply_overrides(&matches, &mut config);
        assert_eq!(config.data_dir, "/tmp/forgeshare-test");
        assert_eq!(config.log_format, "json");
        assert_eq!(
            config.ledger_path(),
            Path::new("/tmp/forgeshare-test").join("ledger")
        );
    }

    #[test]
    fn rollback_arguments_parse() {
        let matches = cli().get_matches_from(["forgeshare", "rollback", "120", "--yes"]);
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "rollback");
        assert_eq!(sub.get_one::<u64>("height"), Some(&120));
        assert!(sub.get_flag("yes"));

        assert!(cli()
            .try_get_matches_from(["forgeshare", "ledger", "--height", "1", "--round", "1"])
            .is_err());
    }

    #[test]
    fn data_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DataDirLock::acquire(dir.path(), "test").unwrap();
        let err = DataDirLock::acquire(dir.path(), "second").err().unwrap();
        assert!(err.to_string().contains("locked by another process"));
        drop(lock);
        assert!(!dir.path().join(".forgeshare.lock").exists());
        DataDirLock::acquire(dir.path(), "third").unwrap();
    }
}
