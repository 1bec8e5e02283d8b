pub const FORGESHARE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}

pub fn version_line() -> String {
    format!(
        "forgeshare {} (commit {}, ledger schema v{})",
        FORGESHARE_VERSION,
        git_commit_hash(),
        LEDGER_SCHEMA_VERSION
    )
}
