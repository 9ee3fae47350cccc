//! revfs administration CLI

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use revfs_core::{
    AccessContext, CancelToken, DeltificationConfig, Filesystem, FsConfig, Revnum, TxnId,
    svn_props,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "revfs-admin")]
#[command(author = "revfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "revfs filesystem administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty filesystem
    Create {
        path: PathBuf,
        /// Revisions per shard
        #[arg(long, default_value_t = 1000)]
        shard_size: u64,
        /// Store every file revision as a fulltext
        #[arg(long)]
        no_deltas: bool,
    },

    /// Show identity, youngest revision and configuration
    Info { path: PathBuf },

    /// Check revision containers, indexes and representations
    Verify {
        path: PathBuf,
        #[arg(short, long)]
        start: Option<Revnum>,
        #[arg(short, long)]
        end: Option<Revnum>,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Pack every complete shard
    Pack { path: PathBuf },

    /// Regenerate the indexes of the container holding a revision
    RebuildIndex { path: PathBuf, revision: Revnum },

    /// Publish revisions left behind by an interrupted commit
    Recover { path: PathBuf },

    /// List locks on a path and everything below it
    Lslocks {
        path: PathBuf,
        #[arg(default_value = "/")]
        under: String,
    },

    /// Remove locks regardless of owner
    Rmlocks {
        path: PathBuf,
        #[arg(required = true)]
        locked: Vec<String>,
    },

    /// List uncommitted transactions
    Lstxns { path: PathBuf },

    /// Remove uncommitted transactions
    Rmtxns {
        path: PathBuf,
        #[arg(required = true)]
        txns: Vec<String>,
    },

    /// Read or change revision properties
    Revprop {
        #[command(subcommand)]
        action: RevpropAction,
    },
}

#[derive(Subcommand, Debug)]
enum RevpropAction {
    /// Print one revision property
    Get {
        path: PathBuf,
        revision: Revnum,
        name: String,
    },
    /// Set (or with --delete, remove) a revision property
    Set {
        path: PathBuf,
        revision: Revnum,
        name: String,
        value: Option<String>,
        #[arg(long)]
        delete: bool,
    },
    /// List the properties of a revision
    List { path: PathBuf, revision: Revnum },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Create {
            path,
            shard_size,
            no_deltas,
        } => cmd_create(&path, shard_size, no_deltas),
        Commands::Info { path } => cmd_info(&path),
        Commands::Verify {
            path,
            start,
            end,
            quiet,
        } => cmd_verify(&path, start, end, quiet),
        Commands::Pack { path } => cmd_pack(&path),
        Commands::RebuildIndex { path, revision } => cmd_rebuild_index(&path, revision),
        Commands::Recover { path } => cmd_recover(&path),
        Commands::Lslocks { path, under } => cmd_lslocks(&path, &under),
        Commands::Rmlocks { path, locked } => cmd_rmlocks(&path, &locked),
        Commands::Lstxns { path } => cmd_lstxns(&path),
        Commands::Rmtxns { path, txns } => cmd_rmtxns(&path, &txns),
        Commands::Revprop { action } => match action {
            RevpropAction::Get {
                path,
                revision,
                name,
            } => cmd_revprop_get(&path, revision, &name),
            RevpropAction::Set {
                path,
                revision,
                name,
                value,
                delete,
            } => cmd_revprop_set(&path, revision, &name, value.as_deref(), delete),
            RevpropAction::List { path, revision } => cmd_revprop_list(&path, revision),
        },
    }
}

fn open(path: &Path) -> Result<Filesystem> {
    Filesystem::open(path).map_err(|e| anyhow!("cannot open filesystem at {}: {}", path.display(), e))
}

fn cmd_create(path: &Path, shard_size: u64, no_deltas: bool) -> Result<()> {
    if shard_size == 0 {
        bail!("shard size must be at least 1");
    }
    let config = FsConfig {
        shard_size,
        deltification: DeltificationConfig {
            enabled: !no_deltas,
            ..DeltificationConfig::default()
        },
        ..FsConfig::default()
    };
    let fs = Filesystem::create(path, &config)?;
    println!("Filesystem created at {} (UUID: {})", path.display(), fs.uuid());
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let fs = open(path)?;
    let metadata = fs.metadata();
    println!("Path: {}", fs.path().display());
    println!("UUID: {}", metadata.uuid);
    println!("Format: {}", metadata.format);
    println!("Created: {}", metadata.created_at);
    println!("Shard size: {}", metadata.shard_size);
    let youngest = fs.youngest_rev()?;
    println!("Youngest revision: {}", youngest);
    if let Some(date) = fs.revision_prop(youngest, svn_props::DATE)? {
        println!("Last changed: {}", display_prop(svn_props::DATE, &date));
    }
    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(fs.config())?);
    for (name, stats) in fs.cache_stats() {
        println!(
            "Cache {}: {} entries, {} bytes, {} hits, {} misses",
            name, stats.entries, stats.bytes, stats.hits, stats.misses
        );
    }
    Ok(())
}

fn cmd_verify(path: &Path, start: Option<Revnum>, end: Option<Revnum>, quiet: bool) -> Result<()> {
    let fs = open(path)?;
    let head = fs.youngest_rev()?;
    let start = start.unwrap_or(0);
    let end = end.unwrap_or(head).min(head);
    if !quiet {
        println!("Verifying {}", path.display());
        println!("  Revisions: {} to {}", start, end);
    }

    let report = fs.verify(start, end, &CancelToken::never())?;
    for issue in &report.issues {
        eprintln!("  ERROR: r{}: {}", issue.revision, issue.message);
    }
    if !quiet {
        println!(
            "  Checked {} revisions, {} items",
            report.revisions_checked, report.items_checked
        );
    }
    if !report.is_ok() {
        bail!("verification found {} problem(s)", report.issues.len());
    }
    if !quiet {
        println!("No problems found");
    }
    Ok(())
}

fn cmd_pack(path: &Path) -> Result<()> {
    let fs = open(path)?;
    let shards = fs.pack(&CancelToken::never())?;
    if shards.is_empty() {
        println!("Nothing to pack");
    }
    for shard in shards {
        println!("Packed shard {}", shard);
    }
    Ok(())
}

fn cmd_rebuild_index(path: &Path, revision: Revnum) -> Result<()> {
    let fs = open(path)?;
    let items = fs.rebuild_index(revision)?;
    println!("Rebuilt index for r{} ({} items)", revision, items);
    Ok(())
}

fn cmd_recover(path: &Path) -> Result<()> {
    let fs = open(path)?;
    let before = fs.youngest_rev()?;
    let after = fs.recover()?;
    if after == before {
        println!("Youngest revision is r{}; nothing to recover", after);
    } else {
        println!("Recovered r{} to r{}", before + 1, after);
    }
    Ok(())
}

fn cmd_lslocks(path: &Path, under: &str) -> Result<()> {
    let fs = open(path)?;
    for lock in fs.get_locks_under(under, &CancelToken::never())? {
        println!("Path: {}", lock.path);
        println!("UUID Token: {}", lock.token);
        println!("Owner: {}", lock.owner);
        println!("Created: {}", lock.creation_date.to_rfc3339());
        match lock.expiration_date {
            Some(expires) => println!("Expires: {}", expires.to_rfc3339()),
            None => println!("Expires: never"),
        }
        if let Some(comment) = &lock.comment {
            println!("Comment: {}", comment);
        }
        println!();
    }
    Ok(())
}

fn cmd_rmlocks(path: &Path, locked: &[String]) -> Result<()> {
    let fs = open(path)?;
    let admin = AccessContext::anonymous();
    for locked_path in locked {
        fs.unlock(locked_path, "", true, &admin)?;
        println!("Removed lock on '{}'", locked_path);
    }
    Ok(())
}

fn cmd_lstxns(path: &Path) -> Result<()> {
    let fs = open(path)?;
    for txn in fs.list_transactions()? {
        println!("{}", txn);
    }
    Ok(())
}

fn cmd_rmtxns(path: &Path, txns: &[String]) -> Result<()> {
    let fs = open(path)?;
    for name in txns {
        let id: TxnId = name
            .parse()
            .map_err(|_| anyhow!("invalid transaction id '{}'", name))?;
        fs.purge_txn(id)?;
        println!("Transaction '{}' removed", id);
    }
    Ok(())
}

fn cmd_revprop_get(path: &Path, revision: Revnum, name: &str) -> Result<()> {
    let fs = open(path)?;
    match fs.revision_prop(revision, name)? {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => bail!("property '{}' not found on r{}", name, revision),
    }
    Ok(())
}

fn cmd_revprop_set(
    path: &Path,
    revision: Revnum,
    name: &str,
    value: Option<&str>,
    delete: bool,
) -> Result<()> {
    let fs = open(path)?;
    let value = match (value, delete) {
        (Some(_), true) => bail!("give either a value or --delete, not both"),
        (None, false) => bail!("a value is required unless --delete is given"),
        (value, _) => value.map(str::as_bytes),
    };
    fs.change_rev_prop(revision, name, value, None)?;
    match value {
        Some(_) => println!("Set '{}' on r{}", name, revision),
        None => println!("Deleted '{}' from r{}", name, revision),
    }
    Ok(())
}

fn cmd_revprop_list(path: &Path, revision: Revnum) -> Result<()> {
    let fs = open(path)?;
    for (name, value) in fs.revision_proplist(revision)?.iter() {
        println!("  {}: {}", name, display_prop(name, value));
    }
    Ok(())
}

/// `svn:date` is stored as RFC 3339 UTC; show it in the local time zone
fn display_prop(name: &str, value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    if name != svn_props::DATE {
        return text.into_owned();
    }
    match chrono::DateTime::parse_from_rfc3339(&text) {
        Ok(date) => date
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S %z")
            .to_string(),
        Err(_) => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revfs_core::{LockRequest, TxnFlags};
    use tempfile::TempDir;

    fn created() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("repo");
        cmd_create(&path, 4, false).unwrap();
        (temp_dir, path)
    }

    fn add_file(fs: &Filesystem, name: &str) {
        let txn = fs.begin_txn(fs.youngest_rev().unwrap(), TxnFlags::default()).unwrap();
        txn.root().make_file(name).unwrap();
        txn.commit(&AccessContext::anonymous(), &CancelToken::never())
            .unwrap();
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["revfs-admin", "verify", "/tmp/repo", "-s", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { start: Some(2), .. }));
        let cli = Cli::try_parse_from([
            "revfs-admin",
            "revprop",
            "set",
            "/tmp/repo",
            "3",
            "svn:log",
            "--delete",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Revprop {
                action: RevpropAction::Set { delete: true, .. }
            }
        ));
        assert!(Cli::try_parse_from(["revfs-admin", "rmtxns", "/tmp/repo"]).is_err());
    }

    #[test]
    fn test_display_prop_formats_dates() {
        assert_eq!(display_prop(svn_props::LOG, b"message"), "message");
        assert_eq!(display_prop(svn_props::DATE, b"not a date"), "not a date");

        let shown = display_prop(svn_props::DATE, b"2024-03-01T12:30:00+00:00");
        let expected = chrono::DateTime::parse_from_rfc3339("2024-03-01T12:30:00+00:00")
            .unwrap()
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S %z")
            .to_string();
        assert_eq!(shown, expected);
        assert!(!shown.contains('T'));
    }

    #[test]
    fn test_create_rejects_zero_shard_size() {
        let temp_dir = TempDir::new().unwrap();
        assert!(cmd_create(&temp_dir.path().join("repo"), 0, false).is_err());
    }

    #[test]
    fn test_admin_commands() {
        let (_temp_dir, path) = created();
        let fs = open(&path).unwrap();
        for i in 0..4 {
            add_file(&fs, &format!("/f{}", i));
        }
        cmd_info(&path).unwrap();
        cmd_verify(&path, None, None, true).unwrap();
        cmd_pack(&path).unwrap();
        assert!(path.join("revs").join("0.pack").exists());
        cmd_rebuild_index(&path, 2).unwrap();
        cmd_recover(&path).unwrap();
        cmd_verify(&path, None, None, true).unwrap();
    }

    #[test]
    fn test_lock_and_txn_removal() {
        let (_temp_dir, path) = created();
        let fs = open(&path).unwrap();
        add_file(&fs, "/f");
        fs.lock("/f", LockRequest::default(), &AccessContext::new("alice"))
            .unwrap();
        cmd_lslocks(&path, "/").unwrap();
        cmd_rmlocks(&path, &["/f".to_string()]).unwrap();
        assert!(fs.get_lock("/f").unwrap().is_none());

        let txn = fs.begin_txn(1, TxnFlags::default()).unwrap();
        cmd_lstxns(&path).unwrap();
        cmd_rmtxns(&path, &[txn.id().to_string()]).unwrap();
        assert!(fs.list_transactions().unwrap().is_empty());
        assert!(cmd_rmtxns(&path, &["bogus".to_string()]).is_err());
    }

    #[test]
    fn test_revprop_commands() {
        let (_temp_dir, path) = created();
        cmd_revprop_set(&path, 0, svn_props::LOG, Some("initial"), false).unwrap();
        let fs = open(&path).unwrap();
        assert_eq!(
            fs.revision_prop(0, svn_props::LOG).unwrap(),
            Some(b"initial".to_vec())
        );
        cmd_revprop_get(&path, 0, svn_props::LOG).unwrap();
        cmd_revprop_list(&path, 0).unwrap();
        cmd_revprop_set(&path, 0, svn_props::LOG, None, true).unwrap();
        assert!(cmd_revprop_get(&path, 0, svn_props::LOG).is_err());
        assert!(cmd_revprop_set(&path, 0, svn_props::LOG, None, false).is_err());
    }
}
