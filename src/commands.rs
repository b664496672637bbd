use crate::cli::{Cli, Command};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::providers::Serialized;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suprsync_config::{Config, Mechanism};
use suprsync_engine::{CopyEngine, CopySettings, Daemon, DaemonSettings, FinalizeSettings, Finalizer};
use suprsync_store::models::{FileRecord, NewFile, Removal};
use suprsync_store::{Database, Repository, TimecodeScheme};
#[cfg(unix)]
use suprsync_transfer::{RsyncCopier, RsyncOptions};
use suprsync_transfer::{CopierHandle, LocalCopier};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load the configuration with command-line overrides on top.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut figment = suprsync_config::figment(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    if let Some(db) = &cli.db {
        figment = figment.merge(Serialized::default("db_path", db));
    }
    if let Some(archive) = &cli.archive {
        figment = figment.merge(Serialized::default("archive_name", archive));
    }
    Config::from_figment(figment).or_raise(|| ErrorKind::Config)
}

pub async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Run => run(&config).await,
        Command::Register { local, remote, keep } => {
            let (db, repo) = open(&config, true).await?;
            let record = repo
                .register(NewFile::new(local, remote, &config.archive_name).deletable(!keep))
                .await
                .or_raise(|| ErrorKind::Store)?;
            print_record(&record);
            db.close().await;
            Ok(())
        },
        Command::Check { file } => {
            let (db, repo) = open(&config, false).await?;
            let records = repo.find_by_local_path(&file).await.or_raise(|| ErrorKind::Store)?;
            if records.is_empty() {
                println!("{}: not registered", file.display());
            }
            records.iter().for_each(print_record);
            db.close().await;
            Ok(())
        },
        Command::Next => {
            let (db, repo) = open(&config, false).await?;
            let records = repo
                .copyable(&config.archive_name, Some(config.copy.max_attempts), config.copy.files_per_batch)
                .await
                .or_raise(|| ErrorKind::Store)?;
            for record in &records {
                println!("{}\t{}\t{}", record.id, record.local_path.display(), record.remote_path);
            }
            db.close().await;
            Ok(())
        },
        Command::List => {
            let (db, repo) = open(&config, false).await?;
            let records = repo.known_files(&config.archive_name).await.or_raise(|| ErrorKind::Store)?;
            records.iter().for_each(print_record);
            db.close().await;
            Ok(())
        },
        Command::AddLocalFiles { root, keep } => {
            let (db, repo) = open(&config, true).await?;
            let added = add_local_files(&repo, &config.archive_name, &root, keep).await;
            db.close().await;
            println!("registered {} files", added?);
            Ok(())
        },
        Command::Stats => {
            let (db, repo) = open(&config, false).await?;
            let stats = repo
                .archive_stats(&config.archive_name, Some(config.copy.max_attempts))
                .await
                .or_raise(|| ErrorKind::Store)?;
            db.close().await;
            let json = serde_json::to_string_pretty(&stats).or_raise(|| ErrorKind::Io)?;
            println!("{json}");
            Ok(())
        },
        Command::Retry { id } => {
            let (db, repo) = open(&config, false).await?;
            repo.reset_failed_attempts(id).await.or_raise(|| ErrorKind::Store)?;
            db.close().await;
            println!("record {id} will be retried");
            Ok(())
        },
        Command::SetDeletable { id, deletable } => {
            let (db, repo) = open(&config, false).await?;
            repo.set_deletable(id, deletable).await.or_raise(|| ErrorKind::Store)?;
            db.close().await;
            println!("record {id} deletable: {deletable}");
            Ok(())
        },
    }
}

fn timecodes(config: &Config) -> Result<TimecodeScheme> {
    match &config.finalize {
        Some(finalize) => {
            TimecodeScheme::new(finalize.bucket_width, finalize.digits).or_raise(|| ErrorKind::Config)
        },
        None => Ok(TimecodeScheme::default()),
    }
}

/// Open the store. Inspection commands never create one.
async fn open(config: &Config, create: bool) -> Result<(Database, Repository)> {
    let db = if create {
        Database::connect(&config.db_path).await
    } else {
        Database::connect_existing(&config.db_path).await
    }
    .or_raise(|| ErrorKind::Store)?;
    let repo = Repository::from(&db).with_checksum(config.remote.checksum).with_timecodes(timecodes(config)?);
    Ok((db, repo))
}

fn copier(config: &Config) -> Result<CopierHandle> {
    let remote = &config.remote;
    let copier: CopierHandle = match remote.resolved_mechanism() {
        #[cfg(unix)]
        Mechanism::Rsync => Arc::new(
            RsyncCopier::new(RsyncOptions {
                basedir: remote.basedir.clone(),
                ssh_host: remote.ssh_host.clone(),
                ssh_key: remote.ssh_key.clone(),
                compression: remote.compression,
                bwlimit: remote.bwlimit,
                checksum: remote.checksum,
            })
            .or_raise(|| ErrorKind::Copier)?,
        ),
        // Batches are staged as symlinks.
        #[cfg(not(unix))]
        Mechanism::Rsync => exn::bail!(ErrorKind::Copier),
        Mechanism::Local | Mechanism::Auto => {
            Arc::new(LocalCopier::new(&remote.basedir, remote.checksum).or_raise(|| ErrorKind::Copier)?)
        },
    };
    Ok(copier)
}

async fn run(config: &Config) -> Result<()> {
    let copier = copier(config)?;
    let (db, repo) = open(config, true).await?;
    let settings = CopySettings {
        max_attempts: Some(config.copy.max_attempts),
        files_per_batch: config.copy.files_per_batch,
        copy_timeout: config.copy.copy_timeout,
        cmd_timeout: config.copy.cmd_timeout,
    };
    let copy = CopyEngine::new(repo.clone(), copier.clone(), settings);
    let mut daemon_settings = DaemonSettings::new(&config.archive_name);
    daemon_settings.sleep_time = config.daemon.sleep_time;
    daemon_settings.delete_after = config.retention.delete_local_after;
    if let Some(finalize) = &config.finalize {
        daemon_settings.finalize_interval = finalize.interval;
    }
    let mut daemon = Daemon::new(repo.clone(), copy.clone(), daemon_settings);
    if let Some(finalize) = &config.finalize {
        let settings = FinalizeSettings {
            local_root: finalize.local_root.clone(),
            sync_id: finalize.sync_id.clone(),
            closure_lag: finalize.closure_lag,
        };
        daemon = daemon.with_finalizer(Finalizer::new(repo.clone(), copy, &config.archive_name, settings));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Could not listen for Ctrl-C");
            return;
        }
        info!("Interrupted; stopping after the current tick");
        on_signal.cancel();
    });

    info!(
        archive = %config.archive_name,
        destination = %copier.destination(),
        mechanism = copier.name(),
        "Starting sync daemon"
    );
    let result = daemon.run(cancel).await;
    db.close().await;
    result.or_raise(|| ErrorKind::Daemon)
}

/// Register every regular file below `root` that has no record yet. Remote
/// paths mirror the layout below `root`.
async fn add_local_files(repo: &Repository, archive: &str, root: &Path, keep: bool) -> Result<usize> {
    let root = std::path::absolute(root).or_raise(|| ErrorKind::Io)?;
    let mut pending = vec![root.clone()];
    let mut files: Vec<PathBuf> = Vec::new();
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.or_raise(|| ErrorKind::Io)?;
        while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io)? {
            let file_type = entry.file_type().await.or_raise(|| ErrorKind::Io)?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();

    let mut added = 0;
    for path in files {
        if !repo.find_by_local_path(&path).await.or_raise(|| ErrorKind::Store)?.is_empty() {
            continue;
        }
        let Some(remote) = path.strip_prefix(&root).ok().and_then(Path::to_str).map(str::to_string) else {
            warn!(path = %path.display(), "Skipping file with a non UTF-8 path");
            continue;
        };
        match repo.register(NewFile::new(&path, remote, archive).deletable(!keep)).await {
            Ok(record) => {
                info!(id = record.id, path = %path.display(), "Registered");
                added += 1;
            },
            // Files can disappear while the directory is being walked.
            Err(err) if matches!(&*err, suprsync_store::error::ErrorKind::Unreadable(_)) => {
                warn!(path = %path.display(), error = ?err, "Skipping unreadable file");
            },
            Err(err) => return Err(err.raise(ErrorKind::Store)),
        }
    }
    Ok(added)
}

fn print_record(record: &FileRecord) {
    let state = match (record.is_copied(), record.removed_at) {
        (_, Some(Removal::AlreadyGone)) => "copied, local file vanished".to_string(),
        (_, Some(Removal::At(at))) => format!("copied, local file removed at {at}"),
        (true, None) => format!("copied at {}", record.copied_at.map(|t| t.to_string()).unwrap_or_default()),
        (false, None) if record.remote_checksum.is_some() => "remote checksum mismatch".to_string(),
        (false, None) => "pending".to_string(),
    };
    println!(
        "{id}\t{local}\t{archive}/{remote}\t{state}\tattempts={attempts}\tdeletable={deletable}",
        id = record.id,
        local = record.local_path.display(),
        archive = record.archive_name,
        remote = record.remote_path,
        attempts = record.failed_attempts,
        deletable = record.deletable,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::ffi::OsString;

    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("suprsync.toml");
        let contents = format!(
            "archive_name = \"timestreams\"\ndb_path = \"{}\"\n[remote]\nbasedir = \"{}\"\n",
            dir.join("state.db").display(),
            dir.join("archive").display(),
        );
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_cli_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let args: Vec<OsString> =
            vec!["suprsync".into(), "--config".into(), config.into(), "--archive".into(), "ancillary".into(), "stats".into()];
        let cli = Cli::parse_from(args);
        let loaded = load_config(&cli).unwrap();
        assert_eq!(loaded.archive_name, "ancillary");
        assert_eq!(loaded.db_path, dir.path().join("state.db"));
    }

    #[tokio::test]
    async fn test_add_local_files_skips_known() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(root.join("17145/sat1")).unwrap();
        std::fs::write(root.join("17145/sat1/a.g3"), b"a").unwrap();
        std::fs::write(root.join("17145/b.g3"), b"b").unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);

        assert_eq!(add_local_files(&repo, "timestreams", &root, false).await.unwrap(), 2);
        assert_eq!(add_local_files(&repo, "timestreams", &root, false).await.unwrap(), 0);
        let mut remotes: Vec<_> =
            repo.known_files("timestreams").await.unwrap().into_iter().map(|r| r.remote_path).collect();
        remotes.sort();
        assert_eq!(remotes, ["17145/b.g3", "17145/sat1/a.g3"]);
        db.close().await;
    }
}
