//! Command-line entry point of the backup manager.

use std::collections::HashMap;
use std::process::ExitCode as ProcessExitCode;

use anyhow::Context;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use postgres_ffi::ControlFileData;
use utils::logging::{self, LogFormat};
use utils::lsn::Lsn;

use walbak::archive::{self, ArchivePushOptions};
use walbak::backup::{self, BackupOptions};
use walbak::catalog::{BackupFilter, BackupId, BackupMode, Catalog, CompressAlg};
use walbak::checkdb::{self, CheckdbOptions};
use walbak::config::{CatalogPaths, InstanceConfig, RunContext};
use walbak::delete::{self, DeleteOptions};
use walbak::error::{classify_error, ExitCode};
use walbak::merge;
use walbak::node::NodeClient;
use walbak::restore::{self, IncrementalMode, RecoveryTargetSpec, RestoreOptions};
use walbak::show;
use walbak::validate;
use walbak::walscan::ScanTarget;

#[derive(Parser)]
#[command(
    name = "walbak",
    about = "Physical backup and point-in-time recovery manager for PostgreSQL",
    version = walbak::program_version(),
)]
struct Cli {
    /// Catalog root directory.
    #[arg(short = 'B', long, env = "WALBAK_BACKUP_PATH", global = true, default_value = ".")]
    backup_path: Utf8PathBuf,

    /// Instance name inside the catalog.
    #[arg(long, env = "WALBAK_INSTANCE", global = true, default_value = "main")]
    instance: String,

    /// Number of worker threads.
    #[arg(short = 'j', long, global = true)]
    threads: Option<usize>,

    /// Do not fsync backup files (faster, unsafe across power loss).
    #[arg(long, global = true)]
    no_sync: bool,

    /// Log output format.
    #[arg(long, global = true, default_value = "plain")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliBackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
}

impl From<CliBackupMode> for BackupMode {
    fn from(mode: CliBackupMode) -> BackupMode {
        match mode {
            CliBackupMode::Full => BackupMode::Full,
            CliBackupMode::Page => BackupMode::Page,
            CliBackupMode::Ptrack => BackupMode::Ptrack,
            CliBackupMode::Delta => BackupMode::Delta,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliIncrementalMode {
    None,
    Checksum,
    Lsn,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty catalog.
    Init,
    /// Register a database cluster to back up.
    AddInstance {
        /// Data directory of the cluster (absolute).
        #[arg(short = 'D', long)]
        pgdata: Utf8PathBuf,
        /// Directories outside the data directory to include in backups.
        #[arg(long = "external-dir")]
        external_dirs: Vec<Utf8PathBuf>,
    },
    /// Take a backup.
    Backup {
        #[arg(short = 'b', long = "backup-mode", value_enum)]
        mode: CliBackupMode,
        /// libpq connection string of the cluster.
        #[arg(short = 'd', long, default_value = "host=/tmp user=postgres")]
        connstr: String,
        /// Bundle the needed WAL inside the backup.
        #[arg(long)]
        stream: bool,
        /// Compress stored files (deflate).
        #[arg(long)]
        compress: bool,
        #[arg(long, default_value_t = 1)]
        compress_level: u32,
        /// Free-form note stored with the backup.
        #[arg(long)]
        note: Option<String>,
        /// Skip the validation pass after the backup.
        #[arg(long)]
        no_validate: bool,
    },
    /// Restore a backup into a data directory.
    Restore {
        #[arg(short = 'D', long)]
        pgdata: Utf8PathBuf,
        /// Backup to restore; default is the newest OK backup.
        #[arg(short = 'i', long = "backup-id")]
        backup_id: Option<BackupId>,
        #[arg(long, value_enum, default_value = "none")]
        incremental_mode: CliIncrementalMode,
        #[arg(long)]
        recovery_target: Option<String>,
        #[arg(long)]
        recovery_target_lsn: Option<Lsn>,
        #[arg(long)]
        recovery_target_xid: Option<u32>,
        #[arg(long)]
        recovery_target_time: Option<DateTime<Utc>>,
        #[arg(long)]
        recovery_target_name: Option<String>,
        /// Restore only these database OIDs (shared files always restored).
        #[arg(long = "db-include")]
        db_include: Vec<u32>,
        /// Replace these databases' files with empty placeholders.
        #[arg(long = "db-exclude")]
        db_exclude: Vec<u32>,
        /// Remap external directory N to PATH, as N=PATH.
        #[arg(long = "external-mapping")]
        external_mapping: Vec<String>,
        /// restore_command to write into the recovery configuration.
        #[arg(long)]
        restore_command: Option<String>,
        #[arg(long)]
        no_validate: bool,
        /// Allow cleaning a non-empty destination.
        #[arg(long)]
        force: bool,
    },
    /// Validate a backup's files and WAL.
    Validate {
        #[arg(short = 'i', long = "backup-id")]
        backup_id: BackupId,
        #[arg(long)]
        recovery_target_lsn: Option<Lsn>,
        #[arg(long)]
        recovery_target_xid: Option<u32>,
        #[arg(long)]
        recovery_target_time: Option<DateTime<Utc>>,
        #[arg(long)]
        recovery_target_name: Option<String>,
    },
    /// Merge an incremental backup into its FULL ancestor.
    Merge {
        #[arg(short = 'i', long = "backup-id")]
        backup_id: BackupId,
    },
    /// Delete a backup; its descendants become orphans.
    Delete {
        #[arg(short = 'i', long = "backup-id")]
        backup_id: BackupId,
        /// Also prune archived WAL nothing needs any more.
        #[arg(long = "wal")]
        prune_wal: bool,
    },
    /// Pin or unpin a backup against deletion.
    SetBackup {
        #[arg(short = 'i', long = "backup-id")]
        backup_id: BackupId,
        /// Pin for this long from now (e.g. "30d", "12h").
        #[arg(long)]
        ttl: Option<humantime::Duration>,
        /// Pin until this moment.
        #[arg(long)]
        expire_time: Option<DateTime<Utc>>,
    },
    /// List backups, or show one backup in detail.
    Show {
        #[arg(short = 'i', long = "backup-id")]
        backup_id: Option<BackupId>,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// archive_command helper: store one WAL file into the catalog.
    ArchivePush {
        #[arg(long)]
        wal_file_path: Utf8PathBuf,
        #[arg(long)]
        wal_file_name: String,
        #[arg(long)]
        compress: bool,
        #[arg(long, default_value_t = 1)]
        compress_level: u32,
        #[arg(long)]
        overwrite: bool,
    },
    /// restore_command helper: fetch one WAL file from the catalog.
    ArchiveGet {
        #[arg(long)]
        wal_file_name: String,
        #[arg(long)]
        wal_file_path: Utf8PathBuf,
    },
    /// Page-level (and optionally index-level) scan of a live cluster.
    Checkdb {
        /// Verify btree indexes through amcheck.
        #[arg(long)]
        amcheck: bool,
        #[arg(short = 'd', long)]
        connstr: Option<String>,
    },
}

fn main() -> ProcessExitCode {
    let cli = Cli::parse();

    let log_format = match LogFormat::from_config(&cli.log_format) {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{e:#}");
            return ProcessExitCode::from(ExitCode::ArgumentError as u8);
        }
    };
    if let Err(e) = logging::init(log_format) {
        eprintln!("failed to initialize logging: {e:#}");
        return ProcessExitCode::from(ExitCode::Failure as u8);
    }
    logging::replace_panic_hook_with_tracing_panic_hook();

    let threads = cli.threads.unwrap_or_else(num_cpus::get);
    let mut ctx = RunContext::new(threads);
    ctx.no_sync = cli.no_sync;

    // Workers poll this flag at every per-file and per-page boundary.
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, ctx.interrupt_flag()) {
            eprintln!("failed to install signal handler: {e}");
            return ProcessExitCode::from(ExitCode::Failure as u8);
        }
    }

    match run(cli, &ctx) {
        Ok(()) => ProcessExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ProcessExitCode::from(classify_error(&e) as i32 as u8)
        }
    }
}

fn load_instance(catalog: &Catalog) -> anyhow::Result<InstanceConfig> {
    InstanceConfig::load(&catalog.paths.instance_config_path())
        .context("instance is not registered; run add-instance first")
}

fn run(cli: Cli, ctx: &RunContext) -> anyhow::Result<()> {
    let paths = CatalogPaths::new(cli.backup_path.clone(), cli.instance.clone());
    let catalog = Catalog::open(paths);

    match cli.command {
        Command::Init => {
            utils::crashsafe::create_dir_all(&cli.backup_path.join("backups"))?;
            utils::crashsafe::create_dir_all(&cli.backup_path.join("wal"))?;
            println!("catalog initialized at {}", cli.backup_path);
            Ok(())
        }

        Command::AddInstance {
            pgdata,
            external_dirs,
        } => {
            anyhow::ensure!(pgdata.is_absolute(), "pgdata path '{pgdata}' must be absolute");
            let control_path = pgdata.join(walbak::PG_CONTROL_PATH);
            let control_bytes = std::fs::read(&control_path)
                .with_context(|| format!("read {control_path}; is this a data directory?"))?;
            let control = ControlFileData::decode(&control_bytes)?;

            utils::crashsafe::create_dir_all(&catalog.paths.backups_dir())?;
            utils::crashsafe::create_dir_all(&catalog.paths.wal_dir())?;
            let instance = InstanceConfig {
                pgdata,
                system_identifier: control.system_identifier,
                block_size: control.blcksz,
                xlog_block_size: control.xlog_blcksz,
                wal_seg_size: control.xlog_seg_size,
                external_dirs,
                archive_timeout: walbak::config::DEFAULT_ARCHIVE_TIMEOUT,
            };
            instance.save(&catalog.paths.instance_config_path())?;
            println!(
                "instance '{}' registered (system id {:#x})",
                cli.instance, control.system_identifier
            );
            Ok(())
        }

        Command::Backup {
            mode,
            connstr,
            stream,
            compress,
            compress_level,
            note,
            no_validate,
        } => {
            let instance = load_instance(&catalog)?;
            let mut node = NodeClient::connect(&connstr)?;
            let options = BackupOptions {
                mode: mode.into(),
                stream,
                compress_alg: if compress {
                    CompressAlg::Zlib
                } else {
                    CompressAlg::None
                },
                compress_level,
                note,
                no_validate,
            };
            let id = backup::do_backup(&catalog, &instance, &mut node, &options, ctx)?;
            println!("backup {id} completed");
            Ok(())
        }

        Command::Restore {
            pgdata,
            backup_id,
            incremental_mode,
            recovery_target,
            recovery_target_lsn,
            recovery_target_xid,
            recovery_target_time,
            recovery_target_name,
            db_include,
            db_exclude,
            external_mapping,
            restore_command,
            no_validate,
            force,
        } => {
            let instance = load_instance(&catalog)?;
            let target = parse_recovery_target(
                recovery_target.as_deref(),
                recovery_target_lsn,
                recovery_target_xid,
                recovery_target_time,
                recovery_target_name,
            )?;
            let options = RestoreOptions {
                backup_id,
                target,
                incremental: match incremental_mode {
                    CliIncrementalMode::None => IncrementalMode::None,
                    CliIncrementalMode::Checksum => IncrementalMode::Checksum,
                    CliIncrementalMode::Lsn => IncrementalMode::Lsn,
                },
                db_include,
                db_exclude,
                external_remap: parse_external_mappings(&external_mapping)?,
                restore_command,
                no_validate,
                force,
            };

            // A point-in-time target must be reachable before we touch the
            // destination at all.
            if options.target != RecoveryTargetSpec::Latest
                && options.target != RecoveryTargetSpec::Immediate
            {
                if let Some(id) = options.backup_id {
                    let backup = catalog.read_backup(id)?;
                    restore::check_target_reachable(&catalog, &instance, &backup, &options.target, ctx)?;
                }
            }

            let summary = restore::do_restore(&catalog, &instance, &pgdata, &options, ctx)?;
            println!(
                "restored {} files into {pgdata} ({} datafile bytes written)",
                summary.files_restored, summary.datafile_bytes_written
            );
            Ok(())
        }

        Command::Validate {
            backup_id,
            recovery_target_lsn,
            recovery_target_xid,
            recovery_target_time,
            recovery_target_name,
        } => {
            let target = scan_target(
                recovery_target_lsn,
                recovery_target_xid,
                recovery_target_time,
                recovery_target_name,
            )?;
            validate::validate_backup(&catalog, backup_id, target.as_ref(), ctx)?;
            println!("backup {backup_id} is valid");
            Ok(())
        }

        Command::Merge { backup_id } => {
            let merged = merge::do_merge(&catalog, backup_id, ctx)?;
            println!("merged into {merged}");
            Ok(())
        }

        Command::Delete {
            backup_id,
            prune_wal,
        } => delete::do_delete(
            &catalog,
            &DeleteOptions {
                backup_id,
                prune_wal,
            },
            ctx,
        ),

        Command::SetBackup {
            backup_id,
            ttl,
            expire_time,
        } => delete::do_set_backup(
            &catalog,
            backup_id,
            ttl.map(|d| chrono::Duration::from_std(d.into()).unwrap_or(chrono::Duration::MAX)),
            expire_time,
        ),

        Command::Show { backup_id, format } => {
            let output = match (backup_id, format.as_str()) {
                (Some(id), "json") => show::show_backup_json(&catalog, id)?,
                (Some(id), "table") => {
                    let filter = BackupFilter {
                        since: Some(id),
                        until: Some(id),
                        statuses: None,
                    };
                    show::show_instance(&catalog, &filter)?
                }
                (None, "json") => anyhow::bail!("--format=json needs --backup-id"),
                (None, _) => show::show_instance(&catalog, &BackupFilter::default())?,
                (_, other) => anyhow::bail!("unknown show format '{other}'"),
            };
            println!("{output}");
            Ok(())
        }

        Command::ArchivePush {
            wal_file_path,
            wal_file_name,
            compress,
            compress_level,
            overwrite,
        } => archive::do_archive_push(
            &catalog,
            &wal_file_path,
            &wal_file_name,
            &ArchivePushOptions {
                compress,
                compress_level,
                overwrite,
            },
            ctx,
        ),

        Command::ArchiveGet {
            wal_file_name,
            wal_file_path,
        } => archive::do_archive_get(&catalog, &wal_file_name, &wal_file_path, ctx),

        Command::Checkdb { amcheck, connstr } => {
            let instance = load_instance(&catalog)?;
            let mut node = match connstr {
                Some(connstr) => Some(NodeClient::connect(&connstr)?),
                None => None,
            };
            let report = checkdb::do_checkdb(
                &instance,
                node.as_mut(),
                &CheckdbOptions { amcheck },
                ctx,
            )?;
            for (path, blkno, reason) in &report.bad_pages {
                println!("CORRUPT {path} block {blkno}: {reason}");
            }
            for index in &report.corrupt_indexes {
                println!("CORRUPT index {index}");
            }
            anyhow::ensure!(
                report.is_clean(),
                "checkdb found {} corrupt pages and {} corrupt indexes",
                report.bad_pages.len(),
                report.corrupt_indexes.len()
            );
            println!(
                "checkdb: {} files, {} pages, no corruption",
                report.files_scanned, report.pages_scanned
            );
            Ok(())
        }
    }
}

fn parse_recovery_target(
    keyword: Option<&str>,
    lsn: Option<Lsn>,
    xid: Option<u32>,
    time: Option<DateTime<Utc>>,
    name: Option<String>,
) -> anyhow::Result<RecoveryTargetSpec> {
    let explicit = [
        lsn.map(RecoveryTargetSpec::Lsn),
        xid.map(RecoveryTargetSpec::Xid),
        time.map(RecoveryTargetSpec::Time),
        name.map(RecoveryTargetSpec::Name),
        match keyword {
            None => None,
            Some("latest") => Some(RecoveryTargetSpec::Latest),
            Some("immediate") => Some(RecoveryTargetSpec::Immediate),
            Some(other) => anyhow::bail!(
                "unknown --recovery-target '{other}' (expected 'latest' or 'immediate')"
            ),
        },
    ];
    let mut targets = explicit.into_iter().flatten();
    let target = targets.next().unwrap_or_default();
    anyhow::ensure!(
        targets.next().is_none(),
        "more than one recovery target specified"
    );
    Ok(target)
}

fn scan_target(
    lsn: Option<Lsn>,
    xid: Option<u32>,
    time: Option<DateTime<Utc>>,
    name: Option<String>,
) -> anyhow::Result<Option<ScanTarget>> {
    match parse_recovery_target(None, lsn, xid, time, name)? {
        RecoveryTargetSpec::Latest => Ok(None),
        RecoveryTargetSpec::Immediate => Ok(None),
        RecoveryTargetSpec::Lsn(lsn) => Ok(Some(ScanTarget::Lsn(lsn))),
        RecoveryTargetSpec::Xid(xid) => Ok(Some(ScanTarget::Xid(xid))),
        RecoveryTargetSpec::Time(time) => Ok(Some(ScanTarget::Time(
            (time.timestamp() - postgres_ffi::PG_EPOCH_OFFSET_SECS) * 1_000_000,
        ))),
        RecoveryTargetSpec::Name(name) => Ok(Some(ScanTarget::Name(name))),
    }
}

fn parse_external_mappings(raw: &[String]) -> anyhow::Result<HashMap<u32, Utf8PathBuf>> {
    let mut mappings = HashMap::new();
    for spec in raw {
        let (num, path) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("bad --external-mapping '{spec}', expected N=PATH"))?;
        let num: u32 = num
            .parse()
            .with_context(|| format!("bad external directory number in '{spec}'"))?;
        mappings.insert(num, Utf8PathBuf::from(path));
    }
    Ok(mappings)
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}
