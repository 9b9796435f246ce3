//! The database server interface: start/stop backup, WAL switching, and the
//! small read-only query surface (database map, tablespaces, ptrack).
//!
//! The exclusive vs. non-exclusive backup protocol differs by server
//! version; both live behind [`BackupControl`] so the orchestrator sees one
//! interface. The tool opens at most two connections: this control
//! connection and (optionally) a replication connection owned by an external
//! WAL-streaming helper.

use anyhow::Context;
use chrono::{DateTime, Utc};
use postgres::types::PgLsn;
use postgres::{Client, NoTls};
use tracing::info;
use utils::bitmap::BlockBitmap;
use utils::lsn::Lsn;

use postgres_ffi::Oid;

#[derive(Debug, Clone, Copy)]
pub struct StopBackupInfo {
    pub stop_lsn: Lsn,
    pub stop_time: DateTime<Utc>,
}

/// The version-dependent part of the backup protocol.
pub trait BackupControl: Send {
    fn name(&self) -> &'static str;
    fn start_backup(&self, client: &mut Client, label: &str) -> anyhow::Result<Lsn>;
    fn stop_backup(&self, client: &mut Client) -> anyhow::Result<StopBackupInfo>;
    /// Best-effort abort used by error cleanup. Must not fail the cleanup
    /// path itself.
    fn cancel_backup(&self, client: &mut Client);
}

/// Non-exclusive backups, servers 9.6..=14: `pg_start_backup(label, fast,
/// false)` / `pg_stop_backup(false)`.
pub struct NonExclusiveBackup;

impl BackupControl for NonExclusiveBackup {
    fn name(&self) -> &'static str {
        "non-exclusive"
    }

    fn start_backup(&self, client: &mut Client, label: &str) -> anyhow::Result<Lsn> {
        let row = client
            .query_one(
                "SELECT pg_start_backup($1, true, false)",
                &[&label],
            )
            .context("pg_start_backup")?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(lsn.into()))
    }

    fn stop_backup(&self, client: &mut Client) -> anyhow::Result<StopBackupInfo> {
        let row = client
            .query_one(
                "SELECT lsn, now() FROM pg_stop_backup(false) AS t(lsn, labelfile, spcmapfile)",
                &[],
            )
            .context("pg_stop_backup")?;
        let lsn: PgLsn = row.get(0);
        let stop_time: DateTime<Utc> = row.get(1);
        Ok(StopBackupInfo {
            stop_lsn: Lsn(lsn.into()),
            stop_time,
        })
    }

    fn cancel_backup(&self, client: &mut Client) {
        if let Err(e) = client.simple_query("SELECT pg_stop_backup(false)") {
            tracing::warn!("best-effort pg_stop_backup failed: {e}");
        }
    }
}

/// Exclusive backups, pre-9.6 servers: the server writes `backup_label`
/// into the data directory itself.
pub struct ExclusiveBackup;

impl BackupControl for ExclusiveBackup {
    fn name(&self) -> &'static str {
        "exclusive"
    }

    fn start_backup(&self, client: &mut Client, label: &str) -> anyhow::Result<Lsn> {
        let row = client
            .query_one("SELECT pg_start_backup($1, true)", &[&label])
            .context("pg_start_backup (exclusive)")?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(lsn.into()))
    }

    fn stop_backup(&self, client: &mut Client) -> anyhow::Result<StopBackupInfo> {
        let row = client
            .query_one("SELECT pg_stop_backup(), now()", &[])
            .context("pg_stop_backup (exclusive)")?;
        let lsn: PgLsn = row.get(0);
        let stop_time: DateTime<Utc> = row.get(1);
        Ok(StopBackupInfo {
            stop_lsn: Lsn(lsn.into()),
            stop_time,
        })
    }

    fn cancel_backup(&self, client: &mut Client) {
        if let Err(e) = client.simple_query("SELECT pg_stop_backup()") {
            tracing::warn!("best-effort pg_stop_backup failed: {e}");
        }
    }
}

/// Pick the protocol implementation for a server version
/// (`server_version_num` form, e.g. 140011).
pub fn backup_control_for_version(server_version_num: u32) -> Box<dyn BackupControl> {
    if server_version_num >= 90600 {
        Box::new(NonExclusiveBackup)
    } else {
        Box::new(ExclusiveBackup)
    }
}

/// One control connection to the cluster being backed up.
pub struct NodeClient {
    client: Client,
    pub server_version_num: u32,
    control: Box<dyn BackupControl>,
}

impl NodeClient {
    pub fn connect(conninfo: &str) -> anyhow::Result<NodeClient> {
        let mut client = Client::connect(conninfo, NoTls)
            .with_context(|| format!("connect to {conninfo}"))?;
        let version_str: String = client
            .query_one("SHOW server_version_num", &[])?
            .get(0);
        let server_version_num: u32 = version_str
            .parse()
            .with_context(|| format!("bad server_version_num {version_str:?}"))?;
        info!("connected, server version {server_version_num}");
        let control = backup_control_for_version(server_version_num);
        Ok(NodeClient {
            client,
            server_version_num,
            control,
        })
    }

    pub fn start_backup(&mut self, label: &str) -> anyhow::Result<Lsn> {
        self.control.start_backup(&mut self.client, label)
    }

    pub fn stop_backup(&mut self) -> anyhow::Result<StopBackupInfo> {
        self.control.stop_backup(&mut self.client)
    }

    pub fn cancel_backup(&mut self) {
        self.control.cancel_backup(&mut self.client)
    }

    pub fn switch_wal(&mut self) -> anyhow::Result<Lsn> {
        let row = self.client.query_one("SELECT pg_switch_wal()", &[])?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(lsn.into()))
    }

    pub fn is_in_recovery(&mut self) -> anyhow::Result<bool> {
        Ok(self.client.query_one("SELECT pg_is_in_recovery()", &[])?.get(0))
    }

    /// Current timeline, from the control data the server itself reports.
    pub fn current_timeline(&mut self) -> anyhow::Result<u32> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])?;
        let tli: i32 = row.get(0);
        Ok(tli as u32)
    }

    /// On a replica, the LSN replay has reached.
    pub fn last_replay_lsn(&mut self) -> anyhow::Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT COALESCE(pg_last_wal_replay_lsn(), '0/0'::pg_lsn)", &[])?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(lsn.into()))
    }

    /// `datname -> oid` map, for partial restore bookkeeping.
    pub fn database_map(&mut self) -> anyhow::Result<Vec<(String, Oid)>> {
        let rows = self
            .client
            .query("SELECT datname, oid FROM pg_database ORDER BY oid", &[])?;
        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let oid: postgres::types::Oid = row.get(1);
                (name, oid)
            })
            .collect())
    }

    /// Locations of user tablespaces.
    pub fn tablespace_map(&mut self) -> anyhow::Result<Vec<(Oid, String)>> {
        let rows = self.client.query(
            "SELECT oid, pg_tablespace_location(oid) FROM pg_tablespace \
             WHERE spcname NOT IN ('pg_default', 'pg_global')",
            &[],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                let oid: postgres::types::Oid = row.get(0);
                let location: String = row.get(1);
                (oid, location)
            })
            .collect())
    }

    /// Installed ptrack version, if the extension is usable.
    pub fn ptrack_version(&mut self) -> anyhow::Result<Option<String>> {
        let rows = self.client.query(
            "SELECT extversion FROM pg_extension WHERE extname = 'ptrack'",
            &[],
        )?;
        Ok(rows.first().map(|row| row.get(0)))
    }

    /// Per-relation change bitmaps since `since_lsn`, from the ptrack
    /// extension. Paths come back relative to the data directory.
    pub fn ptrack_page_maps(
        &mut self,
        since_lsn: Lsn,
    ) -> anyhow::Result<Vec<(String, BlockBitmap)>> {
        let since = PgLsn::from(since_lsn.0);
        let rows = self
            .client
            .query(
                "SELECT path, pagemap FROM ptrack_get_pagemapset($1)",
                &[&since],
            )
            .context("ptrack_get_pagemapset")?;
        Ok(rows
            .iter()
            .map(|row| {
                let path: String = row.get(0);
                let pagemap: Vec<u8> = row.get(1);
                (path, BlockBitmap::from_bytes(pagemap))
            })
            .collect())
    }

    /// Run `amcheck`'s btree verification over every index visible to the
    /// connection. Returns the list of indexes that failed.
    pub fn amcheck_indexes(&mut self) -> anyhow::Result<Vec<String>> {
        let indexes: Vec<String> = self
            .client
            .query(
                "SELECT quote_ident(n.nspname) || '.' || quote_ident(c.relname) \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indexrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_am am ON am.oid = c.relam \
                 WHERE am.amname = 'btree' AND c.relpersistence != 't'",
                &[],
            )?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let mut corrupt = Vec::new();
        for index in indexes {
            let check = self
                .client
                .query_one(&format!("SELECT bt_index_check('{index}'::regclass)"), &[]);
            if let Err(e) = check {
                tracing::warn!("amcheck: index {index} failed verification: {e}");
                corrupt.push(index);
            }
        }
        Ok(corrupt)
    }
}
