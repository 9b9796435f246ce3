//! Relation file naming: mapping between data-directory relative paths and
//! `(tablespace, database, relation, fork)` tuples, in both directions.
//!
//! The backup engine needs the forward direction to mark candidate datafiles
//! while listing the data directory, and the reverse direction to locate the
//! file a WAL block reference lands in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pg_constants::{DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID};
use crate::{Oid, RELSEG_SIZE};

/// Name of the per-version subdirectory inside `pg_tblspc/<oid>/`.
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_14_202107181";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelFileTag {
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
    pub forknum: u8,
}

impl fmt::Display for RelFileTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}{}",
            self.spcnode,
            self.dbnode,
            self.relnode,
            forkname_suffix(self.forknum)
        )
    }
}

pub fn forkname_suffix(forknum: u8) -> &'static str {
    match forknum {
        crate::pg_constants::MAIN_FORKNUM => "",
        crate::pg_constants::FSM_FORKNUM => "_fsm",
        crate::pg_constants::VISIBILITYMAP_FORKNUM => "_vm",
        crate::pg_constants::INIT_FORKNUM => "_init",
        _ => "_unknown",
    }
}

fn forkname_to_number(forkname: &str) -> Option<u8> {
    match forkname {
        "fsm" => Some(crate::pg_constants::FSM_FORKNUM),
        "vm" => Some(crate::pg_constants::VISIBILITYMAP_FORKNUM),
        "init" => Some(crate::pg_constants::INIT_FORKNUM),
        _ => None,
    }
}

impl RelFileTag {
    /// Data-directory-relative path of the file holding segment `segno` of
    /// this relation fork.
    pub fn segfile_path(&self, segno: u32) -> String {
        let seg_suffix = if segno > 0 {
            format!(".{segno}")
        } else {
            String::new()
        };
        let fork = forkname_suffix(self.forknum);
        if self.spcnode == GLOBALTABLESPACE_OID {
            format!("global/{}{fork}{seg_suffix}", self.relnode)
        } else if self.spcnode == DEFAULTTABLESPACE_OID {
            format!("base/{}/{}{fork}{seg_suffix}", self.dbnode, self.relnode)
        } else {
            format!(
                "pg_tblspc/{}/{TABLESPACE_VERSION_DIRECTORY}/{}/{}{fork}{seg_suffix}",
                self.spcnode, self.dbnode, self.relnode
            )
        }
    }

    /// Which segment file and block-within-segment a relation block lives in.
    pub fn block_location(blkno: u32) -> (u32, u32) {
        (blkno / RELSEG_SIZE, blkno % RELSEG_SIZE)
    }
}

/// Parse the file-name component of a relation file:
/// `<relnode>[_<fork>][.<segno>]`. Rejects temp relations (`t<n>_<rel>`) and
/// anything that is not digits-first.
fn parse_relfile_name(name: &str) -> Option<(Oid, u8, u32)> {
    let (stem, segno) = match name.split_once('.') {
        Some((stem, seg)) => (stem, seg.parse::<u32>().ok()?),
        None => (name, 0),
    };
    let (relnode_str, forknum) = match stem.split_once('_') {
        Some((rel, fork)) => (rel, forkname_to_number(fork)?),
        None => (stem, crate::pg_constants::MAIN_FORKNUM),
    };
    if relnode_str.is_empty() || !relnode_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((relnode_str.parse().ok()?, forknum, segno))
}

/// Parse a data-directory-relative path into a relation tag and segment
/// number. Returns None for anything that is not a relation data file.
pub fn parse_relfile_path(rel_path: &str) -> Option<(RelFileTag, u32)> {
    let mut parts = rel_path.split('/');
    match parts.next()? {
        "global" => {
            let name = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            let (relnode, forknum, segno) = parse_relfile_name(name)?;
            Some((
                RelFileTag {
                    spcnode: GLOBALTABLESPACE_OID,
                    dbnode: 0,
                    relnode,
                    forknum,
                },
                segno,
            ))
        }
        "base" => {
            let dbnode: Oid = parts.next()?.parse().ok()?;
            let name = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            let (relnode, forknum, segno) = parse_relfile_name(name)?;
            Some((
                RelFileTag {
                    spcnode: DEFAULTTABLESPACE_OID,
                    dbnode,
                    relnode,
                    forknum,
                },
                segno,
            ))
        }
        "pg_tblspc" => {
            let spcnode: Oid = parts.next()?.parse().ok()?;
            let version_dir = parts.next()?;
            if !version_dir.starts_with("PG_") {
                return None;
            }
            let dbnode: Oid = parts.next()?.parse().ok()?;
            let name = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            let (relnode, forknum, segno) = parse_relfile_name(name)?;
            Some((
                RelFileTag {
                    spcnode,
                    dbnode,
                    relnode,
                    forknum,
                },
                segno,
            ))
        }
        _ => None,
    }
}

/// The database OID a relation file belongs to, for partial restore
/// filtering. Shared catalogs (dbnode 0) belong to every database.
pub fn database_oid_of_path(rel_path: &str) -> Option<Oid> {
    parse_relfile_path(rel_path).map(|(tag, _)| tag.dbnode)
}
