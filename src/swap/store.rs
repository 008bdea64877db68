use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};

use super::{AnySwap, ChainSwap, ReverseSwap, SubmarineSwap, SwapKind, SwapRecord, SwapStatus};

/// SQLite repository for swaps.
///
/// Kind, status and settlement symbol are kept in their own columns for
/// queries; the full record is stored as JSON next to them.
#[derive(Debug)]
pub struct SqliteSwapStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_swap(&mut self, record: &SwapRecord) -> Result<()> {
        let data = serde_json::to_string(record).context("encode swap record")?;
        self.conn
            .execute(
                r#"
INSERT INTO swaps (
  swap_id,
  kind,
  status,
  chain_symbol,
  data
) VALUES (
  ?1, ?2, ?3, ?4, ?5
)
"#,
                params![
                    record.id(),
                    record.kind().as_str(),
                    record.status().as_str(),
                    record.chain_symbol(),
                    data,
                ],
            )
            .with_context(|| format!("insert swap {}", record.id()))?;
        Ok(())
    }

    pub fn get_swap(&self, swap_id: &str) -> Result<Option<SwapRecord>> {
        self.conn
            .query_row(
                r#"
SELECT
  kind,
  status,
  data
FROM swaps
WHERE swap_id = ?1
"#,
                params![swap_id],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("get swap {swap_id}"))
    }

    pub fn get_submarine_swap(&self, swap_id: &str) -> Result<Option<SubmarineSwap>> {
        Ok(match self.get_swap(swap_id)? {
            Some(SwapRecord::Submarine(swap)) => Some(swap),
            _ => None,
        })
    }

    pub fn get_reverse_swap(&self, swap_id: &str) -> Result<Option<ReverseSwap>> {
        Ok(match self.get_swap(swap_id)? {
            Some(SwapRecord::Reverse(swap)) => Some(swap),
            _ => None,
        })
    }

    pub fn get_chain_swap(&self, swap_id: &str) -> Result<Option<ChainSwap>> {
        Ok(match self.get_swap(swap_id)? {
            Some(SwapRecord::Chain(swap)) => Some(swap),
            _ => None,
        })
    }

    pub fn update_status(&mut self, swap_id: &str, status: SwapStatus) -> Result<()> {
        self.modify(swap_id, |record| record.set_status(status))
            .with_context(|| format!("update swap status {swap_id}"))
    }

    /// Marks a claimable swap as queued for a deferred claim.
    pub fn set_claim_pending(&mut self, swap_id: &str, preimage_hex: &str) -> Result<()> {
        self.modify(swap_id, |record| {
            record.set_status(SwapStatus::TransactionClaimPending);
            set_record_preimage(record, preimage_hex);
        })
        .with_context(|| format!("set swap claim pending {swap_id}"))
    }

    pub fn set_preimage(&mut self, swap_id: &str, preimage_hex: &str) -> Result<()> {
        self.modify(swap_id, |record| set_record_preimage(record, preimage_hex))
            .with_context(|| format!("set swap preimage {swap_id}"))
    }

    /// Records a broadcast claim and the share of its fee paid by this swap.
    pub fn set_claimed(&mut self, swap_id: &str, miner_fee: u64) -> Result<()> {
        self.modify(swap_id, |record| {
            record.set_status(SwapStatus::TransactionClaimed);
            match record {
                SwapRecord::Submarine(s) => s.miner_fee = Some(miner_fee),
                SwapRecord::Chain(s) => s.receiving.miner_fee = Some(miner_fee),
                SwapRecord::Reverse(_) => {}
            }
        })
        .with_context(|| format!("set swap claimed {swap_id}"))
    }

    pub fn list_swaps(&self) -> Result<Vec<SwapRecord>> {
        self.query_swaps("SELECT kind, status, data FROM swaps ORDER BY swap_id", [])
    }

    /// Submarine and chain swaps whose claim was deferred but not broadcast.
    pub fn list_claim_pending(&self) -> Result<Vec<AnySwap>> {
        let records = self.query_swaps(
            r#"
SELECT
  kind,
  status,
  data
FROM swaps
WHERE status = ?1 AND kind IN ('submarine', 'chain')
ORDER BY swap_id
"#,
            params![SwapStatus::TransactionClaimPending.as_str()],
        )?;
        Ok(records
            .into_iter()
            .filter_map(SwapRecord::into_claimable)
            .collect())
    }

    fn query_swaps(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SwapRecord>> {
        let mut stmt = self.conn.prepare(sql).context("prepare list swaps")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map(params, record_from_row)
            .context("query list swaps")?;

        for row in rows {
            out.push(row.context("read swap row")?);
        }
        Ok(out)
    }

    fn modify(&mut self, swap_id: &str, f: impl FnOnce(&mut SwapRecord)) -> Result<()> {
        let tx = self.conn.transaction().context("begin sqlite transaction")?;

        let mut record = tx
            .query_row(
                "SELECT kind, status, data FROM swaps WHERE swap_id = ?1",
                params![swap_id],
                record_from_row,
            )
            .optional()
            .context("load swap")?
            .with_context(|| format!("swap not found: {swap_id}"))?;

        f(&mut record);

        let data = serde_json::to_string(&record).context("encode swap record")?;
        let rows = tx
            .execute(
                "UPDATE swaps SET status = ?2, data = ?3 WHERE swap_id = ?1",
                params![swap_id, record.status().as_str(), data],
            )
            .context("update swap")?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");

        tx.commit().context("commit sqlite transaction")
    }
}

fn set_record_preimage(record: &mut SwapRecord, preimage_hex: &str) {
    let preimage = Some(preimage_hex.to_string());
    match record {
        SwapRecord::Submarine(s) => s.preimage = preimage,
        SwapRecord::Reverse(s) => s.preimage = preimage,
        SwapRecord::Chain(s) => s.preimage = preimage,
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  chain_symbol TEXT NOT NULL,
  data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_status_idx ON swaps(status);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SwapRecord> {
    let kind_str: String = row.get(0)?;
    let status_str: String = row.get(1)?;
    let data: String = row.get(2)?;

    let kind = kind_from_str(&kind_str, 0)?;
    let status = status_from_str(&status_str, 1)?;

    let mut record: SwapRecord = serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    if record.kind() != kind {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("swap kind {kind_str} does not match stored record").into(),
        ));
    }
    record.set_status(status);
    Ok(record)
}

fn kind_from_str(s: &str, col: usize) -> rusqlite::Result<SwapKind> {
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown swap kind: {s}").into(),
        )
    })
}

fn status_from_str(s: &str, col: usize) -> rusqlite::Result<SwapStatus> {
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown swap status: {s}").into(),
        )
    })
}
