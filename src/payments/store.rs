use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params, params_from_iter};

use super::{
    App, AppPermission, BudgetRenewal, NewTransaction, Transaction, TransactionState,
    TransactionType, now_unix,
};

const TRANSACTION_COLUMNS: &str = "\
id, app_id, request_event_id, type, state, amount_msat, fee_msat, fee_reserve_msat, \
payment_request, payment_hash, preimage, description, description_hash, expires_at, \
settled_at, failure_reason, self_payment, metadata, boostagram, created_at, updated_at";

#[derive(Debug)]
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create ledger dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self { conn })
    }

    pub fn create_app(&mut self, name: &str, isolated: bool) -> Result<App> {
        let now = now_unix();
        self.conn
            .execute(
                "INSERT INTO apps (name, isolated, created_at) VALUES (?1, ?2, ?3)",
                params![name, isolated, now],
            )
            .with_context(|| format!("insert app {name}"))?;
        let id = self.conn.last_insert_rowid();
        Ok(App {
            id: id as u64,
            name: name.to_string(),
            isolated,
            created_at: now,
        })
    }

    pub fn get_app(&self, id: u64) -> Result<Option<App>> {
        self.conn
            .query_row(
                "SELECT id, name, isolated, created_at FROM apps WHERE id = ?1",
                params![id],
                |row| {
                    Ok(App {
                        id: to_u64(row.get(0)?, 0)?,
                        name: row.get(1)?,
                        isolated: row.get(2)?,
                        created_at: to_u64(row.get(3)?, 3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("get app {id}"))
    }

    pub fn create_app_permission(
        &mut self,
        app_id: u64,
        scope: &str,
        max_amount_sat: u64,
        budget_renewal: BudgetRenewal,
    ) -> Result<AppPermission> {
        let now = now_unix();
        self.conn
            .execute(
                r#"
INSERT INTO app_permissions (app_id, scope, max_amount_sat, budget_renewal, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![app_id, scope, max_amount_sat, budget_renewal.as_str(), now],
            )
            .with_context(|| format!("insert permission {scope} for app {app_id}"))?;
        let id = self.conn.last_insert_rowid();
        Ok(AppPermission {
            id: id as u64,
            app_id,
            scope: scope.to_string(),
            max_amount_sat,
            budget_renewal,
            created_at: now,
        })
    }

    pub fn get_app_permission(&self, app_id: u64, scope: &str) -> Result<Option<AppPermission>> {
        self.conn
            .query_row(
                r#"
SELECT id, app_id, scope, max_amount_sat, budget_renewal, created_at
FROM app_permissions
WHERE app_id = ?1 AND scope = ?2
"#,
                params![app_id, scope],
                |row| {
                    let renewal: String = row.get(4)?;
                    Ok(AppPermission {
                        id: to_u64(row.get(0)?, 0)?,
                        app_id: to_u64(row.get(1)?, 1)?,
                        scope: row.get(2)?,
                        max_amount_sat: to_u64(row.get(3)?, 3)?,
                        budget_renewal: budget_renewal_from_str(&renewal, 4)?,
                        created_at: to_u64(row.get(5)?, 5)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("get permission {scope} for app {app_id}"))
    }

    pub fn create_transaction(&mut self, new: &NewTransaction) -> Result<Transaction> {
        let now = now_unix();
        let metadata = new
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize metadata")?;
        let boostagram = new
            .boostagram
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize boostagram")?;

        self.conn
            .execute(
                r#"
INSERT INTO transactions (
  app_id,
  request_event_id,
  type,
  state,
  amount_msat,
  fee_msat,
  fee_reserve_msat,
  payment_request,
  payment_hash,
  preimage,
  description,
  description_hash,
  expires_at,
  self_payment,
  metadata,
  boostagram,
  created_at,
  updated_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16
)
"#,
                params![
                    new.app_id,
                    new.request_event_id,
                    new.transaction_type.as_str(),
                    TransactionState::Pending.as_str(),
                    new.amount_msat,
                    new.fee_reserve_msat,
                    &new.payment_request,
                    &new.payment_hash,
                    new.preimage.as_deref(),
                    &new.description,
                    &new.description_hash,
                    new.expires_at,
                    new.self_payment,
                    metadata.as_deref(),
                    boostagram.as_deref(),
                    now,
                ],
            )
            .with_context(|| format!("insert transaction {}", new.payment_hash))?;

        let id = self.conn.last_insert_rowid() as u64;
        self.get_transaction(id)?
            .with_context(|| format!("reread inserted transaction {id}"))
    }

    pub fn get_transaction(&self, id: u64) -> Result<Option<Transaction>> {
        self.conn
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id],
                row_to_transaction,
            )
            .optional()
            .with_context(|| format!("get transaction {id}"))
    }

    /// The settled row for this direction and hash, if one exists. The partial
    /// unique index guarantees there is at most one.
    pub fn find_settled(
        &self,
        transaction_type: TransactionType,
        payment_hash: &str,
    ) -> Result<Option<Transaction>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions \
                     WHERE type = ?1 AND payment_hash = ?2 AND state = ?3"
                ),
                params![
                    transaction_type.as_str(),
                    payment_hash,
                    TransactionState::Settled.as_str()
                ],
                row_to_transaction,
            )
            .optional()
            .with_context(|| format!("find settled {} {payment_hash}", transaction_type.as_str()))
    }

    pub fn find_latest_by_type_and_hash(
        &self,
        transaction_type: TransactionType,
        payment_hash: &str,
    ) -> Result<Option<Transaction>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions \
                     WHERE type = ?1 AND payment_hash = ?2 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![transaction_type.as_str(), payment_hash],
                row_to_transaction,
            )
            .optional()
            .with_context(|| format!("find {} {payment_hash}", transaction_type.as_str()))
    }

    pub fn find_pending_incoming(&self, payment_hash: &str) -> Result<Option<Transaction>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions \
                     WHERE type = ?1 AND state = ?2 AND payment_hash = ?3 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![
                    TransactionType::Incoming.as_str(),
                    TransactionState::Pending.as_str(),
                    payment_hash
                ],
                row_to_transaction,
            )
            .optional()
            .with_context(|| format!("find pending incoming {payment_hash}"))
    }

    /// Best row for a hash: settled first, then most recently created. A hash
    /// can have several outgoing attempts when earlier tries failed.
    pub fn lookup_by_hash(
        &self,
        payment_hash: &str,
        transaction_type: Option<TransactionType>,
        app_id: Option<u64>,
    ) -> Result<Option<Transaction>> {
        let mut sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE payment_hash = ?1"
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(payment_hash.to_string())];

        if let Some(transaction_type) = transaction_type {
            args.push(Box::new(transaction_type.as_str()));
            sql.push_str(&format!(" AND type = ?{}", args.len()));
        }
        if let Some(app_id) = app_id {
            args.push(Box::new(app_id));
            sql.push_str(&format!(" AND app_id = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY settled_at DESC, created_at DESC LIMIT 1");

        self.conn
            .query_row(&sql, params_from_iter(args.iter()), row_to_transaction)
            .optional()
            .with_context(|| format!("lookup transaction {payment_hash}"))
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Transaction>> {
        let mut sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        match (filter.unpaid_outgoing, filter.unpaid_incoming) {
            (false, false) => {
                args.push(Box::new(TransactionState::Settled.as_str()));
                clauses.push(format!("state = ?{}", args.len()));
            }
            (true, false) => {
                args.push(Box::new(TransactionState::Settled.as_str()));
                let state = args.len();
                args.push(Box::new(TransactionType::Outgoing.as_str()));
                clauses.push(format!("(state = ?{state} OR type = ?{})", args.len()));
            }
            (false, true) => {
                args.push(Box::new(TransactionState::Settled.as_str()));
                let state = args.len();
                args.push(Box::new(TransactionType::Incoming.as_str()));
                clauses.push(format!("(state = ?{state} OR type = ?{})", args.len()));
            }
            (true, true) => {}
        }

        if let Some(transaction_type) = filter.transaction_type {
            args.push(Box::new(transaction_type.as_str()));
            clauses.push(format!("type = ?{}", args.len()));
        }
        if filter.from > 0 {
            args.push(Box::new(filter.from));
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        if filter.until > 0 {
            args.push(Box::new(filter.until));
            clauses.push(format!("created_at <= ?{}", args.len()));
        }
        if let Some(app_id) = filter.app_id {
            args.push(Box::new(app_id));
            clauses.push(format!("app_id = ?{}", args.len()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC");

        if filter.limit > 0 || filter.offset > 0 {
            let limit = if filter.limit > 0 {
                filter.limit as i64
            } else {
                -1
            };
            args.push(Box::new(limit));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
            if filter.offset > 0 {
                args.push(Box::new(filter.offset));
                sql.push_str(&format!(" OFFSET ?{}", args.len()));
            }
        }

        let mut stmt = self.conn.prepare(&sql).context("prepare list transactions")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_transaction)
            .context("query list transactions")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read transaction row")?);
        }
        Ok(out)
    }

    pub fn list_pending_since(&self, since: u64) -> Result<Vec<Transaction>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions \
                 WHERE state = ?1 AND created_at > ?2 ORDER BY id"
            ))
            .context("prepare list pending transactions")?;
        let rows = stmt
            .query_map(
                params![TransactionState::Pending.as_str(), since],
                row_to_transaction,
            )
            .context("query pending transactions")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read transaction row")?);
        }
        Ok(out)
    }

    pub fn mark_settled(
        &mut self,
        id: u64,
        preimage: &str,
        fee_msat: u64,
        self_payment: bool,
    ) -> Result<Transaction> {
        let now = now_unix();
        let rows = self
            .conn
            .execute(
                r#"
UPDATE transactions
SET state = ?2,
    preimage = ?3,
    fee_msat = ?4,
    fee_reserve_msat = 0,
    settled_at = ?5,
    self_payment = ?6,
    updated_at = ?5
WHERE id = ?1
"#,
                params![
                    id,
                    TransactionState::Settled.as_str(),
                    preimage,
                    fee_msat,
                    now,
                    self_payment
                ],
            )
            .with_context(|| format!("mark transaction {id} settled"))?;
        anyhow::ensure!(rows == 1, "transaction not found: {id}");

        self.get_transaction(id)?
            .with_context(|| format!("reread settled transaction {id}"))
    }

    pub fn mark_failed(&mut self, id: u64, reason: &str) -> Result<Transaction> {
        let now = now_unix();
        let rows = self
            .conn
            .execute(
                r#"
UPDATE transactions
SET state = ?2,
    fee_reserve_msat = 0,
    failure_reason = ?3,
    updated_at = ?4
WHERE id = ?1
"#,
                params![id, TransactionState::Failed.as_str(), reason, now],
            )
            .with_context(|| format!("mark transaction {id} failed"))?;
        anyhow::ensure!(rows == 1, "transaction not found: {id}");

        self.get_transaction(id)?
            .with_context(|| format!("reread failed transaction {id}"))
    }

    /// Spendable balance of an isolated app:
    /// settled incoming, minus settled outgoing with fees, minus in-flight
    /// outgoing with reserves.
    pub fn isolated_balance_msat(&self, app_id: u64) -> Result<i64> {
        self.conn
            .query_row(
                r#"
SELECT
  COALESCE((SELECT SUM(amount_msat) FROM transactions
            WHERE app_id = ?1 AND type = 'incoming' AND state = 'settled'), 0)
- COALESCE((SELECT SUM(amount_msat + fee_msat) FROM transactions
            WHERE app_id = ?1 AND type = 'outgoing' AND state = 'settled'), 0)
- COALESCE((SELECT SUM(amount_msat + fee_reserve_msat) FROM transactions
            WHERE app_id = ?1 AND type = 'outgoing' AND state = 'pending'), 0)
"#,
                params![app_id],
                |row| row.get(0),
            )
            .with_context(|| format!("compute isolated balance for app {app_id}"))
    }

    /// Budget usage since the start of the window: amount, fees and reserves
    /// of settled and in-flight outgoing payments.
    pub fn budget_usage_msat(&self, app_id: u64, since: u64) -> Result<u64> {
        let usage: i64 = self
            .conn
            .query_row(
                r#"
SELECT COALESCE(SUM(amount_msat + fee_msat + fee_reserve_msat), 0)
FROM transactions
WHERE app_id = ?1
  AND type = 'outgoing'
  AND state IN ('settled', 'pending')
  AND created_at >= ?2
"#,
                params![app_id, since],
                |row| row.get(0),
            )
            .with_context(|| format!("compute budget usage for app {app_id}"))?;
        Ok(usage.max(0) as u64)
    }
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let transaction_type: String = row.get(3)?;
    let state: String = row.get(4)?;
    let metadata: Option<String> = row.get(17)?;
    let boostagram: Option<String> = row.get(18)?;

    Ok(Transaction {
        id: to_u64(row.get(0)?, 0)?,
        app_id: row.get::<_, Option<i64>>(1)?.map(|v| to_u64(v, 1)).transpose()?,
        request_event_id: row.get::<_, Option<i64>>(2)?.map(|v| to_u64(v, 2)).transpose()?,
        transaction_type: transaction_type_from_str(&transaction_type, 3)?,
        state: state_from_str(&state, 4)?,
        amount_msat: to_u64(row.get(5)?, 5)?,
        fee_msat: to_u64(row.get(6)?, 6)?,
        fee_reserve_msat: to_u64(row.get(7)?, 7)?,
        payment_request: row.get(8)?,
        payment_hash: row.get(9)?,
        preimage: row.get(10)?,
        description: row.get(11)?,
        description_hash: row.get(12)?,
        expires_at: row.get::<_, Option<i64>>(13)?.map(|v| to_u64(v, 13)).transpose()?,
        settled_at: row.get::<_, Option<i64>>(14)?.map(|v| to_u64(v, 14)).transpose()?,
        failure_reason: row.get(15)?,
        self_payment: row.get(16)?,
        metadata: metadata.as_deref().map(parse_json_column(17)).transpose()?,
        boostagram: boostagram.as_deref().map(parse_json_column(18)).transpose()?,
        created_at: to_u64(row.get(19)?, 19)?,
        updated_at: to_u64(row.get(20)?, 20)?,
    })
}

fn to_u64(value: i64, col: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("negative integer {value}").into(),
        )
    })
}

fn parse_json_column(col: usize) -> impl Fn(&str) -> rusqlite::Result<serde_json::Value> {
    move |raw| {
        serde_json::from_str(raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                col,
                rusqlite::types::Type::Text,
                format!("invalid JSON column: {e}").into(),
            )
        })
    }
}

fn transaction_type_from_str(s: &str, col: usize) -> rusqlite::Result<TransactionType> {
    match s {
        "incoming" => Ok(TransactionType::Incoming),
        "outgoing" => Ok(TransactionType::Outgoing),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown transaction type: {other}").into(),
        )),
    }
}

fn state_from_str(s: &str, col: usize) -> rusqlite::Result<TransactionState> {
    match s {
        "pending" => Ok(TransactionState::Pending),
        "settled" => Ok(TransactionState::Settled),
        "failed" => Ok(TransactionState::Failed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown transaction state: {other}").into(),
        )),
    }
}

fn budget_renewal_from_str(s: &str, col: usize) -> rusqlite::Result<BudgetRenewal> {
    match s {
        "never" => Ok(BudgetRenewal::Never),
        "daily" => Ok(BudgetRenewal::Daily),
        "weekly" => Ok(BudgetRenewal::Weekly),
        "monthly" => Ok(BudgetRenewal::Monthly),
        "yearly" => Ok(BudgetRenewal::Yearly),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown budget renewal: {other}").into(),
        )),
    }
}

/// Filters for `LedgerStore::list`. Zero timestamps and counts mean no bound.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub from: u64,
    pub until: u64,
    pub limit: u64,
    pub offset: u64,
    pub unpaid_outgoing: bool,
    pub unpaid_incoming: bool,
    pub transaction_type: Option<TransactionType>,
    pub app_id: Option<u64>,
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS apps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  isolated INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS app_permissions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app_id INTEGER NOT NULL REFERENCES apps(id),
  scope TEXT NOT NULL,
  max_amount_sat INTEGER NOT NULL DEFAULT 0,
  budget_renewal TEXT NOT NULL DEFAULT 'never',
  created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS app_permissions_app_scope_idx
  ON app_permissions(app_id, scope);

CREATE TABLE IF NOT EXISTS transactions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app_id INTEGER REFERENCES apps(id),
  request_event_id INTEGER,
  type TEXT NOT NULL,
  state TEXT NOT NULL,
  amount_msat INTEGER NOT NULL,
  fee_msat INTEGER NOT NULL DEFAULT 0,
  fee_reserve_msat INTEGER NOT NULL DEFAULT 0,
  payment_request TEXT NOT NULL DEFAULT '',
  payment_hash TEXT NOT NULL,
  preimage TEXT,
  description TEXT NOT NULL DEFAULT '',
  description_hash TEXT NOT NULL DEFAULT '',
  expires_at INTEGER,
  settled_at INTEGER,
  failure_reason TEXT,
  self_payment INTEGER NOT NULL DEFAULT 0,
  metadata TEXT,
  boostagram TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_payment_hash_idx ON transactions(payment_hash);
CREATE INDEX IF NOT EXISTS transactions_app_id_idx ON transactions(app_id);
CREATE INDEX IF NOT EXISTS transactions_state_idx ON transactions(state);
CREATE UNIQUE INDEX IF NOT EXISTS transactions_settled_unique_idx
  ON transactions(type, payment_hash) WHERE state = 'settled';
"#,
    )
    .context("create tables")?;

    ensure_columns(conn).context("ensure columns")?;
    Ok(())
}

fn ensure_columns(conn: &Connection) -> Result<()> {
    let cols = table_columns(conn, "transactions").context("read transactions columns")?;
    ensure_column(conn, "transactions", &cols, "metadata", "TEXT")?;
    ensure_column(conn, "transactions", &cols, "boostagram", "TEXT")?;
    ensure_column(conn, "transactions", &cols, "request_event_id", "INTEGER")?;
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("prepare PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([]).context("query PRAGMA table_info")?;

    let mut out = HashSet::new();
    while let Some(row) = rows.next().context("read PRAGMA row")? {
        let name: String = row.get(1)?;
        out.insert(name);
    }
    Ok(out)
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    columns: &HashSet<String>,
    name: &str,
    decl: &str,
) -> Result<()> {
    if columns.contains(name) {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"), [])
        .with_context(|| format!("add column {table}.{name}"))?;
    Ok(())
}
