//! SQLite persistence for accounts, connections, the trade audit log, and
//! daily statistics.
//!
//! All writes go through the owning component's narrow API; nothing outside
//! this module issues SQL. Decimal fields are stored as TEXT so audit rows
//! round-trip exactly.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    Account, AccountConfiguration, ConflictPolicy, Connection, ConnectionStatus, DailyStats,
    FeatureConfig, Platform, ReplicatedTrade, TradeSide, TradeStatus,
};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Fields accepted when creating an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub platform: Platform,
    pub is_master: bool,
    pub is_active: bool,
    pub risk_multiplier: Decimal,
    pub conflict_policy: ConflictPolicy,
    pub allow_manual_trading: bool,
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    platform: String,
    is_master: bool,
    is_active: bool,
    risk_multiplier: String,
    conflict_policy: String,
    allow_manual_trading: bool,
}

impl AccountRow {
    fn into_account(self) -> Result<Account> {
        Ok(Account {
            id: self.id,
            name: self.name,
            platform: Platform::parse(&self.platform)
                .with_context(|| format!("unknown platform {}", self.platform))?,
            is_master: self.is_master,
            is_active: self.is_active,
            risk_multiplier: self
                .risk_multiplier
                .parse()
                .context("invalid risk multiplier in store")?,
            conflict_policy: ConflictPolicy::parse(&self.conflict_policy)
                .with_context(|| format!("unknown conflict policy {}", self.conflict_policy))?,
            allow_manual_trading: self.allow_manual_trading,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    account_id: i64,
    platform: String,
    status: String,
    server: Option<String>,
    account_label: Option<String>,
    last_ping_ms: Option<i64>,
    last_update: DateTime<Utc>,
}

impl ConnectionRow {
    fn into_connection(self) -> Result<Connection> {
        Ok(Connection {
            account_id: self.account_id,
            platform: Platform::parse(&self.platform)
                .with_context(|| format!("unknown platform {}", self.platform))?,
            status: ConnectionStatus::parse(&self.status)
                .with_context(|| format!("unknown connection status {}", self.status))?,
            server: self.server,
            account_label: self.account_label,
            last_ping_ms: self.last_ping_ms,
            last_update: self.last_update,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: String,
    account_id: Option<i64>,
    symbol: String,
    side: String,
    volume: String,
    price: String,
    take_profit: Option<String>,
    stop_loss: Option<String>,
    status: String,
    latency_ms: Option<i64>,
    source_platform: String,
    target_platform: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TradeRow {
    fn into_trade(self) -> Result<ReplicatedTrade> {
        Ok(ReplicatedTrade {
            id: self.id,
            account_id: self.account_id,
            symbol: self.symbol,
            side: TradeSide::parse(&self.side)
                .with_context(|| format!("unknown trade side {}", self.side))?,
            volume: self.volume.parse().context("invalid volume in store")?,
            price: self.price.parse().context("invalid price in store")?,
            take_profit: self
                .take_profit
                .map(|v| v.parse().context("invalid take profit in store"))
                .transpose()?,
            stop_loss: self
                .stop_loss
                .map(|v| v.parse().context("invalid stop loss in store"))
                .transpose()?,
            status: TradeStatus::parse(&self.status)
                .with_context(|| format!("unknown trade status {}", self.status))?,
            latency_ms: self.latency_ms,
            source_platform: self.source_platform,
            target_platform: self.target_platform,
            error_message: self.error_message,
            created_at: self.created_at,
        })
    }
}

impl Database {
    /// Create a new database connection and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // In-memory databases must stay on a single connection or every
        // pooled connection sees its own empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                platform TEXT NOT NULL,
                is_master INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                risk_multiplier TEXT NOT NULL DEFAULT '1',
                conflict_policy TEXT NOT NULL DEFAULT 'pause_replication',
                allow_manual_trading INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_configurations (
                account_id INTEGER PRIMARY KEY,
                server TEXT,
                login TEXT,
                password TEXT,
                api_key TEXT,
                api_secret TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                account_id INTEGER PRIMARY KEY,
                platform TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'disconnected',
                server TEXT,
                account_label TEXT,
                last_ping_ms INTEGER,
                last_update TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feature_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_mirror_active INTEGER NOT NULL DEFAULT 1,
                enable_take_profit INTEGER NOT NULL DEFAULT 0,
                take_profit_points INTEGER NOT NULL DEFAULT 100,
                enable_stop_loss INTEGER NOT NULL DEFAULT 0,
                stop_loss_points INTEGER NOT NULL DEFAULT 50,
                enable_trailing_stop INTEGER NOT NULL DEFAULT 0,
                trailing_stop_points INTEGER NOT NULL DEFAULT 30,
                max_slippage INTEGER NOT NULL DEFAULT 3
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replicated_trades (
                id TEXT PRIMARY KEY,
                account_id INTEGER,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume TEXT NOT NULL,
                price TEXT NOT NULL,
                take_profit TEXT,
                stop_loss TEXT,
                status TEXT NOT NULL,
                latency_ms INTEGER,
                source_platform TEXT NOT NULL,
                target_platform TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                trades_count INTEGER NOT NULL DEFAULT 0,
                successful_trades INTEGER NOT NULL DEFAULT 0,
                failed_trades INTEGER NOT NULL DEFAULT 0,
                avg_latency_ms INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_created ON replicated_trades(created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_account ON replicated_trades(account_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Accounts ====================

    /// Insert a new account and return its id.
    pub async fn insert_account(&self, account: &NewAccount) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts
                (name, platform, is_master, is_active, risk_multiplier, conflict_policy, allow_manual_trading)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.name)
        .bind(account.platform.as_str())
        .bind(account.is_master)
        .bind(account.is_active)
        .bind(account.risk_multiplier.to_string())
        .bind(account.conflict_policy.as_str())
        .bind(account.allow_manual_trading)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All configured accounts, master first.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT id, name, platform, is_master, is_active, risk_multiplier, conflict_policy, allow_manual_trading FROM accounts ORDER BY is_master DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AccountRow::into_account).collect()
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, name, platform, is_master, is_active, risk_multiplier, conflict_policy, allow_manual_trading FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountRow::into_account).transpose()
    }

    /// Delete an account along with its configuration and connection row.
    pub async fn delete_account(&self, id: i64) -> Result<bool> {
        sqlx::query("DELETE FROM account_configurations WHERE account_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM connections WHERE account_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count active accounts flagged as master, excluding one id if given.
    /// Used to validate the single-active-master invariant at write time.
    pub async fn count_active_masters(&self, exclude_id: Option<i64>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM accounts WHERE is_master = 1 AND is_active = 1 AND id != ?",
        )
        .bind(exclude_id.unwrap_or(-1))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // ==================== Account configuration ====================

    pub async fn get_configuration(&self, account_id: i64) -> Result<Option<AccountConfiguration>> {
        let row: Option<AccountConfiguration> = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>, Option<String>, Option<String>)>(
            "SELECT server, login, password, api_key, api_secret FROM account_configurations WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|(server, login, password, api_key, api_secret)| AccountConfiguration {
            account_id,
            server,
            login,
            password,
            api_key,
            api_secret,
        });

        Ok(row)
    }

    /// Upsert the configuration for one account; absent fields are kept.
    pub async fn upsert_configuration(&self, config: &AccountConfiguration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_configurations (account_id, server, login, password, api_key, api_secret, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(account_id) DO UPDATE SET
                server = COALESCE(excluded.server, account_configurations.server),
                login = COALESCE(excluded.login, account_configurations.login),
                password = COALESCE(excluded.password, account_configurations.password),
                api_key = COALESCE(excluded.api_key, account_configurations.api_key),
                api_secret = COALESCE(excluded.api_secret, account_configurations.api_secret),
                updated_at = datetime('now')
            "#,
        )
        .bind(config.account_id)
        .bind(&config.server)
        .bind(&config.login)
        .bind(&config.password)
        .bind(&config.api_key)
        .bind(&config.api_secret)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Connections ====================

    /// Upsert the connection row for one account.
    pub async fn upsert_connection(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (account_id, platform, status, server, account_label, last_ping_ms, last_update)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                platform = excluded.platform,
                status = excluded.status,
                server = COALESCE(excluded.server, connections.server),
                account_label = COALESCE(excluded.account_label, connections.account_label),
                last_ping_ms = excluded.last_ping_ms,
                last_update = excluded.last_update
            "#,
        )
        .bind(connection.account_id)
        .bind(connection.platform.as_str())
        .bind(connection.status.as_str())
        .bind(&connection.server)
        .bind(&connection.account_label)
        .bind(connection.last_ping_ms)
        .bind(connection.last_update)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_connections(&self) -> Result<Vec<Connection>> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            "SELECT account_id, platform, status, server, account_label, last_ping_ms, last_update FROM connections ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConnectionRow::into_connection).collect()
    }

    // ==================== Feature config ====================

    /// Current feature toggles; the defaults row is created on first read.
    pub async fn get_feature_config(&self) -> Result<FeatureConfig> {
        sqlx::query("INSERT OR IGNORE INTO feature_config (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        let row: (bool, bool, i64, bool, i64, bool, i64, i64) = sqlx::query_as(
            r#"
            SELECT is_mirror_active, enable_take_profit, take_profit_points,
                   enable_stop_loss, stop_loss_points, enable_trailing_stop,
                   trailing_stop_points, max_slippage
            FROM feature_config WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(FeatureConfig {
            is_mirror_active: row.0,
            enable_take_profit: row.1,
            take_profit_points: row.2,
            enable_stop_loss: row.3,
            stop_loss_points: row.4,
            enable_trailing_stop: row.5,
            trailing_stop_points: row.6,
            max_slippage: row.7,
        })
    }

    pub async fn save_feature_config(&self, config: &FeatureConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_config
                (id, is_mirror_active, enable_take_profit, take_profit_points,
                 enable_stop_loss, stop_loss_points, enable_trailing_stop,
                 trailing_stop_points, max_slippage)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                is_mirror_active = excluded.is_mirror_active,
                enable_take_profit = excluded.enable_take_profit,
                take_profit_points = excluded.take_profit_points,
                enable_stop_loss = excluded.enable_stop_loss,
                stop_loss_points = excluded.stop_loss_points,
                enable_trailing_stop = excluded.enable_trailing_stop,
                trailing_stop_points = excluded.trailing_stop_points,
                max_slippage = excluded.max_slippage
            "#,
        )
        .bind(config.is_mirror_active)
        .bind(config.enable_take_profit)
        .bind(config.take_profit_points)
        .bind(config.enable_stop_loss)
        .bind(config.stop_loss_points)
        .bind(config.enable_trailing_stop)
        .bind(config.trailing_stop_points)
        .bind(config.max_slippage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trade audit log ====================

    /// Append one audit row. Rows are never updated afterwards.
    pub async fn insert_trade(&self, trade: &ReplicatedTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replicated_trades
                (id, account_id, symbol, side, volume, price, take_profit, stop_loss,
                 status, latency_ms, source_platform, target_platform, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(trade.account_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.volume.to_string())
        .bind(trade.price.to_string())
        .bind(trade.take_profit.map(|v| v.to_string()))
        .bind(trade.stop_loss.map(|v| v.to_string()))
        .bind(trade.status.as_str())
        .bind(trade.latency_ms)
        .bind(&trade.source_platform)
        .bind(&trade.target_platform)
        .bind(&trade.error_message)
        .bind(trade.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest-first page of the audit log.
    pub async fn list_trades(&self, limit: i64, offset: i64) -> Result<Vec<ReplicatedTrade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM replicated_trades ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    /// Clear the audit log; returns the number of rows removed.
    pub async fn clear_trades(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM replicated_trades")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== Daily stats ====================

    pub async fn get_daily_stats(&self, date: NaiveDate) -> Result<Option<DailyStats>> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT trades_count, successful_trades, failed_trades, avg_latency_ms FROM daily_stats WHERE date = ?",
        )
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(trades_count, successful_trades, failed_trades, avg_latency_ms)| DailyStats {
            date,
            trades_count,
            successful_trades,
            failed_trades,
            avg_latency_ms,
        }))
    }

    pub async fn upsert_daily_stats(&self, stats: &DailyStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_stats (date, trades_count, successful_trades, failed_trades, avg_latency_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                trades_count = excluded.trades_count,
                successful_trades = excluded.successful_trades,
                failed_trades = excluded.failed_trades,
                avg_latency_ms = excluded.avg_latency_ms
            "#,
        )
        .bind(stats.date.to_string())
        .bind(stats.trades_count)
        .bind(stats.successful_trades)
        .bind(stats.failed_trades)
        .bind(stats.avg_latency_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
