use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult, UnauthenticatedSnafu,
};
use super::ids::{AccountId, MessageId};
use super::types::{
    AccountCredentials, AccountRecord, MessageRecord, MessageRole, NewAccount, NewMessage,
};
use super::{AccountStore, BoxFuture, TranscriptStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: in-memory databases vanish with their connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic across builds.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite storage");
        Ok(Self { pool, database_url })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl TranscriptStore for SqliteStorage {
    fn append(
        &self,
        account_id: AccountId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "transcript-append-begin",
            })?;
            ensure_account_exists(&mut tx, account_id, "transcript-append-check-account").await?;

            let message_id = MessageId::new_v7();
            let requested_at = u64_to_i64(
                input.created_at_unix_millis,
                "transcript-append-created-at",
            )?;

            // Seq and timestamp are derived inside one statement so an append can never
            // land behind an existing message, whatever clock the caller used.
            let (seq, created_at) = sqlx::query_as::<_, (i64, i64)>(
                "INSERT INTO transcript_messages (id, account_id, seq, role, content, created_at) \
                 VALUES (?, ?, \
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM transcript_messages WHERE account_id = ?), \
                     ?, ?, \
                     MAX(?, (SELECT COALESCE(MAX(created_at), 0) FROM transcript_messages WHERE account_id = ?))) \
                 RETURNING seq, created_at",
            )
            .bind(message_id.to_string())
            .bind(account_id.to_string())
            .bind(account_id.to_string())
            .bind(role_to_sql(input.role))
            .bind(input.content.as_str())
            .bind(requested_at)
            .bind(account_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "transcript-append-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "transcript-append-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                account_id,
                seq: i64_to_u64(seq, "transcript-append-seq")?,
                role: input.role,
                content: input.content,
                created_at_unix_millis: i64_to_u64(created_at, "transcript-append-created-at")?,
            })
        })
    }

    fn load_history(&self, account_id: AccountId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "transcript-load-acquire",
            })?;
            ensure_account_exists(&mut connection, account_id, "transcript-load-check-account")
                .await?;

            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, account_id, seq, role, content, created_at FROM transcript_messages WHERE account_id = ? ORDER BY created_at ASC, seq ASC",
            )
            .bind(account_id.to_string())
            .fetch_all(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "transcript-load-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

impl AccountStore for SqliteStorage {
    fn create_account(&self, input: NewAccount) -> BoxFuture<'_, StorageResult<AccountRecord>> {
        Box::pin(async move {
            let account_id = AccountId::new_v7();
            let now = unix_timestamp_millis();

            let insert_result = sqlx::query(
                "INSERT INTO accounts (id, email, display_name, password_hash, password_salt, subscription_plan, created_at) VALUES (?, ?, ?, ?, ?, NULL, ?)",
            )
            .bind(account_id.to_string())
            .bind(input.email.as_str())
            .bind(input.display_name.as_str())
            .bind(input.password_hash)
            .bind(input.password_salt)
            .bind(now)
            .execute(&self.pool)
            .await;

            match insert_result {
                Ok(_) => {}
                Err(sqlx::Error::Database(database_error)) if database_error.is_unique_violation() => {
                    return ConflictSnafu {
                        stage: "account-create-unique-email",
                        entity: "account",
                        details: format!("email '{}' is already registered", input.email),
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(StorageError::SqliteQuery {
                        stage: "account-create-insert",
                        source,
                    });
                }
            }

            Ok(AccountRecord {
                id: account_id,
                email: input.email,
                display_name: input.display_name,
                subscription_plan: None,
                created_at_unix_millis: i64_to_u64(now, "account-create-created-at")?,
            })
        })
    }

    fn find_credentials_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<AccountCredentials>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, CredentialsRow>(
                "SELECT id, password_hash, password_salt FROM accounts WHERE email = ?",
            )
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "account-credentials-query",
            })?;

            row.map(|row| {
                Ok(AccountCredentials {
                    account_id: AccountId::parse(&row.id)?,
                    password_hash: row.password_hash,
                    password_salt: row.password_salt,
                })
            })
            .transpose()
        })
    }

    fn get_account(&self, account_id: AccountId) -> BoxFuture<'_, StorageResult<Option<AccountRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, AccountRow>(
                "SELECT id, email, display_name, subscription_plan, created_at FROM accounts WHERE id = ?",
            )
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "account-get-query",
            })?;

            row.map(account_row_to_record).transpose()
        })
    }

    fn set_subscription_plan(
        &self,
        account_id: AccountId,
        plan_id: Option<String>,
    ) -> BoxFuture<'_, StorageResult<AccountRecord>> {
        Box::pin(async move {
            let update_result = sqlx::query("UPDATE accounts SET subscription_plan = ? WHERE id = ?")
                .bind(plan_id)
                .bind(account_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "account-subscription-apply",
                })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "account-subscription-missing",
                    entity: "account",
                    id: account_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, AccountRow>(
                "SELECT id, email, display_name, subscription_plan, created_at FROM accounts WHERE id = ?",
            )
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "account-subscription-load",
            })?
            .context(NotFoundSnafu {
                stage: "account-subscription-load-missing",
                entity: "account",
                id: account_id.to_string(),
            })?;

            account_row_to_record(row)
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    account_id: String,
    seq: i64,
    role: String,
    content: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: String,
    email: String,
    display_name: String,
    subscription_plan: Option<String>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct CredentialsRow {
    id: String,
    password_hash: String,
    password_salt: String,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        account_id: AccountId::parse(&row.account_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn account_row_to_record(row: AccountRow) -> StorageResult<AccountRecord> {
    Ok(AccountRecord {
        id: AccountId::parse(&row.id)?,
        email: row.email,
        display_name: row.display_name,
        subscription_plan: row.subscription_plan,
        created_at_unix_millis: i64_to_u64(row.created_at, "account-row-created-at")?,
    })
}

async fn ensure_account_exists(
    connection: &mut SqliteConnection,
    account_id: AccountId,
    stage: &'static str,
) -> StorageResult<()> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts WHERE id = ?")
        .bind(account_id.to_string())
        .fetch_one(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    if exists == 0 {
        return UnauthenticatedSnafu {
            stage,
            account_id: account_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
