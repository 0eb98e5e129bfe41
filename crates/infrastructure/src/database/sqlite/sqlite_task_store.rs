use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use workerd_core::config::DatabaseConfig;
use workerd_core::{SchedulerError, SchedulerResult, TaskEnv, TaskRow, TaskStore};

/// 基于SQLite的任务存储
///
/// 每个未完成的任务占一行，`env` 列保存JSON编码的任务负载。连接池在
/// `start` 时建立，`stop` 时关闭。
pub struct SqliteTaskStore {
    url: String,
    max_connections: u32,
    pool: Mutex<Option<SqlitePool>>,
}

impl SqliteTaskStore {
    pub fn new(url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            url: url.into(),
            max_connections,
            pool: Mutex::new(None),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.url.clone(), config.max_connections)
    }

    fn pool(&self) -> SchedulerResult<SqlitePool> {
        self.pool
            .lock()
            .map_err(|_| SchedulerError::Internal("连接池锁已中毒".to_string()))?
            .clone()
            .ok_or_else(|| SchedulerError::database_error("任务存储尚未启动"))
    }

    /// 运行数据库迁移
    async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task (
                id TEXT PRIMARY KEY,
                env TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn start(&self) -> SchedulerResult<()> {
        if self.pool().is_ok() {
            debug!("任务存储已经启动");
            return Ok(());
        }

        let connect_options = SqliteConnectOptions::from_str(&self.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;

        let mut slot = self
            .pool
            .lock()
            .map_err(|_| SchedulerError::Internal("连接池锁已中毒".to_string()))?;
        *slot = Some(pool);
        info!("任务存储已启动");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> SchedulerResult<()> {
        let pool = self
            .pool
            .lock()
            .map_err(|_| SchedulerError::Internal("连接池锁已中毒".to_string()))?
            .take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("任务存储已关闭");
        }
        Ok(())
    }

    #[instrument(skip(self, env))]
    async fn insert(&self, task_id: &str, env: &TaskEnv) -> SchedulerResult<()> {
        let pool = self.pool()?;
        let env_json = env.to_json_string()?;

        sqlx::query("INSERT INTO task (id, env) VALUES ($1, $2)")
            .bind(task_id)
            .bind(env_json)
            .execute(&pool)
            .await?;

        debug!("写入任务记录: {}", task_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, task_id: &str) -> SchedulerResult<()> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM task WHERE id = $1")
            .bind(task_id)
            .execute(&pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!("任务记录不存在: {}", task_id);
        } else {
            debug!("删除任务记录: {}", task_id);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> SchedulerResult<Vec<TaskRow>> {
        let pool = self.pool()?;
        let rows = sqlx::query("SELECT id, env FROM task ORDER BY rowid")
            .fetch_all(&pool)
            .await?;

        rows.iter()
            .map(|row| -> SchedulerResult<TaskRow> {
                let task_id: String = row.try_get("id")?;
                let env_json: String = row.try_get("env")?;
                let env = TaskEnv::from_json_str(&env_json).map_err(|e| {
                    SchedulerError::Serialization(format!("任务 {task_id} 的负载无法解析: {e}"))
                })?;
                Ok(TaskRow { task_id, env })
            })
            .collect()
    }
}
