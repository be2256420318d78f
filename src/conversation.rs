use chrono::Utc;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use serde_json::Value;

use crate::{BotResult, debug};

/// 一段持久化的对话
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub cid: String,
    pub origin: String,
    /// OpenAI 消息格式的历史条目
    pub history: Vec<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 对话管理器：sqlite 存储，每个会话源指向一个当前对话
pub struct ConversationManager {
    db: DatabaseConnection,
}

impl ConversationManager {
    pub async fn new(db: DatabaseConnection) -> BotResult<Self> {
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            r#"CREATE TABLE IF NOT EXISTS conversations (
                cid TEXT PRIMARY KEY,
                origin TEXT NOT NULL,
                history TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#
            .to_owned(),
        ))
        .await?;
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            r#"CREATE TABLE IF NOT EXISTS session_conversations (
                origin TEXT PRIMARY KEY,
                cid TEXT NOT NULL
            )"#
            .to_owned(),
        ))
        .await?;
        Ok(Self { db })
    }

    /// 会话源当前指向的对话 ID
    pub async fn get_curr_conversation_id(&self, origin: &str) -> BotResult<Option<String>> {
        let res = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT cid FROM session_conversations WHERE origin = ?",
                [origin.into()],
            ))
            .await?;
        match res {
            Some(row) => Ok(Some(row.try_get("", "cid")?)),
            None => Ok(None),
        }
    }

    /// 新建对话并将其设为会话源的当前对话
    pub async fn new_conversation(&self, origin: &str) -> BotResult<String> {
        let now = Utc::now().timestamp();
        let cid = format!(
            "{:x}",
            md5::compute(format!("{}:{}", origin, Utc::now().timestamp_nanos_opt().unwrap_or(now)))
        );
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO conversations (cid, origin, history, created_at, updated_at) VALUES (?, ?, '[]', ?, ?)",
                [cid.clone().into(), origin.into(), now.into(), now.into()],
            ))
            .await?;
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO session_conversations (origin, cid) VALUES (?, ?) \
                 ON CONFLICT(origin) DO UPDATE SET cid = excluded.cid",
                [origin.into(), cid.clone().into()],
            ))
            .await?;
        debug!(target: "Conversation", "新建对话 {} ({})", cid, origin);
        Ok(cid)
    }

    pub async fn get_conversation(&self, cid: &str) -> BotResult<Option<Conversation>> {
        let res = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT cid, origin, history, created_at, updated_at FROM conversations WHERE cid = ?",
                [cid.into()],
            ))
            .await?;
        let Some(row) = res else {
            return Ok(None);
        };
        let history_raw: String = row.try_get("", "history")?;
        let history: Vec<Value> = serde_json::from_str(&history_raw).unwrap_or_default();
        Ok(Some(Conversation {
            cid: row.try_get("", "cid")?,
            origin: row.try_get("", "origin")?,
            history,
            created_at: row.try_get("", "created_at")?,
            updated_at: row.try_get("", "updated_at")?,
        }))
    }

    /// 覆盖写入对话历史
    pub async fn update_conversation(&self, cid: &str, history: &[Value]) -> BotResult<()> {
        let now = Utc::now().timestamp();
        let history_json = serde_json::to_string(history)?;
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE conversations SET history = ?, updated_at = ? WHERE cid = ?",
                [history_json.into(), now.into(), cid.into()],
            ))
            .await?;
        Ok(())
    }

    /// 取会话源的当前对话，不存在时新建
    pub async fn get_or_create(&self, origin: &str) -> BotResult<Conversation> {
        if let Some(cid) = self.get_curr_conversation_id(origin).await?
            && let Some(conv) = self.get_conversation(&cid).await?
        {
            return Ok(conv);
        }
        let cid = self.new_conversation(origin).await?;
        match self.get_conversation(&cid).await? {
            Some(conv) => Ok(conv),
            None => Err("新建对话后读取失败".into()),
        }
    }
}
