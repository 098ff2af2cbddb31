//! Key-value store repository backing the `store_*` script functions.
//!
//! Values are opaque strings keyed by `(namespace, key)`. Encoding of Lua
//! tables to JSON happens in the script layer, not here.

use sqlx::SqlitePool;

use crate::Result;

/// Repository for namespaced key-value pairs.
pub struct KvRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> KvRepository<'a> {
    /// Create a new KvRepository with the given pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a value.
    pub async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_store (namespace, key, value) VALUES (?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Get a value. Absent keys yield `None`.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM kv_store WHERE namespace = ? AND key = ?")
                .bind(namespace)
                .bind(key)
                .fetch_optional(self.pool)
                .await?;

        Ok(value.map(Option::unwrap_or_default))
    }

    /// Get every key-value pair in a namespace, ordered by key.
    pub async fn get_all(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT key, value FROM kv_store WHERE namespace = ? ORDER BY key")
                .bind(namespace)
                .fetch_all(self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_default()))
            .collect())
    }

    /// Delete a value. Returns whether a row was removed; deleting an
    /// absent key is not an error.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        repo.set("greetings", "hello", "world").await.unwrap();
        let value = repo.get("greetings", "hello").await.unwrap();
        assert_eq!(value.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_get_absent_key() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        assert!(repo.get("ns", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        repo.set("ns", "k", "1").await.unwrap();
        repo.set("ns", "k", "2").await.unwrap();
        assert_eq!(repo.get("ns", "k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(repo.get_all("ns").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        repo.set("a", "k", "from a").await.unwrap();
        repo.set("b", "k", "from b").await.unwrap();

        assert_eq!(repo.get("a", "k").await.unwrap().as_deref(), Some("from a"));
        assert_eq!(repo.get("b", "k").await.unwrap().as_deref(), Some("from b"));
    }

    #[tokio::test]
    async fn test_get_all() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        repo.set("ns", "b", "2").await.unwrap();
        repo.set("ns", "a", "1").await.unwrap();
        repo.set("other", "c", "3").await.unwrap();

        let all = repo.get_all("ns").await.unwrap();
        assert_eq!(
            all,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_get_all_empty_namespace() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        assert!(repo.get_all("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let db = setup().await;
        let repo = KvRepository::new(db.pool());

        repo.set("ns", "k", "v").await.unwrap();
        assert!(repo.delete("ns", "k").await.unwrap());
        assert!(!repo.delete("ns", "k").await.unwrap());
        assert!(repo.get("ns", "k").await.unwrap().is_none());
    }
}
