//! Per-run in-memory alias index over a company's persisted assets.

use std::collections::HashMap;

use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::db::parse_uuid;
use crate::IngestError;

#[derive(Debug, Clone, Default)]
pub struct AliasIndex {
    by_key: HashMap<String, Uuid>,
    alias_texts: Vec<String>,
    names: HashMap<Uuid, String>,
    by_name: HashMap<String, Uuid>,
}

impl AliasIndex {
    pub async fn load(conn: &mut SqliteConnection, company_id: &str) -> Result<Self, IngestError> {
        let mut index = Self::default();

        let assets = sqlx::query("SELECT id, canonical_name FROM assets WHERE company_id = ?")
            .bind(company_id)
            .fetch_all(&mut *conn)
            .await?;
        for row in assets {
            let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
            index.insert_asset(id, row.try_get("canonical_name")?);
        }

        let aliases = sqlx::query(
            "SELECT normalized_text, alias_text, asset_id FROM asset_aliases \
             WHERE company_id = ? ORDER BY normalized_text",
        )
        .bind(company_id)
        .fetch_all(&mut *conn)
        .await?;
        for row in aliases {
            let asset_id = parse_uuid(&row.try_get::<String, _>("asset_id")?)?;
            index.insert_alias(row.try_get("normalized_text")?, row.try_get("alias_text")?, asset_id);
        }

        Ok(index)
    }

    pub fn lookup(&self, key: &str) -> Option<Uuid> {
        self.by_key.get(key).copied()
    }

    pub fn asset_by_name(&self, canonical_name: &str) -> Option<Uuid> {
        self.by_name.get(canonical_name).copied()
    }

    pub fn name_of(&self, asset_id: Uuid) -> Option<&str> {
        self.names.get(&asset_id).map(String::as_str)
    }

    pub fn insert_asset(&mut self, asset_id: Uuid, canonical_name: String) {
        self.by_name.insert(canonical_name.clone(), asset_id);
        self.names.insert(asset_id, canonical_name);
    }

    /// Returns false when the key is already owned.
    pub fn insert_alias(&mut self, key: String, alias_text: String, asset_id: Uuid) -> bool {
        if self.by_key.contains_key(&key) {
            return false;
        }
        self.by_key.insert(key, asset_id);
        self.alias_texts.push(alias_text);
        true
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, Uuid)> {
        self.by_key.iter().map(|(k, id)| (k.as_str(), *id))
    }

    pub fn alias_texts(&self) -> &[String] {
        &self.alias_texts
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
