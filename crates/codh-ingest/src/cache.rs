//! Per-run identity resolver.
//!
//! `RunContext` is owned by exactly one orchestration call and discarded
//! when the run ends; it is never shared across runs or processes, since a
//! cached identity can go stale relative to a concurrent writer. Each
//! distinct canonical key hits the store once per run; repeats are served
//! from memory.

use std::collections::HashMap;

use codh_core::normalize::{canonical_key, person_key, territory_key};
use codh_core::MandateRow;
use codh_store::upsert::{self, PersonUpsert};
use codh_store::{Result, SqliteConnection};

#[derive(Debug, Default)]
pub struct RunContext {
    admin_levels: HashMap<String, i64>,
    roles: HashMap<String, i64>,
    genders: HashMap<String, i64>,
    parties: HashMap<String, i64>,
    institutions: HashMap<String, i64>,
    territories: HashMap<String, i64>,
    persons: HashMap<String, i64>,
    source_records: HashMap<String, i64>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve_admin_level(
        &mut self,
        conn: &mut SqliteConnection,
        label: Option<&str>,
    ) -> Result<Option<i64>> {
        let Some(key) = label.and_then(canonical_key) else {
            return Ok(None);
        };
        if let Some(id) = self.admin_levels.get(&key) {
            return Ok(Some(*id));
        }
        let id = upsert::upsert_admin_level(conn, &key, label.unwrap_or_default().trim()).await?;
        self.admin_levels.insert(key, id);
        Ok(Some(id))
    }

    pub async fn resolve_role(
        &mut self,
        conn: &mut SqliteConnection,
        label: Option<&str>,
    ) -> Result<Option<i64>> {
        let Some(key) = label.and_then(canonical_key) else {
            return Ok(None);
        };
        if let Some(id) = self.roles.get(&key) {
            return Ok(Some(*id));
        }
        let id = upsert::upsert_role(conn, &key, label.unwrap_or_default().trim()).await?;
        self.roles.insert(key, id);
        Ok(Some(id))
    }

    pub async fn resolve_gender(
        &mut self,
        conn: &mut SqliteConnection,
        label: Option<&str>,
    ) -> Result<Option<i64>> {
        let Some(key) = label.and_then(canonical_key) else {
            return Ok(None);
        };
        if let Some(id) = self.genders.get(&key) {
            return Ok(Some(*id));
        }
        let id = upsert::upsert_gender(conn, &key, label.unwrap_or_default().trim()).await?;
        self.genders.insert(key, id);
        Ok(Some(id))
    }

    pub async fn resolve_party(
        &mut self,
        conn: &mut SqliteConnection,
        label: Option<&str>,
    ) -> Result<Option<i64>> {
        let Some(key) = label.and_then(canonical_key) else {
            return Ok(None);
        };
        if let Some(id) = self.parties.get(&key) {
            return Ok(Some(*id));
        }
        let id = upsert::upsert_party(conn, &key, label.unwrap_or_default().trim()).await?;
        self.parties.insert(key, id);
        Ok(Some(id))
    }

    pub async fn resolve_institution(
        &mut self,
        conn: &mut SqliteConnection,
        label: &str,
    ) -> Result<Option<i64>> {
        let Some(key) = canonical_key(label) else {
            return Ok(None);
        };
        if let Some(id) = self.institutions.get(&key) {
            return Ok(Some(*id));
        }
        let id = upsert::upsert_institution(conn, &key, label.trim()).await?;
        self.institutions.insert(key, id);
        Ok(Some(id))
    }

    /// Territories resolve from the code when present (three-way rule),
    /// falling back to the display name.
    pub async fn resolve_territory(
        &mut self,
        conn: &mut SqliteConnection,
        code: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<i64>> {
        let key = match code.and_then(territory_key) {
            Some(key) => key,
            None => match name.and_then(canonical_key) {
                Some(key) => key,
                None => return Ok(None),
            },
        };
        if let Some(id) = self.territories.get(&key) {
            return Ok(Some(*id));
        }
        let id = upsert::upsert_territory(conn, &key, code, name).await?;
        self.territories.insert(key, id);
        Ok(Some(id))
    }

    /// Person identity from `(full name, birth date, territory code)`. An
    /// unresolvable name yields `None` (the caller skips the record).
    pub async fn resolve_person(
        &mut self,
        conn: &mut SqliteConnection,
        row: &MandateRow,
        gender_id: Option<i64>,
    ) -> Result<Option<i64>> {
        let Some(key) = person_key(
            &row.full_name,
            row.birth_date,
            row.territory_code.as_deref(),
        ) else {
            return Ok(None);
        };
        if let Some(id) = self.persons.get(&key) {
            return Ok(Some(*id));
        }
        let birth = row.birth_date.map(|d| d.to_string());
        let id = upsert::upsert_person(
            conn,
            &PersonUpsert {
                person_key: &key,
                full_name: row.full_name.trim(),
                birth_date: birth.as_deref(),
                territory_code: row.territory_code.as_deref(),
                gender_id,
            },
        )
        .await?;
        self.persons.insert(key, id);
        Ok(Some(id))
    }

    /// Raw source-record identity, amortized across repeats within the run.
    pub async fn resolve_source_record(
        &mut self,
        conn: &mut SqliteConnection,
        source_id: i64,
        source_record_id: &str,
        payload: &str,
        content_hash: Option<&str>,
        snapshot_date: Option<&str>,
    ) -> Result<i64> {
        let key = format!("{source_id}:{source_record_id}");
        if let Some(id) = self.source_records.get(&key) {
            return Ok(*id);
        }
        let id = codh_store::records::upsert_source_record(
            conn,
            source_id,
            source_record_id,
            payload,
            content_hash,
            snapshot_date,
        )
        .await?;
        self.source_records.insert(key, id);
        Ok(id)
    }
}
