// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Providing policies and saved consumer terms.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use usage::{Mismatch, ProvidingPolicy, Rejection, Terms};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS policy (
    data_id         TEXT NOT NULL,
    provider        TEXT NOT NULL,
    type            TEXT NOT NULL,
    consumer        TEXT NOT NULL DEFAULT '[]',
    app_id          TEXT NOT NULL DEFAULT '[]',
    disclosing      TEXT NOT NULL DEFAULT '[]',
    counter         INTEGER,
    location        TEXT,
    duration        INTEGER,
    expiration_date TEXT
);

CREATE INDEX IF NOT EXISTS policy_data_id ON policy (data_id);

CREATE TABLE IF NOT EXISTS saved_policy (
    consumer        TEXT NOT NULL,
    app_id          TEXT NOT NULL,
    data_id         TEXT NOT NULL,
    counter         INTEGER,
    location        TEXT,
    duration        INTEGER,
    expiration_date TEXT,
    PRIMARY KEY (consumer, app_id, data_id)
);
"#;

fn storage(e: impl std::fmt::Display) -> Rejection {
    Rejection::Storage(e.to_string())
}

/// Keys a saved policy row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grant<'a> {
    pub consumer: &'a str,
    pub app_id: &'a str,
    pub data_id: &'a str,
}

/// The provider's SQLite database.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a providing policy.
    pub fn insert_policy(&self, policy: &ProvidingPolicy) -> Result<(), Rejection> {
        insert_policy(&self.conn(), policy)
    }

    /// Replaces the providing policies of the given data items.
    pub fn replace_policies(&self, policies: &[ProvidingPolicy]) -> Result<(), Rejection> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(storage)?;
        for policy in policies {
            tx.execute("DELETE FROM policy WHERE data_id = ?", [&policy.data_id])
                .map_err(storage)?;
        }
        for policy in policies {
            insert_policy(&tx, policy)?;
        }
        tx.commit().map_err(storage)
    }

    /// The providing policy of a data item; there must be exactly one.
    pub fn policy(&self, data_id: &str) -> Result<ProvidingPolicy, Rejection> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT provider, type, consumer, app_id, disclosing,
                       counter, location, duration, expiration_date
                FROM policy WHERE data_id = ?
                "#,
            )
            .map_err(storage)?;

        let policies = stmt
            .query_map([data_id], |row| {
                let list = |i: usize| -> rusqlite::Result<Vec<String>> {
                    let text: String = row.get(i)?;
                    serde_json::from_str(&text).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(i, Type::Text, e.into())
                    })
                };

                Ok(ProvidingPolicy {
                    provider: row.get(0)?,
                    data_type: row.get(1)?,
                    data_id: data_id.into(),
                    consumers: list(2)?,
                    app_ids: list(3)?,
                    disclosing: list(4)?,
                    terms: terms(row, 5)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(storage)?;

        match <[ProvidingPolicy; 1]>::try_from(policies) {
            Ok([policy]) => Ok(policy),
            Err(..) => Err(Mismatch::MissingPolicy.into()),
        }
    }

    /// Saves the terms granted to a consumer and then runs `issue`.
    ///
    /// The row is only committed if `issue` succeeds.
    pub fn save<T>(
        &self,
        grant: Grant<'_>,
        terms: &Terms,
        issue: impl FnOnce() -> Result<T, Rejection>,
    ) -> Result<T, Rejection> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(storage)?;

        tx.execute(
            r#"
            INSERT INTO saved_policy (
                consumer, app_id, data_id, counter, location, duration, expiration_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(consumer, app_id, data_id) DO UPDATE SET
                counter = excluded.counter,
                location = excluded.location,
                duration = excluded.duration,
                expiration_date = excluded.expiration_date
            "#,
            params![
                grant.consumer,
                grant.app_id,
                grant.data_id,
                terms.counter,
                terms.location,
                terms.duration,
                terms.expiration_date.map(|d| d.to_string()),
            ],
        )
        .map_err(storage)?;

        let issued = issue()?;
        tx.commit().map_err(storage)?;
        Ok(issued)
    }

    /// The terms saved for a consumer, if any.
    pub fn saved(&self, grant: Grant<'_>) -> Result<Option<Terms>, Rejection> {
        self.conn()
            .query_row(
                r#"
                SELECT counter, location, duration, expiration_date
                FROM saved_policy
                WHERE consumer = ?1 AND app_id = ?2 AND data_id = ?3
                "#,
                params![grant.consumer, grant.app_id, grant.data_id],
                |row| terms(row, 0),
            )
            .optional()
            .map_err(storage)
    }
}

fn insert_policy(conn: &Connection, policy: &ProvidingPolicy) -> Result<(), Rejection> {
    let list = |l: &Vec<String>| serde_json::to_string(l).map_err(storage);

    conn.execute(
        r#"
        INSERT INTO policy (
            data_id, provider, type, consumer, app_id, disclosing,
            counter, location, duration, expiration_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            policy.data_id,
            policy.provider,
            policy.data_type,
            list(&policy.consumers)?,
            list(&policy.app_ids)?,
            list(&policy.disclosing)?,
            policy.terms.counter,
            policy.terms.location,
            policy.terms.duration,
            policy.terms.expiration_date.map(|d| d.to_string()),
        ],
    )
    .map_err(storage)?;
    Ok(())
}

/// Reads the four term columns starting at `first`.
fn terms(row: &Row<'_>, first: usize) -> rusqlite::Result<Terms> {
    let expiration_date: Option<String> = row.get(first + 3)?;
    let expiration_date = expiration_date
        .map(|d| d.parse::<NaiveDate>())
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(first + 3, Type::Text, e.into())
        })?;

    let terms = Terms {
        counter: row.get(first)?,
        location: row.get(first + 1)?,
        duration: row.get(first + 2)?,
        expiration_date,
    };
    Ok(terms.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA_ID: &str = "https://provider.example/data/personal/1";

    const GRANT: Grant<'static> = Grant {
        consumer: "alice",
        app_id: "deadbeef",
        data_id: DATA_ID,
    };

    fn policy() -> ProvidingPolicy {
        ProvidingPolicy {
            provider: "provider.example".into(),
            data_type: "personal".into(),
            data_id: DATA_ID.into(),
            consumers: vec!["alice".into()],
            app_ids: vec![],
            disclosing: vec!["personal.age".into()],
            terms: Terms {
                counter: Some(10),
                location: Some("JP".into()),
                duration: None,
                expiration_date: Some("2030-01-01".parse().unwrap()),
            },
        }
    }

    fn terms(counter: u32) -> Terms {
        Terms {
            counter: Some(counter),
            location: Some("JP".into()),
            duration: Some(30),
            expiration_date: Some("2030-01-01".parse().unwrap()),
        }
    }

    #[test]
    fn policy_lookup() {
        let store = Store::memory().unwrap();
        assert_eq!(
            store.policy(DATA_ID),
            Err(Rejection::PolicyMismatch(Mismatch::MissingPolicy))
        );

        store.insert_policy(&policy()).unwrap();
        assert_eq!(store.policy(DATA_ID).unwrap(), policy());

        // Ambiguous policies are not used.
        store.insert_policy(&policy()).unwrap();
        assert_eq!(
            store.policy(DATA_ID),
            Err(Rejection::PolicyMismatch(Mismatch::MissingPolicy))
        );
    }

    #[test]
    fn replace_policies() {
        let store = Store::memory().unwrap();
        store.insert_policy(&policy()).unwrap();
        store.insert_policy(&policy()).unwrap();

        let mut tighter = policy();
        tighter.terms.counter = Some(3);
        store.replace_policies(&[tighter.clone()]).unwrap();
        store.replace_policies(&[tighter.clone()]).unwrap();
        assert_eq!(store.policy(DATA_ID).unwrap(), tighter);
    }

    #[test]
    fn zero_terms_read_as_unrestricted() {
        let store = Store::memory().unwrap();
        let mut open = policy();
        open.terms = Terms {
            counter: Some(0),
            location: Some(String::new()),
            duration: Some(0),
            expiration_date: None,
        };
        store.insert_policy(&open).unwrap();
        assert_eq!(store.policy(DATA_ID).unwrap().terms, Terms::default());
    }

    #[test]
    fn save_upserts() {
        let store = Store::memory().unwrap();
        assert_eq!(store.saved(GRANT).unwrap(), None);

        store.save(GRANT, &terms(5), || Ok(())).unwrap();
        assert_eq!(store.saved(GRANT).unwrap(), Some(terms(5)));

        store.save(GRANT, &terms(3), || Ok(())).unwrap();
        assert_eq!(store.saved(GRANT).unwrap(), Some(terms(3)));

        let other = Grant {
            consumer: "bob",
            ..GRANT
        };
        assert_eq!(store.saved(other).unwrap(), None);
    }

    #[test]
    fn save_rolls_back() {
        let store = Store::memory().unwrap();
        store.save(GRANT, &terms(5), || Ok(())).unwrap();

        let result: Result<(), _> = store.save(GRANT, &terms(1), || {
            Err(Rejection::Storage("signing failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.saved(GRANT).unwrap(), Some(terms(5)));
    }

    #[test]
    fn unrestricted_terms() {
        let store = Store::memory().unwrap();
        store.save(GRANT, &Terms::default(), || Ok(())).unwrap();
        assert_eq!(store.saved(GRANT).unwrap(), Some(Terms::default()));
    }

    #[test]
    fn reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.db");

        Store::open(&path)
            .unwrap()
            .save(GRANT, &terms(5), || Ok(()))
            .unwrap();
        assert_eq!(Store::open(&path).unwrap().saved(GRANT).unwrap(), Some(terms(5)));
    }
}
