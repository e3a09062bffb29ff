//! Physically undoes one block's tracked mutations.
//!
//! Reads the block's change records newest-first and inverts each one:
//! inserts are deleted, updates and deletes restore the recorded pre-image.
//! A record that no longer matches the table state means the store was
//! touched outside the tracker; that is corruption, so rollback fails rather
//! than guessing. Everything runs inside the caller's transaction.

use crate::store::{quote_ident, to_sql_value};
use crate::tracker::{ChangeRecord, RowValues};
use eyre::{ensure, Context, Result};

fn undo_insert(tx: &rusqlite::Transaction<'_>, table: &str, id: &str) -> Result<()> {
    let deleted = tx.execute(
        &format!("DELETE FROM {} WHERE \"id\" = ?1", quote_ident(table)?),
        [id],
    )?;
    ensure!(
        deleted == 1,
        "inserted row {table}.{id} vanished before rollback"
    );
    Ok(())
}

fn undo_update(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    id: &str,
    prior: &RowValues,
) -> Result<()> {
    if prior.is_empty() {
        return Ok(());
    }
    let mut assignments = Vec::with_capacity(prior.len());
    let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(prior.len() + 1);
    for (position, (column, value)) in prior.iter().enumerate() {
        assignments.push(format!("{} = ?{}", quote_ident(column)?, position + 1));
        params.push(to_sql_value(value)?);
    }
    params.push(rusqlite::types::Value::Text(id.to_string()));
    let updated = tx.execute(
        &format!(
            "UPDATE {} SET {} WHERE \"id\" = ?{}",
            quote_ident(table)?,
            assignments.join(", "),
            prior.len() + 1
        ),
        rusqlite::params_from_iter(params),
    )?;
    ensure!(
        updated == 1,
        "updated row {table}.{id} vanished before rollback"
    );
    Ok(())
}

fn undo_delete(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    id: &str,
    prior: &RowValues,
) -> Result<()> {
    let mut columns = vec!["\"id\"".to_string()];
    let mut params: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(id.to_string())];
    for (column, value) in prior {
        columns.push(quote_ident(column)?);
        params.push(to_sql_value(value)?);
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("?{n}")).collect();
    tx.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            columns.join(", "),
            placeholders.join(", ")
        ),
        rusqlite::params_from_iter(params),
    )
    .wrap_err_with(|| format!("failed to restore deleted row {table}.{id}"))?;
    Ok(())
}

fn apply_inverse(tx: &rusqlite::Transaction<'_>, record: &ChangeRecord) -> Result<()> {
    match record {
        ChangeRecord::Insert { table, id } => undo_insert(tx, table, id),
        ChangeRecord::Update { table, id, prior } => undo_update(tx, table, id, prior),
        ChangeRecord::Delete { table, id, prior } => undo_delete(tx, table, id, prior),
    }
}

/// Rolls back every tracked mutation of the block at `height`, newest
/// record first, then drops the block's change records and its hot-block
/// row. Errors are fatal: a partial rollback would corrupt the data view.
pub fn rollback_block(tx: &rusqlite::Transaction<'_>, schema: &str, height: u64) -> Result<()> {
    let height_param = i64::try_from(height).wrap_err("block height out of range")?;
    let records: Vec<(i64, String)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT idx, change FROM \"{schema}_hot_change_log\"
             WHERE block_height = ?1 ORDER BY idx DESC"
        ))?;
        let rows = stmt
            .query_map([height_param], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    for (idx, json) in &records {
        let record: ChangeRecord = serde_json::from_str(json)
            .wrap_err_with(|| format!("corrupt change record ({height}, {idx})"))?;
        apply_inverse(tx, &record)
            .wrap_err_with(|| format!("failed to roll back block {height} at change {idx}"))?;
    }

    tx.execute(
        &format!("DELETE FROM \"{schema}_hot_change_log\" WHERE block_height = ?1"),
        [height_param],
    )?;
    tx.execute(
        &format!("DELETE FROM \"{schema}_hot_block\" WHERE height = ?1"),
        [height_param],
    )?;
    tracing::info!(height, changes = records.len(), "rolled back block");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BatchStore, Database, Row};
    use crate::tracker::ChangeTracker;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn test_db() -> Database {
        let db = Database::new(":memory:", "sluice").expect("open");
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (id TEXT PRIMARY KEY, amount INTEGER, note TEXT);",
        )
        .expect("migration");
        db
    }

    fn dump(db: &Database) -> BTreeMap<String, (serde_json::Value, serde_json::Value)> {
        db.with_transaction(|tx| {
            let mut stmt = tx.prepare("SELECT id, amount, note FROM entries ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        (
                            row.get::<_, Option<i64>>(1)?
                                .map_or(serde_json::Value::Null, |v| serde_json::json!(v)),
                            row.get::<_, Option<String>>(2)?
                                .map_or(serde_json::Value::Null, serde_json::Value::String),
                        ),
                    ))
                })?
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
            Ok(rows)
        })
        .expect("dump")
    }

    fn entry(id: &str, amount: i64, note: &str) -> Row {
        Row::new(id)
            .set("amount", serde_json::json!(amount))
            .set("note", serde_json::json!(note))
    }

    #[test]
    fn rollback_inverts_insert_update_and_delete() {
        let db = test_db();

        // Pre-existing state from an earlier, already finalized block.
        db.with_transaction(|tx| {
            let mut store = BatchStore::new(tx, "sluice", None);
            store.insert("entries", &[entry("kept", 1, "old"), entry("gone", 2, "old")])
        })
        .expect("seed");
        let before = dump(&db);

        db.with_transaction(|tx| {
            let mut store = BatchStore::new(tx, "sluice", Some(ChangeTracker::new(9)));
            store.insert("entries", &[entry("fresh", 10, "new")])?;
            store.upsert("entries", &[entry("kept", 99, "clobbered")])?;
            store.delete("entries", &["gone".to_string()])?;
            crate::store::insert_hot_block(tx, "sluice", 9, "0x09")?;
            Ok(())
        })
        .expect("hot block");
        assert_ne!(dump(&db), before);

        db.with_transaction(|tx| rollback_block(tx, "sluice", 9))
            .expect("rollback");
        assert_eq!(dump(&db), before);
        assert_eq!(db.change_log_len().unwrap(), 0);
        assert_eq!(db.hot_depth().unwrap(), 0);
    }

    #[test]
    fn rollback_of_a_block_with_no_records_is_a_no_op() {
        let db = test_db();
        db.with_transaction(|tx| rollback_block(tx, "sluice", 1234))
            .expect("rollback");
    }

    #[test]
    fn missing_row_during_rollback_is_fatal() {
        let db = test_db();
        db.with_transaction(|tx| {
            let mut store = BatchStore::new(tx, "sluice", Some(ChangeTracker::new(3)));
            store.insert("entries", &[entry("a", 1, "x")])
        })
        .expect("insert");

        // Something outside the tracker removed the row.
        db.execute_batch("DELETE FROM entries WHERE id = 'a';")
            .expect("tamper");

        let result = db.with_transaction(|tx| rollback_block(tx, "sluice", 3));
        let message = format!("{:#}", result.expect_err("must fail"));
        assert!(message.contains("vanished before rollback"), "{message}");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(String, i64, String),
        Upsert(String, i64, String),
        Delete(String),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        let id = proptest::sample::select(&["a", "b", "c", "d"][..]).prop_map(str::to_string);
        prop_oneof![
            (id.clone(), any::<i64>(), "[a-z]{0,6}").prop_map(|(i, n, s)| Op::Insert(i, n, s)),
            (id.clone(), any::<i64>(), "[a-z]{0,6}").prop_map(|(i, n, s)| Op::Upsert(i, n, s)),
            id.prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn rollback_restores_the_exact_pre_block_state(
            seed in proptest::collection::vec(("[ab]", any::<i64>(), "[a-z]{0,4}"), 0..3),
            ops in proptest::collection::vec(arb_op(), 1..12),
        ) {
            let db = test_db();
            db.with_transaction(|tx| {
                let mut store = BatchStore::new(tx, "sluice", None);
                for (id, amount, note) in &seed {
                    store.upsert("entries", &[entry(id, *amount, note)])?;
                }
                Ok(())
            }).expect("seed");
            let before = dump(&db);

            db.with_transaction(|tx| {
                let mut store = BatchStore::new(tx, "sluice", Some(ChangeTracker::new(77)));
                for op in &ops {
                    match op {
                        Op::Insert(id, amount, note) => {
                            // Plain inserts only apply to absent ids.
                            if store.select("entries", &[id.clone()])?.is_empty() {
                                store.insert("entries", &[entry(id, *amount, note)])?;
                            }
                        }
                        Op::Upsert(id, amount, note) => {
                            store.upsert("entries", &[entry(id, *amount, note)])?;
                        }
                        Op::Delete(id) => {
                            store.delete("entries", &[id.clone()])?;
                        }
                    }
                }
                Ok(())
            }).expect("apply ops");

            db.with_transaction(|tx| rollback_block(tx, "sluice", 77)).expect("rollback");
            prop_assert_eq!(dump(&db), before);
            prop_assert_eq!(db.change_log_len().unwrap(), 0);
        }
    }
}
