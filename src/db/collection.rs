use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::models::{CardIdentity, CollectionRecord};

pub const CSV_HEADER: [&str; 4] = ["Card Name", "Owned Copies", "Scryfall ID", "Scryfall URI"];

/// Records the owned count for `name`. Metadata is only filled where it is
/// still missing; an absent identity never clears what is already known.
pub async fn upsert(
    pool: &SqlitePool,
    name: &str,
    owned_count: u32,
    identity: Option<&CardIdentity>,
) -> Result<()> {
    let external_id = identity.map(|i| i.external_id.as_str());
    let uri = identity.map(|i| i.external_uri.as_str());

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO collection (name, owned_count, external_id, uri, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(name) DO UPDATE SET
            owned_count = excluded.owned_count,
            external_id = COALESCE(collection.external_id, excluded.external_id),
            uri = COALESCE(collection.uri, excluded.uri),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(name)
    .bind(owned_count as i64)
    .bind(external_id)
    .bind(uri)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    debug!("Recorded {} x{}", name, owned_count);
    Ok(())
}

pub async fn get(pool: &SqlitePool, name: &str) -> Result<Option<CollectionRecord>> {
    let record = sqlx::query_as::<_, CollectionRecord>(
        r#"
        SELECT name, owned_count, external_id, uri, updated_at
        FROM collection
        WHERE name = ?1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// All records, ordered by name ignoring case.
pub async fn export(pool: &SqlitePool) -> Result<Vec<CollectionRecord>> {
    let records = sqlx::query_as::<_, CollectionRecord>(
        r#"
        SELECT name, owned_count, external_id, uri, updated_at
        FROM collection
        ORDER BY name COLLATE NOCASE, name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub fn render_csv(records: &[CollectionRecord]) -> String {
    let mut out = String::new();
    push_row(&mut out, CSV_HEADER.iter().copied());
    for record in records {
        let count = record.owned_count.to_string();
        push_row(
            &mut out,
            [
                record.name.as_str(),
                count.as_str(),
                record.external_id.as_deref().unwrap_or(""),
                record.external_uri.as_deref().unwrap_or(""),
            ],
        );
    }
    out
}

fn push_row<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains(&[',', '"', '\n', '\r'][..]) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push_str("\r\n");
}

pub async fn write_csv(records: &[CollectionRecord], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(path, render_csv(records))
        .await
        .with_context(|| format!("Failed to write collection CSV: {}", path.display()))?;
    info!("Exported {} cards to {}", records.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{identity, scratch_db};

    #[tokio::test]
    async fn absent_identity_keeps_known_metadata() {
        let (db, _dir) = scratch_db().await;
        let pool = db.pool();

        upsert(pool, "Llanowar Elves", 2, Some(&identity("Llanowar Elves", "abc")))
            .await
            .unwrap();
        upsert(pool, "Llanowar Elves", 3, None).await.unwrap();

        let records = export(pool).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owned_count, 3);
        assert_eq!(records[0].external_id.as_deref(), Some("abc"));
        assert_eq!(
            records[0].external_uri.as_deref(),
            Some("https://scryfall.com/card/abc")
        );
    }

    #[tokio::test]
    async fn metadata_is_filled_once_and_never_replaced() {
        let (db, _dir) = scratch_db().await;
        let pool = db.pool();

        upsert(pool, "Ambush Viper", 1, None).await.unwrap();
        assert_eq!(get(pool, "Ambush Viper").await.unwrap().unwrap().external_id, None);

        upsert(pool, "Ambush Viper", 1, Some(&identity("Ambush Viper", "first")))
            .await
            .unwrap();
        upsert(pool, "Ambush Viper", 1, Some(&identity("Ambush Viper", "second")))
            .await
            .unwrap();
        let record = get(pool, "Ambush Viper").await.unwrap().unwrap();
        assert_eq!(record.external_id.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn repeated_upsert_only_moves_timestamp() {
        let (db, _dir) = scratch_db().await;
        let pool = db.pool();
        let elves = identity("Llanowar Elves", "abc");

        upsert(pool, "Llanowar Elves", 2, Some(&elves)).await.unwrap();
        let first = get(pool, "Llanowar Elves").await.unwrap().unwrap();
        upsert(pool, "Llanowar Elves", 2, Some(&elves)).await.unwrap();
        let second = get(pool, "Llanowar Elves").await.unwrap().unwrap();

        assert_eq!(first.name, second.name);
        assert_eq!(first.owned_count, second.owned_count);
        assert_eq!(first.external_id, second.external_id);
        assert_eq!(first.external_uri, second.external_uri);
        assert!(second.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn export_sorts_case_insensitively() {
        let (db, _dir) = scratch_db().await;
        let pool = db.pool();
        upsert(pool, "Zoetic Cavern", 1, None).await.unwrap();
        upsert(pool, "Ambush Viper", 2, None).await.unwrap();
        upsert(pool, "aether Vial", 1, None).await.unwrap();

        let names: Vec<String> = export(pool).await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["aether Vial", "Ambush Viper", "Zoetic Cavern"]);
    }

    #[tokio::test]
    async fn empty_store_exports_header_only() {
        let (db, dir) = scratch_db().await;
        let path = dir.path().join("out").join("collection.csv");
        assert_eq!(db.write_collection_csv(&path).await.unwrap(), 0);

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "Card Name,Owned Copies,Scryfall ID,Scryfall URI\r\n");
    }

    #[tokio::test]
    async fn csv_rows_follow_export_order() {
        let (db, _dir) = scratch_db().await;
        db.upsert_collection("Zoetic Cavern", 1, None).await.unwrap();
        db.upsert_collection("Ambush Viper", 2, Some(&identity("Ambush Viper", "v1")))
            .await
            .unwrap();

        let csv = render_csv(&db.export_collection().await.unwrap());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Card Name,Owned Copies,Scryfall ID,Scryfall URI",
                "Ambush Viper,2,v1,https://scryfall.com/card/v1",
                "Zoetic Cavern,1,,",
            ]
        );
    }

    #[test]
    fn csv_quotes_awkward_names() {
        let record = CollectionRecord {
            name: "Borborygmos, \"the\" Loud".to_string(),
            owned_count: 1,
            external_id: None,
            external_uri: None,
            last_updated: Utc::now(),
        };
        let csv = render_csv(&[record]);
        assert!(csv.ends_with("\"Borborygmos, \"\"the\"\" Loud\",1,,\r\n"));
    }
}
