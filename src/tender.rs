use chrono::{DateTime, NaiveDate, Utc};
use compact_str::CompactString;
use hashbrown::HashSet;

use crate::db::{BB8Error, ToSqlIter, get_connection};

pub const SOURCE: &str = "gem";

/// The region gazetteer: department blocks are free text, so region
/// classification is a best-effort first substring hit against this list.
/// Cities come first so "New Delhi" wins over "Delhi".
#[rustfmt::skip]
pub static REGIONS: &[&str] = &[
    "New Delhi", "Delhi", "Mumbai", "Pune", "Bengaluru", "Chennai",
    "Hyderabad", "Kolkata", "Ahmedabad", "Jaipur", "Lucknow", "Chandigarh",
    "Andhra Pradesh", "Arunachal Pradesh", "Assam", "Bihar", "Chhattisgarh",
    "Goa", "Gujarat", "Haryana", "Himachal Pradesh", "Jharkhand",
    "Karnataka", "Kerala", "Madhya Pradesh", "Maharashtra", "Manipur",
    "Meghalaya", "Mizoram", "Nagaland", "Odisha", "Punjab", "Rajasthan",
    "Sikkim", "Tamil Nadu", "Telangana", "Tripura", "Uttar Pradesh",
    "Uttarakhand", "West Bengal", "Jammu", "Kashmir", "Ladakh", "Puducherry",
];

pub fn classify_region(department: &str) -> Option<&'static str> {
    let dep = department.to_lowercase();
    REGIONS
        .iter()
        .copied()
        .find(|region| dep.contains(&region.to_lowercase()))
}

/// A card as extracted from the listing page, before persistence.
#[derive(Debug, Clone)]
pub struct RawTender {
    pub reference_id: CompactString,
    pub title: String,
    pub category: String,
    pub department: String,
    pub quantity: Option<i64>,
    pub start_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub url: String,
}

/// A card that survived the page plan, ready to insert.
#[derive(Debug)]
pub struct NewRecord<'a> {
    pub raw: &'a RawTender,
    pub region: Option<&'static str>,
}

/// A stored row, as the matcher sees it.
#[derive(Debug, Clone)]
pub struct StoredTender {
    pub id: i64,
    pub reference_id: CompactString,
    pub title: String,
    pub description: String,
    pub category: String,
    pub region: Option<String>,
    pub close_date: Option<NaiveDate>,
    pub url: String,
}

/// One round-trip existence probe for a whole page of reference ids.
pub async fn existing_refs<'a, I>(refs: I) -> Result<HashSet<CompactString>, BB8Error>
where
    I: ExactSizeIterator<Item = &'a str> + Clone + core::fmt::Debug + Sync,
{
    const SQL: &str = "select reference_id from tender.record where reference_id = any($1::text[])";

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;
    let rows = conn.query(&stmt, &[&ToSqlIter(refs)]).await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            row.try_get::<_, &str>(0)
                .ok()
                .map(CompactString::from)
        })
        .collect())
}

/// Inserts page survivors one row at a time: a constraint violation or a
/// transient store error on one record must not take its siblings down.
/// `on conflict do nothing` keeps the reference-id invariant even when two
/// overlapping runs race past the existence probe.
pub async fn insert_records(records: &[NewRecord<'_>]) -> Result<u64, BB8Error> {
    const SQL: &str = "insert into tender.record \
        (reference_id, title, description, category, region, quantity, start_date, close_date, status, source, source_url) \
        values ($1, $2, $3, $4, $5, $6, $7, $8, 'ACTIVE', $9, $10) \
        on conflict (reference_id) do nothing";

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;

    let mut n = 0;
    for rec in records {
        match conn
            .execute(&stmt, &[
                &&*rec.raw.reference_id,
                &&*rec.raw.title,
                &&*rec.raw.department,
                &&*rec.raw.category,
                &rec.region,
                &rec.raw.quantity,
                &rec.raw.start_date,
                &rec.raw.close_date,
                &SOURCE,
                &&*rec.raw.url,
            ])
            .await
        {
            Ok(r) => n += r,
            Err(e) => {
                tracing::error!(target: "tender-insert", "save {} failed: {e}", rec.raw.reference_id);
            }
        }
    }

    Ok(n)
}

/// Flips every ACTIVE record whose close date is strictly past to EXPIRED.
/// One-way and idempotent: a second run finds nothing left to flip.
pub async fn reconcile_expired() -> Result<u64, BB8Error> {
    const SQL: &str = "update tender.record set status = 'EXPIRED' \
        where status = 'ACTIVE' and close_date < current_date";

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;
    conn.execute(&stmt, &[]).await.map_err(Into::into)
}

/// Records ingested since `cutoff` — the matcher's lookback window, so a
/// run never rescans the whole store.
pub async fn recent_records(cutoff: DateTime<Utc>) -> Result<Vec<StoredTender>, BB8Error> {
    const SQL: &str = "select id, reference_id, title, description, category, region, close_date, source_url \
        from tender.record where ingested_at >= $1";

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;
    let rows = conn.query(&stmt, &[&cutoff]).await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            Some(StoredTender {
                id: row.try_get(0).ok()?,
                reference_id: row.try_get::<_, &str>(1).ok()?.into(),
                title: row.try_get(2).ok()?,
                description: row.try_get(3).ok()?,
                category: row.try_get(4).ok()?,
                region: row.try_get(5).ok()?,
                close_date: row.try_get(6).ok()?,
                url: row.try_get(7).ok()?,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_from_department_text() {
        assert_eq!(
            classify_region("Department Of Defence, Ministry Of Defence, New Delhi - 110011"),
            Some("New Delhi"),
        );
        assert_eq!(
            classify_region("municipal corporation of greater mumbai, maharashtra"),
            Some("Mumbai"),
        );
        assert_eq!(classify_region("Water Board, Vijayawada, ANDHRA PRADESH"), Some("Andhra Pradesh"));
        assert_eq!(classify_region("Directorate Of Procurement"), None);
    }

    #[test]
    fn region_first_match_wins() {
        // Both "New Delhi" and "Delhi" are substrings; list order decides.
        assert_eq!(classify_region("CPWD, New Delhi"), Some("New Delhi"));
        assert_eq!(classify_region("DDA, Delhi"), Some("Delhi"));
    }
}
