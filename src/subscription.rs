use chrono::{TimeDelta, Utc};

use crate::{
    db::get_connection,
    tender::{self, StoredTender},
};

/// One standing preference per customer, written by the CRM side and
/// read-only here.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub customer_id: i64,
    pub categories: Vec<String>,
    pub regions: Vec<String>,
}

/// Active subscriptions whose owning customer is billing-active.
pub async fn load_active() -> Result<Vec<Subscription>, crate::db::BB8Error> {
    const SQL: &str = "select s.customer_id, s.categories, s.regions \
        from tender.subscription s join tender.customer c on c.id = s.customer_id \
        where s.is_active and c.billing_active";

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;
    let rows = conn.query(&stmt, &[]).await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            Some(Subscription {
                customer_id: row.try_get(0).ok()?,
                categories: row.try_get(1).ok()?,
                regions: row.try_get(2).ok()?,
            })
        })
        .collect())
}

/// Deliberately loose matching: case-insensitive substring on both axes,
/// so classification noise errs toward notifying rather than dropping.
/// An empty constraint set on either axis matches everything.
pub fn matches(sub: &Subscription, record: &StoredTender) -> bool {
    region_matches(&sub.regions, record.region.as_deref())
        && category_matches(&sub.categories, record)
}

fn region_matches(wanted: &[String], region: Option<&str>) -> bool {
    if wanted.is_empty() {
        return true;
    }
    let Some(region) = region else {
        return false;
    };
    let region = region.to_lowercase();
    wanted.iter().any(|w| region.contains(&w.to_lowercase()))
}

fn category_matches(keywords: &[String], record: &StoredTender) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let haystack = format!("{} {} {}", record.title, record.description, record.category).to_lowercase();
    keywords.iter().any(|k| haystack.contains(&k.to_lowercase()))
}

/// Evaluates every active subscription against the lookback window and
/// enqueues one PENDING row per fresh (tender, customer) match. The
/// `on conflict do nothing` insert makes repeated or overlapping runs
/// unable to produce a second row for the same pair.
pub async fn build_queue(lookback: TimeDelta) -> anyhow::Result<u64> {
    const SQL: &str = "insert into tender.dispatch_queue (tender_id, customer_id, status) \
        values ($1, $2, 'PENDING') on conflict (tender_id, customer_id) do nothing";

    let records = tender::recent_records(Utc::now() - lookback).await?;
    if records.is_empty() {
        tracing::info!(target: "queue-builder", "no recent records, nothing to queue");
        return Ok(0);
    }
    let subs = load_active().await?;

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;

    let mut queued = 0;
    for sub in &subs {
        for record in &records {
            if !matches(sub, record) {
                continue;
            }
            match conn.execute(&stmt, &[&record.id, &sub.customer_id]).await {
                Ok(r) => queued += r,
                Err(e) => {
                    tracing::error!(
                        target: "queue-builder",
                        "enqueue ({}, {}) failed: {e}",
                        record.reference_id,
                        sub.customer_id,
                    );
                }
            }
        }
    }

    tracing::info!(
        target: "queue-builder",
        "\x1b[36m{queued} dispatch rows queued for {} subscriptions over {} records\x1b[0m",
        subs.len(),
        records.len(),
    );
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, region: Option<&str>) -> StoredTender {
        StoredTender {
            id: 1,
            reference_id: "GEM/2026/B/200001".into(),
            title: title.to_owned(),
            description: "Department Of Expenditure".to_owned(),
            category: "Miscellaneous".to_owned(),
            region: region.map(str::to_owned),
            close_date: None,
            url: String::new(),
        }
    }

    fn sub(categories: &[&str], regions: &[&str]) -> Subscription {
        Subscription {
            customer_id: 7,
            categories: categories.iter().map(|s| (*s).to_owned()).collect(),
            regions: regions.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn keyword_and_region_must_both_hit() {
        let s = sub(&["IT"], &["Delhi"]);
        assert!(matches(&s, &record("IT Infrastructure Upgrade", Some("Delhi"))));
        assert!(!matches(&s, &record("IT Infrastructure Upgrade", Some("Mumbai"))));
        assert!(!matches(&s, &record("Canteen Supplies", Some("Delhi"))));
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        let s = sub(&["switch"], &["delhi"]);
        assert!(matches(&s, &record("Supply of Network SWITCHES", Some("New Delhi"))));
    }

    #[test]
    fn empty_constraints_match_everything() {
        assert!(matches(&sub(&[], &[]), &record("anything", None)));
        assert!(matches(&sub(&["expenditure"], &[]), &record("x", None)));
    }

    #[test]
    fn region_constraint_rejects_unclassified_records() {
        let s = sub(&[], &["Delhi"]);
        assert!(!matches(&s, &record("IT Infrastructure Upgrade", None)));
    }

    #[test]
    fn keywords_search_description_and_category_too() {
        let s = sub(&["expenditure"], &[]);
        assert!(matches(&s, &record("Unrelated Title", None)));
        let s = sub(&["miscellaneous"], &[]);
        assert!(matches(&s, &record("Unrelated Title", None)));
    }
}
