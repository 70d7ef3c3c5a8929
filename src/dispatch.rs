use chrono::NaiveDate;
use compact_str::CompactString;
use hashbrown::HashMap;

use crate::{
    db::{BB8Error, ToSqlIter, get_connection},
    mail::Mailer,
};

/// How many tenders get itemized per email before "+N more" kicks in.
pub const DISPLAY_LIMIT: usize = 10;

/// One PENDING queue row joined with its record and customer contact.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub queue_id: i64,
    pub customer_id: i64,
    pub email: Option<String>,
    pub customer_name: String,
    pub reference_id: CompactString,
    pub title: String,
    pub region: Option<String>,
    pub close_date: Option<NaiveDate>,
    pub url: String,
}

/// All of one customer's pending rows for this batch: exactly one email.
#[derive(Debug)]
pub struct CustomerBatch {
    pub customer_id: i64,
    pub email: Option<String>,
    pub customer_name: String,
    pub rows: Vec<PendingRow>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// A send was attempted and the relay refused or errored.
    Failed(String),
    /// No send was ever attempted (no usable address), so the failure
    /// carries no attempt bookkeeping.
    Unroutable(String),
}

pub async fn fetch_pending(batch_size: i64) -> Result<Vec<PendingRow>, BB8Error> {
    const SQL: &str = "select q.id, q.customer_id, c.email, c.name, r.reference_id, r.title, r.region, r.close_date, r.source_url \
        from tender.dispatch_queue q \
        join tender.record r on r.id = q.tender_id \
        join tender.customer c on c.id = q.customer_id \
        where q.status = 'PENDING' order by q.id limit $1";

    let conn = get_connection().await?;
    let stmt = conn.prepare(SQL).await?;
    let rows = conn.query(&stmt, &[&batch_size]).await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            Some(PendingRow {
                queue_id: row.try_get(0).ok()?,
                customer_id: row.try_get(1).ok()?,
                email: row.try_get(2).ok()?,
                customer_name: row.try_get(3).ok()?,
                reference_id: row.try_get::<_, &str>(4).ok()?.into(),
                title: row.try_get(5).ok()?,
                region: row.try_get(6).ok()?,
                close_date: row.try_get(7).ok()?,
                url: row.try_get(8).ok()?,
            })
        })
        .collect())
}

/// Buckets the batch per customer, preserving first-seen order.
pub fn group_by_customer(rows: Vec<PendingRow>) -> Vec<CustomerBatch> {
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut batches: Vec<CustomerBatch> = Vec::new();

    for row in rows {
        match index.entry(row.customer_id) {
            hashbrown::hash_map::Entry::Occupied(e) => batches[*e.get()].rows.push(row),
            hashbrown::hash_map::Entry::Vacant(e) => {
                e.insert(batches.len());
                batches.push(CustomerBatch {
                    customer_id: row.customer_id,
                    email: row.email.clone(),
                    customer_name: row.customer_name.clone(),
                    rows: vec![row],
                });
            }
        }
    }

    batches
}

pub fn render_email(batch: &CustomerBatch) -> (String, String) {
    use core::fmt::Write;

    let n = batch.rows.len();
    let subject = format!(
        "{n} new tender{} matching your subscription",
        if n == 1 { "" } else { "s" },
    );

    let mut html = format!(
        "<p>Hello {},</p><p>The following tender{} match your subscription:</p><ul>",
        batch.customer_name,
        if n == 1 { "" } else { "s" },
    );
    for row in batch.rows.iter().take(DISPLAY_LIMIT) {
        let _ = write!(
            html,
            "<li><a href=\"{}\">{}</a> ({}{}{})</li>",
            row.url,
            row.title,
            row.reference_id,
            row.region.as_deref().map(|r| format!(", {r}")).unwrap_or_default(),
            row.close_date.map(|d| format!(", closes {d}")).unwrap_or_default(),
        );
    }
    html.push_str("</ul>");
    if n > DISPLAY_LIMIT {
        let _ = write!(html, "<p>+{} more in your dashboard.</p>", n - DISPLAY_LIMIT);
    }

    (subject, html)
}

/// One send attempt per group. The outcome applies to the group as a
/// whole; rows inside a group never diverge.
pub async fn dispatch_groups(batches: &[CustomerBatch], mailer: &impl Mailer) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(batches.len());

    for batch in batches {
        let Some(email) = batch.email.as_deref().filter(|e| e.contains('@')) else {
            tracing::warn!(
                target: "dispatch",
                "customer {} has no usable email address, failing {} rows",
                batch.customer_id,
                batch.rows.len(),
            );
            outcomes.push(Outcome::Unroutable(format!(
                "customer {} has no usable email address",
                batch.customer_id,
            )));
            continue;
        };

        let (subject, html) = render_email(batch);
        match mailer.send(email, &subject, &html).await {
            Ok(()) => outcomes.push(Outcome::Sent),
            Err(e) => {
                tracing::warn!(target: "dispatch", "send to customer {} failed: {e}", batch.customer_id);
                outcomes.push(Outcome::Failed(e.to_string()));
            }
        }
    }

    outcomes
}

/// Drains up to `batch_size` PENDING rows and records the per-group
/// outcome. Each group flips in a single statement (`id = any(...)`), so
/// a group is observably all-SENT or all-FAILED, never mixed.
pub async fn process_queue(mailer: &impl Mailer, batch_size: i64) -> anyhow::Result<u64> {
    const SQL_SENT: &str = "update tender.dispatch_queue \
        set status = 'SENT', last_attempt_at = now(), error_message = null \
        where id = any($1::bigint[])";
    const SQL_FAILED: &str = "update tender.dispatch_queue \
        set status = 'FAILED', retry_count = retry_count + 1, last_attempt_at = now(), error_message = $2 \
        where id = any($1::bigint[])";
    // No attempt was made, so retry_count stays put.
    const SQL_UNROUTABLE: &str = "update tender.dispatch_queue \
        set status = 'FAILED', last_attempt_at = now(), error_message = $2 \
        where id = any($1::bigint[])";

    let rows = fetch_pending(batch_size).await?;
    if rows.is_empty() {
        tracing::info!(target: "dispatch", "queue empty");
        return Ok(0);
    }

    let batches = group_by_customer(rows);
    let outcomes = dispatch_groups(&batches, mailer).await;

    let conn = get_connection().await?;
    let sent_stmt = conn.prepare(SQL_SENT).await?;
    let failed_stmt = conn.prepare(SQL_FAILED).await?;
    let unroutable_stmt = conn.prepare(SQL_UNROUTABLE).await?;

    let mut sent = 0;
    for (batch, outcome) in batches.iter().zip(&outcomes) {
        let ids = ToSqlIter(batch.rows.iter().map(|r| r.queue_id));
        let res = match outcome {
            Outcome::Sent => conn.execute(&sent_stmt, &[&ids]).await,
            Outcome::Failed(msg) => conn.execute(&failed_stmt, &[&ids, &&**msg]).await,
            Outcome::Unroutable(msg) => conn.execute(&unroutable_stmt, &[&ids, &&**msg]).await,
        };
        match res {
            Ok(r) if matches!(outcome, Outcome::Sent) => sent += r,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(target: "dispatch", "marking group for customer {} failed: {e}", batch.customer_id);
            }
        }
    }

    tracing::info!(target: "dispatch", "\x1b[36m{sent} queue rows sent across {} customers\x1b[0m", batches.len());
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct MockMailer {
        calls: Mutex<Vec<(String, String, String)>>,
        fail: Option<&'static str>,
    }

    impl MockMailer {
        fn ok() -> Self {
            Self { calls: Mutex::new(Vec::new()), fail: None }
        }

        fn failing(reason: &'static str) -> Self {
            Self { calls: Mutex::new(Vec::new()), fail: Some(reason) }
        }
    }

    impl Mailer for MockMailer {
        fn send(
            &self,
            to: &str,
            subject: &str,
            html: &str,
        ) -> impl Future<Output = anyhow::Result<()>> + Send {
            async move {
                self.calls.lock().push((to.to_owned(), subject.to_owned(), html.to_owned()));
                match self.fail {
                    None => Ok(()),
                    Some(reason) => Err(anyhow::anyhow!(reason)),
                }
            }
        }
    }

    fn row(queue_id: i64, customer_id: i64, email: Option<&str>, title: &str) -> PendingRow {
        PendingRow {
            queue_id,
            customer_id,
            email: email.map(str::to_owned),
            customer_name: format!("Customer {customer_id}"),
            reference_id: format!("GEM/2026/B/{}", 300000 + queue_id).into(),
            title: title.to_owned(),
            region: Some("Delhi".to_owned()),
            close_date: NaiveDate::from_ymd_opt(2026, 9, 10),
            url: format!("https://bidplus.gem.gov.in/bid/{queue_id}"),
        }
    }

    #[test]
    fn grouping_preserves_order_and_collects_per_customer() {
        let batches = group_by_customer(vec![
            row(1, 7, Some("a@x.in"), "IT Upgrade"),
            row(2, 9, Some("b@x.in"), "Road Works"),
            row(3, 7, Some("a@x.in"), "Switches"),
        ]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].customer_id, 7);
        assert_eq!(batches[0].rows.len(), 2);
        assert_eq!(batches[1].customer_id, 9);
        assert_eq!(batches[1].rows.len(), 1);
    }

    #[test]
    fn render_caps_at_display_limit() {
        let rows = (0..15)
            .map(|i| row(i, 7, Some("a@x.in"), &format!("Tender {i}")))
            .collect();
        let batch = &group_by_customer(rows)[0];

        let (subject, html) = render_email(batch);
        assert_eq!(subject, "15 new tenders matching your subscription");
        assert_eq!(html.matches("<li>").count(), DISPLAY_LIMIT);
        assert!(html.contains("+5 more"));
    }

    #[tokio::test]
    async fn one_send_per_customer_covering_all_rows() {
        let mailer = MockMailer::ok();
        let batches = group_by_customer(vec![
            row(1, 7, Some("a@x.in"), "First"),
            row(2, 7, Some("a@x.in"), "Second"),
            row(3, 7, Some("a@x.in"), "Third"),
        ]);

        let outcomes = dispatch_groups(&batches, &mailer).await;
        assert_eq!(outcomes, vec![Outcome::Sent]);

        let calls = mailer.calls.lock();
        assert_eq!(calls.len(), 1);
        let (to, subject, html) = &calls[0];
        assert_eq!(to, "a@x.in");
        assert_eq!(subject, "3 new tenders matching your subscription");
        for title in ["First", "Second", "Third"] {
            assert!(html.contains(title));
        }
    }

    #[tokio::test]
    async fn failed_send_fails_the_whole_group_with_one_error() {
        let mailer = MockMailer::failing("relay unavailable");
        let batches = group_by_customer(vec![
            row(1, 7, Some("a@x.in"), "First"),
            row(2, 7, Some("a@x.in"), "Second"),
            row(3, 9, Some("b@x.in"), "Third"),
        ]);

        let outcomes = dispatch_groups(&batches, &mailer).await;
        assert_eq!(outcomes, vec![
            Outcome::Failed("relay unavailable".to_owned()),
            Outcome::Failed("relay unavailable".to_owned()),
        ]);
        // Both groups were still attempted.
        assert_eq!(mailer.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn missing_email_fails_group_without_send_attempt() {
        let mailer = MockMailer::ok();
        let batches = group_by_customer(vec![
            row(1, 7, None, "First"),
            row(2, 9, Some("not-an-address"), "Second"),
            row(3, 11, Some("c@x.in"), "Third"),
        ]);

        let outcomes = dispatch_groups(&batches, &mailer).await;
        assert_eq!(outcomes[0], Outcome::Unroutable("customer 7 has no usable email address".to_owned()));
        assert_eq!(outcomes[1], Outcome::Unroutable("customer 9 has no usable email address".to_owned()));
        assert_eq!(outcomes[2], Outcome::Sent);
        assert_eq!(mailer.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn unattempted_groups_are_distinct_from_refused_sends() {
        // An unroutable group must never count as an attempt, while a
        // relay refusal must; the two map to different bookkeeping.
        let mailer = MockMailer::failing("relay unavailable");
        let batches = group_by_customer(vec![
            row(1, 7, None, "First"),
            row(2, 9, Some("b@x.in"), "Second"),
        ]);

        let outcomes = dispatch_groups(&batches, &mailer).await;
        assert!(matches!(outcomes[0], Outcome::Unroutable(_)));
        assert_eq!(outcomes[1], Outcome::Failed("relay unavailable".to_owned()));
        assert_eq!(mailer.calls.lock().len(), 1);
    }
}
