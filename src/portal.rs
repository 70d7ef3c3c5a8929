use core::time::Duration;
use std::{
    sync::{Arc, LazyLock},
    time::Instant,
};

use chrono::NaiveDate;
use compact_str::CompactString;
use hashbrown::HashSet;
use headless_chrome::{Browser, Tab};
use rand::seq::IndexedRandom;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tokio::time::sleep;

use crate::{
    scrape::{USER_AGENTS, puppeteer},
    tender::{self, NewRecord, RawTender, classify_region},
    util::{parse_portal_date, squash_ws, today},
};

pub const PORTAL_ROOT: &str = match option_env!("PORTAL_ROOT") {
    Some(s) => s,
    None => "https://bidplus.gem.gov.in",
};
const LISTING_PATH: &str = "/all-bids";

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const PAGE_TIMEOUT: Duration = Duration::from_secs(20);
const ADVANCE_TIMEOUT: Duration = Duration::from_secs(15);
const ADVANCE_POLL: Duration = Duration::from_millis(500);

const SEL_CONTAINER: &str = "#bidCard";
const SEL_FIRST_REF: &str = "#bidCard .bid-card .bid-no a";
const SEL_NEXT: &str = "a.page-link.next";

static REF_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]+/\d{4}(?:/[A-Z])?/\d+").unwrap());

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ScrapeStats {
    pub added: u64,
    pub duplicate_skipped: u64,
    pub date_filtered_skipped: u64,
}

/// A normalized record source. The matcher and dispatch stages never see
/// browser-automation details; anything that yields pages of [`RawTender`]
/// can drive the ingestion loop.
pub trait TenderSource {
    /// The next page of cards, `None` once pagination is exhausted.
    fn next_page(&mut self) -> impl Future<Output = anyhow::Result<Vec<RawTender>>> + Send;
}

/// Drives a scripted browser session against the public listing.
pub struct PortalSource {
    // Dropping the browser tears down the chrome process, so it lives as
    // long as the session even though only the tab is used directly.
    _browser: Browser,
    tab: Arc<Tab>,
    page: u32,
    sel_card: Selector,
    sel_ref: Selector,
    sel_title: Selector,
    sel_category: Selector,
    sel_department: Selector,
    sel_quantity: Selector,
    sel_start: Selector,
    sel_close: Selector,
}

impl PortalSource {
    pub fn open(headless: bool) -> anyhow::Result<Self> {
        let browser = puppeteer::launch(headless)?;
        let tab = puppeteer::first_tab(&browser)?;

        let user_agent = *USER_AGENTS
            .choose(&mut rand::rng())
            .ok_or_else(|| anyhow::anyhow!("no user agent available"))?;
        tracing::info!(target: "portal", "user-agent \x1b[1;36m{user_agent}\x1b[0m");
        tab.set_user_agent(user_agent, None, None)?;

        Ok(Self {
            _browser: browser,
            tab,
            page: 0,
            sel_card: Selector::parse(".bid-card").unwrap(),
            sel_ref: Selector::parse(".bid-no a").unwrap(),
            sel_title: Selector::parse(".items").unwrap(),
            sel_category: Selector::parse(".category").unwrap(),
            sel_department: Selector::parse(".department").unwrap(),
            sel_quantity: Selector::parse(".quantity").unwrap(),
            sel_start: Selector::parse(".start-date").unwrap(),
            sel_close: Selector::parse(".end-date").unwrap(),
        })
    }

    /// Hits the portal root first so the session carries proper cookies
    /// before the listing request. Failures here are not fatal.
    async fn warm_up(&self) {
        if let Err(e) = puppeteer::navigate_to(&self.tab, PORTAL_ROOT.to_owned()).await {
            tracing::warn!(target: "portal", "warm-up failed (continuing): {e}");
        } else {
            sleep(const { Duration::from_millis(1200) }).await;
        }
    }

    /// Bounded retry with linearly growing delay; exhaustion is fatal for
    /// the whole scrape invocation.
    async fn load_listing(&self) -> anyhow::Result<()> {
        let url = format!("{PORTAL_ROOT}{LISTING_PATH}");

        for attempt in 1..=MAX_RETRIES {
            let res: anyhow::Result<()> = async {
                puppeteer::navigate_to(&self.tab, url.clone()).await?;
                puppeteer::wait_for(&self.tab, SEL_CONTAINER, PAGE_TIMEOUT).await
            }
            .await;

            match res {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(target: "portal", "listing load {attempt}/{MAX_RETRIES} failed: {e}");
                    if attempt < MAX_RETRIES {
                        sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }

        anyhow::bail!("listing page unreachable after {MAX_RETRIES} attempts")
    }

    /// Clicks the "next" control and waits for the first visible card to
    /// change. A missing control, a failed click, a session error on the
    /// verification probe, or a page that never advances all end
    /// pagination; none of them abort the run.
    async fn advance(&self) -> bool {
        let before = match puppeteer::text_of(&self.tab, SEL_FIRST_REF).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(target: "portal", "advance probe failed, treating as last page: {e}");
                return false;
            }
        };

        match puppeteer::click_first(&self.tab, SEL_NEXT).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(target: "portal", "no next control, pagination ends");
                return false;
            }
            Err(e) => {
                tracing::warn!(target: "portal", "next click failed, treating as last page: {e}");
                return false;
            }
        }

        let deadline = Instant::now() + ADVANCE_TIMEOUT;
        loop {
            sleep(ADVANCE_POLL).await;
            match puppeteer::text_of(&self.tab, SEL_FIRST_REF).await {
                Ok(now) if now != before => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(target: "portal", "advance probe failed, treating as last page: {e}");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(target: "portal", "page did not advance, pagination ends");
                return false;
            }
        }
    }

    /// Card extraction over the rendered container. A markup change shows
    /// up as zero extracted records, never as a crash.
    fn parse_cards(&self, html: &str) -> Vec<RawTender> {
        let fragment = Html::parse_fragment(html);

        fragment
            .select(&self.sel_card)
            .filter_map(|card| {
                let anchor = card.select(&self.sel_ref).next()?;
                let raw_ref = anchor.text().collect::<String>();
                let reference_id = CompactString::new(REF_ID.find(&raw_ref)?.as_str());

                let href = anchor.attr("href").unwrap_or_default();
                let url = if href.starts_with("http") {
                    href.to_owned()
                } else {
                    format!("{PORTAL_ROOT}{href}")
                };

                let title = squash_ws(&card.select(&self.sel_title).next()?.text().collect::<String>());
                let category = card
                    .select(&self.sel_category)
                    .next()
                    .map(|el| squash_ws(&el.text().collect::<String>()))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| title.split(',').next().unwrap_or_default().trim().to_owned());
                let department = card
                    .select(&self.sel_department)
                    .next()
                    .map(|el| squash_ws(&el.text().collect::<String>()))
                    .unwrap_or_default();
                let quantity = card
                    .select(&self.sel_quantity)
                    .next()
                    .and_then(|el| el.text().collect::<String>().trim().parse().ok());
                let start_date = card
                    .select(&self.sel_start)
                    .next()
                    .and_then(|el| parse_portal_date(&el.text().collect::<String>()));
                let close_date = card
                    .select(&self.sel_close)
                    .next()
                    .and_then(|el| parse_portal_date(&el.text().collect::<String>()));

                Some(RawTender {
                    reference_id,
                    title,
                    category,
                    department,
                    quantity,
                    start_date,
                    close_date,
                    url,
                })
            })
            .collect()
    }
}

impl TenderSource for PortalSource {
    fn next_page(&mut self) -> impl Future<Output = anyhow::Result<Vec<RawTender>>> + Send {
        async move {
            if self.page == 0 {
                self.warm_up().await;
                self.load_listing().await?;
            } else if !self.advance().await {
                return Ok(Vec::new());
            }
            self.page += 1;

            match puppeteer::html_of(&self.tab, SEL_CONTAINER).await {
                Ok(html) => Ok(self.parse_cards(&html)),
                Err(e) => {
                    tracing::warn!(target: "portal", "[page #{}] extraction failed: {e}", self.page);
                    Ok(Vec::new())
                }
            }
        }
    }
}

/// What a page of cards turns into, before touching the store.
#[derive(Debug, Default)]
pub struct PagePlan<'a> {
    pub to_insert: Vec<NewRecord<'a>>,
    pub duplicate_skipped: u64,
    pub date_filtered_skipped: u64,
    /// The page carried at least one record opened before today. Combined
    /// with zero insertions this drives the early stop below.
    pub saw_older: bool,
}

pub fn plan_page<'a>(
    cards: &'a [RawTender],
    existing: &HashSet<CompactString>,
    today_only: bool,
    today: NaiveDate,
) -> PagePlan<'a> {
    let mut plan = PagePlan::default();

    for card in cards {
        if let Some(start) = card.start_date
            && start < today
        {
            plan.saw_older = true;
        }

        if let Some(close) = card.close_date
            && close < today
        {
            tracing::debug!(target: "scraper", "{} already closed, skipping", card.reference_id);
            continue;
        }

        if today_only && card.start_date != Some(today) {
            plan.date_filtered_skipped += 1;
            continue;
        }

        if existing.contains(card.reference_id.as_str()) {
            plan.duplicate_skipped += 1;
            continue;
        }

        plan.to_insert.push(NewRecord {
            raw: card,
            region: classify_region(&card.department),
        });
    }

    plan
}

/// The ingestion loop: one bulk existence probe per page, additive inserts
/// only, per-record failures contained by [`tender::insert_records`].
pub async fn scrape_with<S: TenderSource>(
    source: &mut S,
    max_pages: u32,
    today_only: bool,
) -> anyhow::Result<ScrapeStats> {
    let today = today();
    let mut stats = ScrapeStats::default();

    for page in 1..=max_pages {
        let cards = source.next_page().await?;
        if cards.is_empty() {
            tracing::info!(target: "scraper", "[page #{page}] no cards, stopping");
            break;
        }

        let existing = tender::existing_refs(cards.iter().map(|c| c.reference_id.as_str())).await?;
        let plan = plan_page(&cards, &existing, today_only, today);
        let added = tender::insert_records(&plan.to_insert).await?;

        stats.added += added;
        stats.duplicate_skipped += plan.duplicate_skipped;
        stats.date_filtered_skipped += plan.date_filtered_skipped;

        tracing::info!(
            target: "scraper",
            "\x1b[36m[page #{page}] +{added}, dup {}, filtered {}\x1b[0m",
            plan.duplicate_skipped,
            plan.date_filtered_skipped,
        );

        // Assumes the listing is reverse-chronological; that is an
        // observation about the upstream site, not a contract.
        if today_only && added == 0 && plan.saw_older {
            tracing::info!(target: "scraper", "[page #{page}] nothing new and older records present, early stop");
            break;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, d).unwrap()
    }

    fn card(reference_id: &str, start: u32, close: u32) -> RawTender {
        RawTender {
            reference_id: reference_id.into(),
            title: "Supply of network switches".to_owned(),
            category: "Networking".to_owned(),
            department: "NIC, New Delhi".to_owned(),
            quantity: Some(12),
            start_date: Some(day(start)),
            close_date: Some(day(close)),
            url: format!("{PORTAL_ROOT}/bid/{reference_id}"),
        }
    }

    #[test]
    fn two_new_one_stored() {
        let cards = vec![
            card("GEM/2026/B/100001", 30, 31),
            card("GEM/2026/B/100002", 30, 31),
            card("GEM/2026/B/100003", 30, 31),
        ];
        let existing: HashSet<CompactString> = core::iter::once("GEM/2026/B/100003".into()).collect();

        let plan = plan_page(&cards, &existing, true, day(30));
        assert_eq!(plan.to_insert.len(), 2);
        assert_eq!(plan.duplicate_skipped, 1);
        assert_eq!(plan.date_filtered_skipped, 0);
        assert!(!plan.saw_older);
    }

    #[test]
    fn all_stored_means_nothing_to_insert() {
        let cards = vec![card("GEM/2026/B/100001", 30, 31)];
        let existing: HashSet<CompactString> = core::iter::once("GEM/2026/B/100001".into()).collect();

        let plan = plan_page(&cards, &existing, false, day(30));
        assert!(plan.to_insert.is_empty());
        assert_eq!(plan.duplicate_skipped, 1);
    }

    #[test]
    fn today_filter_and_older_flag() {
        let cards = vec![card("GEM/2026/B/100004", 29, 31)];

        let plan = plan_page(&cards, &HashSet::new(), true, day(30));
        assert!(plan.to_insert.is_empty());
        assert_eq!(plan.date_filtered_skipped, 1);
        assert!(plan.saw_older);

        // Without the filter the same card goes straight in.
        let plan = plan_page(&cards, &HashSet::new(), false, day(30));
        assert_eq!(plan.to_insert.len(), 1);
        assert_eq!(plan.date_filtered_skipped, 0);
        assert!(plan.saw_older);
    }

    #[test]
    fn closed_cards_are_dropped_silently() {
        let cards = vec![card("GEM/2026/B/100005", 20, 25)];

        let plan = plan_page(&cards, &HashSet::new(), false, day(30));
        assert!(plan.to_insert.is_empty());
        assert_eq!(plan.duplicate_skipped, 0);
        assert_eq!(plan.date_filtered_skipped, 0);
    }

    #[test]
    fn missing_start_date_is_filtered_in_today_mode() {
        let mut c = card("GEM/2026/B/100006", 30, 31);
        c.start_date = None;

        let plan = plan_page(core::slice::from_ref(&c), &HashSet::new(), true, day(30));
        assert_eq!(plan.date_filtered_skipped, 1);
        assert!(!plan.saw_older);
    }

    #[test]
    fn region_resolved_at_plan_time() {
        let cards = vec![card("GEM/2026/B/100007", 30, 31)];
        let plan = plan_page(&cards, &HashSet::new(), false, day(30));
        assert_eq!(plan.to_insert[0].region, Some("New Delhi"));
    }
}
