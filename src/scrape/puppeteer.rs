use std::{
    ffi::OsStr,
    sync::Arc,
    time::{Duration, Instant},
};

use headless_chrome::{Browser, LaunchOptions, Tab, browser::tab::NoElementFound};
use tokio::{task::spawn_blocking, time::sleep};

const POLL_PERIOD: Duration = Duration::from_millis(1832 / 4);

pub fn launch(headless: bool) -> anyhow::Result<Browser> {
    Browser::new(LaunchOptions {
        args: vec![OsStr::new("--disable-blink-features=AutomationControlled")],
        headless,
        ..LaunchOptions::default()
    })
}

#[allow(clippy::significant_drop_tightening)]
pub fn first_tab(browser: &Browser) -> anyhow::Result<Arc<Tab>> {
    let tab = browser.new_tab()?;

    {
        let tabs_guard = browser
            .get_tabs()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for remain in &*tabs_guard {
            if !Arc::ptr_eq(&tab, remain) {
                remain.close(true)?;
            }
        }
    }

    Ok(tab)
}

pub async fn navigate_to(tab: &Arc<Tab>, url: String) -> anyhow::Result<()> {
    let tab = Arc::clone(tab);

    spawn_blocking(move || -> anyhow::Result<()> {
        tab.navigate_to(&url)?;
        tab.wait_until_navigated()?;
        Ok(())
    })
    .await?
}

/// `Ok(false)` when the selector matches nothing; other CDP failures
/// propagate.
pub async fn exists(tab: &Arc<Tab>, selector: &'static str) -> anyhow::Result<bool> {
    let tab = Arc::clone(tab);

    spawn_blocking(move || match tab.find_element(selector) {
        Ok(_) => Ok(true),
        Err(e) if e.is::<NoElementFound>() => Ok(false),
        Err(e) => Err(e),
    })
    .await?
}

/// Polls for `selector` until it appears or `timeout` elapses. Every wait
/// in the session is bounded by its own timeout; there is no run-level
/// deadline.
pub async fn wait_for(tab: &Arc<Tab>, selector: &'static str, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if exists(tab, selector).await? {
            break Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timed out after {timeout:?} waiting for `{selector}`");
        }
        sleep(POLL_PERIOD).await;
    }
}

pub async fn html_of(tab: &Arc<Tab>, selector: &'static str) -> anyhow::Result<String> {
    let tab = Arc::clone(tab);

    spawn_blocking(move || tab.find_element(selector)?.get_content()).await?
}

pub async fn text_of(tab: &Arc<Tab>, selector: &'static str) -> anyhow::Result<Option<String>> {
    let tab = Arc::clone(tab);

    spawn_blocking(move || match tab.find_element(selector) {
        Ok(el) => el.get_inner_text().map(Some),
        Err(e) if e.is::<NoElementFound>() => Ok(None),
        Err(e) => Err(e),
    })
    .await?
}

/// Clicks the first match; `Ok(false)` when there is none.
pub async fn click_first(tab: &Arc<Tab>, selector: &'static str) -> anyhow::Result<bool> {
    let tab = Arc::clone(tab);

    spawn_blocking(move || match tab.find_element(selector) {
        Ok(el) => el.click().map(|_| true),
        Err(e) if e.is::<NoElementFound>() => Ok(false),
        Err(e) => Err(e),
    })
    .await?
}
