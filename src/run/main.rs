#[derive(clap::Parser)]
struct Args {
    /// Pages to scan before stopping.
    #[arg(short, long, default_value_t = tscr::pipeline::DEFAULT_PAGES)]
    pages: u32,
    /// Ingest every listed tender instead of only ones opened today.
    #[arg(long)]
    all_dates: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;

    pretty_env_logger::init_timed();
    tscr::db::init_db().await;

    let args = Args::parse();
    let mailer = tscr::mail::HttpMailer::from_env()?;

    let stats = tscr::pipeline::run(&mailer, args.pages, !args.all_dates).await?;
    tracing::info!(
        target: "main",
        "\x1b[36madded {}, duplicates {}, date-filtered {}\x1b[0m",
        stats.added,
        stats.duplicate_skipped,
        stats.date_filtered_skipped,
    );

    Ok(())
}
