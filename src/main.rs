#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch causes jemalloc to evaluate all decay windows
    // and release dirty pages back to the OS via its background purge logic.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced, dirty pages scheduled for release");
}

mod bybit_api;
mod config;
mod cross_detector;
mod error;
mod exchange;
mod indicators;
mod journal;
mod pending_trade;
mod position_manager;
mod risk;
mod signal_gate;
mod status;
mod telegram;
mod trader;
mod types;

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use status::StatusSnapshot;

const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = config::Config::from_env()?;
    let bybit = bybit_api::BybitClient::from_env(&cfg)?;
    let journal = journal::JsonJournal::open(&cfg.saves_dir)?;
    let status_path = journal.status_path();

    let tg = telegram::TelegramBot::from_env();
    if tg.is_none() {
        log::info!("Telegram disabled (TELEGRAM_TOKEN / TELEGRAM_CHAT_ID not set)");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let trader = trader::Trader::new(cfg, bybit, journal, stop_rx.clone()).with_telegram(tg.clone());

    // ── Read path: status.json for the dashboard + periodic Telegram status ──
    tokio::spawn(status_reporter(trader.subscribe(), status_path, tg, stop_rx));

    tokio::spawn(shutdown_signal(stop_tx));

    trader.run().await?;
    Ok(())
}

/// Copies each published snapshot out to disk; never touches trading state.
async fn status_reporter(
    mut status: watch::Receiver<StatusSnapshot>,
    path: PathBuf,
    tg: Option<telegram::TelegramBot>,
    mut stop: watch::Receiver<bool>,
) {
    let mut last_report = Instant::now()
        .checked_sub(STATUS_REPORT_INTERVAL)
        .unwrap_or_else(Instant::now);

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = stop.changed() => break,
        }
        let snapshot = status.borrow_and_update().clone();
        if let Err(e) = journal::write_json_atomic(&path, &snapshot) {
            log::warn!("Status write failed: {}", e);
        }

        if last_report.elapsed() >= STATUS_REPORT_INTERVAL && snapshot.price.is_some() {
            if let Some(tg) = &tg {
                tg.notify_status(&snapshot).await;
            }
            last_report = Instant::now();

            // Release unused memory pages back to the OS
            #[cfg(feature = "jemalloc")]
            jemalloc_purge();
        }
    }
}

async fn shutdown_signal(stop: watch::Sender<bool>) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Ctrl-C received, stopping"),
        _ = terminate => log::info!("SIGTERM received, stopping"),
    }
    let _ = stop.send(true);
}
