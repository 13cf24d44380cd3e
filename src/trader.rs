//! The decision loop: one owner of all mutable trading state.
//!
//! `tick` runs fetch → indicators → crosses → risk → gate → pending window →
//! transitions → status once; `run` repeats it behind a failure boundary.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::config::Config;
use crate::cross_detector::{CrossDetector, CrossHistory, Detection};
use crate::error::{ExecutionError, JournalError, NotReady, TickError};
use crate::exchange::Venue;
use crate::indicators::{evaluate, IndicatorParams, Reading};
use crate::journal::Journal;
use crate::pending_trade::{PendingAction, PendingWindow, ProposeError};
use crate::position_manager::{calculate_position_size, validate_entry, Closed, PositionManager};
use crate::risk::RiskManager;
use crate::signal_gate::{Decision, Directive, EarlyExitLatch, GateParams, SignalGate};
use crate::status::{StatusPublisher, StatusSnapshot};
use crate::telegram::TelegramBot;
use crate::types::{Candle, CrossKind, Side, TradeAction, TradeRecord, Trend};

const PRICE_LOG_EVERY_SECS: i64 = 300;

/// What a completed tick did.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Not enough candles yet; nothing evaluated.
    NotReady(NotReady),
    /// Same candle as last tick: risk checked, no new signal.
    SameCandle,
    NewCandle,
    /// Stop flag seen between steps.
    Stopped,
}

pub struct Trader<V: Venue, J: Journal> {
    cfg: Config,
    venue: V,
    journal: J,
    telegram: Option<TelegramBot>,
    indicators: IndicatorParams,
    detector: CrossDetector,
    gate: SignalGate,
    latch: EarlyExitLatch,
    pending: PendingWindow,
    positions: PositionManager,
    risk: RiskManager,
    publisher: StatusPublisher,
    stop: watch::Receiver<bool>,
    last_trend: Option<Trend>,
    last_price_log: Option<DateTime<Utc>>,
    last_signal: Option<String>,
    last_balance: Option<f64>,
    /// The last entry failed without a definite answer from the venue.
    unconfirmed_entry: bool,
    /// First journal write that failed this tick.
    journal_failure: Option<JournalError>,
}

impl<V: Venue, J: Journal> Trader<V, J> {
    pub fn new(cfg: Config, venue: V, journal: J, stop: watch::Receiver<bool>) -> Self {
        Trader {
            indicators: IndicatorParams::from_config(&cfg),
            detector: CrossDetector::new(CrossHistory::new(cfg.max_crosses)),
            gate: SignalGate::new(GateParams::from_config(&cfg)),
            latch: EarlyExitLatch::default(),
            pending: PendingWindow::new(cfg.pending_window),
            positions: PositionManager::new(),
            risk: RiskManager::from_config(&cfg),
            publisher: StatusPublisher::new(&cfg.symbol),
            cfg,
            venue,
            journal,
            telegram: None,
            stop,
            last_trend: None,
            last_price_log: None,
            last_signal: None,
            last_balance: None,
            unconfirmed_entry: false,
            journal_failure: None,
        }
    }

    pub fn with_telegram(mut self, telegram: Option<TelegramBot>) -> Self {
        self.telegram = telegram;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.publisher.subscribe()
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    async fn fetch_candles(&self, now: DateTime<Utc>) -> Result<Vec<Candle>, TickError> {
        let to = now.timestamp_millis();
        let from = (now - self.cfg.candle_history).timestamp_millis();
        Ok(self.venue.fetch_candles(&self.cfg.symbol, &self.cfg.interval, from, to).await?)
    }

    fn log_banner(&self) {
        log::info!(
            "[{}] Cross trader starting | TF {} | MA {}/{} | RSI {} ({}/{}) | shorts={} early_exit={}",
            self.cfg.symbol,
            self.cfg.interval,
            self.cfg.ma_short,
            self.cfg.ma_long,
            self.cfg.rsi_period,
            self.cfg.rsi_oversold,
            self.cfg.rsi_overbought,
            self.cfg.shorting_enabled,
            self.cfg.early_exit_enabled
        );
    }

    /// Restore durable state, reload the cross log and reconcile with the venue.
    /// Unreadable state is fatal: trading on an unknown position is not an option.
    /// Safe to call again after a failure; nothing is kept from a partial run.
    pub async fn startup(&mut self, now: DateTime<Utc>) -> Result<(), TickError> {
        let sym = self.cfg.symbol.clone();

        let candles = self.fetch_candles(now).await?;
        let required = self.indicators.required_candles();
        let last_close = match candles.last() {
            Some(c) if candles.len() >= required => c.close,
            _ => return Err(NotReady { required, available: candles.len() }.into()),
        };

        match self.journal.load_state() {
            Ok(Some(state)) => {
                self.positions = PositionManager::restore(&state);
                log::info!(
                    "[{}] Restored state: {} | total profit {:+.2}",
                    sym,
                    state.side.label(),
                    state.total_profit
                );
            }
            Ok(None) => log::info!("[{}] No saved state, starting flat", sym),
            Err(e) => return Err(TickError::Fatal(format!("cannot load state: {e}"))),
        }

        let crosses = self.journal.load_crosses().unwrap_or_else(|e| {
            log::warn!("[{}] Cross log unreadable ({}), starting empty", sym, e);
            Vec::new()
        });
        self.detector = CrossDetector::new(CrossHistory::from_events(self.cfg.max_crosses, crosses));

        let venue_pos = self.venue.get_position().await?;
        if self.positions.reconcile(&venue_pos, last_close) {
            self.journal.save_state(&self.positions.durable_state())?;
        }
        self.risk.reset();
        self.latch.arm();
        self.refresh_balance().await;
        if let Some(b) = self.last_balance {
            log::info!("[{}] Initial balance: {:.2}", sym, b);
        }

        if let Some(tg) = &self.telegram {
            tg.notify_start(&sym, &self.cfg.interval, self.positions.side()).await;
        }
        self.publish(now, Some(last_close), None);
        Ok(())
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome, TickError> {
        if self.stopping() {
            return Ok(TickOutcome::Stopped);
        }
        let candles = self.fetch_candles(now).await?;
        let reading = match evaluate(&candles, &self.indicators) {
            Ok(r) => r,
            Err(not_ready) => {
                log::info!(
                    "[{}] Waiting for sufficient candle data ({}/{})",
                    self.cfg.symbol,
                    not_ready.available,
                    not_ready.required
                );
                self.publish(now, candles.last().map(|c| c.close), None);
                return Ok(TickOutcome::NotReady(not_ready));
            }
        };
        let price = reading.price;
        self.positions.mark(price);
        self.log_price(now, price);
        self.log_trend(reading.current.trend());

        let detection = self.detector.observe(&reading);
        if let Detection::Cross(event) = &detection {
            let label = match event.kind {
                CrossKind::Golden => "GOLDEN CROSS",
                CrossKind::Death => "DEATH CROSS",
            };
            log::info!(
                "[{}] {} @ {:.2} | SMA {:.4}/{:.4} | RSI {:.1} | {}",
                self.cfg.symbol,
                label,
                event.price,
                reading.current.sma_short,
                reading.current.sma_long,
                reading.current.rsi,
                event.trend.label()
            );
            // the cursor already moved: losing the log line must not lose the signal
            if let Err(e) = self.journal.save_crosses(&self.detector.history().to_vec()) {
                log::warn!("[{}] Cross log not saved: {}", self.cfg.symbol, e);
            }
        }
        let cross_kind = detection.cross().map(|e| e.kind);

        if self.stopping() {
            return self.finish(TickOutcome::Stopped);
        }
        self.check_risk(now, price).await?;

        let decision = if detection.is_new_candle() {
            self.gate.decide(detection.cross(), &reading.current, self.positions.side(), &mut self.latch)
        } else {
            Decision::none()
        };
        if let Some(reason) = decision.reason {
            if let Some(kind) = cross_kind {
                log::info!("[{}] {:?} cross ignored: {}", self.cfg.symbol, kind, reason);
            } else {
                log::debug!("[{}] {}", self.cfg.symbol, reason);
            }
        }
        if decision.directive != Directive::None {
            self.last_signal = Some(decision.directive.label().to_string());
        }

        match self.pending.sweep(now, cross_kind) {
            PendingAction::Expired(p) => {
                log::info!("[{}] Trade window expired ({:?} {:.6})", self.cfg.symbol, p.side, p.qty)
            }
            PendingAction::Cancelled(p) => log::info!(
                "[{}] Opposing cross, cancelling pending {:?} {:.6}",
                self.cfg.symbol,
                p.side,
                p.qty
            ),
            _ => {}
        }

        if self.stopping() {
            return self.finish(TickOutcome::Stopped);
        }
        self.act(now, &decision, &reading).await?;

        if self.stopping() {
            return self.finish(TickOutcome::Stopped);
        }
        self.execute_pending(now, price).await?;

        self.refresh_balance().await;
        self.publish(now, Some(price), Some(&reading));

        self.finish(if detection.is_new_candle() { TickOutcome::NewCandle } else { TickOutcome::SameCandle })
    }

    /// Journal writes that failed during the tick surface here, after every
    /// transition of the tick has been applied.
    fn finish(&mut self, outcome: TickOutcome) -> Result<TickOutcome, TickError> {
        match self.journal_failure.take() {
            Some(e) => Err(e.into()),
            None => Ok(outcome),
        }
    }

    /// Loop until the stop flag flips or a fatal error surfaces.
    pub async fn run(mut self) -> Result<(), TickError> {
        self.log_banner();
        if self.start_with_retry().await? {
            loop {
                if self.stopping() {
                    break;
                }
                let delay = match self.tick(Utc::now()).await {
                    Ok(TickOutcome::Stopped) => break,
                    Ok(_) => self.cfg.poll_interval,
                    Err(e) => self.backoff_after(e).await?,
                };
                if !self.pause(delay).await {
                    break;
                }
            }
        }
        log::info!("[{}] Stopped", self.cfg.symbol);
        Ok(())
    }

    /// `startup` behind the same boundary as the tick loop. False if stopped
    /// before it succeeded.
    async fn start_with_retry(&mut self) -> Result<bool, TickError> {
        loop {
            if self.stopping() {
                return Ok(false);
            }
            let delay = match self.startup(Utc::now()).await {
                Ok(()) => return Ok(true),
                Err(TickError::NotReady(nr)) => {
                    log::info!(
                        "[{}] Waiting for sufficient candle data before startup ({}/{})",
                        self.cfg.symbol,
                        nr.available,
                        nr.required
                    );
                    self.cfg.poll_interval
                }
                Err(e) => self.backoff_after(e).await?,
            };
            if !self.pause(delay).await {
                return Ok(false);
            }
        }
    }

    /// Fatal errors halt the bot; anything else is logged and answered with
    /// the error backoff.
    async fn backoff_after(&self, e: TickError) -> Result<std::time::Duration, TickError> {
        if e.is_fatal() {
            log::error!("[{}] Fatal error, halting: {}", self.cfg.symbol, e);
            if let Some(tg) = &self.telegram {
                tg.notify_risk_alert(&format!("[{}] Bot halted: {}", self.cfg.symbol, e)).await;
            }
            return Err(e);
        }
        log::error!(
            "[{}] Tick failed: {} (backing off {}s)",
            self.cfg.symbol,
            e,
            self.cfg.error_backoff.as_secs()
        );
        Ok(self.cfg.error_backoff)
    }

    /// Sleep unless the stop flag changes first. False once the stop channel is gone.
    async fn pause(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = self.stop.changed() => changed.is_ok(),
        }
    }

    async fn refresh_balance(&mut self) {
        match self.venue.get_balance().await {
            Ok(b) => self.last_balance = Some(b),
            Err(e) => log::warn!("[{}] Balance refresh failed: {}", self.cfg.symbol, e),
        }
    }

    fn log_price(&mut self, now: DateTime<Utc>, price: f64) {
        let due = self
            .last_price_log
            .map_or(true, |t| now - t >= Duration::seconds(PRICE_LOG_EVERY_SECS));
        if due {
            log::info!("[{}] Current price: {:.2}", self.cfg.symbol, price);
            self.last_price_log = Some(now);
        }
    }

    fn log_trend(&mut self, trend: Trend) {
        if self.last_trend != Some(trend) {
            log::info!("[{}] TREND CHANGE → {}", self.cfg.symbol, trend.label());
            self.last_trend = Some(trend);
        }
    }

    async fn check_risk(&mut self, now: DateTime<Utc>, price: f64) -> Result<(), TickError> {
        let pos = *self.positions.position();
        let Some(side) = pos.side.side() else {
            return Ok(());
        };
        let unrealized = pos.unrealized_pnl(price);
        let Some(trigger) = self.risk.evaluate(side, pos.peak_favorable, price, unrealized) else {
            if let Some(r) = self.risk.ratchet().filter(|r| r.is_active()) {
                log::debug!(
                    "[{}] Ratchet peak {:+.4}, unrealized {:+.4}",
                    self.cfg.symbol,
                    r.peak_unrealized(),
                    unrealized
                );
            }
            return Ok(());
        };
        log::warn!(
            "[{}] {} ({:?}) at {:.2}, closing {}",
            self.cfg.symbol,
            trigger.reason(),
            trigger,
            price,
            pos.side.label()
        );
        self.close(now, trigger.reason()).await.map(|_| ())
    }

    /// Close the open position. Execution failures leave it intact and are
    /// reported as `Ok(false)`; only fatal venue errors propagate.
    async fn close(&mut self, now: DateTime<Utc>, reason: &str) -> Result<bool, TickError> {
        let pos = *self.positions.position();
        match self.positions.exit(&self.venue, now).await {
            Ok(closed) => {
                self.after_close(&closed, pos.entry_price, reason).await;
                Ok(true)
            }
            Err(e) => {
                self.execution_failed("close", e).await?;
                Ok(false)
            }
        }
    }

    /// FLAT → `side`. Execution failures are reported as `Ok(false)`.
    async fn open(&mut self, now: DateTime<Utc>, side: Side, qty: f64, what: &str) -> Result<bool, TickError> {
        match self.positions.enter(&self.venue, side, qty, now).await {
            Ok(record) => {
                self.unconfirmed_entry = false;
                self.after_open(side, &record).await;
                Ok(true)
            }
            Err(e) => {
                // no answer is not a no: the order may still have filled
                if matches!(e, ExecutionError::Venue(_)) {
                    self.unconfirmed_entry = true;
                }
                self.execution_failed(what, e).await?;
                Ok(false)
            }
        }
    }

    async fn after_close(&mut self, closed: &Closed, entry: f64, reason: &str) {
        self.risk.reset();
        self.record(&closed.record);
        if let Some(tg) = &self.telegram {
            let side = match closed.record.action {
                TradeAction::Cover => Side::Short,
                _ => Side::Long,
            };
            tg.notify_trade_close(&self.cfg.symbol, side, entry, closed.record.price, closed.pnl, reason)
                .await;
        }
    }

    async fn after_open(&mut self, side: Side, record: &TradeRecord) {
        self.risk.reset();
        self.latch.arm();
        self.record(record);
        if let Some(tg) = &self.telegram {
            tg.notify_trade_open(&self.cfg.symbol, side, record.qty, record.price).await;
        }
    }

    /// Every fill: append to the trade log, then persist the durable state.
    /// Both writes are attempted; a failure is reported when the tick finishes.
    fn record(&mut self, record: &TradeRecord) {
        if let Err(e) = self.journal.append_trade(record) {
            self.journal_failed(e);
        }
        if let Err(e) = self.journal.save_state(&self.positions.durable_state()) {
            self.journal_failed(e);
        }
    }

    fn journal_failed(&mut self, e: JournalError) {
        log::error!("[{}] Journal write failed: {}", self.cfg.symbol, e);
        if self.journal_failure.is_none() {
            self.journal_failure = Some(e);
        }
    }

    async fn execution_failed(&self, what: &str, e: ExecutionError) -> Result<(), TickError> {
        if e.is_fatal() {
            return Err(TickError::Fatal(format!("{what}: {e}")));
        }
        log::error!("[{}] {} failed: {}", self.cfg.symbol, what, e);
        if let Some(tg) = &self.telegram {
            tg.notify_risk_alert(&format!("[{}] {} failed: {}", self.cfg.symbol, what, e)).await;
        }
        Ok(())
    }

    fn entry_qty(&self, price: f64) -> Option<f64> {
        calculate_position_size(self.cfg.sizing, price, self.cfg.qty_step, self.cfg.min_trade_qty)
    }

    async fn sufficient_balance(&mut self, qty: f64, price: f64) -> Result<bool, TickError> {
        let balance = self.venue.get_balance().await?;
        self.last_balance = Some(balance);
        match validate_entry(qty, price, balance, self.cfg.fee_buffer_pct, self.cfg.min_trade_qty) {
            Ok(()) => Ok(true),
            Err(why) => {
                log::warn!("[{}] Entry skipped: {}", self.cfg.symbol, why);
                Ok(false)
            }
        }
    }

    async fn act(&mut self, now: DateTime<Utc>, decision: &Decision, reading: &Reading) -> Result<(), TickError> {
        let price = reading.price;
        match decision.directive {
            Directive::None => Ok(()),
            Directive::Buy | Directive::Short => {
                let side = if decision.directive == Directive::Buy { Side::Long } else { Side::Short };
                self.propose(now, side, price).await
            }
            Directive::Sell | Directive::Cover => match decision.flip_into {
                Some(into) => self.flip(now, into, price).await,
                None => self.close(now, "opposite cross").await.map(|_| ()),
            },
            Directive::SellEarly | Directive::CoverEarly => {
                log::info!(
                    "[{}] Early exit: RSI {:.1} outside {}..{}",
                    self.cfg.symbol,
                    reading.current.rsi,
                    self.cfg.rsi_oversold,
                    self.cfg.rsi_overbought
                );
                if !self.close(now, "RSI early exit").await? {
                    self.latch.disarm();
                }
                Ok(())
            }
        }
    }

    async fn propose(&mut self, now: DateTime<Utc>, side: Side, price: f64) -> Result<(), TickError> {
        let Some(qty) = self.entry_qty(price) else {
            log::warn!("[{}] {:?} signal but size is below the minimum tradeable qty", self.cfg.symbol, side);
            return Ok(());
        };
        if !self.sufficient_balance(qty, price).await? {
            return Ok(());
        }
        match self.pending.propose(side, qty, now, self.positions.is_flat()) {
            Ok(p) => log::info!(
                "[{}] PENDING {:?} {:.6} until {}",
                self.cfg.symbol,
                p.side,
                p.qty,
                p.expires_at.format("%H:%M:%S")
            ),
            Err(ProposeError::AlreadyPending) => {
                log::debug!("[{}] {:?} signal while a trade is already pending", self.cfg.symbol, side)
            }
            Err(ProposeError::PositionOpen) => {
                log::debug!("[{}] {:?} signal while a position is open", self.cfg.symbol, side)
            }
        }
        Ok(())
    }

    /// Close, then open the other side. A failed close keeps the old position;
    /// after a successful close the open leg needs the same balance as any entry.
    async fn flip(&mut self, now: DateTime<Utc>, into: Side, price: f64) -> Result<(), TickError> {
        let Some(qty) = self.entry_qty(price) else {
            return self.close(now, "opposite cross").await.map(|_| ());
        };
        log::info!("[{}] Flipping into {:?} {:.6}", self.cfg.symbol, into, qty);
        if !self.close(now, "flip").await? {
            return Ok(());
        }
        if !self.sufficient_balance(qty, price).await? {
            log::warn!("[{}] Staying flat instead of flipping into {:?}", self.cfg.symbol, into);
            return Ok(());
        }
        self.open(now, into, qty, "flip open leg").await.map(|_| ())
    }

    async fn execute_pending(&mut self, now: DateTime<Utc>, price: f64) -> Result<(), TickError> {
        if self.unconfirmed_entry && self.positions.is_flat() && self.adopt_unconfirmed_entry(now, price).await? {
            return Ok(());
        }
        let PendingAction::Execute(trade) = self.pending.tick(now, None, self.positions.is_flat()) else {
            return Ok(());
        };
        if !self.sufficient_balance(trade.qty, price).await? {
            return Ok(());
        }
        if self.open(now, trade.side, trade.qty, "entry").await? {
            self.pending.fill();
        }
        // otherwise the intent stays pending and is retried next tick until it expires
        Ok(())
    }

    /// An entry that failed without a clear rejection may have filled anyway.
    /// Ask the venue before sending another order; true if a position was adopted.
    async fn adopt_unconfirmed_entry(&mut self, now: DateTime<Utc>, price: f64) -> Result<bool, TickError> {
        let venue_pos = self.venue.get_position().await?;
        self.unconfirmed_entry = false;
        if !self.positions.reconcile(&venue_pos, price) {
            return Ok(false);
        }
        let pos = *self.positions.position();
        let Some(side) = pos.side.side() else {
            return Ok(false);
        };
        log::warn!(
            "[{}] Unconfirmed {} entry is live on the venue: {:.6} @ {:.2}",
            self.cfg.symbol,
            pos.side.label(),
            pos.quantity,
            pos.entry_price
        );
        if let Some(p) = self.pending.fill() {
            log::info!("[{}] Pending {:?} {:.6} settled by the adopted position", self.cfg.symbol, p.side, p.qty);
        }
        let record = TradeRecord::new(now, TradeAction::open(side), pos.quantity, pos.entry_price);
        self.after_open(side, &record).await;
        Ok(true)
    }

    fn publish(&self, now: DateTime<Utc>, price: Option<f64>, reading: Option<&Reading>) {
        let pos = self.positions.position();
        self.publisher.publish(StatusSnapshot {
            last_update: Some(now),
            symbol: self.cfg.symbol.clone(),
            price,
            trend: reading.map(|r| r.current.trend().label()),
            rsi: reading.map(|r| r.current.rsi),
            sma_short: reading.map(|r| r.current.sma_short),
            sma_long: reading.map(|r| r.current.sma_long),
            balance: self.last_balance,
            position: pos.quantity,
            side: pos.side,
            entry_price: pos.is_open().then_some(pos.entry_price),
            unrealized_pnl: price.map_or(0.0, |p| pos.unrealized_pnl(p)),
            total_profit: self.positions.total_profit(),
            crosses: self.detector.history().newest_first(),
            pending_trade: self.pending.current().cloned(),
            last_signal: self.last_signal.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RatchetParams, SizingPolicy};
    use crate::error::VenueError;
    use crate::exchange::mock::{Call, MockVenue};
    use crate::journal::memory::MemoryJournal;
    use crate::types::{
        Candle, DurableState, Fill, FillResult, PositionSide, TradeAction, VenuePosition,
    };

    const BASE_TS: i64 = 1_700_000_000_000;

    /// 300 one-minute closes: slow decline to candle 205, then a steady climb,
    /// with a ±0.5 zigzag. SMA(50) crosses above SMA(200) at candle 250 with
    /// the long SMA rising and RSI(14) at 60.
    fn golden_series() -> Vec<f64> {
        (0..300usize)
            .map(|i| {
                let z = if i % 2 == 0 { 0.5 } else { -0.5 };
                100.0 - 0.05 * (i.min(205) as f64) + 0.2 * (i.saturating_sub(205) as f64) + z
            })
            .collect()
    }

    fn candles(closes: &[f64], ts_offset: i64) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: BASE_TS + ts_offset + i as i64 * 60_000,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    /// Window ending at the golden cross candle.
    fn golden_window() -> Vec<Candle> {
        candles(&golden_series()[..=250], 0)
    }

    /// Mirror image (200 - close): a death cross in a downtrend with RSI 40,
    /// stamped after the golden window so the detector sees new candles.
    fn death_window() -> Vec<Candle> {
        let mirrored: Vec<f64> = golden_series()[..=250].iter().map(|c| 200.0 - c).collect();
        candles(&mirrored, 1_000 * 60_000)
    }

    fn cfg() -> Config {
        Config { sizing: SizingPolicy::Fixed { qty: 0.5 }, ..Config::default() }
    }

    fn trader(cfg: Config, venue: MockVenue, journal: MemoryJournal) -> (Trader<MockVenue, MemoryJournal>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Trader::new(cfg, venue, journal, rx), tx)
    }

    fn last_ts(c: &[Candle]) -> DateTime<Utc> {
        crate::types::ms_to_utc(c.last().unwrap().timestamp)
    }

    /// Journal and venue agreeing on an open long.
    fn restored_long(entry: f64, qty: f64, price: f64) -> (MockVenue, MemoryJournal) {
        let journal = MemoryJournal {
            state: Some(DurableState {
                position_open: true,
                side: PositionSide::Long,
                entry_price: Some(entry),
                quantity: qty,
                total_profit: 0.0,
            }),
            ..Default::default()
        };
        let venue = MockVenue::new(price);
        *venue.position.lock().unwrap() =
            VenuePosition { side: PositionSide::Long, size: qty, avg_price: Some(entry) };
        (venue, journal)
    }

    /// Long opened on the golden cross, ready for the death window.
    async fn long_after_golden(cfg: Config) -> (Trader<MockVenue, MemoryJournal>, watch::Sender<bool>, DateTime<Utc>) {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        let (mut t, tx) = trader(cfg, venue, MemoryJournal::default());
        let now = last_ts(&golden_window());
        t.tick(now).await.unwrap();
        assert_eq!(t.positions.side(), PositionSide::Long);
        (t, tx, now)
    }

    #[tokio::test]
    async fn golden_cross_buys_through_pending_window() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        venue.script(Ok(FillResult::Filled(Fill { price: 100.0, qty: 0.5 })));
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        let now = last_ts(&golden_window());
        assert_eq!(t.tick(now).await.unwrap(), TickOutcome::NewCandle);

        assert_eq!(t.last_signal.as_deref(), Some("buy"));
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5)]);
        let pos = *t.positions.position();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.entry_price, 100.0);
        assert_eq!(pos.quantity, 0.5);
        assert!(!t.pending.is_pending());

        assert_eq!(t.journal.trades.len(), 1);
        let rec = &t.journal.trades[0];
        assert_eq!((rec.action, rec.qty, rec.price), (TradeAction::Buy, 0.5, 100.0));
        let state = t.journal.state.clone().unwrap();
        assert!(state.position_open);
        assert_eq!(state.entry_price, Some(100.0));
        assert_eq!(t.journal.crosses.len(), 1);

        let status = t.publisher.current();
        assert_eq!(status.side, PositionSide::Long);
        assert_eq!(status.crosses.len(), 1);
        assert_eq!(status.trend, Some("Uptrend"));

        // polling the same candle again neither re-raises the cross nor trades
        assert_eq!(t.tick(now).await.unwrap(), TickOutcome::SameCandle);
        assert_eq!(t.venue.calls().len(), 1);
        assert_eq!(t.detector.history().len(), 1);
    }

    #[tokio::test]
    async fn short_window_is_not_ready() {
        let venue = MockVenue::new(100.0);
        venue.set_candles(candles(&golden_series()[..150], 0));
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());
        match t.tick(Utc::now()).await.unwrap() {
            TickOutcome::NotReady(nr) => assert_eq!((nr.available, nr.required), (150, 205)),
            other => panic!("expected not ready, got {other:?}"),
        }
        assert!(t.venue.calls().is_empty());
        assert_eq!(t.publisher.current().price, Some(golden_series()[149]));
    }

    #[tokio::test]
    async fn empty_fetch_is_not_ready() {
        let (mut t, _tx) = trader(cfg(), MockVenue::new(100.0), MemoryJournal::default());
        assert!(matches!(t.tick(Utc::now()).await, Ok(TickOutcome::NotReady(_))));
    }

    #[tokio::test]
    async fn rejected_entry_stays_pending_then_opposing_cross_cancels() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        venue.script(Ok(FillResult::Rejected { reason: "insufficient liquidity".into() }));
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        let now = last_ts(&golden_window());
        t.tick(now).await.unwrap();
        assert!(t.positions.is_flat());
        assert!(t.pending.is_pending());
        assert!(t.journal.trades.is_empty());

        t.venue.set_candles(death_window());
        t.tick(now + Duration::seconds(30)).await.unwrap();
        assert!(!t.pending.is_pending());
        assert!(t.positions.is_flat());
        // shorts are disabled by default, so the death cross opens nothing
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5)]);
    }

    #[tokio::test]
    async fn death_cross_flips_long_into_short() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        let (mut t, _tx) = trader(Config { shorting_enabled: true, ..cfg() }, venue, MemoryJournal::default());

        let now = last_ts(&golden_window());
        t.tick(now).await.unwrap();
        assert_eq!(t.positions.side(), PositionSide::Long);

        let death = death_window();
        t.venue.set_candles(death.clone());
        t.tick(now + Duration::minutes(1)).await.unwrap();

        assert_eq!(t.positions.side(), PositionSide::Short);
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5), Call::Close, Call::OpenShort(0.5)]);
        let actions: Vec<TradeAction> = t.journal.trades.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![TradeAction::Buy, TradeAction::Sell, TradeAction::Short]);
        let exit_price = death.last().unwrap().close;
        assert!((t.positions.total_profit() - (exit_price - golden_series()[250]) * 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fatal_entry_error_halts_the_loop() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        venue.script(Err(VenueError::Fatal("invalid api key".into())));
        let (t, _tx) = trader(cfg(), venue, MemoryJournal::default());
        let err = t.run().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn startup_seeds_position_from_venue() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        *venue.position.lock().unwrap() =
            VenuePosition { side: PositionSide::Short, size: 1.0, avg_price: None };
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        t.startup(Utc::now()).await.unwrap();
        let pos = *t.positions.position();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.quantity, 1.0);
        assert_eq!(pos.entry_price, golden_series()[250]);
        assert_eq!(t.journal.state.as_ref().map(|s| s.side), Some(PositionSide::Short));
    }

    #[tokio::test]
    async fn startup_clears_local_position_when_venue_is_flat() {
        let journal = MemoryJournal {
            state: Some(DurableState {
                position_open: true,
                side: PositionSide::Long,
                entry_price: Some(95.0),
                quantity: 0.5,
                total_profit: 1.25,
            }),
            ..Default::default()
        };
        let venue = MockVenue::new(100.0);
        venue.set_candles(golden_window());
        let (mut t, _tx) = trader(cfg(), venue, journal);
        t.startup(Utc::now()).await.unwrap();
        assert!(t.positions.is_flat());
        assert_eq!(t.positions.total_profit(), 1.25);
        assert_eq!(t.journal.state.as_ref().map(|s| s.position_open), Some(false));
    }

    #[tokio::test]
    async fn trailing_stop_closes_restored_long() {
        let journal = MemoryJournal {
            state: Some(DurableState {
                position_open: true,
                side: PositionSide::Long,
                entry_price: Some(110.0),
                quantity: 0.5,
                total_profit: 0.0,
            }),
            ..Default::default()
        };
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        *venue.position.lock().unwrap() =
            VenuePosition { side: PositionSide::Long, size: 0.5, avg_price: Some(110.0) };
        // RSI 60 sits above this threshold, so the golden cross cannot re-enter
        let cfg = Config { trailing_stop_pct: Some(0.02), rsi_overbought: 55.0, rsi_oversold: 20.0, ..cfg() };
        let (mut t, _tx) = trader(cfg, venue, journal);

        t.startup(Utc::now()).await.unwrap();
        t.tick(last_ts(&golden_window())).await.unwrap();

        assert!(t.positions.is_flat());
        assert_eq!(t.venue.calls(), vec![Call::Close]);
        assert_eq!(t.journal.trades.len(), 1);
        assert_eq!(t.journal.trades[0].action, TradeAction::Sell);
        assert!((t.positions.total_profit() - (golden_series()[250] - 110.0) * 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_flag_short_circuits_tick() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        let (mut t, tx) = trader(cfg(), venue, MemoryJournal::default());
        tx.send(true).unwrap();
        assert_eq!(t.tick(Utc::now()).await.unwrap(), TickOutcome::Stopped);
        assert!(t.venue.calls().is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_stop_signal() {
        let venue = MockVenue::new(100.0);
        let (t, tx) = trader(Config { poll_interval: std::time::Duration::from_secs(3600), ..cfg() }, venue, MemoryJournal::default());
        let handle = tokio::spawn(t.run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn startup_failure_is_not_fatal() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        *venue.fetch_failures.lock().unwrap() = 1;
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());
        let err = t.startup(Utc::now()).await.unwrap_err();
        assert!(!err.is_fatal());
        t.startup(Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn run_backs_off_and_retries_startup() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        *venue.fetch_failures.lock().unwrap() = 3;
        let fast = Config {
            poll_interval: std::time::Duration::from_millis(10),
            error_backoff: std::time::Duration::from_millis(10),
            ..cfg()
        };
        let (t, tx) = trader(fast, venue, MemoryJournal::default());
        let handle = tokio::spawn(t.run());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn startup_waits_for_candles_before_seeding() {
        let venue = MockVenue::new(99.25);
        *venue.position.lock().unwrap() =
            VenuePosition { side: PositionSide::Short, size: 1.0, avg_price: None };
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        let err = t.startup(Utc::now()).await.unwrap_err();
        assert!(matches!(err, TickError::NotReady(NotReady { available: 0, .. })));
        assert!(t.positions.is_flat());
        assert!(t.journal.state.is_none());

        t.venue.set_candles(golden_window());
        t.startup(Utc::now()).await.unwrap();
        assert_eq!(t.positions.position().entry_price, golden_series()[250]);
    }

    #[tokio::test]
    async fn cross_log_failure_does_not_lose_the_signal() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        let journal = MemoryJournal { failing_cross_writes: 1, ..Default::default() };
        let (mut t, _tx) = trader(cfg(), venue, journal);

        let now = last_ts(&golden_window());
        assert_eq!(t.tick(now).await.unwrap(), TickOutcome::NewCandle);
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5)]);
        assert_eq!(t.positions.side(), PositionSide::Long);
        assert!(t.journal.crosses.is_empty());
        assert_eq!(t.detector.history().len(), 1);
    }

    #[tokio::test]
    async fn flip_bookkeeping_completes_when_trade_log_fails() {
        let (mut t, _tx, now) = long_after_golden(Config { shorting_enabled: true, ..cfg() }).await;
        t.journal.failing_trade_writes = 1;
        t.venue.set_candles(death_window());

        let err = t.tick(now + Duration::minutes(1)).await.unwrap_err();
        assert!(matches!(err, TickError::Journal(_)));
        assert!(!err.is_fatal());

        // the close line is lost, everything after it still happened
        assert_eq!(t.positions.side(), PositionSide::Short);
        let actions: Vec<TradeAction> = t.journal.trades.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![TradeAction::Buy, TradeAction::Short]);
        assert_eq!(t.journal.state.as_ref().map(|s| s.side), Some(PositionSide::Short));
        assert!(t.latch.is_armed());
        assert_eq!(t.publisher.current().side, PositionSide::Short);
    }

    #[tokio::test]
    async fn lost_entry_response_is_adopted_not_resent() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        venue.script(Err(VenueError::Transient("timeout".into())));
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        let now = last_ts(&golden_window());
        t.tick(now).await.unwrap();
        assert!(t.positions.is_flat());
        assert!(t.pending.is_pending());

        // the order went through even though the response never arrived
        *t.venue.position.lock().unwrap() =
            VenuePosition { side: PositionSide::Long, size: 0.5, avg_price: Some(99.5) };
        t.tick(now + Duration::seconds(30)).await.unwrap();

        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5)]);
        let pos = *t.positions.position();
        assert_eq!((pos.side, pos.quantity, pos.entry_price), (PositionSide::Long, 0.5, 99.5));
        assert!(!t.pending.is_pending());
        assert_eq!(t.journal.trades.len(), 1);
        assert_eq!(t.journal.trades[0].action, TradeAction::Buy);
    }

    #[tokio::test]
    async fn lost_entry_that_never_filled_is_retried() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        venue.script(Err(VenueError::Transient("timeout".into())));
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        let now = last_ts(&golden_window());
        t.tick(now).await.unwrap();
        t.tick(now + Duration::seconds(30)).await.unwrap();

        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5), Call::OpenLong(0.5)]);
        assert_eq!(t.positions.side(), PositionSide::Long);
        assert!(!t.unconfirmed_entry);
    }

    #[tokio::test]
    async fn insufficient_balance_skips_proposal() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        *venue.balance.lock().unwrap() = 10.0;
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        t.tick(last_ts(&golden_window())).await.unwrap();
        assert!(!t.pending.is_pending());
        assert!(t.venue.calls().is_empty());
        assert_eq!(t.publisher.current().balance, Some(10.0));
    }

    #[tokio::test]
    async fn insufficient_balance_holds_pending_execution() {
        let venue = MockVenue::new(99.25);
        venue.set_candles(golden_window());
        venue.script(Ok(FillResult::Rejected { reason: "price band".into() }));
        let (mut t, _tx) = trader(cfg(), venue, MemoryJournal::default());

        let now = last_ts(&golden_window());
        t.tick(now).await.unwrap();
        assert!(t.pending.is_pending());

        *t.venue.balance.lock().unwrap() = 1.0;
        t.tick(now + Duration::seconds(30)).await.unwrap();
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5)]);
        assert!(t.pending.is_pending());
        assert!(t.positions.is_flat());
    }

    #[tokio::test]
    async fn failed_early_exit_disarms_until_rsi_normalises() {
        let (venue, journal) = restored_long(110.0, 0.5, 99.25);
        venue.set_candles(golden_window());
        venue.script(Ok(FillResult::Rejected { reason: "reduce-only rejected".into() }));
        // RSI sits at 60 on the climb, above this threshold
        let cfg = Config { early_exit_enabled: true, rsi_overbought: 55.0, rsi_oversold: 20.0, ..cfg() };
        let (mut t, _tx) = trader(cfg, venue, journal);

        t.startup(Utc::now()).await.unwrap();
        t.tick(last_ts(&golden_window())).await.unwrap();
        assert_eq!(t.venue.calls(), vec![Call::Close]);
        assert_eq!(t.positions.side(), PositionSide::Long);
        assert!(!t.latch.is_armed());

        // next candle, RSI still high: no second close attempt
        let next = candles(&golden_series()[..=251], 0);
        t.venue.set_candles(next.clone());
        assert_eq!(t.tick(last_ts(&next)).await.unwrap(), TickOutcome::NewCandle);
        assert_eq!(t.venue.calls(), vec![Call::Close]);
        assert_eq!(t.positions.side(), PositionSide::Long);
    }

    #[tokio::test]
    async fn profit_ratchet_closes_within_one_tick() {
        let (venue, journal) = restored_long(90.0, 1.0, 99.25);
        let climb = candles(&golden_series()[..=280], 0);
        venue.set_candles(climb.clone());
        let cfg = Config {
            ratchet: Some(RatchetParams { min_profit: 5.0, retention: 0.7 }),
            rsi_overbought: 55.0,
            rsi_oversold: 20.0,
            ..cfg()
        };
        let (mut t, _tx) = trader(cfg, venue, journal);
        t.startup(Utc::now()).await.unwrap();

        // unrealized 15.25 arms the ratchet
        t.tick(last_ts(&climb)).await.unwrap();
        assert_eq!(t.positions.side(), PositionSide::Long);
        assert!(t.risk.ratchet().is_some_and(|r| r.is_active()));

        // 10.0 is below 70% of the 15.25 peak
        let mut closes = golden_series()[..=280].to_vec();
        closes.push(100.0);
        let dip = candles(&closes, 0);
        t.venue.set_candles(dip.clone());
        t.tick(last_ts(&dip)).await.unwrap();

        assert!(t.positions.is_flat());
        assert_eq!(t.venue.calls(), vec![Call::Close]);
        assert_eq!(t.journal.trades.len(), 1);
        assert!((t.positions.total_profit() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn flip_close_leg_failure_keeps_old_position() {
        let (mut t, _tx, now) = long_after_golden(Config { shorting_enabled: true, ..cfg() }).await;
        let entry = t.positions.position().entry_price;
        t.venue.script(Ok(FillResult::Rejected { reason: "reduce-only rejected".into() }));
        t.venue.set_candles(death_window());
        t.tick(now + Duration::minutes(1)).await.unwrap();

        assert_eq!(t.positions.side(), PositionSide::Long);
        assert_eq!(t.positions.position().entry_price, entry);
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5), Call::Close]);
        assert_eq!(t.journal.trades.len(), 1);
    }

    #[tokio::test]
    async fn flip_open_leg_failure_ends_flat() {
        let (mut t, _tx, now) = long_after_golden(Config { shorting_enabled: true, ..cfg() }).await;
        t.venue.script(Ok(FillResult::Filled(Fill { price: 98.0, qty: 0.5 })));
        t.venue.script(Ok(FillResult::Rejected { reason: "insufficient margin".into() }));
        t.venue.set_candles(death_window());
        t.tick(now + Duration::minutes(1)).await.unwrap();

        assert!(t.positions.is_flat());
        assert_eq!(t.journal.state.as_ref().and_then(|s| s.entry_price), None);
        let actions: Vec<TradeAction> = t.journal.trades.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![TradeAction::Buy, TradeAction::Sell]);
    }

    #[tokio::test]
    async fn flip_without_balance_stays_flat() {
        let (mut t, _tx, now) = long_after_golden(Config { shorting_enabled: true, ..cfg() }).await;
        *t.venue.balance.lock().unwrap() = 1.0;
        t.venue.set_candles(death_window());
        t.tick(now + Duration::minutes(1)).await.unwrap();

        assert!(t.positions.is_flat());
        assert_eq!(t.venue.calls(), vec![Call::OpenLong(0.5), Call::Close]);
        let actions: Vec<TradeAction> = t.journal.trades.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![TradeAction::Buy, TradeAction::Sell]);
    }
}
