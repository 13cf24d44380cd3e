use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::types::{CrossEvent, PendingTrade, PositionSide};

/// Read-only view of the bot for dashboards and operators.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub last_update: Option<DateTime<Utc>>,
    pub symbol: String,
    pub price: Option<f64>,
    pub trend: Option<&'static str>,
    pub rsi: Option<f64>,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub balance: Option<f64>,
    pub position: f64,
    pub side: PositionSide,
    pub entry_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub total_profit: f64,
    /// Newest first.
    pub crosses: Vec<CrossEvent>,
    pub pending_trade: Option<PendingTrade>,
    pub last_signal: Option<String>,
}

impl StatusSnapshot {
    /// Telegram-ready summary.
    pub fn to_html(&self) -> String {
        let price = self.price.map(|p| format!("{p:.2}")).unwrap_or_else(|| "n/a".into());
        let trend = self.trend.unwrap_or("n/a");
        let rsi = self.rsi.map(|r| format!("{r:.1}")).unwrap_or_else(|| "n/a".into());
        let mut msg = format!(
            "📡 <b>{}</b> | <code>{price}</code> | {trend} | RSI <code>{rsi}</code>\n\
             Position: <code>{} {:.4}</code> | uPnL <code>{:+.2}</code> | Total <code>{:+.2}</code>",
            self.symbol,
            self.side.label(),
            self.position,
            self.unrealized_pnl,
            self.total_profit,
        );
        if let Some(p) = &self.pending_trade {
            msg.push_str(&format!(
                "\n⏳ Pending {:?} {:.4} until {}",
                p.side,
                p.qty,
                p.expires_at.format("%H:%M:%S")
            ));
        }
        if let Some(c) = self.crosses.first() {
            msg.push_str(&format!(
                "\nLast cross: {:?} @ <code>{:.2}</code> ({})",
                c.kind,
                c.price,
                c.time.format("%Y-%m-%d %H:%M")
            ));
        }
        msg
    }
}

/// Single writer (the decision loop), any number of readers.
pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    pub fn new(symbol: &str) -> Self {
        let initial = StatusSnapshot { symbol: symbol.to_string(), ..Default::default() };
        let (tx, _rx) = watch::channel(initial);
        StatusPublisher { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        // send_replace never fails, even with no live receivers
        self.tx.send_replace(snapshot);
    }

    #[cfg(test)]
    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}
