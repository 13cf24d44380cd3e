use crate::status::StatusSnapshot;
use crate::types::{PositionSide, Side};

const BASE_URL: &str = "https://api.telegram.org";

/// Operator notifications. Optional: the bot runs without it when
/// TELEGRAM_TOKEN / TELEGRAM_CHAT_ID are unset.
#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramBot {
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_TOKEN").ok().filter(|t| !t.is_empty())?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|c| !c.is_empty())?;
        Some(TelegramBot {
            client: reqwest::Client::new(),
            url: format!("{}/bot{}/sendMessage", BASE_URL, token),
            chat_id,
        })
    }

    /// Failures are logged, never propagated: notifications must not stall trading.
    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::debug!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => {
                log::warn!("Telegram error status: {}", resp.status());
            }
            Err(e) => {
                log::warn!("Telegram send failed: {}", e);
            }
        }
    }

    // ── Convenience helpers ──────────────────────────────────────────────────

    pub async fn notify_start(&self, symbol: &str, interval: &str, position: PositionSide) {
        self.send(&start_message(symbol, interval, position)).await;
    }

    pub async fn notify_trade_open(&self, symbol: &str, side: Side, qty: f64, price: f64) {
        self.send(&open_message(symbol, side, qty, price)).await;
    }

    pub async fn notify_trade_close(
        &self,
        symbol: &str,
        side: Side,
        entry: f64,
        exit: f64,
        pnl: f64,
        reason: &str,
    ) {
        self.send(&close_message(symbol, side, entry, exit, pnl, reason)).await;
    }

    pub async fn notify_risk_alert(&self, message: &str) {
        let msg = format!("⚠️ <b>Risk Alert</b>\n{message}");
        self.send(&msg).await;
    }

    pub async fn notify_status(&self, snapshot: &StatusSnapshot) {
        self.send(&snapshot.to_html()).await;
    }
}

fn start_message(symbol: &str, interval: &str, position: PositionSide) -> String {
    format!(
        "🤖 <b>Cross Trader started</b>\nPair: {symbol} | TF: {interval}m | Position: {}",
        position.label()
    )
}

fn open_message(symbol: &str, side: Side, qty: f64, price: f64) -> String {
    let (emoji, label) = match side {
        Side::Long => ("🟢", "LONG"),
        Side::Short => ("🔴", "SHORT"),
    };
    format!(
        "{emoji} <b>Trade Opened: {label} {symbol}</b>\n\
         Qty:   <code>{qty:.4}</code>\n\
         Entry: <code>{price:.2}</code>",
    )
}

fn close_message(symbol: &str, side: Side, entry: f64, exit: f64, pnl: f64, reason: &str) -> String {
    let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
    let label = match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    };
    format!(
        "{emoji} <b>Trade Closed: {label} {symbol}</b>\n\
         Entry: <code>{entry:.2}</code>  Exit: <code>{exit:.2}</code>\n\
         PnL:   <code>{pnl:+.2} USDT</code>\n\
         Reason: {reason}",
    )
}
