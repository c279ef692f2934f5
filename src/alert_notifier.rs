use crate::email_client::EmailClient;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

static ALERT_NOTIFIER: Lazy<AlertNotifier> = Lazy::new(AlertNotifier::new);

// Repeated alerts for the same context are collapsed inside this window.
const RESEND_INTERVAL: Duration = Duration::from_secs(900);

pub fn notify_alert(context: &str, detail: &str) {
    ALERT_NOTIFIER.notify(context, detail);
}

struct AlertNotifier {
    book_name: String,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertNotifier {
    fn new() -> Self {
        let book_name = std::env::var("PAIRS")
            .or_else(|_| std::env::var("PAIR"))
            .unwrap_or_default();
        Self {
            book_name,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, context: &str, detail: &str) {
        if !self.should_send(context) {
            log::debug!("[ALERT] suppressed repeat alert for '{}'", context);
            return;
        }
        let subject = if self.book_name.is_empty() {
            format!("[StatArb] {}", context)
        } else {
            format!("[{}] Alert - {}", self.book_name, context)
        };
        let body = format!(
            "Operator attention required: {}.\nDetail: {}",
            context, detail
        );

        EmailClient::new().send(&subject, &body);
        log::warn!(
            "📧 [ALERT] Notification raised for '{}' (detail: {})",
            context,
            detail
        );
    }

    fn should_send(&self, context: &str) -> bool {
        let mut map = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        match map.get(context) {
            Some(last) if now.duration_since(*last) < RESEND_INTERVAL => false,
            _ => {
                map.insert(context.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_alerts_are_suppressed() {
        let notifier = AlertNotifier {
            book_name: String::new(),
            last_sent: Mutex::new(HashMap::new()),
        };
        assert!(notifier.should_send("unhedged BTC/ETH"));
        assert!(!notifier.should_send("unhedged BTC/ETH"));
        assert!(notifier.should_send("unhedged SOL/AVAX"));
    }
}
