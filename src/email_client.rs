use anyhow::Result;
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};

/// Best-effort SMTP delivery for operator alerts. All settings come from the
/// environment; with no configuration the client silently drops messages so
/// dry runs never need a mail server.
pub struct EmailClient {
    config: Option<EmailConfig>,
}

struct EmailConfig {
    server: String,
    port: u16,
    username: String,
    password: String,
    sender: String,
    recipient: String,
}

impl EmailConfig {
    fn from_env() -> Option<Self> {
        let server = std::env::var("SMTP_SERVER").ok()?;
        let username = std::env::var("EMAIL_USERNAME").ok()?;
        let password = std::env::var("EMAIL_PASSWORD").ok()?;
        let sender = std::env::var("ALERT_SENDER").ok()?;
        let recipient = std::env::var("ALERT_RECIPIENT").ok()?;
        let port = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(587);
        Some(Self {
            server,
            port,
            username,
            password,
            sender,
            recipient,
        })
    }
}

impl EmailClient {
    pub fn new() -> Self {
        Self {
            config: EmailConfig::from_env(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn send(&self, subject: &str, body: &str) {
        let Some(config) = &self.config else {
            log::debug!("[EMAIL] no SMTP configuration, dropping '{}'", subject);
            return;
        };
        match Self::deliver(config, subject, body) {
            Ok(()) => log::info!("[EMAIL] sent '{}'", subject),
            Err(err) => log::warn!("[EMAIL] send failed for '{}': {}", subject, err),
        }
    }

    fn deliver(config: &EmailConfig, subject: &str, body: &str) -> Result<()> {
        let message = Message::builder()
            .from(config.sender.parse()?)
            .to(config.recipient.parse()?)
            .subject(subject)
            .body(body.to_string())?;
        let mailer = SmtpTransport::relay(&config.server)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        mailer.send(&message)?;
        Ok(())
    }
}
