use std::sync::Arc;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("smtp relay: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
}

#[derive(Deserialize, Serialize, Debug)]
pub struct MailerSettings {
    pub user: String,
    pub pass: String,
    pub relay: String,
    pub from: String,
    pub to: Vec<String>,
    pub machine_id: String,
}

pub struct Mailer {
    from: Mailbox,
    vec_to: Vec<Mailbox>,
    machine_id: String,
    relay: SmtpTransport,
}

impl Mailer {
    pub fn new(settings: MailerSettings) -> Result<Mailer, MailError> {
        let vec_to = settings
            .to
            .iter()
            .map(|to| to.parse())
            .collect::<Result<Vec<Mailbox>, _>>()?;

        Ok(Mailer {
            from: settings.from.parse()?,
            vec_to,
            machine_id: settings.machine_id,
            relay: SmtpTransport::relay(&settings.relay)?
                .credentials(Credentials::new(settings.user, settings.pass))
                .build(),
        })
    }

    pub fn send(&self, subject: &str, message: &str) -> Result<(), MailError> {
        if cfg!(debug_assertions) {
            debug!("In debug build, not sending email: {}", subject);
            return Ok(());
        }

        let mut builder = Message::builder().from(self.from.clone());
        for to in &self.vec_to {
            builder = builder.to(to.clone());
        }
        let email = builder
            .subject(format!("{}: {}", self.machine_id, subject))
            .body(message.to_string())?;

        self.relay.send(&email)?;
        Ok(())
    }
}

/// Fire-and-forget delivery of power event mails, kept off the async workers.
#[derive(Clone, Default)]
pub struct Notifier {
    mailer: Option<Arc<Mailer>>,
}

impl Notifier {
    pub fn new(mailer: Mailer) -> Self {
        Notifier {
            mailer: Some(Arc::new(mailer)),
        }
    }

    pub fn disabled() -> Self {
        Notifier { mailer: None }
    }

    pub fn notify(&self, subject: &str, message: String) {
        let Some(mailer) = self.mailer.clone() else {
            return;
        };
        let subject = subject.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = mailer.send(&subject, &message) {
                error!("Failed to send email: {}", e);
            }
        });
    }
}
