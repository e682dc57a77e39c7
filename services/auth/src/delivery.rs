//! OTP delivery channels
//!
//! The core hands the raw code to a [`CodeSender`] and nowhere else.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{error, info};

use crate::error::DeliveryError;
use crate::models::Purpose;
use crate::phone::PhoneNumber;

#[async_trait]
pub trait CodeSender: Send + Sync {
    async fn send(
        &self,
        phone: &PhoneNumber,
        code: &str,
        purpose: Purpose,
    ) -> Result<(), DeliveryError>;
}

/// Text of the message carrying a code
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub brand_name: String,
    pub expires_in_minutes: u64,
}

impl MessageTemplate {
    pub fn render(&self, code: &str, purpose: Purpose) -> String {
        let kind = match purpose {
            Purpose::Login => "login",
            Purpose::PhoneChange => "phone verification",
        };
        format!(
            "Your {} {} code is: {}. This code expires in {} minutes.",
            self.brand_name, kind, code, self.expires_in_minutes
        )
    }
}

/// Development sender: records that a message would have gone out
#[derive(Debug, Clone, Default)]
pub struct LogSender;

#[async_trait]
impl CodeSender for LogSender {
    async fn send(
        &self,
        phone: &PhoneNumber,
        _code: &str,
        purpose: Purpose,
    ) -> Result<(), DeliveryError> {
        info!("[log delivery] {} code for {} not sent over any network", purpose, phone);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwilioChannel {
    Sms,
    WhatsApp,
}

impl TwilioChannel {
    fn address(&self, number: &str) -> String {
        match self {
            TwilioChannel::Sms => number.to_string(),
            TwilioChannel::WhatsApp => format!("whatsapp:{}", number),
        }
    }
}

/// Twilio account used for outgoing messages
#[derive(Debug, Clone)]
pub struct TwilioOptions {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number, in canonical international form
    pub from: String,
    /// Defaults to `https://api.twilio.com`
    pub base_url: String,
    pub channel: TwilioChannel,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: String,
    status: Option<String>,
}

/// Sender backed by the Twilio Messages API
#[derive(Debug, Clone)]
pub struct TwilioSender {
    client: Client,
    options: TwilioOptions,
    template: MessageTemplate,
}

impl TwilioSender {
    pub fn new(options: TwilioOptions, template: MessageTemplate) -> Result<Self, DeliveryError> {
        if options.account_sid.is_empty() || options.auth_token.is_empty() {
            return Err(DeliveryError::Misconfigured(
                "Twilio account SID and auth token are required".to_string(),
            ));
        }
        if options.from.is_empty() {
            return Err(DeliveryError::Misconfigured(
                "Twilio sender number is required".to_string(),
            ));
        }

        Ok(Self {
            client: Client::new(),
            options,
            template,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.options.base_url.trim_end_matches('/'),
            self.options.account_sid
        )
    }
}

#[async_trait]
impl CodeSender for TwilioSender {
    async fn send(
        &self,
        phone: &PhoneNumber,
        code: &str,
        purpose: Purpose,
    ) -> Result<(), DeliveryError> {
        let to = self.options.channel.address(phone.as_str());
        let from = self.options.channel.address(&self.options.from);
        let body = self.template.render(code, purpose);
        let form = [
            ("To", to.as_str()),
            ("From", from.as_str()),
            ("Body", body.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Twilio error ({}) sending {} code to {}: {}", status, purpose, phone, body);
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let message = response
            .json::<MessageResponse>()
            .await
            .map_err(|e| DeliveryError::Transport(format!("unreadable Twilio response: {}", e)))?;

        info!(
            "Sent {} code to {} (message {}, status {})",
            purpose,
            phone,
            message.sid,
            message.status.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }
}
