use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    engine::{AtCommand, AtEngine},
    error::{Error, Result},
    serial::SUBMIT_TERMINATOR,
};

// Ends text entry without sending.
const ESCAPE: char = '\u{1b}';

/// An SMS to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Destination number.
    pub recipient: String,

    /// The text.
    pub body: String,
}

impl OutboundRequest {
    /// A new request.
    pub fn new(recipient: &str, body: &str) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
        }
    }

    /// Check that the request can go on the line without breaking the command framing.
    ///
    /// The recipient is digits with an optional leading `+`.
    /// The body must not contain Ctrl-Z or Esc, the modem would act on those mid-text.
    pub fn validate(&self) -> Result<()> {
        let digits = self
            .recipient
            .strip_prefix('+')
            .unwrap_or(self.recipient.as_str());

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidRequest(
                "phone_number must be digits, optionally starting with +".into(),
            ));
        }

        if self.body.is_empty() {
            return Err(Error::InvalidRequest("message must not be empty".into()));
        }

        if self
            .body
            .chars()
            .any(|c| c == char::from(SUBMIT_TERMINATOR) || c == ESCAPE)
        {
            return Err(Error::InvalidRequest(
                "message must not contain Ctrl-Z or Esc".into(),
            ));
        }

        Ok(())
    }
}

/// Sends SMS through the modem, in text mode.
#[derive(Debug, Clone)]
pub struct SmsSender {
    engine: AtEngine,
}

impl SmsSender {
    /// Send through this engine.
    pub fn new(engine: AtEngine) -> Self {
        Self { engine }
    }

    /// Send the SMS.
    ///
    /// Returns `Ok(true)` only if the modem confirmed the submission with `OK`.
    /// A modem which answers anything else (including an error) gives `Ok(false)`.
    /// Transport problems are errors. Nothing is retried.
    ///
    /// Requests failing [`OutboundRequest::validate`] never reach the modem.
    /// Once started, the exchange runs to the end even if the returned future is dropped.
    pub async fn send(&self, request: &OutboundRequest) -> Result<bool> {
        request.validate()?;

        let sender = self.clone();
        let request = request.clone();
        let span = info_span!("send-sms", recipient = %request.recipient);

        // Stopping after `AT+CMGS` would leave the modem waiting for a body,
        // taking whatever comes next on the line as the text.
        tokio::spawn(async move { sender.send_in_session(&request).await }.instrument(span))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn send_in_session(&self, request: &OutboundRequest) -> Result<bool> {
        // One session for all steps.
        // A poll cycle must not get in between the recipient and the body.
        let mut session = self.engine.session().await;

        let response = session.execute(&AtCommand::TextMode).await?;
        if !response.is_ok() {
            warn!(%response, "Unexpected reply to text mode");
        }

        let response = session
            .execute(&AtCommand::SetRecipient(request.recipient.clone()))
            .await?;
        if !response.as_str().contains('>') {
            // The body is still sent, the modem could be waiting for it.
            warn!(%response, "No prompt for the message body");
        }

        let response = session
            .execute(&AtCommand::SubmitBody(request.body.clone()))
            .await?;

        let sent = response.is_ok();
        if sent {
            info!("Sent");
        } else {
            warn!(%response, "Modem did not confirm");
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, time::Duration};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::{
        config::Timings,
        mock::{MockModem, SentSms},
        serial::Transport,
    };

    /// Answers each write with the next canned reply.
    struct Scripted(VecDeque<&'static str>);

    #[async_trait]
    impl Transport for Scripted {
        async fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn read_available(&mut self) -> Result<Vec<u8>> {
            Ok(self.0.pop_front().unwrap_or_default().as_bytes().to_vec())
        }
    }

    async fn send_with_final_reply(reply: &'static str) -> bool {
        let script = Scripted(VecDeque::from(["\r\nOK\r\n", "\r\n> ", reply]));
        let sender = SmsSender::new(AtEngine::new(script, Timings::fast()));

        sender
            .send(&OutboundRequest::new("123", "Hello"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn success_iff_final_reply_has_ok() {
        assert!(send_with_final_reply("OK\r\n").await);
        assert!(send_with_final_reply("\r\n+CMGS: 12\r\n\r\nOK\r\n").await);
        assert!(!send_with_final_reply("ERROR\r\n").await);
        assert!(!send_with_final_reply("").await);
    }

    fn sender() -> (MockModem, SmsSender) {
        let modem = MockModem::new();
        let sender = SmsSender::new(AtEngine::new(modem.clone(), Timings::fast()));
        (modem, sender)
    }

    #[tokio::test]
    async fn sends_in_order() {
        let (modem, sender) = sender();

        let sent = sender
            .send(&OutboundRequest::new("+15551234567", "Hello"))
            .await
            .unwrap();

        assert!(sent);
        assert_eq!(
            modem.commands(),
            vec![
                "AT+CMGF=1".to_owned(),
                "AT+CMGS=\"+15551234567\"".to_owned(),
                "Hello<Ctrl-Z>".to_owned(),
            ]
        );
        assert_eq!(
            modem.sent(),
            vec![SentSms {
                recipient: "+15551234567".into(),
                body: "Hello".into()
            }]
        );
    }

    #[tokio::test]
    async fn rejected_submission_is_false() {
        let (modem, sender) = sender();
        modem.set_reject_submissions(true);

        let sent = sender
            .send(&OutboundRequest::new("123", "Hello"))
            .await
            .unwrap();

        assert!(!sent);
        assert!(modem.sent().is_empty());
    }

    #[test]
    fn recipient_must_be_a_number() {
        assert!(OutboundRequest::new("+15551234567", "Hi").validate().is_ok());
        assert!(OutboundRequest::new("15551234567", "Hi").validate().is_ok());

        for recipient in ["", "+", "+1\"", "123\r\nAT+CMGD=1", "12 34", "++1"] {
            assert!(
                matches!(
                    OutboundRequest::new(recipient, "Hi").validate(),
                    Err(Error::InvalidRequest(_))
                ),
                "{recipient:?}"
            );
        }
    }

    #[test]
    fn body_must_not_end_text_entry() {
        assert!(OutboundRequest::new("1", "line one\nline two").validate().is_ok());

        for body in ["", "hi\x1aAT+CMGD=1\r\n", "\x1b"] {
            assert!(
                OutboundRequest::new("1", body).validate().is_err(),
                "{body:?}"
            );
        }
    }

    #[tokio::test]
    async fn control_characters_never_reach_the_modem() {
        let (modem, sender) = sender();
        let slot = modem.receive("111", "ts", "not stored yet");

        let result = sender
            .send(&OutboundRequest::new("+1", "hi\x1aAT+CMGD=1\r\n"))
            .await;

        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert!(modem.commands().is_empty());
        assert!(modem.inbox().contains_key(&slot));
    }

    #[tokio::test]
    async fn echoed_ok_in_body_is_not_success() {
        let script = Scripted(VecDeque::from([
            "\r\nOK\r\n",
            "\r\n> ",
            "> OK thanks\r\n+CMS ERROR: 500\r\n",
        ]));
        let sender = SmsSender::new(AtEngine::new(script, Timings::fast()));

        let sent = sender
            .send(&OutboundRequest::new("123", "OK thanks"))
            .await
            .unwrap();

        assert!(!sent);
    }

    #[tokio::test]
    async fn dropped_send_still_completes() {
        let modem = MockModem::new();
        let timings = Timings {
            default_settle_ms: 50,
            ..Timings::fast()
        };
        let sender = SmsSender::new(AtEngine::new(modem.clone(), timings));

        // Give up while the modem is waiting for the body.
        let request = OutboundRequest::new("+1", "Hello");
        let gave_up = tokio::time::timeout(Duration::from_millis(75), sender.send(&request)).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            modem.commands(),
            vec![
                "AT+CMGF=1".to_owned(),
                "AT+CMGS=\"+1\"".to_owned(),
                "Hello<Ctrl-Z>".to_owned(),
            ]
        );
        assert_eq!(modem.sent().len(), 1);
    }

    #[tokio::test]
    async fn transport_error_is_an_error() {
        let (modem, sender) = sender();
        modem.set_fail_writes(true);

        assert!(sender.send(&OutboundRequest::new("123", "Hello")).await.is_err());
    }
}
