use std::time::Duration;

use color_eyre::Result;
use common::{eventually, start_gateway, start_gateway_with_timings, API_KEY};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sms_gateway::{config::Timings, mock::MockModem, server::API_KEY_HEADER};

mod common;

#[tokio::test]
async fn messages_without_key_is_unauthorized() -> Result<()> {
    let gw = start_gateway().await?;

    let response = reqwest::get(gw.url("/messages")).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.json::<Value>().await?,
        json!({"error": "Unauthorized access"})
    );
    assert_eq!(gw.reads(), 0);

    Ok(())
}

#[tokio::test]
async fn messages_with_wrong_key_is_unauthorized() -> Result<()> {
    let gw = start_gateway().await?;

    let response = reqwest::Client::new()
        .get(gw.url("/messages"))
        .header(API_KEY_HEADER, "not-the-key")
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gw.reads(), 0);

    Ok(())
}

#[tokio::test]
async fn messages_empty_at_first() -> Result<()> {
    let gw = start_gateway().await?;

    let response = reqwest::Client::new()
        .get(gw.url("/messages"))
        .header(API_KEY_HEADER, API_KEY)
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await?, json!([]));
    assert_eq!(gw.reads(), 1);

    Ok(())
}

#[tokio::test]
async fn send_without_key_never_reaches_modem() -> Result<()> {
    let gw = start_gateway().await?;

    let response = reqwest::Client::new()
        .post(gw.url("/send_sms"))
        .json(&json!({"phone_number": "+15551234567", "message": "Hi"}))
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(gw.modem.sent().is_empty());
    assert_eq!(gw.modem.count_commands("AT+CMGS"), 0);

    Ok(())
}

#[tokio::test]
async fn send_sms() -> Result<()> {
    let gw = start_gateway().await?;

    let response = reqwest::Client::new()
        .post(gw.url("/send_sms"))
        .header(API_KEY_HEADER, API_KEY)
        .json(&json!({"phone_number": "+15551234567", "message": "Hi"}))
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>().await?,
        json!({"success": "Message sent to +15551234567"})
    );

    let sent = gw.modem.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "+15551234567");
    assert_eq!(sent[0].body, "Hi");

    Ok(())
}

#[tokio::test]
async fn send_sms_missing_fields_is_bad_request() -> Result<()> {
    let gw = start_gateway().await?;
    let client = reqwest::Client::new();

    for body in [
        json!({"phone_number": "+15551234567"}),
        json!({"message": "Hi"}),
        json!({"phone_number": "", "message": "Hi"}),
        json!({}),
    ] {
        let response = client
            .post(gw.url("/send_sms"))
            .header(API_KEY_HEADER, API_KEY)
            .json(&body)
            .send()
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(
            response.json::<Value>().await?,
            json!({"error": "phone_number and message are required"})
        );
    }

    let response = client
        .post(gw.url("/send_sms"))
        .header(API_KEY_HEADER, API_KEY)
        .body("not json")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(gw.modem.sent().is_empty());

    Ok(())
}

#[tokio::test]
async fn send_sms_breaking_command_framing_is_bad_request() -> Result<()> {
    let gw = start_gateway().await?;
    let client = reqwest::Client::new();

    for body in [
        json!({"phone_number": "+15551234567", "message": "hi\u{1a}AT+CMGD=1\r\n"}),
        json!({"phone_number": "+15551234567", "message": "hi\u{1b}"}),
        json!({"phone_number": "+1\"\r\nAT+CMGD=1", "message": "Hi"}),
        json!({"phone_number": "call me", "message": "Hi"}),
    ] {
        let response = client
            .post(gw.url("/send_sms"))
            .header(API_KEY_HEADER, API_KEY)
            .json(&body)
            .send()
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        assert!(response.json::<Value>().await?["error"].is_string());
    }

    assert_eq!(gw.modem.count_commands("AT+CMGS"), 0);
    assert!(gw.modem.sent().is_empty());

    Ok(())
}

#[tokio::test]
async fn client_giving_up_does_not_cut_a_send_short() -> Result<()> {
    let timings = Timings {
        default_settle_ms: 300,
        ..Timings::fast()
    };
    let gw = start_gateway_with_timings(MockModem::new(), timings).await?;

    // Times out while the modem waits for the body.
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(450))
        .build()?;
    let result = client
        .post(gw.url("/send_sms"))
        .header(API_KEY_HEADER, API_KEY)
        .json(&json!({"phone_number": "+1", "message": "Hello"}))
        .send()
        .await;
    assert!(result.is_err());

    assert!(eventually(|| gw.modem.sent().len() == 1).await);

    let commands = gw.modem.commands();
    let recipient = commands
        .iter()
        .position(|c| c == "AT+CMGS=\"+1\"")
        .expect("recipient was set");
    assert_eq!(commands[recipient + 1], "Hello<Ctrl-Z>");

    // Polling still works afterwards.
    gw.modem.receive("+2", "25/01/01,12:00:00+00", "after");
    assert!(eventually(|| gw.modem.inbox().is_empty()).await);

    Ok(())
}

#[tokio::test]
async fn send_sms_rejected_by_modem_is_server_error() -> Result<()> {
    let gw = start_gateway().await?;
    gw.modem.set_reject_submissions(true);

    let response = reqwest::Client::new()
        .post(gw.url("/send_sms"))
        .header(API_KEY_HEADER, API_KEY)
        .json(&json!({"phone_number": "+15551234567", "message": "Hi"}))
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.json::<Value>().await?,
        json!({"error": "Failed to send SMS"})
    );

    Ok(())
}

#[tokio::test]
async fn send_sms_with_unplugged_modem_is_server_error() -> Result<()> {
    let gw = start_gateway().await?;
    gw.modem.set_fail_writes(true);

    let response = reqwest::Client::new()
        .post(gw.url("/send_sms"))
        .header(API_KEY_HEADER, API_KEY)
        .json(&json!({"phone_number": "+15551234567", "message": "Hi"}))
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    Ok(())
}

#[tokio::test]
async fn version() -> Result<()> {
    let gw = start_gateway().await?;

    let text = reqwest::get(gw.url("/version")).await?.text().await?;

    assert!(text.starts_with("SMS Gateway v"));

    Ok(())
}
