use std::fmt;

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use opentelemetry::KeyValue;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::config::SmtpSettings;
use crate::error::{AppError, AppResult};
use crate::http::{RetryPolicy, send_with_retry};
use crate::sharepoint::GraphClient;
use crate::telemetry::metrics::EMAILS_TOTAL;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorySummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl CategorySummary {
    pub fn new(total: usize, succeeded: usize) -> Self {
        Self {
            total,
            succeeded,
            failed: total.saturating_sub(succeeded),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub date: String,
    pub areas: CategorySummary,
    pub employees: CategorySummary,
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    Graph,
    Smtp,
}

impl fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryChannel::Graph => f.write_str("graph"),
            DeliveryChannel::Smtp => f.write_str("smtp"),
        }
    }
}

pub fn subject(report_title: &str, date: &str) -> String {
    format!("{report_title} - {date}")
}

const STYLE: &str = r#"
        body { font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; line-height: 1.6; color: #333; }
        .container { max-width: 600px; margin: 0 auto; padding: 20px; }
        h2 { color: #0078d4; border-bottom: 2px solid #0078d4; padding-bottom: 10px; }
        .section { background-color: #f5f5f5; border-left: 4px solid #0078d4; padding: 15px; margin: 15px 0; }
        .success { color: #107c10; font-weight: bold; }
        .failure { color: #d13438; font-weight: bold; }
        .stats { font-size: 16px; line-height: 2; }
        .footer { margin-top: 30px; padding-top: 20px; border-top: 1px solid #ccc; font-size: 12px; color: #666; }
"#;

fn section(heading: &str, record_label: &str, total_label: &str, counts: &CategorySummary) -> String {
    let mut html = format!(
        "<div class=\"section\">\n<h3>{heading}</h3>\n<div class=\"stats\">\n\
         <span class=\"success\">&#9989; {} {record_label}</span> have been created successfully.<br>\n",
        counts.succeeded
    );
    if counts.failed > 0 {
        html.push_str(&format!(
            "<span class=\"failure\">&#10060; {} failed</span> to be created.<br>\n",
            counts.failed
        ));
    }
    html.push_str(&format!(
        "Total count of {total_label}: <strong>{}</strong>\n</div>\n</div>\n",
        counts.total
    ));
    html
}

pub fn email_html(summary: &RunSummary, report_title: &str, employee_label: &str) -> String {
    let areas = section("Areas", "records", "areas", &summary.areas);
    let employees = section(
        employee_label,
        &format!("{employee_label} records"),
        employee_label,
        &summary.employees,
    );

    format!(
        "<html>\n<head>\n<style>{STYLE}</style>\n</head>\n<body>\n<div class=\"container\">\n\
         <h2>{report_title}</h2>\n\
         <p>Hello,</p>\n\
         <p>Today is <strong>{date}</strong>.</p>\n\
         {areas}{employees}\
         <div class=\"footer\">\n\
         <p>This is an automated notification from the {report_title} workflow.</p>\n\
         <p>For any issues, please check the logs in SharePoint.</p>\n\
         </div>\n</div>\n</body>\n</html>\n",
        date = summary.date,
    )
}

fn recipients(addresses: &[String]) -> Vec<Value> {
    addresses
        .iter()
        .map(|address| json!({"emailAddress": {"address": address}}))
        .collect()
}

#[tracing::instrument(
    name = "email.graph",
    skip(graph, message),
    fields(email.recipients = message.to.len())
)]
pub async fn send_via_graph(graph: &GraphClient, message: &EmailMessage) -> AppResult<()> {
    let token = graph.access_token().await?;
    let url = graph.url(["users", message.sender.as_str(), "sendMail"])?;

    let mut body = json!({
        "message": {
            "subject": message.subject,
            "body": {"contentType": "HTML", "content": message.html},
            "toRecipients": recipients(&message.to),
        },
        "saveToSentItems": true,
    });
    if !message.cc.is_empty() {
        body["message"]["ccRecipients"] = Value::Array(recipients(&message.cc));
    }

    tracing::info!(recipients = message.to.len(), "Sending email via Graph");
    tracing::debug!(subject = %message.subject);

    // a retried 5xx could deliver the mail twice
    let request = graph.http().post(url).bearer_auth(&token).json(&body);
    let response = send_with_retry(request, &RetryPolicy::none()).await?;

    if response.status() != StatusCode::ACCEPTED {
        let err = AppError::from_response(response).await;
        return Err(AppError::Email(format!("Graph sendMail failed: {err}")));
    }
    tracing::info!("Email sent via Graph");
    Ok(())
}

fn mailbox(address: &str) -> AppResult<Mailbox> {
    address
        .trim()
        .parse()
        .map_err(|e| AppError::Email(format!("invalid address {address:?}: {e}")))
}

pub fn build_smtp_message(message: &EmailMessage) -> AppResult<Message> {
    let mut builder = Message::builder()
        .from(mailbox(&message.sender)?)
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_HTML);
    for to in &message.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &message.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    builder
        .body(message.html.clone())
        .map_err(|e| AppError::Email(format!("cannot build message: {e}")))
}

#[tracing::instrument(
    name = "email.smtp",
    skip(smtp, message),
    fields(smtp.server = %smtp.server, smtp.port = smtp.port)
)]
pub async fn send_via_smtp(smtp: &SmtpSettings, message: &EmailMessage) -> AppResult<()> {
    tracing::info!(recipients = message.to.len(), "Sending email via SMTP");
    let email = build_smtp_message(message)?;

    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.server)
        .map_err(|e| AppError::Email(format!("invalid SMTP relay {}: {e}", smtp.server)))?
        .port(smtp.port)
        .credentials(SmtpCredentials::new(
            message.sender.clone(),
            smtp.password.expose().to_string(),
        ))
        .build();

    transport
        .send(email)
        .await
        .map_err(|e| AppError::Email(format!("SMTP delivery failed: {e}")))?;
    tracing::info!("Email sent via SMTP");
    Ok(())
}

/// Delivers through Graph, falling back to SMTP when it is configured.
#[tracing::instrument(name = "email.notify", skip_all, fields(email.channel))]
pub async fn send_notification(
    graph: &GraphClient,
    smtp: Option<&SmtpSettings>,
    message: &EmailMessage,
) -> AppResult<DeliveryChannel> {
    let span = tracing::Span::current();

    tracing::info!("Attempting to send email via Graph API");
    let graph_error = match send_via_graph(graph, message).await {
        Ok(()) => {
            record_email(DeliveryChannel::Graph, true);
            span.record("email.channel", "graph");
            return Ok(DeliveryChannel::Graph);
        }
        Err(e) => {
            record_email(DeliveryChannel::Graph, false);
            tracing::warn!(error = %e, "Graph API failed, attempting SMTP fallback");
            e
        }
    };

    let Some(smtp) = smtp else {
        tracing::error!("SMTP fallback not configured (SMTP_SERVER, SMTP_PORT, SMTP_PASSWORD)");
        return Err(graph_error);
    };

    match send_via_smtp(smtp, message).await {
        Ok(()) => {
            record_email(DeliveryChannel::Smtp, true);
            span.record("email.channel", "smtp");
            Ok(DeliveryChannel::Smtp)
        }
        Err(e) => {
            record_email(DeliveryChannel::Smtp, false);
            tracing::error!(error = %e, "Failed to send email via SMTP");
            Err(e)
        }
    }
}

fn record_email(channel: DeliveryChannel, ok: bool) {
    EMAILS_TOTAL.add(
        1,
        &[
            KeyValue::new("channel", channel.to_string()),
            KeyValue::new("outcome", if ok { "success" } else { "failure" }),
        ],
    );
}
