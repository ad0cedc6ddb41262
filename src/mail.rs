use actix_web::{error, post, web, Error, Responder};
use anyhow::Context;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use once_cell::sync::OnceCell;
use serde::Deserialize;

static MAILER: OnceCell<AsyncSmtpTransport<Tokio1Executor>> = OnceCell::new();

#[derive(Debug, Deserialize)]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    pub message: String,
}

/// Builds the shared SMTP transport. Constructed once at startup, pooled by
/// lettre for the life of the process.
pub fn init() {
    let host = std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_owned());
    let port = std::env::var("SMTP_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(587);

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
        .expect("SMTP transport failed to initialize.")
        .port(port);

    if let (Ok(user), Ok(pass)) = (std::env::var("SMTP_USER"), std::env::var("SMTP_PASS")) {
        builder = builder.credentials(Credentials::new(user, pass));
    }

    MAILER
        .set(builder.build())
        .expect("mail::init() called twice");
}

fn get_mailer() -> &'static AsyncSmtpTransport<Tokio1Executor> {
    MAILER.get().expect("get_mailer() called before init()")
}

fn contact_address() -> String {
    std::env::var("CONTACT_EMAIL").unwrap_or_else(|_| "support@contenthub.local".to_owned())
}

fn sender_address() -> String {
    std::env::var("SMTP_USER").unwrap_or_else(|_| contact_address())
}

/// Parses the visitor-supplied address so a malformed one is rejected as
/// client error before any send is attempted.
fn parse_reply_to(email: &str) -> Result<Mailbox, Error> {
    email
        .trim()
        .parse()
        .map_err(|_| error::ErrorBadRequest("Invalid email address."))
}

pub async fn send_contact_email(form: &ContactForm, reply_to: Mailbox) -> anyhow::Result<()> {
    let body = format!(
        "<h3>New Contact Form Message</h3>\
         <p><strong>Name:</strong> {}</p>\
         <p><strong>Email:</strong> {}</p>\
         <p><strong>Message:</strong></p>\
         <p>{}</p>",
        escape_html(&form.name),
        escape_html(&form.email),
        escape_html(&form.message).replace('\n', "<br>"),
    );

    let message = Message::builder()
        .from(sender_address().parse().context("bad sender address")?)
        .reply_to(reply_to)
        .to(contact_address().parse().context("bad contact address")?)
        .subject(format!("Contact Form Message from {}", form.name))
        .header(ContentType::TEXT_HTML)
        .body(body)
        .context("failed to build message")?;

    get_mailer().send(message).await.context("smtp send")?;
    Ok(())
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[post("/api/contact")]
pub async fn post_contact(form: web::Json<ContactForm>) -> Result<impl Responder, Error> {
    let form = form.into_inner();
    if form.name.trim().is_empty() || form.email.trim().is_empty() || form.message.trim().is_empty()
    {
        return Err(error::ErrorBadRequest("Name, email and message are required."));
    }
    let reply_to = parse_reply_to(&form.email)?;

    send_contact_email(&form, reply_to).await.map_err(|e| {
        log::error!("post_contact: {:#}", e);
        error::ErrorInternalServerError("Failed to send message.")
    })?;

    Ok(web::Json(serde_json::json!({ "message": "Message sent successfully." })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_reply_to_is_a_client_error() {
        use actix_web::http::StatusCode;

        assert!(parse_reply_to("user@example.com").is_ok());
        assert!(parse_reply_to("  user@example.com  ").is_ok());

        let err = parse_reply_to("not an address").unwrap_err();
        assert_eq!(err.as_response_error().status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(
            escape_html("<script>alert(\"x\") & more</script>"),
            "&lt;script&gt;alert(&quot;x&quot;) &amp; more&lt;/script&gt;"
        );
        assert_eq!(escape_html("plain text"), "plain text");
    }
}
