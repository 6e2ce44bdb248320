//! Validation email contract and composition.
//!
//! Message transport lives outside this crate; implementations of
//! [`EmailSender`] plug in SES, a local relay, or a test double. The message
//! itself is composed here so the wording is tested alongside the workflow
//! that triggers it.

use async_trait::async_trait;

use crate::models::PolicySubmission;

/// Sends policy validation mail. Implemented by the deployment's transport.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Delivers the validation message for `submission` carrying `token`.
    async fn send_validation(
        &self,
        submission: &PolicySubmission,
        token: &str,
    ) -> anyhow::Result<()>;
}

/// Where validation mail for a domain is addressed.
pub fn validation_address(domain: &str) -> String {
    format!("postmaster@{domain}")
}

/// A composed validation message, ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationEmail {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Builds the validation message for a submission.
///
/// The confirmation link points at the public frontend named by the
/// `FRONTEND_WEBSITE_LINK` environment variable. The token appears only in
/// this message, never in API responses.
pub fn compose_validation(submission: &PolicySubmission, token: &str) -> ValidationEmail {
    let website = std::env::var("FRONTEND_WEBSITE_LINK")
        .unwrap_or_else(|_| "https://starttls-everywhere.org".to_string());
    let domain = &submission.domain;
    ValidationEmail {
        to: submission.contact_email.clone(),
        subject: format!("Confirm your submission of {domain}"),
        body: format!(
            "Hello,\n\n\
             {domain} was submitted for addition to the STARTTLS policy list.\n\
             To confirm that you control this domain and complete the submission,\n\
             visit:\n\n\
             {website}/validate?token={token}\n\n\
             The link expires in 72 hours. If you did not request this, you can\n\
             ignore this message and nothing will change.\n"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> PolicySubmission {
        PolicySubmission {
            domain: "example.com".into(),
            contact_email: "postmaster@example.com".into(),
            mta_sts: true,
            policy: None,
        }
    }

    #[test]
    fn validation_address_targets_postmaster() {
        assert_eq!(validation_address("example.com"), "postmaster@example.com");
    }

    #[test]
    fn composed_message_carries_token_and_domain() {
        let email = compose_validation(&submission(), "feedfacecafebeef");
        assert_eq!(email.to, "postmaster@example.com");
        assert!(email.subject.contains("example.com"));
        assert!(email.body.contains("token=feedfacecafebeef"));
        assert!(email.body.contains("example.com"));
    }
}
