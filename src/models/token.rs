//! Email validation tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_handling::SubmissionError;
use crate::storage::{PolicyStore, TokenStore};

/// A one-time token proving control of a domain's postmaster address.
///
/// At most one live token exists per domain; minting a new one invalidates
/// its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Domain the token validates.
    pub domain: String,
    /// The opaque 16-hex-character token value.
    pub token: String,
    /// When the token stops being redeemable.
    pub expires: DateTime<Utc>,
    /// Whether the token has been redeemed.
    pub used: bool,
}

impl Token {
    /// Redeems `token`, promoting the domain's pending submission to the
    /// active store, and returns the domain.
    ///
    /// A token that does not redeem (unknown, used, expired) is the caller's
    /// error. Store failures after that point are ours, and the token is
    /// already burnt, so the move cannot be retried through this path. If
    /// the promotion itself fails the pending row survives for operator
    /// intervention; if only the cleanup fails the active copy is
    /// authoritative and the leftover pending row is harmless — it is
    /// overwritten by any future submission.
    pub async fn redeem(
        token: &str,
        pending: &dyn PolicyStore,
        active: &dyn PolicyStore,
        tokens: &dyn TokenStore,
    ) -> Result<String, SubmissionError> {
        let domain = tokens.use_token(token).await.map_err(|_| {
            SubmissionError::UserInput(
                "This token is invalid, already used, or expired.".to_string(),
            )
        })?;
        let submission = pending
            .get(&domain)
            .await
            .map_err(|e| SubmissionError::Internal(anyhow::Error::new(e)))?;
        active
            .put_or_update(&submission)
            .await
            .map_err(|e| SubmissionError::Internal(anyhow::Error::new(e)))?;
        pending
            .remove(&domain)
            .await
            .map_err(|e| SubmissionError::Internal(anyhow::Error::new(e)))?;
        Ok(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TlsPolicy;
    use crate::storage::memory::{MemPolicyStore, MemTokenStore};
    use crate::PolicySubmission;

    fn submission(domain: &str) -> PolicySubmission {
        PolicySubmission {
            domain: domain.to_string(),
            contact_email: format!("postmaster@{domain}"),
            mta_sts: false,
            policy: Some(TlsPolicy {
                mode: "testing".into(),
                mxs: vec![format!(".{domain}")],
                ..TlsPolicy::default()
            }),
        }
    }

    #[tokio::test]
    async fn redemption_moves_pending_to_active() {
        let pending = MemPolicyStore::default();
        let active = MemPolicyStore::default();
        let tokens = MemTokenStore::default();

        pending.put_or_update(&submission("example.com")).await.unwrap();
        let token = tokens.put_token("example.com").await.unwrap();

        let domain = Token::redeem(&token.token, &pending, &active, &tokens)
            .await
            .expect("redeem");
        assert_eq!(domain, "example.com");
        assert!(active.get("example.com").await.is_ok());
        assert!(pending.get("example.com").await.is_err());
    }

    #[tokio::test]
    async fn second_redemption_is_a_user_error() {
        let pending = MemPolicyStore::default();
        let active = MemPolicyStore::default();
        let tokens = MemTokenStore::default();

        pending.put_or_update(&submission("example.com")).await.unwrap();
        let token = tokens.put_token("example.com").await.unwrap();
        Token::redeem(&token.token, &pending, &active, &tokens)
            .await
            .expect("first redemption");

        let err = Token::redeem(&token.token, &pending, &active, &tokens)
            .await
            .expect_err("second redemption");
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn unknown_token_is_a_user_error() {
        let err = Token::redeem(
            "feedfacecafebeef",
            &MemPolicyStore::default(),
            &MemPolicyStore::default(),
            &MemTokenStore::default(),
        )
        .await
        .expect_err("unknown token");
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn missing_pending_submission_is_our_error_and_token_burns() {
        let pending = MemPolicyStore::default();
        let active = MemPolicyStore::default();
        let tokens = MemTokenStore::default();

        // Token exists but nothing is pending: the move fails on our side.
        let token = tokens.put_token("example.com").await.unwrap();
        let err = Token::redeem(&token.token, &pending, &active, &tokens)
            .await
            .expect_err("nothing pending");
        assert!(!err.is_user_error());
        assert!(active.get("example.com").await.is_err());
    }

    #[tokio::test]
    async fn reissuing_invalidates_the_previous_token() {
        let pending = MemPolicyStore::default();
        let active = MemPolicyStore::default();
        let tokens = MemTokenStore::default();

        pending.put_or_update(&submission("example.com")).await.unwrap();
        let first = tokens.put_token("example.com").await.unwrap();
        let second = tokens.put_token("example.com").await.unwrap();

        let err = Token::redeem(&first.token, &pending, &active, &tokens)
            .await
            .expect_err("stale token");
        assert!(err.is_user_error());
        Token::redeem(&second.token, &pending, &active, &tokens)
            .await
            .expect("fresh token");
    }
}
