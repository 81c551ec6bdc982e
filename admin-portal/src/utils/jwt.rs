use crate::models::RemoteSession;
use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use chrono::{TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
}

impl JwtClaims {
    /// The session these claims describe. Tokens without an email carry no
    /// identity the allow-list can match.
    pub fn into_session(self) -> Option<RemoteSession> {
        let email = self.email.filter(|email| !email.is_empty())?;
        Some(RemoteSession {
            user_id: self.sub,
            email,
            display_name: self.name,
            expires_at: Utc.timestamp_opt(self.exp, 0).single(),
        })
    }
}

/// Decode JWT claims without validation.
///
/// Tokens reach this only straight from the identity provider's login and
/// refresh responses. Authorization never rests on these claims alone: every
/// decoded session still goes through the allow-list.
pub fn decode_jwt_claims(token: &str) -> Result<JwtClaims> {
    let parts: Vec<&str> = token.split('.').collect();

    if parts.len() != 3 {
        return Err(anyhow::anyhow!("Invalid JWT format"));
    }

    // Decode the payload (second part)
    let payload = general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| anyhow::anyhow!("Failed to decode JWT payload: {}", e))?;

    let claims: JwtClaims = serde_json::from_slice(&payload)
        .map_err(|e| anyhow::anyhow!("Failed to parse JWT claims: {}", e))?;

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(payload: &str) -> String {
        format!(
            "eyJhbGciOiJIUzI1NiJ9.{}.signature",
            general_purpose::URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn claims_become_a_session() {
        let token = token(r#"{"sub":"user_123","email":"test@example.com","name":"Tess","exp":9999999999}"#);

        let session = decode_jwt_claims(&token)
            .unwrap()
            .into_session()
            .expect("token carries an email");
        assert_eq!(session.user_id, "user_123");
        assert_eq!(session.email, "test@example.com");
        assert_eq!(session.display_name.as_deref(), Some("Tess"));
        assert!(session.expires_at.is_some());
    }

    #[test]
    fn claims_without_email_have_no_session() {
        let token = token(r#"{"sub":"svc","exp":9999999999}"#);
        assert!(decode_jwt_claims(&token).unwrap().into_session().is_none());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(decode_jwt_claims("not-a-jwt").is_err());
        assert!(decode_jwt_claims("a.!!!.c").is_err());
    }
}
