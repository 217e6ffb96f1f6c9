use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    sub: i32,
    team: String,
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Authenticated management caller. The bearer JWT carries the identity and
/// home team; `X-Butler-Team` switches the active team for the request.
pub struct AuthUser {
    pub user_id: i32,
    pub team: String,
    pub role: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|value| value.to_string())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;

        // Runner callback tokens never authenticate management endpoints.
        if token.starts_with("brce_") {
            return Err((
                StatusCode::UNAUTHORIZED,
                "Callback tokens are not valid here".into(),
            ));
        }
        let token = token.strip_prefix("breg_").unwrap_or(&token);

        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;

        let team = parts
            .headers
            .get("x-butler-team")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
            .unwrap_or_else(|| decoded.claims.team.clone());

        Ok(AuthUser {
            user_id: decoded.claims.sub,
            team,
            role: decoded.claims.role,
        })
    }
}
