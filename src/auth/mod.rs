pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::Serialize;

use crate::{
    error::AppError,
    lifecycle::{Actor, Role},
    state::AppState,
};

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub email: String,
    #[serde(serialize_with = "serialize_role")]
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn actor(&self) -> Actor {
        Actor::new(self.user_id, self.role)
    }
}

fn serialize_role<S: serde::Serializer>(role: &Role, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(role.as_str())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let claims = state
            .jwt
            .verify_token(bearer.token())
            .map_err(|_| AppError::unauthorized())?;

        // Unknown role strings are demoted to designer here, at the
        // boundary, so the core predicates only ever see the closed enum.
        let role = Role::parse(&claims.role).unwrap_or(Role::Designer);

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
            role,
        })
    }
}
