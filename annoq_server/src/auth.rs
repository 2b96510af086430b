use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::Request;

use crate::state::AppState;

/// Caller identity, as asserted by the fronting authentication proxy via
/// headers. Routes requiring a user reject requests without one.
pub struct Identity {
    pub user_id: String,
    pub contact: Option<String>,
}

#[derive(Debug)]
pub enum AuthError {
    MissingUser,
    BadSecret,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Identity {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one("x-user-id") {
            Some(user_id) => Outcome::Success(Identity {
                user_id: user_id.to_string(),
                contact: request
                    .headers()
                    .get_one("x-contact")
                    .map(str::to_string),
            }),
            None => Outcome::Error((Status::Unauthorized, AuthError::MissingUser)),
        }
    }
}

/// Guard for internal operator routes, keyed on the configured secret.
/// An unconfigured (empty) secret locks these routes entirely.
pub struct Operator;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Operator {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let secret = request
            .rocket()
            .state::<AppState>()
            .map(|state| state.manager.settings().secret_key.clone())
            .unwrap_or_default();
        match request.headers().get_one("x-secret-key") {
            Some(provided) if !secret.is_empty() && provided == secret => {
                Outcome::Success(Operator)
            }
            _ => Outcome::Error((Status::Unauthorized, AuthError::BadSecret)),
        }
    }
}
