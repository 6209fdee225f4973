use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use linkbio_types::api::Claims;

use crate::AppState;
use crate::error::ApiError;

/// Who is making the request. `None` is a guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewer(pub Option<Uuid>);

impl Viewer {
    pub fn id(&self) -> Option<Uuid> {
        self.0
    }

    /// Succeeds only when the viewer is signed in as `owner_id`.
    pub fn require_owner(&self, owner_id: Uuid) -> Result<Uuid, ApiError> {
        match self.0 {
            None => Err(ApiError::Unauthorized),
            Some(id) if id == owner_id => Ok(id),
            Some(_) => Err(ApiError::Forbidden),
        }
    }
}

/// Resolve the optional bearer token into a [`Viewer`] extension.
///
/// A missing header means guest; a header that is present but invalid is
/// rejected rather than silently downgraded.
pub async fn identify(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let viewer = match req.headers().get(header::AUTHORIZATION) {
        None => Viewer(None),
        Some(value) => {
            let token = value
                .to_str()
                .ok()
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or(ApiError::Unauthorized)?;

            let token_data = decode::<Claims>(
                token,
                &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
                &Validation::default(),
            )
            .map_err(|_| ApiError::Unauthorized)?;

            Viewer(Some(token_data.claims.sub))
        }
    };

    req.extensions_mut().insert(viewer);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_owner_passes() {
        let owner = Uuid::new_v4();
        assert_eq!(Viewer(Some(owner)).require_owner(owner).unwrap(), owner);
        assert!(matches!(
            Viewer(Some(Uuid::new_v4())).require_owner(owner),
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(Viewer(None).require_owner(owner), Err(ApiError::Unauthorized)));
    }
}
