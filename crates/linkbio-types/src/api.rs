use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Link;

// -- Identity --

/// Bearer token claims. Tokens are minted by the auth service; this
/// workspace only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Directory --

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

// -- Links --

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkCollectionResponse {
    pub links: Vec<Link>,
    /// Only present when the viewer owns the collection.
    pub qr_code_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateLinkRequest {
    pub url: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetLinkOrderRequest {
    pub links_sort: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkOrderResponse {
    pub links_sort: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClickResponse {
    pub counted: bool,
}
