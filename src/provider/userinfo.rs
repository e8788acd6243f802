//! User-info and group membership retrieval.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::oidc::{AuthError, TokenClaims};

/// Upper bound on followed `@odata.nextLink` pages.
const MAX_GROUP_PAGES: usize = 50;

/// `GET {user_info_uri}` with the access token as bearer.
pub async fn fetch_user_info(
    http: &reqwest::Client,
    user_info_uri: &str,
    access_token: &str,
) -> Result<TokenClaims, AuthError> {
    let response = http
        .get(user_info_uri)
        .bearer_auth(access_token)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AuthError::Remote(format!(
            "user-info returned HTTP {}",
            response.status()
        )));
    }
    let body = response.bytes().await?;
    TokenClaims::from_json_slice(&body)
}

#[derive(Debug, Deserialize)]
struct GroupPage {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Collect group names from a paginated, Graph-style membership endpoint.
///
/// Each page is `{"value": [...], "@odata.nextLink": "..."}`; entries
/// contribute their `displayName` (or `id` when unnamed). Pagination stops
/// at the last page or after a fixed page bound.
pub async fn fetch_groups(
    http: &reqwest::Client,
    groups_uri: &str,
    access_token: &str,
) -> Result<Vec<String>, AuthError> {
    let mut groups = Vec::new();
    let mut next = Some(groups_uri.to_string());
    let mut pages = 0;

    while let Some(url) = next.take() {
        if pages == MAX_GROUP_PAGES {
            warn!(pages, "Group pagination limit reached, result truncated");
            break;
        }
        pages += 1;

        let response = http.get(&url).bearer_auth(access_token).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::Remote(format!(
                "group membership returned HTTP {}",
                response.status()
            )));
        }
        let page: GroupPage = response
            .json()
            .await
            .map_err(|e| AuthError::Remote(format!("invalid group page: {e}")))?;

        groups.extend(page.value.iter().filter_map(|entry| {
            entry
                .get("displayName")
                .or_else(|| entry.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        }));
        next = page.next_link.filter(|l| !l.is_empty());
    }

    debug!(count = groups.len(), pages, "Group membership fetched");
    Ok(groups)
}
