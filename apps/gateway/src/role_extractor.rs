// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Extracts the pre-authenticated `{userID, roles}` a trusted reverse
//! proxy attaches to the upgrade request (§1 Non-goals: "no JWT parsing";
//! §4.3 step 1 "check the pre-authenticated `{userID, roles}`").

use axum::http::HeaderMap;
use chatgate_core::{ChatGateError, Identity, Role};
use tracing::debug;

use crate::config::IdentityConfig;

fn parse_role(raw: &str) -> Option<Role> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" => Some(Role::User),
        "admin" => Some(Role::Admin),
        "chat_admin" | "chatadmin" => Some(Role::ChatAdmin),
        _ => None,
    }
}

/// Reads `{userID, roles}` from the configured trusted headers.
///
/// # Errors
///
/// Returns `ChatGateError::Forbidden` if the user-id header is missing or
/// empty.
pub fn extract_identity(headers: &HeaderMap, config: &IdentityConfig) -> Result<Identity, ChatGateError> {
    let user_id = headers
        .get(config.user_id_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChatGateError::Forbidden("missing pre-authenticated user identity".into()))?
        .to_string();

    let roles: Vec<Role> = headers
        .get(config.roles_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.split(',').filter_map(parse_role).collect())
        .unwrap_or_default();

    debug!(user_id = %user_id, roles = ?roles, "extracted pre-authenticated identity");
    Ok(Identity { user_id, roles })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn config() -> IdentityConfig {
        IdentityConfig::default()
    }

    #[test]
    fn missing_user_id_header_is_forbidden() {
        let headers = HeaderMap::new();
        assert!(extract_identity(&headers, &config()).is_err());
    }

    #[test]
    fn parses_user_id_and_roles() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u1"));
        headers.insert("x-roles", HeaderValue::from_static("user, admin"));
        let identity = extract_identity(&headers, &config()).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert!(identity.has_admin());
    }

    #[test]
    fn unrecognized_roles_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u1"));
        headers.insert("x-roles", HeaderValue::from_static("superuser"));
        let identity = extract_identity(&headers, &config()).unwrap();
        assert!(identity.roles.is_empty());
    }
}
