//! Framework-agnostic HTTP boundary for assignment requests.
//!
//! [`handle_assign`] takes the raw request headers and body and produces a status code and a
//! JSON-serializable response, so it can sit behind any HTTP server.
use std::net::IpAddr;

use reqwest::{header::HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    context::{ContextFallback, UserContext},
    service::validate_ids,
    AssignmentService, Error,
};

const NOT_ASSIGNED_MESSAGE: &str = "not eligible or test inactive";
const INTERNAL_ERROR_MESSAGE: &str = "failed to assign variant";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const GEO_HEADERS: [&str; 2] = ["cf-ipcountry", "x-vercel-ip-country"];

/// Body of an assignment request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignRequest {
    #[serde(default)]
    test_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    session_id: String,
    /// Kept as raw JSON so malformed fields degrade to "absent" instead of rejecting the request.
    #[serde(default)]
    user_context: Option<serde_json::Value>,
}

/// Body of an assignment response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignResponse {
    #[allow(missing_docs)]
    pub success: bool,
    /// `Some(None)` serializes as an explicit `"variantId": null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[allow(missing_docs)]
    pub details: Vec<String>,
}

impl AssignResponse {
    fn assigned(variant_id: String) -> AssignResponse {
        AssignResponse {
            success: true,
            variant_id: Some(Some(variant_id)),
            message: None,
            error: None,
            details: Vec::new(),
        }
    }

    fn not_assigned() -> AssignResponse {
        AssignResponse {
            success: true,
            variant_id: Some(None),
            message: Some(NOT_ASSIGNED_MESSAGE.to_owned()),
            error: None,
            details: Vec::new(),
        }
    }

    fn invalid(details: Vec<String>) -> AssignResponse {
        AssignResponse {
            success: false,
            variant_id: None,
            message: None,
            error: Some("validation failed".to_owned()),
            details,
        }
    }

    fn failed() -> AssignResponse {
        AssignResponse {
            success: false,
            variant_id: None,
            message: None,
            error: Some(INTERNAL_ERROR_MESSAGE.to_owned()),
            details: Vec::new(),
        }
    }
}

/// Handle `POST {testId, userId, sessionId, userContext?}`.
///
/// - 400 with `details` for malformed JSON or invalid ids.
/// - 200 with the variant, or with `variantId: null` when the user is not assigned.
/// - 500 on storage or experiment source failures. Details are logged, not returned.
///
/// Geo location and IP address missing from `userContext` are filled from proxy headers.
pub fn handle_assign(
    service: &AssignmentService,
    headers: &HeaderMap,
    body: &[u8],
) -> (StatusCode, AssignResponse) {
    let request = match serde_json::from_slice::<AssignRequest>(body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                AssignResponse::invalid(vec![format!("invalid request body: {err}")]),
            );
        }
    };

    let problems = validate_ids(&request.test_id, &request.user_id, &request.session_id);
    if !problems.is_empty() {
        return (StatusCode::BAD_REQUEST, AssignResponse::invalid(problems));
    }

    let context = request
        .user_context
        .as_ref()
        .map(UserContext::from_json)
        .unwrap_or_default()
        .with_fallback(context_fallback(headers));

    match service.assign_variant(
        &request.test_id,
        &request.user_id,
        &request.session_id,
        Some(context),
    ) {
        Ok(Some(variant_id)) => (StatusCode::OK, AssignResponse::assigned(variant_id)),
        Ok(None) => (StatusCode::OK, AssignResponse::not_assigned()),
        Err(Error::Validation(details)) => {
            (StatusCode::BAD_REQUEST, AssignResponse::invalid(details))
        }
        Err(err) => {
            log::error!(target: "abkit",
                        test_id = request.test_id,
                        user_id = request.user_id;
                        "assignment request failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                AssignResponse::failed(),
            )
        }
    }
}

/// Derive geo location and client IP from proxy and CDN headers.
pub fn context_fallback(headers: &HeaderMap) -> ContextFallback {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let ip_address = header(FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .or_else(|| header(REAL_IP).and_then(|value| value.parse().ok()));

    // Cloudflare reports unknown countries as "XX".
    let geo_location = GEO_HEADERS
        .iter()
        .filter_map(|name| header(name))
        .find(|value| *value != "XX")
        .map(str::to_owned);

    ContextFallback {
        geo_location,
        ip_address,
    }
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, sync::Arc};

    use reqwest::{
        header::{HeaderMap, HeaderValue},
        StatusCode,
    };
    use serde_json::json;

    use super::{context_fallback, handle_assign};
    use crate::{
        experiment::{Experiment, ExperimentStatus, RuleOperator, TargetingRule, Variant},
        registry::InMemoryExperimentSource,
        store::{AssignmentStore, InMemoryAssignmentStore},
        AssignmentService, ServiceConfig,
    };

    fn service(rules: Vec<TargetingRule>) -> (Arc<InMemoryAssignmentStore>, AssignmentService) {
        let source = InMemoryExperimentSource::new();
        source
            .insert(
                Experiment::new(
                    "homepage-cta",
                    "Homepage CTA",
                    vec![Variant::new("A", 50.0), Variant::new("B", 50.0)],
                )
                .with_status(ExperimentStatus::Running)
                .with_rules(rules),
            )
            .unwrap();
        let store = Arc::new(InMemoryAssignmentStore::new());
        let service = ServiceConfig::new().to_service(source, store.clone());
        (store, service)
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    fn call(
        service: &AssignmentService,
        headers: &HeaderMap,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let (status, response) = handle_assign(service, headers, body.to_string().as_bytes());
        (status, serde_json::to_value(response).unwrap())
    }

    #[test]
    fn assigns_variant() {
        let (_store, service) = service(vec![]);
        let (status, body) = call(
            &service,
            &HeaderMap::new(),
            json!({
                "testId": "homepage-cta",
                "userId": "user-42",
                "sessionId": "sess-1",
                "userContext": {"deviceType": "mobile", "timestamp": "2024-05-01T12:00:00Z"}
            }),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "variantId": "A"}));
    }

    #[test]
    fn not_assigned_has_explicit_null() {
        let (_store, service) = service(vec![]);
        let (status, body) = call(
            &service,
            &HeaderMap::new(),
            json!({"testId": "unknown", "userId": "user-42", "sessionId": "s"}),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "variantId": null, "message": "not eligible or test inactive"})
        );
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let (store, service) = service(vec![]);

        let (status, body) = call(
            &service,
            &HeaderMap::new(),
            json!({"testId": "", "sessionId": "s"}),
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({
                "success": false,
                "error": "validation failed",
                "details": ["testId is required", "userId is required"]
            })
        );

        let (status, response) = handle_assign(&service, &HeaderMap::new(), b"{not json");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!response.success);
        assert!(response.details[0].starts_with("invalid request body"));

        assert!(store.is_empty());
    }

    #[test]
    fn malformed_context_is_treated_as_absent() {
        let (_store, service) = service(vec![]);
        let (status, body) = call(
            &service,
            &HeaderMap::new(),
            json!({
                "testId": "homepage-cta",
                "userId": "user-42",
                "sessionId": "s",
                "userContext": {"deviceType": 7, "ipAddress": "not-an-ip", "timestamp": "yesterday"}
            }),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["variantId"], "A");
    }

    #[test]
    fn headers_fill_missing_context() {
        let (store, service) = service(vec![TargetingRule::new(
            "geoLocation",
            RuleOperator::In,
            vec!["US", "CA"],
        )]);
        let request = json!({"testId": "homepage-cta", "userId": "user-42", "sessionId": "s"});

        let (_, body) = call(&service, &HeaderMap::new(), request.clone());
        assert_eq!(body["variantId"], serde_json::Value::Null);

        let (_, body) = call(
            &service,
            &headers(&[
                ("cf-ipcountry", "US"),
                ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ]),
            request,
        );
        assert_eq!(body["variantId"], "A");

        let stored = store.get_existing("homepage-cta", "user-42").unwrap().unwrap();
        assert_eq!(stored.context_snapshot.geo_location.as_deref(), Some("US"));
        assert_eq!(
            stored.context_snapshot.ip_address,
            Some("203.0.113.7".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn caller_context_overrides_headers() {
        let (_store, service) = service(vec![TargetingRule::new(
            "geoLocation",
            RuleOperator::Equals,
            "DE",
        )]);
        let (_, body) = call(
            &service,
            &headers(&[("cf-ipcountry", "US")]),
            json!({
                "testId": "homepage-cta",
                "userId": "user-42",
                "sessionId": "s",
                "userContext": {"geoLocation": "DE"}
            }),
        );
        assert_eq!(body["variantId"], "A");
    }

    #[test]
    fn fallback_header_precedence() {
        let fallback = context_fallback(&headers(&[
            ("x-forwarded-for", "garbage"),
            ("x-real-ip", "2001:db8::1"),
            ("cf-ipcountry", "XX"),
            ("x-vercel-ip-country", "FR"),
        ]));
        assert_eq!(fallback.ip_address, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(fallback.geo_location.as_deref(), Some("FR"));

        let empty = context_fallback(&HeaderMap::new());
        assert_eq!(empty.ip_address, None);
        assert_eq!(empty.geo_location, None);
    }
}
