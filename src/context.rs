//! Request-time user context and the attribute map targeting rules are evaluated against.
use std::{collections::HashMap, net::IpAddr};

use chrono::{DateTime, TimeZone, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::experiment::Timestamp;

/// Attributes visible to targeting rules.
pub type Attributes = HashMap<String, AttributeValue>;

/// Attribute names the service populates from [`UserContext`] and the request ids.
pub mod attribute {
    #![allow(missing_docs)]
    pub const DEVICE_TYPE: &str = "deviceType";
    pub const GEO_LOCATION: &str = "geoLocation";
    pub const IP_ADDRESS: &str = "ipAddress";
    pub const TIMESTAMP: &str = "timestamp";
    pub const USER_ID: &str = "userId";
    pub const SESSION_ID: &str = "sessionId";
}

#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}
impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Context captured with an assignment request.
///
/// Every field except `timestamp` is optional. Parsing is lenient: a malformed field is treated
/// as absent rather than failing the request (see [`UserContext::from_json`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub geo_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub ip_address: Option<IpAddr>,
    /// When the request was made. Defaults to "now".
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
    /// Additional caller-supplied attributes, also visible to targeting rules.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: Attributes,
}

impl Default for UserContext {
    fn default() -> Self {
        UserContext::new()
    }
}

/// Values derived from proxy/CDN headers, used only where the caller supplied nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextFallback {
    #[allow(missing_docs)]
    pub geo_location: Option<String>,
    #[allow(missing_docs)]
    pub ip_address: Option<IpAddr>,
}

const KNOWN_FIELDS: [&str; 4] = [
    attribute::DEVICE_TYPE,
    attribute::GEO_LOCATION,
    attribute::IP_ADDRESS,
    attribute::TIMESTAMP,
];

impl UserContext {
    /// Empty context stamped with the current time.
    pub fn new() -> UserContext {
        UserContext {
            device_type: None,
            geo_location: None,
            ip_address: None,
            timestamp: Utc::now(),
            attributes: Attributes::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_geo_location(mut self, geo_location: impl Into<String>) -> Self {
        self.geo_location = Some(geo_location.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_ip_address(mut self, ip_address: IpAddr) -> Self {
        self.ip_address = Some(ip_address);
        self
    }

    #[allow(missing_docs)]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Build a context from caller-supplied JSON without ever failing.
    ///
    /// Wrong types, empty strings, unparseable IP addresses and unparseable timestamps are dropped
    /// (the timestamp falls back to "now"). Unknown keys with scalar values become extra
    /// attributes; nested objects and arrays are ignored.
    pub fn from_json(value: &serde_json::Value) -> UserContext {
        let mut context = UserContext::new();
        let Some(object) = value.as_object() else {
            return context;
        };

        let non_empty_str = |key: &str| {
            object
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        context.device_type = non_empty_str(attribute::DEVICE_TYPE).map(str::to_owned);
        context.geo_location = non_empty_str(attribute::GEO_LOCATION).map(str::to_owned);
        context.ip_address = non_empty_str(attribute::IP_ADDRESS).and_then(|s| s.parse().ok());
        if let Some(timestamp) = object.get(attribute::TIMESTAMP).and_then(parse_timestamp) {
            context.timestamp = timestamp;
        }

        for (key, value) in object {
            if KNOWN_FIELDS.contains(&key.as_str()) {
                continue;
            }
            let value = match value {
                serde_json::Value::String(s) => AttributeValue::String(s.clone()),
                serde_json::Value::Bool(b) => AttributeValue::Boolean(*b),
                serde_json::Value::Number(n) => match n.as_f64() {
                    Some(n) => AttributeValue::Number(n),
                    None => continue,
                },
                serde_json::Value::Null => AttributeValue::Null,
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => continue,
            };
            context.attributes.insert(key.clone(), value);
        }

        context
    }

    /// Fill fields the caller left empty from header-derived values. Caller-supplied values always
    /// win.
    pub fn with_fallback(mut self, fallback: ContextFallback) -> UserContext {
        if self.geo_location.is_none() {
            self.geo_location = fallback.geo_location;
        }
        if self.ip_address.is_none() {
            self.ip_address = fallback.ip_address;
        }
        self
    }

    /// Flatten into the attribute map targeting rules see. Typed fields and request ids take
    /// precedence over extra attributes of the same name.
    pub fn to_attributes(&self, user_id: &str, session_id: &str) -> Attributes {
        let mut attributes = self.attributes.clone();
        if let Some(device_type) = &self.device_type {
            attributes.insert(attribute::DEVICE_TYPE.into(), device_type.as_str().into());
        }
        if let Some(geo_location) = &self.geo_location {
            attributes.insert(attribute::GEO_LOCATION.into(), geo_location.as_str().into());
        }
        if let Some(ip_address) = &self.ip_address {
            attributes.insert(attribute::IP_ADDRESS.into(), ip_address.to_string().into());
        }
        attributes.insert(
            attribute::TIMESTAMP.into(),
            self.timestamp.to_rfc3339().into(),
        );
        attributes.insert(attribute::USER_ID.into(), user_id.into());
        attributes.insert(attribute::SESSION_ID.into(), session_id.into());
        attributes
    }
}

/// Accept RFC 3339 strings and epoch milliseconds.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}
