use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user context that flags are evaluated against.
///
/// Only `key` is required. The fixed built-in attributes plus the free-form
/// `custom` map are all addressable from rule clauses by name.
///
/// # Examples
/// ```
/// # use switchboard_core::User;
/// let user = User::with_key("user-key")
///     .country("DE")
///     .custom_attribute("plan", "enterprise".into());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secondary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    custom: HashMap<String, Value>,
}

macro_rules! builtin_setter {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub fn $name(mut self, value: impl Into<String>) -> User {
            self.$name = Some(value.into());
            self
        }
    };
}

impl User {
    /// Create a user with the given key and no other attributes.
    pub fn with_key(key: impl Into<String>) -> User {
        User {
            key: key.into(),
            secondary: None,
            ip: None,
            country: None,
            email: None,
            first_name: None,
            last_name: None,
            avatar: None,
            name: None,
            custom: HashMap::new(),
        }
    }

    /// The user's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The secondary key, if any. When present it participates in bucketing.
    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    /// Set the secondary key.
    pub fn secondary_key(mut self, value: impl Into<String>) -> User {
        self.secondary = Some(value.into());
        self
    }

    builtin_setter!(ip);
    builtin_setter!(country);
    builtin_setter!(email);
    builtin_setter!(first_name);
    builtin_setter!(last_name);
    builtin_setter!(avatar);
    builtin_setter!(
        /// Set the user's full name.
        name
    );

    /// Set a custom attribute. Values may be any JSON type; array values are
    /// matched element-wise by rule clauses.
    pub fn custom_attribute(mut self, name: impl Into<String>, value: Value) -> User {
        self.custom.insert(name.into(), value);
        self
    }

    /// Look up an attribute value by name.
    ///
    /// `"key"` and `"secondary"` resolve to the corresponding keys; other
    /// built-in names resolve to their string values; anything else is looked
    /// up in the custom attribute map. Returns `None` for attributes the user
    /// does not carry.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let builtin = |v: &Option<String>| v.as_ref().map(|s| Value::String(s.clone()));
        match name {
            "key" => Some(Value::String(self.key.clone())),
            "secondary" => builtin(&self.secondary),
            "ip" => builtin(&self.ip),
            "country" => builtin(&self.country),
            "email" => builtin(&self.email),
            "firstName" => builtin(&self.first_name),
            "lastName" => builtin(&self.last_name),
            "avatar" => builtin(&self.avatar),
            "name" => builtin(&self.name),
            _ => self.custom.get(name).cloned(),
        }
    }
}
