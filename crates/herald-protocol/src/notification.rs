//! Notification value objects.
//!
//! A [`Notification`] is produced and persisted by the notification use-case
//! layer. The hub only routes it: it never mutates a notification and
//! serializes it verbatim to every recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of an authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Order,
    Payment,
    Shipping,
    Inventory,
    Account,
    Promotion,
    System,
}

/// Delivery priority hint for clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Scalar value carried in [`NotificationData::extra`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ExtraValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ExtraValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ExtraValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ExtraValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Structured attachments of a notification.
///
/// Well-known references get their own fields; anything else goes into
/// `extra` as a typed scalar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Related order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Related product.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    /// Deep link the client should open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    /// Image to render next to the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Free-form scalar fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, ExtraValue>,
}

impl NotificationData {
    /// Check if no attachment is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order_id.is_none()
            && self.product_id.is_none()
            && self.action_url.is_none()
            && self.image_url.is_none()
            && self.extra.is_empty()
    }

    /// Add a free-form field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<ExtraValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A notification addressed to one user or to everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification identifier.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Recipient; `None` makes it a broadcast candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    /// Category.
    pub category: NotificationCategory,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Structured attachments.
    #[serde(default, skip_serializing_if = "NotificationData::is_empty")]
    pub data: NotificationData,
    /// When the notification was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Create a broadcast notification with normal priority.
    #[must_use]
    pub fn new(
        category: NotificationCategory,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_user_id: None,
            category,
            priority: Priority::default(),
            title: title.into(),
            message: message.into(),
            data: NotificationData::default(),
            created_at: Utc::now(),
        }
    }

    /// Address the notification to a single user.
    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.target_user_id = Some(user_id.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the structured attachments.
    #[must_use]
    pub fn with_data(mut self, data: NotificationData) -> Self {
        self.data = data;
        self
    }

    /// Check if the notification has no specific recipient.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target_user_id.is_none()
    }
}
