//! Provenance and enrichment data attached to every classified error
//!
//! Each enrichment field is independently optional. Callers that want to
//! change a field go through [`ContextOverrides`], where every field is a
//! [`FieldOverride`] so that "leave the computed value alone" and "force this
//! field to be absent" stay distinguishable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open key/value bag carried in [`ErrorContext::metadata`]
pub type Metadata = Map<String, Value>;

/// Context owned by exactly one [`ClassifiedError`](super::ClassifiedError)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Creation instant, set automatically
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the owning error's retryability at creation
    pub retryable: bool,
    /// Attempts already made when this context was produced
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ErrorContext {
    /// Create a context stamped with the current time and no enrichment
    pub fn new(retryable: bool) -> Self {
        Self {
            component: None,
            operation: None,
            timestamp: Utc::now(),
            retryable,
            retry_count: 0,
            status_code: None,
            url: None,
            request_id: None,
            user_agent: None,
            error_id: None,
            metadata: None,
        }
    }

    /// Look up a single metadata entry
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// Three-way override for one optional context field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOverride<T> {
    /// Keep whatever value was computed (possibly none)
    Keep,
    /// Force the field to be absent
    Clear,
    /// Replace the field with this value
    Set(T),
}

impl<T> Default for FieldOverride<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T: Clone> FieldOverride<T> {
    /// Apply this override to an optional slot
    pub fn apply_to(&self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Clear => *slot = None,
            Self::Set(value) => *slot = Some(value.clone()),
        }
    }

    /// Resolve against a computed default
    pub fn resolve(&self, computed: Option<T>) -> Option<T> {
        let mut slot = computed;
        self.apply_to(&mut slot);
        slot
    }
}

impl<T> FieldOverride<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// An explicit `None` means "no value", not "no override".
impl<T> From<Option<T>> for FieldOverride<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Set(value),
            None => Self::Clear,
        }
    }
}

/// Caller-supplied changes merged on top of a computed [`ErrorContext`]
///
/// `timestamp`, `retryable` and `retry_count` are owned by the error itself
/// and cannot be overridden here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextOverrides {
    pub component: FieldOverride<String>,
    pub operation: FieldOverride<String>,
    pub status_code: FieldOverride<u16>,
    pub url: FieldOverride<String>,
    pub request_id: FieldOverride<String>,
    pub user_agent: FieldOverride<String>,
    pub error_id: FieldOverride<String>,
    pub metadata: FieldOverride<Metadata>,
}

impl ContextOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides naming the component and operation that observed a failure
    pub fn at<C: Into<String>, O: Into<String>>(component: C, operation: O) -> Self {
        Self::new().component(component).operation(operation)
    }

    pub fn component<S: Into<String>>(mut self, component: S) -> Self {
        self.component = FieldOverride::Set(component.into());
        self
    }

    pub fn operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.operation = FieldOverride::Set(operation.into());
        self
    }

    pub fn status_code(mut self, status: u16) -> Self {
        self.status_code = FieldOverride::Set(status);
        self
    }

    pub fn url<S: Into<String>>(mut self, url: S) -> Self {
        self.url = FieldOverride::Set(url.into());
        self
    }

    pub fn request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = FieldOverride::Set(request_id.into());
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = FieldOverride::Set(user_agent.into());
        self
    }

    pub fn error_id<S: Into<String>>(mut self, error_id: S) -> Self {
        self.error_id = FieldOverride::Set(error_id.into());
        self
    }

    /// Assign a fresh random error id
    pub fn generated_error_id(self) -> Self {
        self.error_id(Uuid::new_v4().to_string())
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = FieldOverride::Set(metadata);
        self
    }

    /// Add one metadata entry, replacing `Keep`/`Clear` with a fresh map
    pub fn metadata_entry<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        let mut map = match self.metadata {
            FieldOverride::Set(map) => map,
            FieldOverride::Keep | FieldOverride::Clear => Metadata::new(),
        };
        map.insert(key.into(), value.into());
        self.metadata = FieldOverride::Set(map);
        self
    }

    /// True when no field would change
    pub fn is_empty(&self) -> bool {
        self.component.is_keep()
            && self.operation.is_keep()
            && self.status_code.is_keep()
            && self.url.is_keep()
            && self.request_id.is_keep()
            && self.user_agent.is_keep()
            && self.error_id.is_keep()
            && self.metadata.is_keep()
    }

    /// Merge these overrides on top of `context`
    pub fn apply(&self, context: &mut ErrorContext) {
        self.component.apply_to(&mut context.component);
        self.operation.apply_to(&mut context.operation);
        self.status_code.apply_to(&mut context.status_code);
        self.url.apply_to(&mut context.url);
        self.request_id.apply_to(&mut context.request_id);
        self.user_agent.apply_to(&mut context.user_agent);
        self.error_id.apply_to(&mut context.error_id);
        self.metadata.apply_to(&mut context.metadata);
    }

    /// Layer `other` on top of `self`; fields `other` keeps are left as-is
    pub fn merged_with(&self, other: &Self) -> Self {
        fn pick<T: Clone>(base: &FieldOverride<T>, top: &FieldOverride<T>) -> FieldOverride<T> {
            if top.is_keep() {
                base.clone()
            } else {
                top.clone()
            }
        }

        Self {
            component: pick(&self.component, &other.component),
            operation: pick(&self.operation, &other.operation),
            status_code: pick(&self.status_code, &other.status_code),
            url: pick(&self.url, &other.url),
            request_id: pick(&self.request_id, &other.request_id),
            user_agent: pick(&self.user_agent, &other.user_agent),
            error_id: pick(&self.error_id, &other.error_id),
            metadata: pick(&self.metadata, &other.metadata),
        }
    }
}
