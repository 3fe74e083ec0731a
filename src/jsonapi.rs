//! JSON-API document types.
//!
//! Terraform Cloud speaks JSON-API: a top-level `data` member holding one resource
//! object or an array of them, `included` for side-loaded secondary resources, and
//! `errors` when a request fails. The types here parse that envelope generically;
//! [`Single`] and [`Collection`] map primary resources onto typed attribute structs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A parsed JSON-API top-level document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PrimaryData>,

    /// Secondary resources side-loaded with the primary data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource>,

    /// Error objects, present instead of `data` when a request failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiError>,

    /// Non-standard meta information, e.g. pagination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    /// Links related to the primary data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
}

impl Document {
    /// Finds a side-loaded resource by type and id.
    pub fn find_included(&self, kind: &str, id: &str) -> Option<&Resource> {
        self.included
            .iter()
            .find(|resource| resource.kind == kind && resource.id == id)
    }

    /// Parses the `meta.pagination` block, if present.
    pub fn pagination(&self) -> Option<Pagination> {
        let pagination = self.meta.as_ref()?.get("pagination")?;
        serde_json::from_value(pagination.clone()).ok()
    }
}

/// The `data` member: a single resource, a list of them, or explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    /// A single resource object.
    One(Box<Resource>),
    /// An array of resource objects.
    Many(Vec<Resource>),
}

/// A JSON-API resource object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// The resource id. Absent only on resources being created client-side.
    #[serde(default)]
    pub id: String,

    /// The resource type, e.g. `workspaces`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Resource attributes.
    #[serde(default)]
    pub attributes: Map<String, Value>,

    /// Relationships to other resources, keyed by relationship name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Relationship>,

    /// Links related to the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
}

impl Resource {
    /// Deserializes the attributes into `A`.
    pub fn attributes_as<A: DeserializeOwned>(&self) -> Result<A, serde_json::Error> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
    }
}

/// A relationship object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Resource linkage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Linkage>,

    /// Relationship links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
}

impl Relationship {
    /// Returns the linked identifiers, whether to-one or to-many.
    pub fn identifiers(&self) -> &[ResourceIdentifier] {
        match &self.data {
            Some(Linkage::One(id)) => std::slice::from_ref(id),
            Some(Linkage::Many(ids)) => ids,
            None => &[],
        }
    }
}

/// Resource linkage of a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    /// A to-one relationship.
    One(ResourceIdentifier),
    /// A to-many relationship.
    Many(Vec<ResourceIdentifier>),
}

/// A `{ "type", "id" }` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    /// The referenced resource's id.
    pub id: String,
    /// The referenced resource's type.
    #[serde(rename = "type")]
    pub kind: String,
}

/// A JSON-API error object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// The HTTP status as a string, as the API sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// An application-specific, stable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// A short summary of the problem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// A human-readable explanation of this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Which part of the request caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let title = self.title.as_deref().unwrap_or("error");
        match &self.detail {
            Some(detail) if !detail.is_empty() => write!(f, "{}: {}", title, detail)?,
            _ => write!(f, "{}", title)?,
        }
        if let Some(pointer) = self.source.as_ref().and_then(|s| s.pointer.as_deref()) {
            write!(f, " ({})", pointer)?;
        }
        Ok(())
    }
}

/// The `source` member of an error object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    /// A JSON pointer into the request document, e.g. `/data/attributes/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,

    /// The query parameter that caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// Pagination details from `meta.pagination`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Pagination {
    pub current_page: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub prev_page: Option<u32>,
    #[serde(default)]
    pub next_page: Option<u32>,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total_count: u32,
}

/// Construction of a typed model from a parsed document.
pub trait FromDocument: Sized {
    /// Maps `document` onto `Self`.
    fn from_document(document: Document) -> Result<Self, serde_json::Error>;
}

/// An object-safe sink that a document can be written into.
///
/// Every [`FromDocument`] type is a sink; the decoder only ever sees
/// `&mut dyn DocumentSink`.
pub trait DocumentSink: Send {
    /// Replaces the sink's contents with the model mapped from `document`.
    fn fill(&mut self, document: Document) -> Result<(), serde_json::Error>;
}

impl<T: FromDocument + Send> DocumentSink for T {
    fn fill(&mut self, document: Document) -> Result<(), serde_json::Error> {
        *self = T::from_document(document)?;
        Ok(())
    }
}

impl FromDocument for Document {
    fn from_document(document: Document) -> Result<Self, serde_json::Error> {
        Ok(document)
    }
}

/// A single primary resource with typed attributes.
///
/// # Examples
///
/// ```
/// use tfe_core::jsonapi::{Document, FromDocument, Single};
/// use serde::Deserialize;
///
/// #[derive(Debug, Default, Deserialize)]
/// #[serde(default, rename_all = "kebab-case")]
/// struct Workspace {
///     name: String,
///     auto_apply: bool,
/// }
///
/// let doc: Document = serde_json::from_str(r#"{
///     "data": {
///         "id": "ws-123",
///         "type": "workspaces",
///         "attributes": { "name": "prod", "auto-apply": true }
///     }
/// }"#)?;
///
/// let ws = Single::<Workspace>::from_document(doc)?;
/// assert_eq!(ws.id, "ws-123");
/// assert_eq!(ws.attributes.name, "prod");
/// assert!(ws.attributes.auto_apply);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Single<A> {
    pub id: String,
    pub kind: String,
    pub attributes: A,
    pub relationships: BTreeMap<String, Relationship>,
    /// Side-loaded resources, for resolving relationships.
    pub included: Vec<Resource>,
}

impl<A> Single<A> {
    /// Looks up the first resource linked through `relationship` among the
    /// included resources.
    pub fn related(&self, relationship: &str) -> Option<&Resource> {
        resolve(&self.relationships, &self.included, relationship)
    }
}

fn resolve<'a>(
    relationships: &BTreeMap<String, Relationship>,
    included: &'a [Resource],
    relationship: &str,
) -> Option<&'a Resource> {
    let id = relationships.get(relationship)?.identifiers().first()?;
    included
        .iter()
        .find(|resource| resource.kind == id.kind && resource.id == id.id)
}

impl<A: DeserializeOwned> Single<A> {
    fn from_resource(resource: Resource, included: Vec<Resource>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            attributes: resource.attributes_as()?,
            id: resource.id,
            kind: resource.kind,
            relationships: resource.relationships,
            included,
        })
    }
}

impl<A: DeserializeOwned> FromDocument for Single<A> {
    fn from_document(document: Document) -> Result<Self, serde_json::Error> {
        match document.data {
            Some(PrimaryData::One(resource)) => Self::from_resource(*resource, document.included),
            Some(PrimaryData::Many(_)) => Err(serde::de::Error::custom(
                "expected a single resource, found an array",
            )),
            None => Err(serde::de::Error::custom("document has no primary data")),
        }
    }
}

/// A list of primary resources with typed attributes.
///
/// Side-loaded resources are held once on the collection, so the items' own
/// `included` lists are empty; resolve their relationships through
/// [`Collection::related`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection<A> {
    pub items: Vec<Single<A>>,
    pub included: Vec<Resource>,
    pub pagination: Option<Pagination>,
}

impl<A> Collection<A> {
    /// Looks up the first resource `item` links to through `relationship`.
    pub fn related(&self, item: &Single<A>, relationship: &str) -> Option<&Resource> {
        resolve(&item.relationships, &self.included, relationship)
    }
}

impl<A: DeserializeOwned> FromDocument for Collection<A> {
    fn from_document(document: Document) -> Result<Self, serde_json::Error> {
        let pagination = document.pagination();
        let resources = match document.data {
            Some(PrimaryData::Many(resources)) => resources,
            Some(PrimaryData::One(resource)) => vec![*resource],
            None => Vec::new(),
        };
        let items = resources
            .into_iter()
            .map(|resource| Single::from_resource(resource, Vec::new()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            items,
            included: document.included,
            pagination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default, rename_all = "kebab-case")]
    struct Run {
        status: String,
        message: String,
        is_destroy: bool,
    }

    #[test]
    fn test_single_leaves_missing_fields_default() {
        let doc: Document = serde_json::from_str(
            r#"{"data": {"id": "run-1", "type": "runs", "attributes": {"status": "applied"}}}"#,
        )
        .unwrap();

        let run = Single::<Run>::from_document(doc).unwrap();
        assert_eq!(run.attributes.status, "applied");
        assert_eq!(run.attributes.message, "");
        assert!(!run.attributes.is_destroy);
    }

    #[test]
    fn test_collection_with_pagination() {
        let doc: Document = serde_json::from_str(
            r#"{
                "data": [
                    {"id": "run-1", "type": "runs", "attributes": {"status": "planned"}},
                    {"id": "run-2", "type": "runs", "attributes": {"status": "errored"}}
                ],
                "meta": {"pagination": {
                    "current-page": 1, "page-size": 2, "prev-page": null,
                    "next-page": 2, "total-pages": 3, "total-count": 5
                }}
            }"#,
        )
        .unwrap();

        let runs = Collection::<Run>::from_document(doc).unwrap();
        assert_eq!(runs.items.len(), 2);
        assert_eq!(runs.items[1].id, "run-2");
        let pagination = runs.pagination.unwrap();
        assert_eq!(pagination.next_page, Some(2));
        assert_eq!(pagination.total_count, 5);
    }

    #[test]
    fn test_related_resolves_included() {
        let doc: Document = serde_json::from_str(
            r#"{
                "data": {
                    "id": "ws-1", "type": "workspaces", "attributes": {},
                    "relationships": {"organization": {"data": {"id": "acme", "type": "organizations"}}}
                },
                "included": [{"id": "acme", "type": "organizations", "attributes": {"email": "ops@acme.test"}}]
            }"#,
        )
        .unwrap();

        let ws = Single::<Value>::from_document(doc).unwrap();
        let org = ws.related("organization").unwrap();
        assert_eq!(org.attributes["email"], "ops@acme.test");
        assert!(ws.related("project").is_none());
    }

    #[test]
    fn test_collection_shares_included() {
        let doc: Document = serde_json::from_str(
            r#"{
                "data": [
                    {"id": "run-1", "type": "runs", "attributes": {"status": "applied"},
                     "relationships": {"workspace": {"data": {"id": "ws-1", "type": "workspaces"}}}},
                    {"id": "run-2", "type": "runs", "attributes": {"status": "planned"},
                     "relationships": {"workspace": {"data": {"id": "ws-2", "type": "workspaces"}}}}
                ],
                "included": [
                    {"id": "ws-1", "type": "workspaces", "attributes": {"name": "prod"}},
                    {"id": "ws-2", "type": "workspaces", "attributes": {"name": "staging"}}
                ]
            }"#,
        )
        .unwrap();

        let runs = Collection::<Run>::from_document(doc).unwrap();
        assert_eq!(runs.included.len(), 2);
        assert!(runs.items.iter().all(|run| run.included.is_empty()));

        let ws = runs.related(&runs.items[1], "workspace").unwrap();
        assert_eq!(ws.attributes["name"], "staging");
        assert!(runs.related(&runs.items[0], "organization").is_none());
    }

    #[test]
    fn test_single_rejects_array() {
        let doc: Document =
            serde_json::from_str(r#"{"data": [{"id": "a", "type": "runs"}]}"#).unwrap();
        assert!(Single::<Value>::from_document(doc).is_err());
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError {
            status: Some("422".to_string()),
            code: None,
            title: Some("invalid attribute".to_string()),
            detail: Some("Name has already been taken".to_string()),
            source: Some(ErrorSource {
                pointer: Some("/data/attributes/name".to_string()),
                parameter: None,
            }),
        };
        assert_eq!(
            err.to_string(),
            "invalid attribute: Name has already been taken (/data/attributes/name)"
        );
    }
}
