//! Vector context store abstraction.
//!
//! Defines the `ContextStore` trait over the retrieval backend, the payload
//! shape stored alongside each vector, and an in-memory implementation used
//! in tests and embedded setups. The production backend is Qdrant.

pub mod qdrant;

pub use qdrant::QdrantStore;

use crate::error::StoreError;
use crate::types::ContextItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The payload stored alongside each vector point.
///
/// `access_groups` scopes retrieval; a query only matches points whose
/// payload lists the caller's group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPayload {
    pub content: String,
    pub source: String,
    pub updated_at: String,
    pub page_id: String,
    pub access_groups: Vec<String>,
}

impl ItemPayload {
    /// Project the payload down to the retrievable unit the pipeline
    /// carries; access groups stay behind in the store.
    pub fn to_context_item(&self) -> ContextItem {
        ContextItem::new(
            self.content.clone(),
            self.source.clone(),
            self.updated_at.clone(),
            self.page_id.clone(),
        )
    }
}

/// A vector point ready for upsert.
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: ItemPayload,
}

impl StoredPoint {
    pub fn new(vector: Vec<f32>, payload: ItemPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            vector,
            payload,
        }
    }
}

/// A retrieved point with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub id: Uuid,
    pub score: f32,
    pub payload: ItemPayload,
}

/// Filter applied to queries and deletions.
///
/// All present fields must match; `access_group` matches points whose
/// `access_groups` payload list contains the value.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub access_group: Option<String>,
    pub source: Option<String>,
    pub page_id: Option<String>,
}

impl MetadataFilter {
    pub fn for_group(group: impl Into<String>) -> Self {
        Self {
            access_group: Some(group.into()),
            ..Self::default()
        }
    }

    pub fn for_page(source: impl Into<String>, page_id: impl Into<String>) -> Self {
        Self {
            access_group: None,
            source: Some(source.into()),
            page_id: Some(page_id.into()),
        }
    }

    fn matches(&self, payload: &ItemPayload) -> bool {
        if let Some(group) = &self.access_group
            && !payload.access_groups.contains(group)
        {
            return false;
        }
        if let Some(source) = &self.source
            && &payload.source != source
        {
            return false;
        }
        if let Some(page_id) = &self.page_id
            && &payload.page_id != page_id
        {
            return false;
        }
        true
    }
}

/// Trait over the vector retrieval backend.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Create the collection if it does not already exist. Called once at
    /// process start; a no-op when the collection is present.
    async fn ensure_collection(&self) -> Result<(), StoreError>;

    /// Query the store for the nearest points passing the filter,
    /// descending by score, bounded by `limit`.
    async fn query(
        &self,
        vector: &[f32],
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<ScoredItem>, StoreError>;

    /// Insert or replace points by id.
    async fn upsert(&self, points: Vec<StoredPoint>) -> Result<(), StoreError>;

    /// Delete points by id.
    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Delete all points passing the filter.
    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<(), StoreError>;

    /// Replace the access-group list on every point of a page.
    async fn update_access_groups(
        &self,
        filter: &MetadataFilter,
        access_groups: &[String],
    ) -> Result<(), StoreError>;
}

/// In-memory store used in tests and embedded setups.
///
/// Scores by cosine similarity regardless of configured metric; queries
/// against a store populated with orthogonal unit vectors give
/// deterministic ordering.
pub struct MemoryStore {
    vector_size: usize,
    points: std::sync::Mutex<HashMap<Uuid, StoredPoint>>,
}

impl MemoryStore {
    pub fn new(vector_size: usize) -> Self {
        Self {
            vector_size,
            points: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn ensure_collection(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<ScoredItem>, StoreError> {
        if vector.len() != self.vector_size {
            return Err(StoreError::DimensionMismatch {
                expected: self.vector_size,
                actual: vector.len(),
            });
        }

        let points = self.points.lock().unwrap();
        let mut scored: Vec<ScoredItem> = points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredItem {
                id: p.id,
                score: Self::cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn upsert(&self, new_points: Vec<StoredPoint>) -> Result<(), StoreError> {
        for point in &new_points {
            if point.vector.len() != self.vector_size {
                return Err(StoreError::DimensionMismatch {
                    expected: self.vector_size,
                    actual: point.vector.len(),
                });
            }
        }
        let mut points = self.points.lock().unwrap();
        for point in new_points {
            points.insert(point.id, point);
        }
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut points = self.points.lock().unwrap();
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<(), StoreError> {
        let mut points = self.points.lock().unwrap();
        points.retain(|_, p| !filter.matches(&p.payload));
        Ok(())
    }

    async fn update_access_groups(
        &self,
        filter: &MetadataFilter,
        access_groups: &[String],
    ) -> Result<(), StoreError> {
        let mut points = self.points.lock().unwrap();
        for point in points.values_mut() {
            if filter.matches(&point.payload) {
                point.payload.access_groups = access_groups.to_vec();
            }
        }
        Ok(())
    }
}
