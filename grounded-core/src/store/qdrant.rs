//! Qdrant-backed context store.
//!
//! Stores one point per chunk with the payload fields in `ItemPayload`.
//! The collection is created lazily at startup with the configured vector
//! size and distance metric.

use crate::config::{DistanceMetric, StoreConfig};
use crate::error::StoreError;
use crate::store::{ContextStore, ItemPayload, MetadataFilter, ScoredItem, StoredPoint};
use async_trait::async_trait;
use qdrant_client::Payload;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    PointsIdsList, QueryPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder, value::Kind,
};
use tracing::{debug, info};
use uuid::Uuid;

impl From<DistanceMetric> for Distance {
    fn from(metric: DistanceMetric) -> Self {
        match metric {
            DistanceMetric::Cosine => Distance::Cosine,
            DistanceMetric::Dot => Distance::Dot,
            DistanceMetric::Euclid => Distance::Euclid,
            DistanceMetric::Manhattan => Distance::Manhattan,
        }
    }
}

/// Qdrant-backed implementation of `ContextStore`.
pub struct QdrantStore {
    client: Qdrant,
    collection: String,
    vector_size: usize,
    metric: DistanceMetric,
}

impl QdrantStore {
    /// Connect to the configured Qdrant server. Metric parse failure is
    /// startup-fatal and surfaces before any connection is attempted.
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let metric = config.metric().map_err(|e| StoreError::Connection {
            message: e.to_string(),
        })?;
        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| StoreError::Connection {
                message: format!("Failed to connect to Qdrant at {}: {}", config.url, e),
            })?;
        Ok(Self {
            client,
            collection: config.collection.clone(),
            vector_size: config.vector_size,
            metric,
        })
    }

    fn op_error(op: &str, err: impl std::fmt::Display) -> StoreError {
        StoreError::Operation {
            op: op.to_string(),
            message: err.to_string(),
        }
    }

    /// Build a Qdrant filter from the metadata filter. `access_group`
    /// matches list membership, the rest are keyword matches.
    fn build_filter(filter: &MetadataFilter) -> Option<Filter> {
        let mut must = Vec::new();
        if let Some(group) = &filter.access_group {
            must.push(Condition::matches("access_groups", group.clone()));
        }
        if let Some(source) = &filter.source {
            must.push(Condition::matches("source", source.clone()));
        }
        if let Some(page_id) = &filter.page_id {
            must.push(Condition::matches("page_id", page_id.clone()));
        }
        if must.is_empty() {
            None
        } else {
            Some(Filter::must(must))
        }
    }

    fn payload_json(payload: &ItemPayload) -> Result<Payload, StoreError> {
        let value = serde_json::to_value(payload).map_err(|e| Self::op_error("upsert", e))?;
        Payload::try_from(value).map_err(|e| Self::op_error("upsert", e))
    }

    /// Extract the typed payload back out of a Qdrant point payload.
    fn extract_payload(
        payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
    ) -> Result<ItemPayload, StoreError> {
        let get_str = |key: &str| -> Result<String, StoreError> {
            match payload.get(key).and_then(|v| v.kind.as_ref()) {
                Some(Kind::StringValue(s)) => Ok(s.clone()),
                _ => Err(Self::op_error(
                    "query",
                    format!("missing or non-string payload field '{}'", key),
                )),
            }
        };

        let access_groups = match payload.get("access_groups").and_then(|v| v.kind.as_ref()) {
            Some(Kind::ListValue(list)) => list
                .values
                .iter()
                .filter_map(|v| match v.kind.as_ref() {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(ItemPayload {
            content: get_str("content")?,
            source: get_str("source")?,
            updated_at: get_str("updated_at")?,
            page_id: get_str("page_id")?,
            access_groups,
        })
    }
}

#[async_trait]
impl ContextStore for QdrantStore {
    async fn ensure_collection(&self) -> Result<(), StoreError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| Self::op_error("collection_exists", e))?;
        if exists {
            debug!(collection = %self.collection, "Collection already exists");
            return Ok(());
        }

        info!(
            collection = %self.collection,
            vector_size = self.vector_size,
            metric = ?self.metric,
            "Creating collection"
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.vector_size as u64, self.metric.into()),
                ),
            )
            .await
            .map_err(|e| Self::op_error("create_collection", e))?;
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

        let mut query = QueryPointsBuilder::new(&self.collection)
            .query(vector.to_vec())
            .limit(limit as u64)
            .with_payload(true);
        if let Some(qdrant_filter) = Self::build_filter(filter) {
            query = query.filter(qdrant_filter);
        }

        let response = self
            .client
            .query(query)
            .await
            .map_err(|e| Self::op_error("query", e))?;

        response
            .result
            .into_iter()
            .map(|point| {
                let id = point
                    .id
                    .as_ref()
                    .and_then(|id| id.point_id_options.as_ref())
                    .and_then(|opts| match opts {
                        qdrant_client::qdrant::point_id::PointIdOptions::Uuid(s) => {
                            Uuid::parse_str(s).ok()
                        }
                        _ => None,
                    })
                    .unwrap_or_else(Uuid::new_v4);
                let payload = Self::extract_payload(&point.payload)?;
                Ok(ScoredItem {
                    id,
                    score: point.score,
                    payload,
                })
            })
            .collect()
    }

    async fn upsert(&self, points: Vec<StoredPoint>) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let mut qdrant_points = Vec::with_capacity(points.len());
        for point in points {
            if point.vector.len() != self.vector_size {
                return Err(StoreError::DimensionMismatch {
                    expected: self.vector_size,
                    actual: point.vector.len(),
                });
            }
            let payload = Self::payload_json(&point.payload)?;
            qdrant_points.push(PointStruct::new(
                point.id.to_string(),
                point.vector,
                payload,
            ));
        }

        debug!(count = qdrant_points.len(), collection = %self.collection, "Upserting points");
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, qdrant_points).wait(true))
            .await
            .map_err(|e| Self::op_error("upsert", e))?;
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_list: Vec<_> = ids.iter().map(|id| id.to_string().into()).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList { ids: id_list })
                    .wait(true),
            )
            .await
            .map_err(|e| Self::op_error("delete", e))?;
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<(), StoreError> {
        let Some(qdrant_filter) = Self::build_filter(filter) else {
            // An empty filter would wipe the whole collection.
            return Err(Self::op_error("delete", "refusing to delete with an empty filter"));
        };
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(qdrant_filter)
                    .wait(true),
            )
            .await
            .map_err(|e| Self::op_error("delete", e))?;
        Ok(())
    }

    async fn update_access_groups(
        &self,
        filter: &MetadataFilter,
        access_groups: &[String],
    ) -> Result<(), StoreError> {
        let Some(qdrant_filter) = Self::build_filter(filter) else {
            return Err(Self::op_error(
                "set_payload",
                "refusing to update payload with an empty filter",
            ));
        };
        let patch = serde_json::json!({ "access_groups": access_groups });
        let payload = Payload::try_from(patch).map_err(|e| Self::op_error("set_payload", e))?;

        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload)
                    .points_selector(qdrant_filter)
                    .wait(true),
            )
            .await
            .map_err(|e| Self::op_error("set_payload", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_mapping() {
        assert_eq!(Distance::from(DistanceMetric::Cosine), Distance::Cosine);
        assert_eq!(Distance::from(DistanceMetric::Dot), Distance::Dot);
        assert_eq!(Distance::from(DistanceMetric::Euclid), Distance::Euclid);
        assert_eq!(
            Distance::from(DistanceMetric::Manhattan),
            Distance::Manhattan
        );
    }

    #[test]
    fn test_empty_filter_builds_to_none() {
        assert!(QdrantStore::build_filter(&MetadataFilter::default()).is_none());
    }

    #[test]
    fn test_group_filter_builds_condition() {
        let filter = QdrantStore::build_filter(&MetadataFilter::for_group("eng")).unwrap();
        assert_eq!(filter.must.len(), 1);
    }

    #[test]
    fn test_page_filter_has_both_conditions() {
        let filter = QdrantStore::build_filter(&MetadataFilter::for_page("notion", "p1")).unwrap();
        assert_eq!(filter.must.len(), 2);
    }
}
