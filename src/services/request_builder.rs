//! Maps domain records onto the remote API's request shapes.

use crate::models::{FieldValue, ObservationRecord, PhotoRole};
use crate::services::transport::{HttpMethod, RemoteRequest, RequestBody};
use photo_store::PhotoBlob;
use serde_json::{json, Value};

pub trait RequestBuilder: Send + Sync {
    fn create_observation(&self, record: &ObservationRecord) -> RemoteRequest;
    fn update_observation(&self, record: &ObservationRecord, remote_id: i64) -> RemoteRequest;
    fn delete_observation(&self, remote_id: i64) -> RemoteRequest;
    fn upload_photo(
        &self,
        remote_parent_id: i64,
        local_id: &str,
        role: PhotoRole,
        blob: PhotoBlob,
    ) -> RemoteRequest;
    fn delete_photo(&self, remote_photo_id: i64) -> RemoteRequest;
    fn upsert_field_value(&self, remote_parent_id: i64, field: &FieldValue) -> RemoteRequest;
    fn delete_field_value(&self, remote_field_id: i64) -> RemoteRequest;
    fn link_to_project(&self, remote_parent_id: i64, project_id: i64) -> RemoteRequest;
    fn status_check(&self, handle: &str) -> RemoteRequest;
}

/// REST layout of the observation service
#[derive(Debug, Clone, Default)]
pub struct ApiRequestBuilder;

impl ApiRequestBuilder {
    fn observation_json(record: &ObservationRecord) -> Value {
        let body = &record.body;
        json!({
            "observation": {
                "uuid": record.uuid,
                "species_guess": body.species_guess,
                "caption": body.caption,
                "description": body.description,
                "latitude": body.latitude,
                "longitude": body.longitude,
                "observed_on": body.observed_at.map(|t| t.to_rfc3339()),
            }
        })
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

impl RequestBuilder for ApiRequestBuilder {
    fn create_observation(&self, record: &ObservationRecord) -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Post,
            "/observations",
            RequestBody::Json(Self::observation_json(record)),
        )
    }

    fn update_observation(&self, record: &ObservationRecord, remote_id: i64) -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Put,
            format!("/observations/{}", remote_id),
            RequestBody::Json(Self::observation_json(record)),
        )
    }

    fn delete_observation(&self, remote_id: i64) -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Delete,
            format!("/observations/{}", remote_id),
            RequestBody::Empty,
        )
    }

    fn upload_photo(
        &self,
        remote_parent_id: i64,
        local_id: &str,
        role: PhotoRole,
        blob: PhotoBlob,
    ) -> RemoteRequest {
        let file_name = format!("{}.{}", local_id, extension_for(&blob.mime));
        RemoteRequest::new(
            HttpMethod::Post,
            "/observation_photos",
            RequestBody::Photo {
                blob,
                file_name,
                fields: vec![
                    ("observation_id".to_string(), remote_parent_id.to_string()),
                    ("role".to_string(), role.as_str().to_string()),
                ],
            },
        )
    }

    fn delete_photo(&self, remote_photo_id: i64) -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Delete,
            format!("/observation_photos/{}", remote_photo_id),
            RequestBody::Empty,
        )
    }

    fn upsert_field_value(&self, remote_parent_id: i64, field: &FieldValue) -> RemoteRequest {
        let body = RequestBody::Json(json!({
            "observation_field_value": {
                "observation_id": remote_parent_id,
                "observation_field_id": field.field_id,
                "value": field.value,
            }
        }));
        match field.remote_id {
            Some(id) => RemoteRequest::new(
                HttpMethod::Put,
                format!("/observation_field_values/{}", id),
                body,
            ),
            None => RemoteRequest::new(HttpMethod::Post, "/observation_field_values", body),
        }
    }

    fn delete_field_value(&self, remote_field_id: i64) -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Delete,
            format!("/observation_field_values/{}", remote_field_id),
            RequestBody::Empty,
        )
    }

    fn link_to_project(&self, remote_parent_id: i64, project_id: i64) -> RemoteRequest {
        RemoteRequest::new(
            HttpMethod::Post,
            "/project_observations",
            RequestBody::Json(json!({
                "project_observation": {
                    "observation_id": remote_parent_id,
                    "project_id": project_id,
                }
            })),
        )
    }

    fn status_check(&self, handle: &str) -> RemoteRequest {
        RemoteRequest::get(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, ObservationBody, Outcome, SyncMeta};
    use uuid::Uuid;

    #[test]
    fn test_observation_body_leaves_out_field_values() {
        let record = ObservationRecord::new(
            Uuid::new_v4(),
            ObservationBody {
                species_guess: Some("Alcedo atthis".into()),
                field_values: vec![FieldValue::new(1, "x")],
                ..Default::default()
            },
            SyncMeta::new(ActionType::Create, Outcome::Waiting),
        );

        let request = ApiRequestBuilder.create_observation(&record);
        assert_eq!(request.method, HttpMethod::Post);
        match request.body {
            RequestBody::Json(v) => {
                assert_eq!(v["observation"]["species_guess"], "Alcedo atthis");
                assert!(v["observation"].get("field_values").is_none());
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_field_value_put_when_known_remotely() {
        let mut field = FieldValue::new(3, "7");
        assert_eq!(
            ApiRequestBuilder.upsert_field_value(1, &field).method,
            HttpMethod::Post
        );
        field.remote_id = Some(90);
        let request = ApiRequestBuilder.upsert_field_value(1, &field);
        assert_eq!(request.method, HttpMethod::Put);
        assert_eq!(request.path, "/observation_field_values/90");
    }

    #[test]
    fn test_photo_upload_is_multipart() {
        let request = ApiRequestBuilder.upload_photo(
            5,
            "local-1",
            PhotoRole::Detail,
            PhotoBlob::new(vec![1], "image/png"),
        );
        match request.body {
            RequestBody::Photo { file_name, fields, .. } => {
                assert_eq!(file_name, "local-1.png");
                assert!(fields.contains(&("observation_id".to_string(), "5".to_string())));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
