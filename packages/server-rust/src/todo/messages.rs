//! Logging view of the generated ToDo messages.
//!
//! Every message is structured, so payload logging renders it as JSON.
//! Requests that address a single item promote its id to the
//! `grpc.request.id` tag.

use reqlog_core::{Payload, RpcMessage, TagValue};

use crate::generated::v1::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, ReadAllRequest,
    ReadAllResponse, ReadRequest, ReadResponse, UpdateRequest, UpdateResponse,
};

reqlog_core::structured_messages!(
    CreateRequest,
    CreateResponse,
    ReadResponse,
    UpdateResponse,
    DeleteResponse,
    ReadAllRequest,
    ReadAllResponse,
);

impl RpcMessage for ReadRequest {
    fn payload(&self) -> Option<&dyn Payload> {
        Some(self)
    }

    fn log_fields(&self) -> Vec<(&'static str, TagValue)> {
        vec![("id", self.id.into())]
    }
}

impl RpcMessage for DeleteRequest {
    fn payload(&self) -> Option<&dyn Payload> {
        Some(self)
    }

    fn log_fields(&self) -> Vec<(&'static str, TagValue)> {
        vec![("id", self.id.into())]
    }
}

impl RpcMessage for UpdateRequest {
    fn payload(&self) -> Option<&dyn Payload> {
        Some(self)
    }

    fn log_fields(&self) -> Vec<(&'static str, TagValue)> {
        self.to_do
            .as_ref()
            .map(|item| vec![("id", item.id.into())])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::generated::v1::ToDo;

    #[test]
    fn payload_uses_camel_case_json() {
        let request = CreateRequest {
            api: "v1".into(),
            to_do: Some(ToDo {
                id: 0,
                title: "buy milk".into(),
                description: String::new(),
            }),
        };
        let json = request.payload().unwrap().marshal_json().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&json).unwrap(),
            json!({"api": "v1", "toDo": {"id": 0, "title": "buy milk", "description": ""}})
        );
    }

    #[test]
    fn single_item_requests_expose_id() {
        let read = ReadRequest {
            api: String::new(),
            id: 7,
        };
        assert_eq!(read.log_fields(), vec![("id", json!(7))]);

        let update = UpdateRequest {
            api: String::new(),
            to_do: Some(ToDo {
                id: 9,
                ..ToDo::default()
            }),
        };
        assert_eq!(update.log_fields(), vec![("id", json!(9))]);
        assert!(UpdateRequest::default().log_fields().is_empty());
    }

    #[test]
    fn listing_has_no_fields() {
        assert!(ReadAllRequest::default().log_fields().is_empty());
    }
}
