//! `v1.ToDoService` handlers.
//!
//! Each method hands its business logic to the [`Pipeline`] as a closure;
//! the pipeline runs the interceptor chain around it exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqlog_core::{CallKind, CallLogger, Tags};
use tonic::service::Routes;
use tonic::{Request, Response, Status, Streaming};

use super::repository::ToDoRepository;
use crate::generated::v1::to_do_service_server::{ToDoService, ToDoServiceServer};
use crate::generated::v1::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, ReadAllRequest,
    ReadAllResponse, ReadRequest, ReadResponse, ToDo, UpdateRequest, UpdateResponse,
};
use crate::interceptor::{Pipeline, TypedStream};

/// API version implemented by this server.
pub const API_VERSION: &str = "v1";

const CREATE: &str = "/v1.ToDoService/Create";
const READ: &str = "/v1.ToDoService/Read";
const UPDATE: &str = "/v1.ToDoService/Update";
const DELETE: &str = "/v1.ToDoService/Delete";
const READ_ALL: &str = "/v1.ToDoService/ReadAll";
const BULK_CREATE: &str = "/v1.ToDoService/BulkCreate";

/// `v1.ToDoService` implementation routing every method through the [`Pipeline`].
pub struct ToDoServer<R> {
    repo: Arc<R>,
    pipeline: Pipeline,
}

impl<R: ToDoRepository> ToDoServer<R> {
    #[must_use]
    pub fn new(repo: Arc<R>, pipeline: Pipeline) -> Self {
        Self { repo, pipeline }
    }

    #[must_use]
    pub fn into_service(self) -> ToDoServiceServer<Self> {
        ToDoServiceServer::new(self)
    }
}

/// Routes serving the ToDo service over `repo`, dispatched through
/// `pipeline`.
#[must_use]
pub fn routes<R: ToDoRepository>(repo: Arc<R>, pipeline: Pipeline) -> Routes {
    Routes::new(ToDoServer::new(repo, pipeline).into_service())
}

/// An empty `api` means "whatever the server speaks".
fn check_api(api: &str) -> Result<(), Status> {
    if api.is_empty() || api == API_VERSION {
        Ok(())
    } else {
        Err(Status::unimplemented(format!(
            "unsupported API version: service implements '{API_VERSION}', but asked for '{api}'"
        )))
    }
}

fn require_item(item: Option<ToDo>) -> Result<ToDo, Status> {
    item.ok_or_else(|| Status::invalid_argument("to_do is required"))
}

/// Body of `BulkCreate`: one response per inbound request.
async fn create_each<R: ToDoRepository>(
    repo: Arc<R>,
    req: Request<TypedStream<CreateRequest>>,
) -> Result<Response<TypedStream<CreateResponse>>, Status> {
    let tags = Tags::from_extensions(req.extensions());
    let outbound: TypedStream<CreateResponse> = Box::pin(req.into_inner().then(move |item| {
        let repo = Arc::clone(&repo);
        let tags = tags.clone();
        async move {
            let req = item?;
            check_api(&req.api)?;
            let id = repo.create(require_item(req.to_do)?).await?;
            tags.set("todo.last_id", id);
            Ok::<_, Status>(CreateResponse {
                api: API_VERSION.to_string(),
                id,
            })
        }
    }));
    Ok(Response::new(outbound))
}

#[async_trait]
impl<R: ToDoRepository> ToDoService for ToDoServer<R> {
    async fn create(
        &self,
        request: Request<CreateRequest>,
    ) -> Result<Response<CreateResponse>, Status> {
        let repo = Arc::clone(&self.repo);
        self.pipeline
            .unary(CREATE, request, move |req: Request<CreateRequest>| async move {
                let log = CallLogger::bind(req.extensions());
                let req = req.into_inner();
                check_api(&req.api)?;

                let id = repo.create(require_item(req.to_do)?).await?;
                log.tag("todo.id", id).debug("ToDo created");

                Ok::<_, Status>(Response::new(CreateResponse {
                    api: API_VERSION.to_string(),
                    id,
                }))
            })
            .await
    }

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let repo = Arc::clone(&self.repo);
        self.pipeline
            .unary(READ, request, move |req: Request<ReadRequest>| async move {
                let req = req.into_inner();
                check_api(&req.api)?;

                let item = repo.read(req.id).await?;
                Ok::<_, Status>(Response::new(ReadResponse {
                    api: API_VERSION.to_string(),
                    to_do: Some(item),
                }))
            })
            .await
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        let repo = Arc::clone(&self.repo);
        self.pipeline
            .unary(UPDATE, request, move |req: Request<UpdateRequest>| async move {
                let req = req.into_inner();
                check_api(&req.api)?;

                let updated = repo.update(require_item(req.to_do)?).await?;
                Ok::<_, Status>(Response::new(UpdateResponse {
                    api: API_VERSION.to_string(),
                    updated,
                }))
            })
            .await
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let repo = Arc::clone(&self.repo);
        self.pipeline
            .unary(DELETE, request, move |req: Request<DeleteRequest>| async move {
                let req = req.into_inner();
                check_api(&req.api)?;

                let deleted = repo.delete(req.id).await?;
                Ok::<_, Status>(Response::new(DeleteResponse {
                    api: API_VERSION.to_string(),
                    deleted,
                }))
            })
            .await
    }

    async fn read_all(
        &self,
        request: Request<ReadAllRequest>,
    ) -> Result<Response<ReadAllResponse>, Status> {
        let repo = Arc::clone(&self.repo);
        self.pipeline
            .unary(READ_ALL, request, move |req: Request<ReadAllRequest>| async move {
                let log = CallLogger::bind(req.extensions());
                check_api(&req.get_ref().api)?;

                let to_dos = repo.read_all().await?;
                log.tag("todo.count", to_dos.len()).debug("ToDo list read");

                Ok::<_, Status>(Response::new(ReadAllResponse {
                    api: API_VERSION.to_string(),
                    to_dos,
                }))
            })
            .await
    }

    type BulkCreateStream = TypedStream<CreateResponse>;

    /// Creates one item per inbound request and answers each with its id.
    /// The first failure ends the call.
    async fn bulk_create(
        &self,
        request: Request<Streaming<CreateRequest>>,
    ) -> Result<Response<Self::BulkCreateStream>, Status> {
        let repo = Arc::clone(&self.repo);
        self.pipeline
            .streaming(
                BULK_CREATE,
                CallKind::BidiStreaming,
                request,
                move |req: Request<TypedStream<CreateRequest>>| create_each(repo, req),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;
    use tonic::Code;

    use super::*;
    use crate::interceptor::{build_pipeline, InterceptorConfig};
    use crate::network::ShutdownController;
    use crate::todo::InMemoryRepository;

    fn server() -> ToDoServer<InMemoryRepository> {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let pipeline = build_pipeline(&InterceptorConfig::default(), shutdown);
        ToDoServer::new(Arc::new(InMemoryRepository::new()), pipeline)
    }

    fn create_request(title: &str) -> CreateRequest {
        CreateRequest {
            api: API_VERSION.to_string(),
            to_do: Some(ToDo {
                id: 0,
                title: title.to_string(),
                description: String::new(),
            }),
        }
    }

    #[test]
    fn api_check_accepts_empty_and_current() {
        assert!(check_api("").is_ok());
        assert!(check_api("v1").is_ok());
        assert_eq!(check_api("v2").unwrap_err().code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let server = server();

        let id = server
            .create(Request::new(create_request("buy milk")))
            .await
            .unwrap()
            .into_inner()
            .id;

        let read = server
            .read(Request::new(ReadRequest {
                api: String::new(),
                id,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(read.to_do.unwrap().title, "buy milk");

        let updated = server
            .update(Request::new(UpdateRequest {
                api: API_VERSION.to_string(),
                to_do: Some(ToDo {
                    id,
                    title: "buy oat milk".into(),
                    description: String::new(),
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(updated.updated, 1);

        let all = server
            .read_all(Request::new(ReadAllRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(all.to_dos.len(), 1);
        assert_eq!(all.to_dos[0].title, "buy oat milk");

        let deleted = server
            .delete(Request::new(DeleteRequest {
                api: String::new(),
                id,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(deleted.deleted, 1);
    }

    #[tokio::test]
    async fn wrong_api_version_is_unimplemented() {
        let server = server();
        let err = server
            .read_all(Request::new(ReadAllRequest { api: "v9".into() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn missing_item_is_invalid_argument() {
        let server = server();
        let err = server
            .create(Request::new(CreateRequest {
                api: String::new(),
                to_do: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn read_logs_with_promoted_id_and_quiet_ok() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let server = server();
        let id = server
            .create(Request::new(create_request("x")))
            .await
            .unwrap()
            .into_inner()
            .id;
        logs.clear();

        server
            .read(Request::new(ReadRequest {
                api: String::new(),
                id,
            }))
            .await
            .unwrap();

        let finished = &logs.with_message("finished unary call")[0];
        assert_eq!(finished.level, tracing::Level::DEBUG);
        assert_eq!(finished.field("grpc.method"), Some("Read"));
        assert_eq!(finished.tags()["grpc.request.id"], json!(id));
    }

    #[tokio::test]
    async fn not_found_logs_at_info() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let server = server();

        let err = server
            .read(Request::new(ReadRequest {
                api: String::new(),
                id: 404,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let finished = &logs.with_message("finished unary call")[0];
        assert_eq!(finished.level, tracing::Level::INFO);
        assert_eq!(finished.field("grpc.code"), Some("NotFound"));
    }

    #[tokio::test]
    async fn bulk_create_answers_each_request() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let server = server();
        let repo = Arc::clone(&server.repo);

        // tonic's `Streaming` only comes from a decoded body, so drive the
        // pipeline with a plain stream.
        let inbound = stream::iter(vec![
            Ok(create_request("a")),
            Ok(create_request("b")),
            Ok(create_request("c")),
        ]);
        let response = server
            .pipeline
            .streaming(
                BULK_CREATE,
                CallKind::BidiStreaming,
                Request::new(inbound),
                move |req: Request<TypedStream<CreateRequest>>| create_each(repo, req),
            )
            .await
            .unwrap();

        let ids: Vec<i64> = response
            .into_inner()
            .map(|item| item.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(server.repo.len(), 3);
        assert_eq!(logs.count("Message received"), 3);

        let finished = &logs.with_message("finished streaming call")[0];
        assert_eq!(finished.field("grpc.code"), Some("Ok"));
        assert_eq!(finished.tags()["todo.last_id"], json!(3));
    }

    #[tokio::test]
    async fn bulk_create_stops_at_first_invalid_request() {
        let server = server();
        let repo = Arc::clone(&server.repo);

        let inbound = stream::iter(vec![
            Ok(create_request("a")),
            Ok(create_request("")),
        ]);
        let response = server
            .pipeline
            .streaming(
                BULK_CREATE,
                CallKind::BidiStreaming,
                Request::new(inbound),
                move |req: Request<TypedStream<CreateRequest>>| create_each(repo, req),
            )
            .await
            .unwrap();

        let items: Vec<Result<CreateResponse, Status>> = response.into_inner().collect().await;
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().code(), Code::InvalidArgument);
    }
}
