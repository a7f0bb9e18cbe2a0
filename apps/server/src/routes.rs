//! HTTP surface: entity snapshots, search, mutations and the NDJSON change feed.

use crate::error::ApiError;

use std::sync::Arc;

use axum::{
	body::Body,
	extract::{Path, Query, State},
	http::header,
	response::{IntoResponse, Response},
	routing::get,
	Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tb_core::{infra::sync::EntityFilter, Node};
use tb_sync::EntityType;
use tracing::debug;

type ApiResult<T = Json<Value>> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct SearchQuery {
	#[serde(default)]
	search: String,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
	cursor: Option<u64>,
}

pub fn router(node: Arc<Node>) -> Router {
	Router::new()
		.route("/health", get(|| async { "OK" }))
		.route("/api/cursor", get(cursor))
		.route("/api/poll", get(poll))
		.route("/api/tasks/by-user/:user_id", get(tasks_by_user))
		.nest("/api/users", entity_routes(EntityType::User))
		.nest("/api/tasks", entity_routes(EntityType::Task))
		.with_state(node)
}

fn entity_routes(entity_type: EntityType) -> Router<Arc<Node>> {
	Router::new()
		.route(
			"/",
			get(move |State(node): State<Arc<Node>>| list(node, entity_type)).post(
				move |State(node): State<Arc<Node>>, Json(data): Json<Map<String, Value>>| {
					create(node, entity_type, data)
				},
			),
		)
		.route(
			"/search",
			get(
				move |State(node): State<Arc<Node>>, Query(query): Query<SearchQuery>| {
					search(node, entity_type, query.search)
				},
			),
		)
		.route(
			"/:id",
			get(
				move |State(node): State<Arc<Node>>, Path(id): Path<String>| {
					find(node, entity_type, id)
				},
			)
			.put(
				move |State(node): State<Arc<Node>>,
				      Path(id): Path<String>,
				      Json(data): Json<Map<String, Value>>| {
					update(node, entity_type, id, data)
				},
			)
			.delete(
				move |State(node): State<Arc<Node>>, Path(id): Path<String>| {
					delete(node, entity_type, id)
				},
			),
		)
}

async fn list(node: Arc<Node>, entity_type: EntityType) -> ApiResult {
	let entities = node.feed().fetch_snapshot(entity_type).await?;
	Ok(Json(json!(entities)))
}

async fn search(node: Arc<Node>, entity_type: EntityType, term: String) -> ApiResult {
	let entities = node
		.store()
		.find_many(entity_type, &EntityFilter::search(term))
		.await?;
	Ok(Json(json!(entities)))
}

async fn find(node: Arc<Node>, entity_type: EntityType, id: String) -> ApiResult {
	let entity = node.store().find_unique(entity_type, &id).await?;
	match entity {
		Some(entity) => Ok(Json(entity.to_value())),
		None => Err(tb_core::infra::sync::Error::NotFound { entity_type, id }.into()),
	}
}

async fn create(node: Arc<Node>, entity_type: EntityType, data: Map<String, Value>) -> ApiResult {
	let entity = node.store().create(entity_type, data).await?;
	Ok(Json(entity.to_value()))
}

async fn update(
	node: Arc<Node>,
	entity_type: EntityType,
	id: String,
	data: Map<String, Value>,
) -> ApiResult {
	let entity = node.store().update(entity_type, &id, data).await?;
	Ok(Json(entity.to_value()))
}

async fn delete(node: Arc<Node>, entity_type: EntityType, id: String) -> ApiResult {
	let outcome = node
		.store()
		.execute(entity_type, "delete", json!({ "where": { "id": id } }))
		.await?;
	Ok(Json(outcome.into_value()))
}

async fn tasks_by_user(State(node): State<Arc<Node>>, Path(user_id): Path<String>) -> ApiResult {
	let tasks = node
		.store()
		.find_many(EntityType::Task, &EntityFilter::assigned_to(user_id))
		.await?;
	Ok(Json(json!(tasks)))
}

async fn cursor(State(node): State<Arc<Node>>) -> ApiResult {
	let cursor = node.feed().current_cursor().await?;
	Ok(Json(json!({ "cursor": cursor })))
}

/// Streams one JSON encoded batch per line for as long as the client stays connected.
async fn poll(State(node): State<Arc<Node>>, Query(query): Query<PollQuery>) -> ApiResult<Response> {
	let (feed, _handle) = node.feed().consume_feed(query.cursor).await?;
	debug!(cursor = ?query.cursor, "Client connected to the change feed");

	let lines = feed.map(|item| {
		item.and_then(|batch| {
			let mut line = batch
				.encode()
				.map_err(|e| tb_core::service::sync::FeedError::Permanent(e.to_string()))?;
			line.push('\n');
			Ok(line)
		})
	});

	Ok((
		[(header::CONTENT_TYPE, "application/x-ndjson")],
		Body::from_stream(lines),
	)
		.into_response())
}

#[cfg(test)]
mod tests {
	use super::*;

	use axum::{
		body::to_bytes,
		http::{Method, Request, StatusCode},
	};
	use tb_core::config::AppConfig;
	use tower::ServiceExt;

	async fn app() -> (Router, Arc<Node>) {
		let config = AppConfig::default_with_dir(std::env::temp_dir());
		let node = Node::in_memory(config).await.unwrap();
		(router(Arc::clone(&node)), node)
	}

	async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
		let request = Request::builder()
			.method(method)
			.uri(uri)
			.header(header::CONTENT_TYPE, "application/json")
			.body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))
			.unwrap();

		let response = app.clone().oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let value = if bytes.is_empty() {
			Value::Null
		} else {
			serde_json::from_slice(&bytes).unwrap()
		};

		(status, value)
	}

	#[tokio::test]
	async fn crud_round_trip_through_http() {
		let (app, _node) = app().await;

		let (status, user) = call(
			&app,
			Method::POST,
			"/api/users",
			Some(json!({ "fullName": "Ada Lovelace", "email": "ada@example.com" })),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		let user_id = user["id"].as_str().unwrap().to_string();

		let (_, task) = call(
			&app,
			Method::POST,
			"/api/tasks",
			Some(json!({ "title": "Notes on the engine", "userId": user_id })),
		)
		.await;
		assert_eq!(task["status"], json!("TODO"));

		let (_, found) = call(&app, Method::GET, "/api/users/search?search=lovelace", None).await;
		assert_eq!(found.as_array().unwrap().len(), 1);

		let (_, assigned) = call(&app, Method::GET, &format!("/api/tasks/by-user/{user_id}"), None).await;
		assert_eq!(assigned[0]["id"], task["id"]);

		let (status, deleted) =
			call(&app, Method::DELETE, &format!("/api/users/{user_id}"), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(deleted["__isDeleted"], json!(true));
		assert_eq!(deleted["tasks"][0]["id"], task["id"]);

		let (_, cursor) = call(&app, Method::GET, "/api/cursor", None).await;
		assert_eq!(cursor["cursor"], json!(4));
	}

	#[tokio::test]
	async fn maps_store_errors_to_status_codes() {
		let (app, _node) = app().await;

		let (status, body) = call(
			&app,
			Method::PUT,
			"/api/tasks/missing",
			Some(json!({ "status": "DONE" })),
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert!(body["error"].as_str().unwrap().contains("missing"));

		let (status, _) = call(&app, Method::POST, "/api/users", Some(json!({ "fullName": "Nobody" }))).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn poll_streams_ndjson_batches() {
		let (app, node) = app().await;
		node.store()
			.create(
				EntityType::Task,
				json!({ "title": "Stream me" }).as_object().cloned().unwrap(),
			)
			.await
			.unwrap();

		let response = app
			.oneshot(
				Request::builder()
					.uri("/api/poll?cursor=0")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(
			response.headers()[header::CONTENT_TYPE],
			"application/x-ndjson"
		);

		let mut body = response.into_body().into_data_stream();
		let chunk = body.next().await.unwrap().unwrap();
		let line = std::str::from_utf8(&chunk).unwrap();

		assert!(line.ends_with('\n'));
		let batch = tb_sync::ChangeBatch::decode(line.trim_end()).unwrap();
		assert_eq!(batch.cursor, 1);
		assert_eq!(batch.entities[0].field("title"), Some(&json!("Stream me")));
	}
}
