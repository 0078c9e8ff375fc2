//! JSON-RPC 2.0 endpoint speaking the A2A task methods.
//!
//! Every reply is HTTP 200 with a JSON-RPC envelope; faults travel in the
//! `error` member.

use std::sync::Arc;

use axum::{extract::State, response::Json};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::routes::AppState;
use crate::manager::RequestError;
use crate::protocol::a2a::{TaskIdParams, TaskQueryParams, TaskSendParams};
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::task::{Task, TaskError};

/// `POST /`
pub async fn handle_rpc(State(state): State<Arc<AppState>>, body: String) -> Json<JsonRpcResponse> {
    let raw: Value = match serde_json::from_str(&body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!("Unparseable JSON-RPC body: {}", e);
            return Json(JsonRpcResponse::failure(
                None,
                JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("Parse error: {}", e)),
            ));
        }
    };

    // Keep the id when the envelope is otherwise malformed.
    let id: Option<RequestId> = raw.get("id").cloned().and_then(|v| serde_json::from_value(v).ok());

    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(JsonRpcError::INVALID_REQUEST, format!("Invalid request: {}", e)),
            ));
        }
    };
    if request.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::failure(
            id,
            JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "Invalid request: jsonrpc must be \"2.0\""),
        ));
    }

    tracing::debug!("JSON-RPC {} (id {:?})", request.method, request.id);
    let result = dispatch(&state, &request.method, request.params).await;

    Json(match result {
        Ok(task) => match serde_json::to_value(&task) {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => JsonRpcResponse::failure(
                request.id,
                JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, format!("Internal error: {}", e)),
            ),
        },
        Err(error) => {
            tracing::debug!("JSON-RPC {} failed: {}", request.method, error);
            JsonRpcResponse::failure(request.id, error)
        }
    })
}

async fn dispatch(state: &AppState, method: &str, params: Option<Value>) -> Result<Task, JsonRpcError> {
    match method {
        "tasks/send" => {
            let params: TaskSendParams = parse_params(params)?;
            state.manager.handle(params).await.map_err(request_error)
        }
        "tasks/get" => {
            let params: TaskQueryParams = parse_params(params)?;
            state
                .manager
                .get_task(&params.id, params.history_length)
                .await
                .map_err(task_error)
        }
        "tasks/cancel" => {
            let params: TaskIdParams = parse_params(params)?;
            state.manager.cancel(&params.id).await.map_err(task_error)
        }
        other => Err(JsonRpcError::new(
            JsonRpcError::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        )),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, "Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("Invalid params: {}", e)))
}

fn request_error(error: RequestError) -> JsonRpcError {
    match error {
        RequestError::Store(e) => task_error(e),
        RequestError::Interrupted(reason) => {
            JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, format!("Request was interrupted: {}", reason))
        }
        other => JsonRpcError::new(JsonRpcError::INVALID_PARAMS, other.to_string()),
    }
}

fn task_error(error: TaskError) -> JsonRpcError {
    match error {
        TaskError::NotFound(_) => JsonRpcError::new(JsonRpcError::TASK_NOT_FOUND, error.to_string()),
        other => JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, other.to_string()),
    }
}
