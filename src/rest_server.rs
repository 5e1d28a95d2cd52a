use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::{json::Json, Serialize};
use rocket::{get, routes, Build, Rocket, State};
use tracing::{error, info};

use crate::error::MqttError;
use crate::models::Message;
use crate::publisher::MqttPublisher;

pub const PING_TOPIC: &str = "ptduc";
const PING_NAME: &str = "Duc";

/// Error envelope returned by `/api/ping` when the broker side fails.
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct PingPayload<'a> {
    name: &'a str,
}

type ApiError = (Status, Json<ApiResponse>);

fn error_response(status: Status, message: String) -> ApiError {
    (
        status,
        Json(ApiResponse {
            status: "error".to_string(),
            message,
        }),
    )
}

/// Broker unreachable is a 503, anything the transport rejected afterwards a 500.
fn mqtt_error_response(e: &MqttError) -> ApiError {
    let status = match e {
        MqttError::Connection(_) => Status::ServiceUnavailable,
        _ => Status::InternalServerError,
    };
    error_response(status, e.to_string())
}

/// Connects the publisher if needed and publishes the ping message.
#[get("/ping")]
async fn ping(publisher: &State<Arc<MqttPublisher>>) -> Result<&'static str, ApiError> {
    if let Err(e) = publisher.connect().await {
        error!("Ping failed to connect publisher: {}", e);
        return Err(mqtt_error_response(&e));
    }

    let payload = serde_json::to_vec(&PingPayload { name: PING_NAME }).map_err(|e| {
        error!("Failed to encode ping payload: {}", e);
        error_response(Status::InternalServerError, e.to_string())
    })?;

    if let Err(e) = publisher.publish(Message::new(PING_TOPIC, payload)).await {
        error!("Ping failed to publish: {}", e);
        return Err(mqtt_error_response(&e));
    }

    info!("Ping published to '{}'", PING_TOPIC);
    Ok("pong")
}

pub fn build_rocket(publisher: Arc<MqttPublisher>) -> Rocket<Build> {
    rocket::build()
        .manage(publisher)
        .mount("/api", routes![ping])
}

/// Runs the HTTP server until Rocket's shutdown (Ctrl-C) completes.
pub async fn run_rest_server(publisher: Arc<MqttPublisher>) -> Result<(), rocket::Error> {
    build_rocket(publisher).launch().await?;
    Ok(())
}
