use crate::error::RoutingError;
use hyper::{Body, Response, StatusCode};
use log::error;
use std::error::Error;

fn with_status(status: StatusCode, body: Body) -> Response<Body> {
  let mut response = Response::new(body);
  *response.status_mut() = status;
  response
}

pub fn not_found() -> Response<Body> {
  with_status(StatusCode::NOT_FOUND, Body::from("404 - page not found"))
}

pub fn handle_bad_gateway<E: Error>(error: E) -> Response<Body> {
  log_error(error);
  bad_gateway()
}

pub fn bad_gateway() -> Response<Body> {
  with_status(StatusCode::BAD_GATEWAY, Body::empty())
}

pub fn gateway_timeout() -> Response<Body> {
  with_status(StatusCode::GATEWAY_TIMEOUT, Body::empty())
}

pub fn service_unavailable() -> Response<Body> {
  with_status(StatusCode::SERVICE_UNAVAILABLE, Body::empty())
}

pub fn routing_failure(error: &RoutingError) -> Response<Body> {
  with_status(error.status(), Body::empty())
}

pub fn handle_internal_server_error<E: Error>(error: E) -> Response<Body> {
  log_error(error);
  internal_server_error()
}

pub fn internal_server_error() -> Response<Body> {
  with_status(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
}

pub fn log_error<E: Error>(error: E) {
  error!("{}", error);
}
