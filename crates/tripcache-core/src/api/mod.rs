//! REST API client module for the trip guide server.
//!
//! This module provides the `ApiClient` used by the bundle fetcher, the
//! version oracle and the release feed. All endpoints are read-only and
//! unauthenticated; trip guides are public content.

pub mod client;
pub mod error;

pub use client::{ApiClient, AppRelease};
pub use error::ApiError;
