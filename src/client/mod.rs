//! Query service client and authentication.
//!
//! This module provides the [`PowerBiConnector`] that opens sessions against a
//! Power BI dataset, along with authentication types ([`Auth`], [`AuthType`]).

mod auth;
mod powerbi;

pub use auth::{Auth, AuthType};
pub use powerbi::{
    DEFAULT_URL, PowerBiConnector, PowerBiSession, column_names, normalize_column, parse_response,
    status_error,
};
