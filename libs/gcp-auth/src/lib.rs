//! Google Cloud REST plumbing shared by the Pub/Sub and BigQuery connectors:
//! OAuth2 bearer tokens and HTTP status → `ConnectorError` mapping.

mod http;
mod token;

pub use http::{build_client, check_status, send_error};
pub use token::{AuthConfig, TokenProvider, TokenSource};
