//! JWXT Harvest: authenticated course-catalog harvesting for the JWXT portal.

pub mod catalog;
pub mod cipher;
pub mod cloud;
pub mod config;
pub mod extract;
pub mod fields;
pub mod harvest;
pub mod http_client;
pub mod login;
pub mod pipeline;
pub mod scope;
pub mod session;
pub mod types;

pub use cloud::{download_cloud_snapshot, CloudMode};
pub use config::{resolve_credentials, HarvestConfig};
pub use harvest::{HarvestOptions, HarvestReport, Harvester, SessionPaths};
pub use http_client::{HttpClient, HttpResponse, RateLimiter};
pub use login::{LoginFlow, LoginState};
pub use session::SessionJar;
pub use types::*;
