pub mod error;
pub mod index;
pub mod keycloak;
pub mod permission;
pub mod pipeline;
pub mod preferences;
pub mod principal;
pub mod roles;
