pub mod allocations;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod html;
pub mod portal;
pub mod prometheus;
pub mod routes;
pub mod slurmdb;
