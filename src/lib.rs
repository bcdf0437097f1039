pub mod batch;
pub mod cache;
pub mod config;
pub mod derivative;
pub mod domain;
pub mod error;
pub mod geometry;
pub mod metadata;
pub mod output;
pub mod repository;
pub mod resolver;
pub mod thumbnail;
pub mod traversal;
pub mod upload;
pub mod worker;
