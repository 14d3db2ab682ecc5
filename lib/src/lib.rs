//! # Bootloader images as OCI artifacts
//!
//! This crate implements the `bootpack` tool: it compiles bootloader
//! artifacts described by a declarative `Bootfile.yml` through a
//! container-build backend, captures the results as OCI image layers in a
//! content-addressed local cache, and exports portable OCI image-layout
//! archives.

pub mod backend;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod export;
pub mod oci;
pub mod reference;
pub mod tar;

#[cfg(any(test, feature = "internal-testing-api"))]
pub mod fixture;
