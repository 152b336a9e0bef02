//! # Node Image Maker
//!
//! Asynchronous disk-image customization. A caller submits a base image id
//! plus named resources (including a customization script); a worker
//! decompresses and verifies the base image, runs the customization tool on
//! it, then compresses and publishes the result to an image repository. The
//! caller polls a [`receipt::Receipt`] until the task is done.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────────┐   ┌──────────────┐
//! │ source repo  │──▶│ pipeline                     │──▶│  dest repo   │
//! │ FS / S3      │   │ decompress+verify ─▶ customize│   │ FS / S3      │
//! │ (+ cache)    │   │ ─▶ compress+publish           │   │ data + JSON  │
//! └──────────────┘   └──────────────┬───────────────┘   └──────────────┘
//!                                   │ TaskStepTracker
//!                            ┌──────▼──────┐
//!                            │  receipts   │◀── poll / sweep
//!                            └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! nim images                                   # list base images
//! nim create solarnode-base --resource setup.fish --env NODE_NAME=solar-1
//! nim fetch 4c1f…  --out custom.img
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and service construction |
//! | [`error`] | `NimError` taxonomy |
//! | [`models`] | Image metadata, images, resources, options |
//! | [`tracker`] | Step-based progress tracking |
//! | [`streams`] | Digest, progress, and cancellation stream wrappers |
//! | [`compression`] | xz / gzip / zstd codecs |
//! | [`cache`] | Keyed file-backed stream cache |
//! | [`object_store`] | S3 client and in-memory store |
//! | [`repository`] | Filesystem and object-storage image repositories |
//! | [`sanitizer`] | Customization script validation |
//! | [`customizer`] | Customization tool runner |
//! | [`auth`] | Authorizers and session cache |
//! | [`receipt`] | Task receipts |
//! | [`pipeline`] | The per-task customization job |
//! | [`service`] | `ImageService` |
//! | [`progress`] | CLI progress reporters |

pub mod auth;
pub mod cache;
pub mod compression;
pub mod config;
pub mod customizer;
pub mod error;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod progress;
pub mod receipt;
pub mod repository;
pub mod sanitizer;
pub mod service;
pub mod streams;
pub mod tracker;

pub use error::{NimError, Result};
