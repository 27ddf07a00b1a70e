//! Environment file synchronization with S3-compatible object storage.
//!
//! This library keeps `.env` style configuration in an object store and
//! brings it, together with any related files, onto the machines that need
//! it. It's designed for deployments where configuration lives next to the
//! infrastructure rather than in the repository.
//!
//! # Features
//!
//! - **Lossless dotenv parsing**: comments and layout survive a
//!   read-modify-write of the remote file, quoted values are escape-decoded
//! - **Mapped file sync**: `remote:local` lists drive bulk downloads and
//!   uploads, skipping files whose ETag already matches
//! - **Layered settings**: a TOML config section with the process
//!   environment on top
//! - **Optional tracing**: Detailed logging when the `tracing` feature is enabled
//!
//! # Example
//!
//! ```rust,no_run
//! use s3conf::settings::Settings;
//! use s3conf::sync::S3Conf;
//!
//! let settings = Settings::load(None, None).unwrap(); // S3CONF from the environment
//! let s3conf = S3Conf::from_settings(settings);
//!
//! let environment = s3conf.environment().unwrap();
//! s3conf::dump::phusion_dump(&environment, "/etc/container_environment".as_ref()).unwrap();
//! ```

pub mod dump;
pub mod editor;
pub mod hash;
pub mod mapping;
pub mod parse;
pub mod settings;
pub mod storage;
pub mod sync;
