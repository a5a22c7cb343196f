//! SceneSync - incremental mirroring of scenery trees over HTTP
//!
//! This library keeps a local directory tree in step with a remote tree
//! described by per-directory `.dirindex` manifests. Only changed content
//! is fetched, every file is verified by SHA-1, and archive entries are
//! unpacked in place by a streaming tar/zip extractor.
//!
//! - [`repository`] - the sync engine and its on-disk caches
//! - [`archive`] - push-driven tar, tar.gz, tar.xz and zip extraction
//! - [`http`] - non-blocking transport abstraction
//! - [`config`] - user configuration file
//! - [`logging`] - tracing subscriber setup

pub mod archive;
pub mod config;
pub mod hash;
pub mod http;
pub mod logging;
pub mod repository;

pub use archive::{extract_file, ArchiveError, ArchiveExtractor};
pub use http::{HttpClient, MemoryTransport, ReqwestClient};
pub use repository::{HttpRepository, RepoConfig, RepoError, ResultCode, SyncReport};
