//! Per-query device identification and filtering for DNS services.
//!
//! This crate provides the decision pipeline of a filtering DNS service.
//! For every incoming query it identifies the subscriber's device from
//! transport-level signals, matches the query against hot-reloadable rule
//! lists, synthesizes a response if the query is blocked or rewritten, and
//! counts the query for billing. Transport handling, upstream resolution,
//! and the backend services are left to the application which connects to
//! them through a small number of traits.
//!
//! # Modules
//!
//! * [base] contains the fundamental types such as device and profile
//!   identifiers and transport protocols,
//! * [profile] defines profiles and devices as well as the [ProfileDb]
//!   trait for looking them up, together with an in-memory store,
//! * [server] describes the server and the transport of a query,
//! * [dnsmsg] resolves blocking modes and builds synthesized responses,
//! * [devicefinder] identifies the device that sent a query,
//! * [filter] contains the rule list engine, rule sources, and safe
//!   search,
//! * [billstat] counts queries per device and uploads the counts,
//! * [refresh] runs periodic refreshes of filters and statistics,
//! * [errcoll] receives errors from background work,
//! * [metrics] provides the metrics of the components,
//! * [config] contains the configuration of the components, and
//! * [service] ties everything together into the per-query pipeline.
//!
//! [ProfileDb]: profile::ProfileDb
//!
//! # Reference of Feature Flags
//!
//! * `http`: Enables fetching rule lists over HTTP through
//!   `filter::HttpRuleSource` using the
//!   [reqwest](https://github.com/seanmonstar/reqwest) crate. This feature
//!   is enabled by default.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod base;
pub mod billstat;
pub mod config;
pub mod devicefinder;
pub mod dnsmsg;
pub mod errcoll;
pub mod filter;
pub mod metrics;
pub mod profile;
pub mod refresh;
pub mod server;
pub mod service;
