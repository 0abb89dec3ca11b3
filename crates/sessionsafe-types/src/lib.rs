#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for SessionSafe metered sessions.
//!
//! This crate provides the foundational types shared by the session core and the
//! chain-specific settlement crates. It is chain-agnostic: anything that knows how
//! to talk to a particular ledger lives in a separate crate and plugs in through
//! [`settlement::SettlementChain`].
//!
//! # Modules
//!
//! - [`amount`] - Exact, non-negative decimal amounts
//! - [`config`] - RPC configuration and environment variable resolution
//! - [`session`] - Session identifiers, status, action log and the persisted record
//! - [`settlement`] - Two-phase settlement interface and progress reporting
//! - [`timestamp`] - Unix timestamps for action log entries

pub mod amount;
pub mod config;
pub mod session;
pub mod settlement;
pub mod timestamp;
