//! Core components, types, and utilities for the bot.
//!
//! This module contains fundamental building blocks used throughout the application:
//! - Configuration handling and environment variables.
//! - BigQuery ML query templates and fixed reply texts.
//! - Common types and result handling.

pub mod config;
pub mod queries;
pub mod types;
