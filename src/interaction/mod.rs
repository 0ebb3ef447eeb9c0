//! Event handling and user interactions for the bot.
//!
//! This module provides functionality for handling chat events:
//! - Cleaning mention text into a question
//! - Choosing between the index refresh and the answer query
//! - Posting the interim notice and the result back to the thread

pub mod app_mention;
