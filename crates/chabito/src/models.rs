//! These models represent the objects passed around by the agent
//!
//! There are several different related formats we need to interact with:
//! - the chat payloads sent by the transports to the agent
//! - openai messages/tools, sent from the agent to the LLM
//! - gemini contents/function declarations, sent from the agent to the LLM
//! - capability calls, sent from the agent to the registered tools
//! - audit rows, written to the relational store after each turn
//!
//! We always immediately convert those data models into the internal structs
//! using to/from helpers, so the internal models are not an exact match to any
//! of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
