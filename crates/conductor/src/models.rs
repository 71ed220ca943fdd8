//! These models represent the objects passed around by the engine
//!
//! There are several different related formats we need to interact with:
//! - turns recorded in the conversation, exported to whoever persists them
//! - openai, anthropic and ollama chat messages/tools, sent from the engine to the LLM
//! - remote tool descriptors and results, exchanged with tool servers
//!
//! We always immediately convert those wire formats into the internal structs using
//! to/from helpers, so the internal models do not exactly match any one of them.
pub mod role;
pub mod tool;
pub mod turn;
