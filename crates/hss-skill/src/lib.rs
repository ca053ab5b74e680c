//! hss-skill: runtime for skills managed by the Hermes skill server.
//!
//! A skill process is launched by the skill server with
//! `--skill-name <name> --parent-port <port> --port <port>`. It listens on
//! `--port` for `get_intentlist` and `handle` requests, and connects to
//! `--parent-port` to push `say` and `ask` requests back.

pub mod command;
pub mod config;
pub mod intent;
pub mod logging;
mod skill;

pub use command::SkillCommand;
pub use config::{ConfigError, SkillArgs};
pub use intent::{IntentError, IntentRequest, SkillReply};
pub use skill::{Skill, SkillAdapter, SkillError, SkillHost, SkillRuntime, run};
