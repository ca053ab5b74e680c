//! Demonstration skill: repeats what it hears.
//!
//! - `echo:Repeat` answers with the `text` slot.
//! - `echo:Confirm` asks a follow-up restricted to `echo:Repeat`.
//! - `echo:Announce` speaks the `text` slot on the requesting site, then
//!   answers.

use std::process;

use hss_skill::config::USAGE;
use hss_skill::logging::init_tracing;
use hss_skill::{ConfigError, IntentRequest, Skill, SkillArgs, SkillError, SkillHost, SkillReply};

const REPEAT: &str = "echo:Repeat";
const CONFIRM: &str = "echo:Confirm";
const ANNOUNCE: &str = "echo:Announce";

struct EchoSkill;

#[async_trait::async_trait]
impl Skill for EchoSkill {
    async fn intent_list(&self) -> Result<Vec<String>, SkillError> {
        Ok(vec![
            REPEAT.to_string(),
            CONFIRM.to_string(),
            ANNOUNCE.to_string(),
        ])
    }

    async fn handle(
        &self,
        intent: &IntentRequest,
        host: SkillHost,
    ) -> Result<SkillReply, SkillError> {
        let text = intent.slot_str("text");

        match intent.intent_name.as_str() {
            REPEAT => Ok(SkillReply::answer(text.unwrap_or("I heard nothing"))),
            CONFIRM => Ok(SkillReply::followup("What should I repeat?").with_intent_filter([REPEAT])),
            ANNOUNCE => {
                let text = text.ok_or_else(|| SkillError::failed("nothing to announce"))?;
                let reply = host
                    .say(text, intent.site_id.as_deref(), None)
                    .await?
                    .wait()
                    .await?;
                tracing::debug!(command = %reply.command, "Announcement delivered");
                Ok(SkillReply::answer("Done"))
            }
            other => Err(SkillError::failed(format!("unsupported intent {other}"))),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match SkillArgs::from_env() {
        Ok(args) => args,
        Err(ConfigError::HelpRequested) => {
            eprintln!("{USAGE}");
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing(args.debug);

    hss_skill::run(EchoSkill, args).await?;
    Ok(())
}
