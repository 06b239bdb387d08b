//! System prompts for the counterpart, keyed on trial phase and simulation mode.
//!
//! The wording here is deliberately generic; deployments supply their own `PromptProvider`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of the trial being rehearsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    PreTrial,
    VoirDire,
    #[default]
    OpeningStatement,
    DirectExamination,
    CrossExamination,
    ClosingArgument,
    Sentencing,
}

impl TrialPhase {
    pub fn label(&self) -> &'static str {
        match self {
            TrialPhase::PreTrial => "pre-trial motions",
            TrialPhase::VoirDire => "voir dire",
            TrialPhase::OpeningStatement => "opening statement",
            TrialPhase::DirectExamination => "direct examination",
            TrialPhase::CrossExamination => "cross-examination",
            TrialPhase::ClosingArgument => "closing argument",
            TrialPhase::Sentencing => "sentencing",
        }
    }

    /// Role the counterpart plays in this phase.
    fn counterpart_role(&self) -> &'static str {
        match self {
            TrialPhase::DirectExamination | TrialPhase::CrossExamination => "the witness on the stand",
            TrialPhase::Sentencing | TrialPhase::PreTrial => "the presiding judge",
            _ => "opposing counsel",
        }
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How much the counterpart helps the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// Patient, explains every objection.
    Learn,
    #[default]
    Practice,
    /// Full adversarial pressure.
    Trial,
}

impl SimulationMode {
    fn directive(&self) -> &'static str {
        match self {
            SimulationMode::Learn => {
                "Be patient. When you object or rule, explain the rule of evidence in plain language."
            }
            SimulationMode::Practice => {
                "Behave realistically but fairly. Object when an objection is clearly warranted."
            }
            SimulationMode::Trial => {
                "Be a demanding, adversarial counterpart. Object to every defect you notice."
            }
        }
    }
}

/// Everything the prompt provider may key on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub phase: TrialPhase,
    pub mode: SimulationMode,
    pub counterpart_name: String,
    pub case_summary: String,
}

/// Supplies the domain system prompt for a turn. Pure and synchronous.
pub trait PromptProvider: Send + Sync {
    fn system_prompt(&self, ctx: &PromptContext) -> String;
}

const COURTROOM_TEMPLATE: &str = r#"You are {name}, {role}, in a courtroom simulation during {phase}.
Stay in character at all times and keep spoken replies under three sentences.
{directive}

Case summary:
---
{case}
---

Besides your spoken line, privately coach the user (an advocate in training): critique their last
statement, suggest an improvement, score its rhetorical effectiveness and name any logical fallacies."#;

/// Built-in provider used when the host supplies none.
#[derive(Debug, Default, Clone)]
pub struct CourtroomPrompts;

impl PromptProvider for CourtroomPrompts {
    fn system_prompt(&self, ctx: &PromptContext) -> String {
        let case = if ctx.case_summary.trim().is_empty() {
            "(no case summary provided)"
        } else {
            ctx.case_summary.trim()
        };
        COURTROOM_TEMPLATE
            .replace("{name}", &ctx.counterpart_name)
            .replace("{role}", ctx.phase.counterpart_role())
            .replace("{phase}", ctx.phase.label())
            .replace("{directive}", ctx.mode.directive())
            .replace("{case}", case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn courtroom_prompt_fills_every_placeholder() {
        let ctx = PromptContext {
            phase: TrialPhase::CrossExamination,
            mode: SimulationMode::Trial,
            counterpart_name: "Ms. Reyes".to_string(),
            case_summary: "State v. Doyle, burglary.".to_string(),
        };
        let prompt = CourtroomPrompts.system_prompt(&ctx);
        assert!(prompt.contains("Ms. Reyes, the witness on the stand"));
        assert!(prompt.contains("cross-examination"));
        assert!(prompt.contains("State v. Doyle"));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn empty_case_summary_is_marked() {
        let ctx = PromptContext {
            phase: TrialPhase::default(),
            mode: SimulationMode::default(),
            counterpart_name: "Counsel".to_string(),
            case_summary: "  ".to_string(),
        };
        assert!(CourtroomPrompts.system_prompt(&ctx).contains("no case summary"));
    }
}
