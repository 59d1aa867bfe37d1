//! Risk scoring and hardening of generated shell commands.
//!
//! Classification runs three ordered tables over a whitespace-normalized copy
//! of the command:
//!
//! 1. **Deny rules**: the first match blocks the command outright
//!    (`high`, score 1.0). Caution rules are not consulted.
//! 2. **Caution rules**: every match adds its weight (points out of 100);
//!    the clamped sum decides the tier.
//! 3. **Preview rules**: a `moderate` command whose leading tool has a
//!    non-destructive preview flag gets that flag inserted after the tool
//!    name, unless it is already there.
//!
//! Tables are plain slices, so evaluation order is exactly declaration order.
//! Assessment only depends on the command text, which makes it deterministic
//! and makes re-assessing a hardened command a no-op.

use crate::provider::CandidateCommand;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

/// Score (in points) at or above which a command is `high`.
pub const HIGH_THRESHOLD: u32 = 75;
/// Score (in points) at or above which a command is `moderate`.
pub const MODERATE_THRESHOLD: u32 = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Moderate,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Moderate => "moderate",
            RiskTier::High => "high",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct DenyRule {
    label: &'static str,
    pattern: &'static str,
}

struct CautionRule {
    label: &'static str,
    pattern: &'static str,
    weight: u32,
}

struct PreviewRule {
    tool: &'static str,
    /// Regex for the tool words, e.g. `git\s+clean`.
    tool_pattern: &'static str,
    flag: &'static str,
    long_alias: Option<&'static str>,
    short_alias: Option<char>,
}

// Start of a simple command: beginning of text, whitespace, a shell operator,
// an opening quote or backquote. An alias-bypassing `\` and a directory
// prefix such as `/bin/` may precede the program name.
macro_rules! cmd_start {
    () => {
        r#"(?:^|[\s;&|(`'"])\\?(?:[^\s;&|()`'"]*/)?"#
    };
}

// End of a word: whitespace, a shell operator, a closing `)` or backquote,
// or end of text.
macro_rules! word_end {
    () => {
        r#"["']?(?:[\s;&|)`]|$)"#
    };
}

const DENY_RULES: &[DenyRule] = &[
    DenyRule {
        label: "recursive delete of the filesystem root or home directory",
        pattern: concat!(
            cmd_start!(),
            r#"rm\s+(?:-\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:\S+\s+)*["']?(?:/|/\*|~|~/|~/\*|\$HOME|\$HOME/|\$HOME/\*|\$\{HOME\}|\$\{HOME\}/|\$\{HOME\}/\*)"#,
            word_end!()
        ),
    },
    DenyRule {
        label: "fork bomb",
        pattern: r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}",
    },
    DenyRule {
        label: "creates or wipes a filesystem",
        pattern: concat!(cmd_start!(), r"(?:mkfs(?:\.\w+)?|mke2fs|mkswap|wipefs)(?:\s|$)"),
    },
    DenyRule {
        label: "erases a disk",
        pattern: r"\bdiskutil\s+(?:eraseDisk|eraseVolume|zeroDisk|randomDisk|secureErase|partitionDisk)\b",
    },
    DenyRule {
        label: "raw write to a block device",
        pattern: r"\bdd\s+(?:\S+\s+)*of=/dev/(?:[sh]d[a-z]|nvme\d|disk\d|rdisk\d|mmcblk\d|vd[a-z]|xvd[a-z]|md\d|dm-\d|mapper/)",
    },
    DenyRule {
        label: "redirects output onto a block device",
        pattern: r">\s*/dev/(?:[sh]d[a-z]|nvme\d|disk\d|rdisk\d|mmcblk\d|vd[a-z]|xvd[a-z])",
    },
    DenyRule {
        label: "shreds a block device",
        pattern: r"\bshred\b.*\s/dev/(?:[sh]d[a-z]|nvme\d|disk\d|rdisk\d|mmcblk\d|vd[a-z]|xvd[a-z])",
    },
    DenyRule {
        label: "changes ownership or permissions of the filesystem root",
        pattern: concat!(cmd_start!(), r#"ch(?:mod|own|grp)\s+(?:\S+\s+)+["']?/\*?"#, word_end!()),
    },
    DenyRule {
        label: "overwrites the system account database",
        pattern: r">\s*/etc/(?:passwd|shadow|sudoers|group)(?:\s|$)",
    },
];

const CAUTION_RULES: &[CautionRule] = &[
    CautionRule {
        label: "runs with elevated privileges",
        pattern: concat!(cmd_start!(), r"(?:sudo|doas)\s"),
        weight: 30,
    },
    CautionRule {
        label: "deletes files",
        pattern: concat!(cmd_start!(), r"rm\s"),
        weight: 20,
    },
    CautionRule {
        label: "recursive delete",
        pattern: concat!(
            cmd_start!(),
            r"rm\s+(?:-\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)(?:\s|$)"
        ),
        weight: 25,
    },
    CautionRule {
        label: "deletes everything in the directory",
        pattern: concat!(cmd_start!(), r"rm\s+(?:\S+\s+)*(?:\./)?\*(?:\s|$)"),
        weight: 35,
    },
    CautionRule {
        label: "deletes files found by a search",
        pattern: r"\bfind\b.*\s(?:-delete\b|-exec\s+rm\b)",
        weight: 40,
    },
    CautionRule {
        label: "shreds or truncates files",
        pattern: concat!(cmd_start!(), r"(?:shred|truncate)\s"),
        weight: 35,
    },
    CautionRule {
        label: "moves files",
        pattern: concat!(cmd_start!(), r"mv\s"),
        weight: 20,
    },
    CautionRule {
        label: "bulk move with a wildcard",
        pattern: concat!(cmd_start!(), r"mv\s.*[*?]"),
        weight: 20,
    },
    CautionRule {
        label: "bulk rename",
        pattern: concat!(cmd_start!(), r"(?:rename|perl-rename|mmv)\s"),
        weight: 35,
    },
    CautionRule {
        label: "feeds a file list into rm or mv",
        pattern: r"\bxargs\b.*\b(?:rm|mv)\b",
        weight: 20,
    },
    CautionRule {
        label: "recursive copy may overwrite files",
        pattern: concat!(cmd_start!(), r"cp\s+(?:-\S+\s+)*-[a-zA-Z]*[rR][a-zA-Z]*(?:\s|$)"),
        weight: 15,
    },
    CautionRule {
        label: "bulk copy with a wildcard",
        pattern: concat!(cmd_start!(), r"cp\s.*[*?]"),
        weight: 20,
    },
    CautionRule {
        label: "synchronizes directories",
        pattern: concat!(cmd_start!(), r"rsync\s"),
        weight: 35,
    },
    CautionRule {
        label: "sync deletes files missing from the source",
        pattern: r"\brsync\b.*\s--delete",
        weight: 30,
    },
    CautionRule {
        label: "remote sync or move",
        pattern: r"\brclone\s+(?:\S+\s+)*(?:sync|move|delete|purge|dedupe)\b",
        weight: 45,
    },
    CautionRule {
        label: "mirrors a remote site",
        pattern: r"\bwget\b.*\s(?:-m|--mirror|-r|--recursive)(?:\s|$)",
        weight: 35,
    },
    CautionRule {
        label: "changes permissions or ownership",
        pattern: concat!(cmd_start!(), r"ch(?:mod|own|grp)\s"),
        weight: 30,
    },
    CautionRule {
        label: "recursive permission change",
        pattern: r"\bch(?:mod|own|grp)\s+(?:\S+\s+)*-[a-zA-Z]*R",
        weight: 20,
    },
    CautionRule {
        label: "makes files world-writable",
        pattern: r"\bchmod\s+(?:\S+\s+)*(?:0?777|a\+w|o\+w)(?:\s|$)",
        weight: 15,
    },
    CautionRule {
        label: "force-pushes over remote history",
        pattern: r"\bgit\s+push\b.*\s(?:--force(?:-with-lease)?|-f)(?:\s|=|$)",
        weight: 50,
    },
    CautionRule {
        label: "discards commits and working changes",
        pattern: r"\bgit\s+reset\b.*\s--hard\b",
        weight: 45,
    },
    CautionRule {
        label: "rewrites commit history",
        pattern: r"\bgit\s+(?:rebase|filter-branch|filter-repo)\b",
        weight: 40,
    },
    CautionRule {
        label: "deletes untracked files",
        pattern: r"\bgit\s+clean\b",
        weight: 40,
    },
    CautionRule {
        label: "force-deletes a branch",
        pattern: r"\bgit\s+branch\s+(?:\S+\s+)*-D\b",
        weight: 35,
    },
    CautionRule {
        label: "pipes a download straight into a shell",
        pattern: r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b",
        weight: 80,
    },
    CautionRule {
        label: "removes packages",
        pattern: r"\b(?:apt|apt-get|brew|dnf|yum|npm|pip|pip3|cargo|gem)\s+(?:\S+\s+)*(?:remove|uninstall|purge|autoremove)\b",
        weight: 35,
    },
    CautionRule {
        label: "removes cached package versions",
        pattern: r"\bbrew\s+cleanup\b",
        weight: 35,
    },
    CautionRule {
        label: "installs packages",
        pattern: r"\b(?:apt|apt-get|brew|dnf|yum|npm|pip|pip3|gem)\s+install\b",
        weight: 15,
    },
    CautionRule {
        label: "stops or disables a service",
        pattern: r"\b(?:systemctl|launchctl|service)\s+(?:\S+\s+)*(?:stop|disable|mask|unload|bootout)\b",
        weight: 40,
    },
    CautionRule {
        label: "changes the machine's power state",
        pattern: concat!(cmd_start!(), r"(?:shutdown|reboot|halt|poweroff)(?:\s|$)"),
        weight: 60,
    },
    CautionRule {
        label: "kills processes",
        pattern: concat!(cmd_start!(), r"(?:kill\s+-(?:9|KILL)|killall|pkill)\b"),
        weight: 25,
    },
    CautionRule {
        label: "flushes or disables the firewall",
        pattern: r"\biptables\s+(?:-F|--flush)\b|\bufw\s+(?:--force|disable|reset)\b",
        weight: 60,
    },
    CautionRule {
        label: "edits a partition table",
        pattern: concat!(cmd_start!(), r"(?:fdisk|sfdisk|gdisk|parted)(?:\s|$)"),
        weight: 60,
    },
    CautionRule {
        label: "truncates a file through redirection",
        pattern: r"(?:^|[^>&0-9])>\s*[^\s&>|]",
        weight: 10,
    },
    CautionRule {
        label: "talks to the network",
        pattern: concat!(cmd_start!(), r"(?:curl|wget|ssh|scp|sftp|nc)(?:\s|$)"),
        weight: 10,
    },
];

const PREVIEW_RULES: &[PreviewRule] = &[
    PreviewRule {
        tool: "rsync",
        tool_pattern: r"rsync",
        flag: "--dry-run",
        long_alias: None,
        short_alias: Some('n'),
    },
    PreviewRule {
        tool: "rclone",
        tool_pattern: r"rclone",
        flag: "--dry-run",
        long_alias: None,
        short_alias: Some('n'),
    },
    PreviewRule {
        tool: "git clean",
        tool_pattern: r"git\s+clean",
        flag: "--dry-run",
        long_alias: None,
        short_alias: Some('n'),
    },
    PreviewRule {
        tool: "git push",
        tool_pattern: r"git\s+push",
        flag: "--dry-run",
        long_alias: None,
        short_alias: Some('n'),
    },
    PreviewRule {
        tool: "brew cleanup",
        tool_pattern: r"brew\s+cleanup",
        flag: "--dry-run",
        long_alias: None,
        short_alias: Some('n'),
    },
    PreviewRule {
        tool: "mv",
        tool_pattern: r"mv",
        flag: "-n",
        long_alias: Some("--no-clobber"),
        short_alias: Some('n'),
    },
    PreviewRule {
        tool: "cp",
        tool_pattern: r"cp",
        flag: "-n",
        long_alias: Some("--no-clobber"),
        short_alias: Some('n'),
    },
];

struct CompiledDeny {
    rule: &'static DenyRule,
    regex: Regex,
}

struct CompiledCaution {
    rule: &'static CautionRule,
    regex: Regex,
}

struct CompiledPreview {
    rule: &'static PreviewRule,
    regex: Regex,
}

static DENY: LazyLock<Vec<CompiledDeny>> = LazyLock::new(|| {
    DENY_RULES
        .iter()
        .map(|rule| CompiledDeny {
            rule,
            regex: Regex::new(rule.pattern).expect("deny pattern is valid"),
        })
        .collect()
});

static CAUTION: LazyLock<Vec<CompiledCaution>> = LazyLock::new(|| {
    CAUTION_RULES
        .iter()
        .map(|rule| CompiledCaution {
            rule,
            regex: Regex::new(rule.pattern).expect("caution pattern is valid"),
        })
        .collect()
});

static PREVIEW: LazyLock<Vec<CompiledPreview>> = LazyLock::new(|| {
    PREVIEW_RULES
        .iter()
        .map(|rule| CompiledPreview {
            rule,
            // group 1 ends where the flag gets inserted
            regex: Regex::new(&format!(
                r"^(\s*(?:sudo\s+(?:-\S+\s+)*)?{})(?:\s|$)",
                rule.tool_pattern
            ))
            .expect("preview pattern is valid"),
        })
        .collect()
});

/// Trims and collapses runs of whitespace into single spaces.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scores, classifies and hardens candidate commands.
///
/// `assess` is total: it never fails, and anything it cannot make sense of
/// (such as an empty command) comes back blocked.
#[derive(Debug, Clone)]
pub struct SafetyEngine {
    high_threshold: u32,
    moderate_threshold: u32,
}

impl Default for SafetyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyEngine {
    pub fn new() -> Self {
        Self {
            high_threshold: HIGH_THRESHOLD,
            moderate_threshold: MODERATE_THRESHOLD,
        }
    }

    /// Populates the risk fields of `candidate`, possibly rewriting its text.
    pub fn assess(&self, mut candidate: CandidateCommand) -> CandidateCommand {
        candidate.risk_score = 0.0;
        candidate.risk_tier = RiskTier::Safe;
        candidate.hardened = false;
        candidate.blocked = false;
        candidate.block_reason = None;
        candidate.notes.clear();

        let normalized = normalize(&candidate.text);
        if normalized.is_empty() {
            return block(candidate, "empty command");
        }

        if let Some(deny) = DENY.iter().find(|d| d.regex.is_match(&normalized)) {
            debug!("Blocked '{}': {}", normalized, deny.rule.label);
            return block(candidate, deny.rule.label);
        }

        let mut points = 0u32;
        for caution in CAUTION.iter().filter(|c| c.regex.is_match(&normalized)) {
            points += caution.rule.weight;
            candidate.notes.push(caution.rule.label.to_string());
        }
        let points = points.min(100);

        candidate.risk_score = points as f32 / 100.0;
        candidate.risk_tier = if points >= self.high_threshold {
            RiskTier::High
        } else if points >= self.moderate_threshold {
            RiskTier::Moderate
        } else {
            RiskTier::Safe
        };

        if candidate.risk_tier == RiskTier::Moderate {
            harden(&mut candidate);
        }

        debug!(
            "Assessed '{}': tier={} score={:.2} hardened={}",
            normalized, candidate.risk_tier, candidate.risk_score, candidate.hardened
        );
        candidate
    }
}

fn block(mut candidate: CandidateCommand, reason: &str) -> CandidateCommand {
    candidate.risk_score = 1.0;
    candidate.risk_tier = RiskTier::High;
    candidate.blocked = true;
    candidate.block_reason = Some(reason.to_string());
    candidate.notes.push(format!("blocked: {}", reason));
    candidate
}

fn harden(candidate: &mut CandidateCommand) {
    for preview in PREVIEW.iter() {
        let Some(tool_match) = preview.regex.captures(&candidate.text).and_then(|c| c.get(1)) else {
            continue;
        };
        let rule = preview.rule;
        let insert_at = tool_match.end();

        // Only a lone invocation of the tool is rewritten.
        if has_continuation(&candidate.text[insert_at..]) {
            candidate.notes.push(format!(
                "{} is followed by further commands, so no preview flag was added",
                rule.tool
            ));
            return;
        }

        if !flag_present(&candidate.text[insert_at..], rule) {
            candidate
                .text
                .insert_str(insert_at, &format!(" {}", rule.flag));
        }
        candidate.hardened = true;
        candidate.notes.push(format!(
            "`{}` keeps {} in preview mode; remove it to apply the changes",
            rule.flag, rule.tool
        ));
        return;
    }
}

/// True when `rest` chains, pipes or substitutes another command.
fn has_continuation(rest: &str) -> bool {
    rest.contains(&[';', '|', '&', '`', '\n'][..]) || rest.contains("$(")
}

/// Looks for the preview flag among the tool's arguments, stopping at the
/// first shell operator.
fn flag_present(args: &str, rule: &PreviewRule) -> bool {
    args.split_whitespace()
        .take_while(|token| !matches!(*token, "|" | "||" | "&&" | ";" | "&"))
        .any(|token| {
            if token == rule.flag || Some(token) == rule.long_alias {
                return true;
            }
            match (rule.short_alias, token.strip_prefix('-')) {
                (Some(short), Some(cluster))
                    if !cluster.starts_with('-') && !cluster.is_empty() =>
                {
                    cluster.chars().all(|c| c.is_ascii_alphabetic()) && cluster.contains(short)
                }
                _ => false,
            }
        })
}
