//! Usage banner derived from a client status
//!
//! Severity is cosmetic. Whether an action may run is decided only by the
//! server's answer to an increment.

use serde::Serialize;
use std::fmt;

use super::store::ClientUsageStatus;
use crate::tier::Limit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Blocked,
    Premium,
}

impl Severity {
    /// Band for a bounded usage percentage
    pub fn for_percent(percent: u32) -> Self {
        match percent {
            0..=49 => Severity::Ok,
            50..=79 => Severity::Warning,
            _ => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Banner {
    Loading,
    Hidden,
    Visible {
        severity: Severity,
        text: String,
        /// Percent used; absent when there is no ceiling
        progress: Option<u32>,
        upgrade_url: Option<String>,
    },
}

impl Banner {
    pub fn from_status(status: &ClientUsageStatus, upgrade_url: &str) -> Self {
        if status.loading {
            return Banner::Loading;
        }
        // A refused increment keeps the upgrade prompt; any other error hides it
        if status.error.is_some() && !status.rejected {
            return Banner::Hidden;
        }

        let limit = match status.limit {
            Limit::Unlimited => {
                return Banner::Visible {
                    severity: Severity::Premium,
                    text: format!("Unlimited {} plan usage", status.tier),
                    progress: None,
                    upgrade_url: None,
                };
            }
            Limit::Bounded(limit) => limit,
        };

        let percent = if limit == 0 {
            100
        } else {
            (u64::from(status.used) * 100 / u64::from(limit)).min(100) as u32
        };

        if status.limit_reached {
            return Banner::Visible {
                severity: Severity::Blocked,
                text: format!(
                    "Daily limit reached ({}/{}). Upgrade for more.",
                    status.used, limit
                ),
                progress: Some(percent),
                upgrade_url: Some(upgrade_url.to_string()),
            };
        }

        Banner::Visible {
            severity: Severity::for_percent(percent),
            text: format!(
                "{} of {} daily uses left on the {} plan",
                status.remaining, limit, status.tier
            ),
            progress: Some(percent),
            upgrade_url: None,
        }
    }
}

impl fmt::Display for Banner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Banner::Loading => f.write_str("Checking usage..."),
            Banner::Hidden => Ok(()),
            Banner::Visible {
                severity,
                text,
                progress,
                upgrade_url,
            } => {
                write!(f, "[{:?}] {}", severity, text)?;
                if let Some(percent) = progress {
                    let filled = (*percent as usize) / 5;
                    write!(
                        f,
                        " [{}{}] {}%",
                        "#".repeat(filled),
                        "-".repeat(20 - filled),
                        percent
                    )?;
                }
                if let Some(url) = upgrade_url {
                    write!(f, " Upgrade: {}", url)?;
                }
                Ok(())
            }
        }
    }
}
