//! Protocol tags embedded in every leaf's inscription envelope.

use std::fmt;

use serde::Serialize;

use crate::error::{CustodyError, Result};

pub const QUAS_PROTOCOL: &str = "quas";
pub const BRC20_PROTOCOL: &str = "brc-20";

pub const DEFAULT_DEPLOY_MAX: &str = "21000000";
pub const DEFAULT_DEPLOY_LIMIT: &str = "1000";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionTag {
    Borrow,
    Repay,
    Withdraw,
    Mint { tick: String, amt: String },
    Transfer { tick: String, amt: String },
    Deploy { tick: String, max: String, lim: String },
}

/// Field order here is the byte order of the inscribed JSON.
#[derive(Serialize)]
struct Payload<'a> {
    p: &'a str,
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tick: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lim: Option<&'a str>,
}

impl ActionTag {
    /// Actions the custody quorum can authorize, in tree order.
    pub const QUORUM_ACTIONS: [ActionTag; 3] =
        [ActionTag::Borrow, ActionTag::Repay, ActionTag::Withdraw];

    /// BRC-20 `mint` or `transfer` from the raw query arguments.
    pub fn brc20(op: &str, tick: &str, amt: &str) -> Result<Self> {
        let tick = validate_tick(tick)?;
        let amt = validate_amount("amt", amt)?;
        match op {
            "mint" => Ok(ActionTag::Mint { tick, amt }),
            "transfer" => Ok(ActionTag::Transfer { tick, amt }),
            _ => Err(CustodyError::validation("op can only be mint or transfer")),
        }
    }

    pub fn deploy(tick: &str, max: Option<&str>, lim: Option<&str>) -> Result<Self> {
        Ok(ActionTag::Deploy {
            tick: validate_tick(tick)?,
            max: validate_amount("max", max.unwrap_or(DEFAULT_DEPLOY_MAX))?,
            lim: validate_amount("lim", lim.unwrap_or(DEFAULT_DEPLOY_LIMIT))?,
        })
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            ActionTag::Borrow | ActionTag::Repay | ActionTag::Withdraw => QUAS_PROTOCOL,
            _ => BRC20_PROTOCOL,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            ActionTag::Borrow => "borrow",
            ActionTag::Repay => "repay",
            ActionTag::Withdraw => "withdraw",
            ActionTag::Mint { .. } => "mint",
            ActionTag::Transfer { .. } => "transfer",
            ActionTag::Deploy { .. } => "deploy",
        }
    }

    /// JSON body of the inscription, e.g. `{"p":"quas","op":"borrow"}`.
    pub fn payload(&self) -> Result<String> {
        let mut payload = Payload {
            p: self.protocol(),
            op: self.op(),
            tick: None,
            amt: None,
            max: None,
            lim: None,
        };
        match self {
            ActionTag::Mint { tick, amt } | ActionTag::Transfer { tick, amt } => {
                payload.tick = Some(tick.as_str());
                payload.amt = Some(amt.as_str());
            }
            ActionTag::Deploy { tick, max, lim } => {
                payload.tick = Some(tick.as_str());
                payload.max = Some(max.as_str());
                payload.lim = Some(lim.as_str());
            }
            _ => {}
        }
        Ok(serde_json::to_string(&payload)?)
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol(), self.op())
    }
}

fn validate_tick(tick: &str) -> Result<String> {
    let tick = tick.trim();
    if tick.is_empty() {
        return Err(CustodyError::validation("missing brc-20 tick"));
    }
    if tick.chars().count() > 5 {
        return Err(CustodyError::validation(format!(
            "brc-20 tick '{}' is longer than 5 characters",
            tick
        )));
    }
    Ok(tick.to_string())
}

fn validate_amount(name: &str, amount: &str) -> Result<String> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(CustodyError::validation(format!("missing brc-20 {}", name)));
    }
    let dots = amount.chars().filter(|c| *c == '.').count();
    let digits_only = amount.chars().all(|c| c.is_ascii_digit() || c == '.');
    if !digits_only || dots > 1 || amount.starts_with('.') || amount.ends_with('.') {
        return Err(CustodyError::validation(format!(
            "brc-20 {} '{}' is not a decimal number",
            name, amount
        )));
    }
    Ok(amount.to_string())
}
